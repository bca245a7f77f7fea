use crate::Value;

/// Encode a value to its canonical bencoded form. Dictionary keys are
/// emitted in ascending byte order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (key, item) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use crate::decode;
    use super::*;

    #[test]
    fn encode_scalars() {
        assert_eq!(encode(&Value::Int(42)), b"i42e");
        assert_eq!(encode(&Value::Int(-7)), b"i-7e");
        assert_eq!(encode(&Value::Bytes(b"spam".to_vec())), b"4:spam");
    }

    #[test]
    fn encode_dict_sorts_keys() {
        let mut d = BTreeMap::new();
        d.insert(b"zz".to_vec(), Value::Int(1));
        d.insert(b"aa".to_vec(), Value::Int(2));
        assert_eq!(encode(&Value::Dict(d)), b"d2:aai2e2:zzi1ee");
    }

    #[test]
    fn round_trip() {
        let raw: &[u8] = b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let v = decode(raw).unwrap();
        assert_eq!(encode(&v), raw);
    }

    #[test]
    fn round_trip_binary_string() {
        let mut raw = b"3:".to_vec();
        raw.extend_from_slice(&[0x00, 0xff, 0x13]);
        let v = decode(&raw).unwrap();
        assert_eq!(encode(&v), raw);
    }
}
