use std::collections::BTreeMap;
use crate::{Error, Result, Value};

/// Decode a complete bencoded value. Trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut d = Decoder { input, pos: 0 };
    let value = d.value()?;
    if d.pos != d.input.len() {
        return Err(Error::TrailingBytes(d.input.len() - d.pos));
    }
    Ok(value)
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {

    fn peek(&self) -> Result<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(Error::UnexpectedEof(self.pos))
    }

    fn bump(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.bytes()?)),
            byte => Err(Error::UnexpectedByte { at: self.pos, byte }),
        }
    }

    // i<digits>e, negatives allowed except -0, no leading zeros.
    fn int(&mut self) -> Result<Value> {
        let start = self.pos;
        self.bump()?; // 'i'
        let negative = if self.peek()? == b'-' {
            self.bump()?;
            true
        } else {
            false
        };

        let digits_at = self.pos;
        let mut n: i64 = 0;
        while self.peek()? != b'e' {
            let b = self.bump()?;
            if !b.is_ascii_digit() {
                return Err(Error::InvalidInt(start));
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as i64))
                .ok_or(Error::InvalidInt(start))?;
        }
        let ndigits = self.pos - digits_at;
        self.bump()?; // 'e'

        if ndigits == 0 {
            return Err(Error::InvalidInt(start));
        }
        if ndigits > 1 && self.input[digits_at] == b'0' {
            return Err(Error::LeadingZero(start));
        }
        if negative && n == 0 {
            return Err(Error::NegativeZero(start));
        }
        Ok(Value::Int(if negative { -n } else { n }))
    }

    // <len>:<bytes>
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let mut len: usize = 0;
        while self.peek()? != b':' {
            let b = self.bump()?;
            if !b.is_ascii_digit() {
                return Err(Error::UnexpectedByte { at: self.pos - 1, byte: b });
            }
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add((b - b'0') as usize))
                .ok_or(Error::LengthOverflow(start))?;
        }
        self.bump()?; // ':'

        if self.pos + len > self.input.len() {
            return Err(Error::UnexpectedEof(self.input.len()));
        }
        let out = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn list(&mut self) -> Result<Value> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.bump()?; // 'e'
        Ok(Value::List(items))
    }

    // Keys are accepted in any order; BTreeMap restores canonical order.
    fn dict(&mut self) -> Result<Value> {
        self.bump()?; // 'd'
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(Error::NonStringKey(self.pos));
            }
            let key = self.bytes()?;
            let value = self.value()?;
            map.insert(key, value);
        }
        self.bump()?; // 'e'
        Ok(Value::Dict(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_int() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"i-17e").unwrap(), Value::Int(-17));
    }

    #[test]
    fn decode_int_rejects_malformed() {
        assert!(matches!(decode(b"i-0e"), Err(Error::NegativeZero(_))));
        assert!(matches!(decode(b"i03e"), Err(Error::LeadingZero(_))));
        assert!(matches!(decode(b"ie"), Err(Error::InvalidInt(_))));
        assert!(matches!(decode(b"i4x2e"), Err(Error::InvalidInt(_))));
        assert!(matches!(decode(b"i42"), Err(Error::UnexpectedEof(_))));
    }

    #[test]
    fn decode_bytes() {
        assert_eq!(decode(b"5:hello").unwrap(), Value::Bytes(b"hello".to_vec()));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(vec![]));
        assert!(matches!(decode(b"5:hell"), Err(Error::UnexpectedEof(_))));
    }

    #[test]
    fn decode_list() {
        assert_eq!(
            decode(b"l4:spami7ee").unwrap(),
            Value::List(vec![Value::Bytes(b"spam".to_vec()), Value::Int(7)]),
        );
        assert_eq!(decode(b"le").unwrap(), Value::List(vec![]));
    }

    #[test]
    fn decode_dict() {
        let v = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let d = v.as_dict().unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(v.require_str("cow").unwrap(), "moo");
        assert_eq!(v.require_str("spam").unwrap(), "eggs");
    }

    #[test]
    fn decode_dict_out_of_order_keys() {
        // Accepted on parse, canonicalized by the map.
        let v = decode(b"d1:bi2e1:ai1ee").unwrap();
        let keys: Vec<_> = v.as_dict().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn decode_nested() {
        let v = decode(b"d4:infod6:lengthi100e4:name4:testee").unwrap();
        let info = v.require("info").unwrap();
        assert_eq!(info.require_int("length").unwrap(), 100);
        assert_eq!(info.require_str("name").unwrap(), "test");
    }

    #[test]
    fn decode_rejects_trailing() {
        assert!(matches!(decode(b"i1eXYZ"), Err(Error::TrailingBytes(3))));
    }

    #[test]
    fn decode_rejects_non_string_key() {
        assert!(matches!(decode(b"di1ei2ee"), Err(Error::NonStringKey(_))));
    }

    #[test]
    fn accessor_errors_name_the_key() {
        let v = decode(b"d3:fooi1ee").unwrap();
        match v.require("bar") {
            Err(Error::MissingKey(k)) => assert_eq!(k, "bar"),
            other => panic!("expected MissingKey, got {:?}", other),
        }
        match v.require_str("foo") {
            Err(Error::WrongType { key, expected }) => {
                assert_eq!(key, "foo");
                assert_eq!(expected, "byte string");
            }
            other => panic!("expected WrongType, got {:?}", other),
        }
    }
}
