#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {

    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("unexpected byte {byte:#04x} at offset {at}")]
    UnexpectedByte { at: usize, byte: u8 },

    #[error("invalid integer at offset {0}")]
    InvalidInt(usize),

    #[error("integer with leading zero at offset {0}")]
    LeadingZero(usize),

    #[error("negative zero at offset {0}")]
    NegativeZero(usize),

    #[error("string length prefix overflows at offset {0}")]
    LengthOverflow(usize),

    #[error("dictionary key is not a byte string at offset {0}")]
    NonStringKey(usize),

    #[error("{0} bytes of trailing garbage after value")]
    TrailingBytes(usize),

    #[error("missing required key `{0}`")]
    MissingKey(String),

    #[error("key `{key}` is not a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("value is not a {0}")]
    NotA(&'static str),

    #[error("key `{key}` is not valid UTF-8")]
    InvalidUtf8 { key: String },
}
