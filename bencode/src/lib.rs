//! Bencoding, the encoding used by .torrent files and tracker responses.
//!
//! Values are decoded into an explicit [`Value`] tree and fields are pulled
//! out by key, so a parse failure always names the key it tripped on.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::Error;
pub use value::Value;

pub type Result<T> = std::result::Result<T, Error>;
