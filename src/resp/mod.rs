pub mod decoder;
pub mod encoding;
pub mod types;
pub mod writer;

pub use decoder::Decoder;
pub use encoding::Encoding;
pub use types::RespValue;
pub use writer::{encode_args, Arg};
