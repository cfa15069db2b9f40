pub(crate) mod date;
pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod io;
pub(crate) mod parse;

pub(crate) use self::decode::{Decoded, Decoder};
pub(crate) use self::encode::Encoder;
pub(crate) use self::io::{ReadSide, WriteSide};
