//! Bencode encoding and decoding (BEP-3).
//!
//! Bencode is the binary serialization used on the DHT wire and in the
//! persisted routing table. Four kinds exist: integers, byte strings, lists,
//! and dictionaries.
//!
//! [`decode`] is strict and accepts canonical input only; [`decode_lenient`]
//! tolerates the dictionary-key and integer sloppiness seen from some remote
//! clients. [`encode`] always emits canonical form, so
//! `decode(&encode(&v)?) == v` holds for every value.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_lenient};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
