use super::error::BencodeError;
use super::value::Value;
use std::io::Write;

/// Encodes a bencode value into its canonical byte representation.
///
/// The output buffer is allocated up front from [`Value::encoded_len`], and
/// dictionary keys are emitted in ascending byte order. Decoding the result
/// with [`decode`](super::decode) yields the original value back.
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut buf = Vec::with_capacity(value.encoded_len());
    encode_value(value, &mut buf)?;
    debug_assert_eq!(buf.len(), value.encoded_len());
    Ok(buf)
}

fn encode_value<W: Write>(value: &Value, writer: &mut W) -> Result<(), BencodeError> {
    match value {
        Value::Integer(i) => {
            write!(writer, "i{}e", i)?;
        }
        Value::Bytes(b) => {
            write!(writer, "{}:", b.len())?;
            writer.write_all(b)?;
        }
        Value::List(l) => {
            writer.write_all(b"l")?;
            for item in l {
                encode_value(item, writer)?;
            }
            writer.write_all(b"e")?;
        }
        Value::Dict(d) => {
            writer.write_all(b"d")?;
            for (key, val) in d {
                write!(writer, "{}:", key.len())?;
                writer.write_all(key)?;
                encode_value(val, writer)?;
            }
            writer.write_all(b"e")?;
        }
    }
    Ok(())
}
