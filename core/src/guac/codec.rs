//! Guacamole instruction framing: `<len>.<bytes>,<len>.<bytes>,...;`.
//!
//! Lengths are counted in bytes of the raw element, not codepoints, so elements may contain
//! arbitrary binary data including commas, dots, and semicolons — the length prefix resolves all
//! ambiguity. See spec §4.1.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{GatewayError, Result};

/// A decoded Guacamole instruction: an opcode plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<Vec<u8>>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self { opcode: opcode.into(), args }
    }

    pub fn with_str_args(opcode: impl Into<String>, args: &[&str]) -> Self {
        Self {
            opcode: opcode.into(),
            args: args.iter().map(|a| a.as_bytes().to_vec()).collect(),
        }
    }

    /// Encode to the wire form. The opcode is element 1; arguments follow.
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.opcode, self.args.iter().map(|a| a.as_slice()))
    }

    /// Convenience: the n-th argument as a UTF-8 string (lossy on invalid bytes).
    pub fn arg_str(&self, index: usize) -> Option<std::borrow::Cow<'_, str>> {
        self.args.get(index).map(|a| String::from_utf8_lossy(a))
    }
}

/// Encode an opcode and arguments into wire form. The opcode is element 1.
pub fn encode<'a>(opcode: &str, args: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = BytesMut::new();
    write_element(&mut out, opcode.as_bytes());
    for arg in args {
        out.put_u8(b',');
        write_element(&mut out, arg);
    }
    out.put_u8(b';');
    out.to_vec()
}

fn write_element(out: &mut BytesMut, element: &[u8]) {
    out.put_slice(element.len().to_string().as_bytes());
    out.put_u8(b'.');
    out.put_slice(element);
}

/// Decode exactly one instruction from an async byte stream.
///
/// Repeatedly reads a decimal length, a `.`, that many raw bytes, then a delimiter byte (`,`
/// continues, `;` terminates). Fails with [`GatewayError::MalformedFrame`] if the length prefix
/// is non-numeric, the delimiter is neither `,` nor `;`, the stream ends mid-element, or zero
/// elements precede `;`.
pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Instruction> {
    let mut elements: Vec<Vec<u8>> = Vec::new();

    loop {
        let len = read_length(reader).await?;
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| GatewayError::MalformedFrame(format!("stream ended mid-element: {e}")))?;
        elements.push(buf);

        let mut delim = [0u8; 1];
        reader
            .read_exact(&mut delim)
            .await
            .map_err(|e| GatewayError::MalformedFrame(format!("stream ended after element: {e}")))?;
        match delim[0] {
            b',' => continue,
            b';' => break,
            other => {
                return Err(GatewayError::MalformedFrame(format!(
                    "expected ',' or ';' delimiter, got {:?}",
                    other as char
                )))
            }
        }
    }

    if elements.is_empty() {
        return Err(GatewayError::MalformedFrame("zero elements before ';'".into()));
    }

    let opcode = String::from_utf8(elements.remove(0))
        .map_err(|e| GatewayError::MalformedFrame(format!("opcode is not valid UTF-8: {e}")))?;
    Ok(Instruction { opcode, args: elements })
}

/// Read a decimal length prefix up to (but not including) the `.` delimiter.
async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut digits = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = reader
            .read(&mut byte)
            .await
            .map_err(|e| GatewayError::MalformedFrame(format!("read error in length prefix: {e}")))?;
        if n == 0 {
            return Err(GatewayError::MalformedFrame("stream ended in length prefix".into()));
        }
        if byte[0] == b'.' {
            break;
        }
        if !byte[0].is_ascii_digit() {
            return Err(GatewayError::MalformedFrame(format!(
                "non-numeric length prefix byte {:?}",
                byte[0] as char
            )));
        }
        digits.push(byte[0]);
        if digits.len() > 10 {
            return Err(GatewayError::MalformedFrame("length prefix too long".into()));
        }
    }
    if digits.is_empty() {
        return Err(GatewayError::MalformedFrame("empty length prefix".into()));
    }
    std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| GatewayError::MalformedFrame("non-numeric length prefix".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_basic() {
        let wire = encode("select", [b"rdp".as_slice()]);
        assert_eq!(wire, b"6.select,3.rdp;");
    }

    #[tokio::test]
    async fn decode_basic() {
        let mut cursor = std::io::Cursor::new(b"6.select,3.rdp;".to_vec());
        let inst = decode(&mut cursor).await.unwrap();
        assert_eq!(inst.opcode, "select");
        assert_eq!(inst.args, vec![b"rdp".to_vec()]);
    }

    #[tokio::test]
    async fn decode_comma_inside_argument_is_data_not_delimiter() {
        let mut cursor = std::io::Cursor::new(b"3.foo,3.b,r,3.baz;".to_vec());
        let inst = decode(&mut cursor).await.unwrap();
        assert_eq!(inst.opcode, "foo");
        assert_eq!(inst.args, vec![b"b,r".to_vec(), b"baz".to_vec()]);
    }

    #[tokio::test]
    async fn decode_args_version_example() {
        let mut cursor = std::io::Cursor::new(b"4.args,13.VERSION_1_5_0;".to_vec());
        let inst = decode(&mut cursor).await.unwrap();
        assert_eq!(inst.opcode, "args");
        assert_eq!(inst.args, vec![b"VERSION_1_5_0".to_vec()]);
    }

    #[tokio::test]
    async fn round_trip_with_binary_and_punctuation() {
        let arg1 = b"has,comma.and;semicolon".to_vec();
        let arg2 = vec![0u8, 1, 2, 255, b',', b';', b'.'];
        let wire = encode("opcode", [arg1.as_slice(), arg2.as_slice()]);
        let mut cursor = std::io::Cursor::new(wire);
        let inst = decode(&mut cursor).await.unwrap();
        assert_eq!(inst.opcode, "opcode");
        assert_eq!(inst.args, vec![arg1, arg2]);
    }

    #[tokio::test]
    async fn decode_rejects_non_numeric_length() {
        let mut cursor = std::io::Cursor::new(b"a.foo;".to_vec());
        let err = decode(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedFrame);
    }

    #[tokio::test]
    async fn decode_rejects_bad_delimiter() {
        let mut cursor = std::io::Cursor::new(b"3.foo:".to_vec());
        let err = decode(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedFrame);
    }

    #[tokio::test]
    async fn decode_rejects_truncated_stream() {
        let mut cursor = std::io::Cursor::new(b"10.short".to_vec());
        let err = decode(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedFrame);
    }

    #[tokio::test]
    async fn decode_rejects_zero_elements() {
        let mut cursor = std::io::Cursor::new(b";".to_vec());
        let err = decode(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedFrame);
    }
}
