//! Line-based frame encoding/decoding
//!
//! Wire format: one UTF-8 line per frame, terminated by `\n` (`\r\n` is
//! accepted on read).
//!
//! - Control frame: `%roomlink% <op>[ <arg>]`, op is `disconnect`, `ping` or `pong`
//! - Payload frame: any other line, carried verbatim
//!
//! Maximum line length: 1MB (sanity limit)

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Reserved first token of every control frame
pub const SENTINEL: &str = "%roomlink%";

/// Maximum allowed line length in bytes, terminator excluded (1MB)
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Operation carried by a control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOp {
    Disconnect,
    Ping,
    Pong,
    /// Op not known to this implementation; ignored by the read loops
    Unknown(String),
}

impl ControlOp {
    fn parse(op: &str) -> Self {
        match op {
            "disconnect" => ControlOp::Disconnect,
            "ping" => ControlOp::Ping,
            "pong" => ControlOp::Pong,
            other => ControlOp::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ControlOp::Disconnect => "disconnect",
            ControlOp::Ping => "ping",
            ControlOp::Pong => "pong",
            ControlOp::Unknown(op) => op,
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control { op: ControlOp, arg: Option<String> },
    Payload(String),
}

impl Frame {
    pub fn control(op: ControlOp) -> Self {
        Frame::Control { op, arg: None }
    }

    /// Build a payload frame, rejecting text that cannot travel as one line
    /// or that a peer would read back as a control frame.
    pub fn payload(message: impl Into<String>) -> Result<Self> {
        let message = message.into();
        if message.contains(['\n', '\r']) {
            return Err(Error::InvalidPayload(
                "payload contains a line terminator".into(),
            ));
        }
        if matches!(decode(&message), Frame::Control { .. }) {
            return Err(Error::InvalidPayload(format!(
                "payload starts with reserved marker '{}'",
                SENTINEL
            )));
        }
        Ok(Frame::Payload(message))
    }
}

/// Decode one line (terminator already stripped)
pub fn decode(line: &str) -> Frame {
    if let Some((marker, rest)) = line.split_once(' ') {
        if marker == SENTINEL && !rest.is_empty() {
            let (op, arg) = match rest.split_once(' ') {
                Some((op, arg)) => (op, Some(arg.to_string())),
                None => (rest, None),
            };
            return Frame::Control {
                op: ControlOp::parse(op),
                arg,
            };
        }
    }
    Frame::Payload(line.to_string())
}

/// Encode one frame as a line, terminator excluded
pub fn encode(frame: &Frame) -> String {
    match frame {
        Frame::Control { op, arg: Some(arg) } => format!("{} {} {}", SENTINEL, op, arg),
        Frame::Control { op, arg: None } => format!("{} {}", SENTINEL, op),
        Frame::Payload(message) => message.clone(),
    }
}

/// Read one line-delimited frame from a stream
///
/// End of stream is reported as [`Error::ConnectionClosed`]. A line that is
/// not valid UTF-8 yields [`Error::Protocol`]; the stream stays positioned
/// at the next line so the caller may keep reading.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut buf = Vec::new();
    let read = (&mut *reader)
        // Room for the longest line plus a CRLF terminator
        .take(MAX_LINE_LEN as u64 + 2)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Err(Error::ConnectionClosed);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > MAX_LINE_LEN {
        return Err(Error::LineTooLong {
            len: buf.len(),
            max: MAX_LINE_LEN,
        });
    }

    let line =
        String::from_utf8(buf).map_err(|e| Error::Protocol(format!("Invalid UTF-8: {}", e)))?;

    Ok(decode(&line))
}

/// Write one frame as a line and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let mut line = encode(frame);
    line.push('\n');

    writer.write_all(line.as_bytes()).await?;

    // Flush to ensure delivery
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_decode_control_ops() {
        assert_eq!(
            decode("%roomlink% disconnect"),
            Frame::control(ControlOp::Disconnect)
        );
        assert_eq!(decode("%roomlink% ping"), Frame::control(ControlOp::Ping));
        assert_eq!(
            decode("%roomlink% pong 42"),
            Frame::Control {
                op: ControlOp::Pong,
                arg: Some("42".into())
            }
        );
    }

    #[test]
    fn test_decode_unknown_op_is_still_control() {
        assert_eq!(
            decode("%roomlink% frobnicate"),
            Frame::control(ControlOp::Unknown("frobnicate".into()))
        );
    }

    #[test]
    fn test_bare_sentinel_is_payload() {
        assert_eq!(decode(SENTINEL), Frame::Payload(SENTINEL.into()));
        assert_eq!(
            decode("%roomlink%ping"),
            Frame::Payload("%roomlink%ping".into())
        );
        assert_eq!(decode("%roomlink% "), Frame::Payload("%roomlink% ".into()));
    }

    #[test]
    fn test_payload_decodes_verbatim() {
        for text in ["hello", "", "  spaced  out ", "ping", "disconnect now", "héllo wörld"] {
            assert_eq!(decode(text), Frame::Payload(text.into()));
            assert_eq!(encode(&Frame::payload(text).unwrap()), text);
        }
    }

    #[test]
    fn test_payload_rejects_line_terminators() {
        assert!(matches!(
            Frame::payload("a\nb"),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            Frame::payload("a\rb"),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_payload_rejects_control_lookalike() {
        assert!(matches!(
            Frame::payload("%roomlink% disconnect"),
            Err(Error::InvalidPayload(_))
        ));
        assert!(Frame::payload("%roomlink%").is_ok());
    }

    #[test]
    fn test_encode_control() {
        assert_eq!(
            encode(&Frame::control(ControlOp::Disconnect)),
            "%roomlink% disconnect"
        );
        assert_eq!(
            encode(&Frame::Control {
                op: ControlOp::Ping,
                arg: Some("7".into())
            }),
            "%roomlink% ping 7"
        );
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::payload("hello").unwrap())
            .await
            .unwrap();
        write_frame(&mut buf, &Frame::control(ControlOp::Ping))
            .await
            .unwrap();
        assert_eq!(buf, b"hello\n%roomlink% ping\n");

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Frame::Payload("hello".into())
        );
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Frame::control(ControlOp::Ping)
        );
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_crlf_and_unterminated_last_line() {
        let mut cursor = Cursor::new(b"one\r\ntwo".to_vec());
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Frame::Payload("one".into())
        );
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Frame::Payload("two".into())
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_skips_one_line() {
        let mut data = vec![0xff, 0xfe, b'\n'];
        data.extend_from_slice(b"after\n");
        let mut cursor = Cursor::new(data);

        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::Protocol(_))
        ));
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Frame::Payload("after".into())
        );
    }

    #[tokio::test]
    async fn test_oversized_line_rejected() {
        let data = vec![b'x'; MAX_LINE_LEN + 10];
        let mut cursor = Cursor::new(data);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::LineTooLong { .. })));
    }

    #[tokio::test]
    async fn test_max_length_line_accepted() {
        let mut data = vec![b'x'; MAX_LINE_LEN];
        data.push(b'\n');
        let mut cursor = Cursor::new(data);
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Payload(line) => assert_eq!(line.len(), MAX_LINE_LEN),
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_length_crlf_line_accepted() {
        let mut data = vec![b'x'; MAX_LINE_LEN];
        data.extend_from_slice(b"\r\nnext\n");
        let mut cursor = Cursor::new(data);
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Payload(line) => assert_eq!(line.len(), MAX_LINE_LEN),
            other => panic!("Wrong frame: {:?}", other),
        }
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Frame::Payload("next".into())
        );
    }

    #[tokio::test]
    async fn test_one_byte_over_limit_with_terminator_rejected() {
        let mut data = vec![b'x'; MAX_LINE_LEN + 1];
        data.push(b'\n');
        let mut cursor = Cursor::new(data);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::LineTooLong { len, .. }) if len == MAX_LINE_LEN + 1
        ));
    }
}
