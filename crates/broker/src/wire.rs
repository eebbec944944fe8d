//! Wire format: one JSON object per line, tagged by `op`.
//!
//! ```text
//! {"op":"sub","sid":1,"topic":"logs.test.v1.>"}
//! {"op":"pub","message":{"topic":"logs.test.v1.boot","category":"info","text":"hi","timestamp":1}}
//! {"op":"msg","sid":1,"message":{...}}
//! {"op":"ping","id":7}   ->   {"op":"pong","id":7}
//! ```
//!
//! A connection's frames are handled strictly in order, so a `pong` proves
//! that every frame sent before the matching `ping` has been routed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tonetest_core::error::BrokerError;
use tonetest_core::message::Message;

/// Largest accepted frame, newline included.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The widest `msg` envelope a delivered message is wrapped in, minus the
/// message itself. Used to size-check a message before it is published.
const MSG_ENVELOPE: &str = r#"{"op":"msg","sid":18446744073709551615,"message":}"#;

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Frame {
    /// Client registers subscription `sid` for a topic pattern.
    Sub { sid: u64, topic: String },
    /// Client drops subscription `sid`.
    Unsub { sid: u64 },
    /// Client publishes a message.
    Pub { message: Message },
    /// Client asks for a `pong` once everything before it is routed.
    Ping { id: u64 },
    /// Broker delivers a message for subscription `sid`.
    Msg { sid: u64, message: Message },
    /// Broker answers a `ping`.
    Pong { id: u64 },
    /// Broker reports a rejected frame.
    Err { reason: String },
}

impl Frame {
    /// Short name used in logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Sub { .. } => "sub",
            Self::Unsub { .. } => "unsub",
            Self::Pub { .. } => "pub",
            Self::Ping { .. } => "ping",
            Self::Msg { .. } => "msg",
            Self::Pong { .. } => "pong",
            Self::Err { .. } => "err",
        }
    }
}

/// Serialises a frame into one newline-terminated line.
pub fn encode(frame: &Frame) -> Result<Bytes, BrokerError> {
    let mut buf = serde_json::to_vec(frame)
        .map_err(|e| BrokerError::Protocol(format!("failed to encode {} frame: {e}", frame.op())))?;
    buf.push(b'\n');
    if buf.len() > MAX_FRAME_SIZE {
        return Err(BrokerError::Protocol(format!(
            "{} frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
            frame.op(),
            buf.len()
        )));
    }
    Ok(Bytes::from(buf))
}

/// Checks that `message` fits in a frame once the broker wraps it for delivery.
///
/// A message that passes can be both published and delivered on any
/// subscription.
pub fn check_message_size(message: &Message) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(message)
        .map_err(|e| BrokerError::Protocol(format!("failed to encode message: {e}")))?;
    let framed = body.len() + MSG_ENVELOPE.len() + 1;
    if framed > MAX_FRAME_SIZE {
        return Err(BrokerError::Protocol(format!(
            "message on '{}' too large: {framed} bytes framed (max: {MAX_FRAME_SIZE})",
            message.topic
        )));
    }
    Ok(())
}

/// Parses one line (without or with its trailing newline).
pub fn decode(line: &str) -> Result<Frame, BrokerError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| BrokerError::Protocol(format!("malformed frame: {e}")))
}

/// Reads the next frame, skipping blank lines. `Ok(None)` means EOF.
///
/// At most `MAX_FRAME_SIZE + 1` bytes of a line are buffered; a longer line
/// is a protocol error and leaves the stream mid-line.
pub async fn read_frame<R>(reader: &mut R, line: &mut String) -> Result<Option<Frame>, BrokerError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_line(line)
            .await
            .map_err(|e| BrokerError::Connection(format!("read error: {e}")))?;
        if read == 0 {
            return Ok(None);
        }
        if line.len() > MAX_FRAME_SIZE {
            return Err(BrokerError::Protocol(format!(
                "frame exceeds max size ({} bytes, max: {MAX_FRAME_SIZE})",
                line.len()
            )));
        }
        if line.trim().is_empty() {
            continue;
        }
        return decode(line).map(Some);
    }
}

/// Writes one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), BrokerError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(frame)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| BrokerError::Connection(format!("write error: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BrokerError::Connection(format!("flush error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn encoded_frame_is_single_tagged_line() {
        let bytes = encode(&Frame::Ping { id: 7 }).expect("encode");
        assert_eq!(&bytes[..], b"{\"op\":\"ping\",\"id\":7}\n");
    }

    #[test]
    fn decode_pub_frame() {
        let line = r#"{"op":"pub","message":{"topic":"a.b","category":"error","text":"boom","timestamp":5}}"#;
        match decode(line).expect("decode") {
            Frame::Pub { message } => {
                assert_eq!(message.topic, "a.b");
                assert_eq!(message.text, "boom");
                assert_eq!(message.timestamp, 5);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_unknown_op() {
        let err = decode(r#"{"op":"shout","sid":1}"#).expect_err("should fail");
        assert!(matches!(err, BrokerError::Protocol(_)));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let message = Message::info("a.b", "x".repeat(MAX_FRAME_SIZE));
        let err = encode(&Frame::Pub { message }).expect_err("should fail");
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn message_size_check_leaves_room_for_delivery_envelope() {
        let fits = Message::info("a.b", "x".repeat(1024)).with_timestamp(1);
        check_message_size(&fits).expect("small message fits");

        // Fits as a `pub` frame but not once wrapped in a `msg` frame.
        let pub_len = encode(&Frame::Pub {
            message: Message::info("a.b", "").with_timestamp(1),
        })
        .expect("encode")
        .len();
        let borderline =
            Message::info("a.b", "x".repeat(MAX_FRAME_SIZE - pub_len)).with_timestamp(1);
        encode(&Frame::Pub {
            message: borderline.clone(),
        })
        .expect("pub frame fits");
        let err = check_message_size(&borderline).expect_err("msg frame would not fit");
        assert!(matches!(err, BrokerError::Protocol(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn read_frame_rejects_overlong_line() {
        let mut input = vec![b'x'; MAX_FRAME_SIZE + 10];
        input.push(b'\n');
        let mut reader = BufReader::new(&input[..]);
        let mut line = String::new();

        let err = read_frame(&mut reader, &mut line)
            .await
            .expect_err("overlong line");
        assert!(matches!(err, BrokerError::Protocol(_)));
        assert_eq!(line.len(), MAX_FRAME_SIZE + 1);
    }

    #[tokio::test]
    async fn read_frame_skips_blank_lines_and_reports_eof() {
        let input = b"\n  \n{\"op\":\"pong\",\"id\":3}\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut line = String::new();

        let frame = read_frame(&mut reader, &mut line).await.expect("read");
        assert_eq!(frame, Some(Frame::Pong { id: 3 }));

        let eof = read_frame(&mut reader, &mut line).await.expect("read");
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn write_then_read_sub_frame() {
        let mut buf = Vec::new();
        let frame = Frame::Sub {
            sid: 1,
            topic: "logs.>".to_owned(),
        };
        write_frame(&mut buf, &frame).await.expect("write");

        let mut reader = BufReader::new(&buf[..]);
        let mut line = String::new();
        let read = read_frame(&mut reader, &mut line).await.expect("read");
        assert_eq!(read, Some(frame));
    }
}
