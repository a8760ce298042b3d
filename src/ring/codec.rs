// Wire format: one JSON object per line.
//   {"sum":15,"initiator":1,"round":8243...}\n   sender -> receiver
//   {"status":"accepted"}\n                      receiver -> sender

use crate::ring::types::{Ack, RoundMessage};
use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload exceeds {} bytes", MAX_FRAME_BYTES)]
    TooLarge,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode(msg: &RoundMessage) -> serde_json::Result<Vec<u8>> {
    to_line(msg)
}

pub fn decode(bytes: &[u8]) -> Result<RoundMessage, DecodeError> {
    let trimmed = trim_ascii(bytes);
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    if trimmed.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge);
    }
    Ok(serde_json::from_slice(trimmed)?)
}

pub fn write_message<W: Write>(stream: &mut W, msg: &RoundMessage) -> std::io::Result<()> {
    stream.write_all(&encode(msg)?)?;
    stream.flush()
}

/// Reads one frame: up to the first newline, or to EOF for peers that close
/// instead of terminating the line.
pub fn read_message<R: Read>(stream: &mut R) -> Result<RoundMessage, DecodeError> {
    let line = read_frame(stream)?;
    decode(&line)
}

pub fn write_ack<W: Write>(stream: &mut W) -> std::io::Result<()> {
    stream.write_all(&to_line(&Ack::Accepted)?)?;
    stream.flush()
}

pub fn read_ack<R: Read>(stream: &mut R) -> Result<Ack, DecodeError> {
    let line = read_frame(stream)?;
    let trimmed = trim_ascii(&line);
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(trimmed)?)
}

fn to_line<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = serde_json::to_vec(value)?;
    out.push(b'\n');
    Ok(out)
}

/// The limit applies to the payload; the line terminator is not counted.
fn read_frame<R: Read>(stream: &mut R) -> Result<Vec<u8>, DecodeError> {
    let limit = (MAX_FRAME_BYTES + 2) as u64;
    let mut reader = BufReader::new(stream.take(limit));
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    let mut payload = line.as_slice();
    for terminator in [b'\n', b'\r'] {
        if let Some((&last, rest)) = payload.split_last() {
            if last == terminator {
                payload = rest;
            }
        }
    }
    if payload.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge);
    }
    Ok(line)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodes_local_mask_message_without_r() {
        let msg = RoundMessage {
            sum: 15,
            initiator: 1,
            round: 9,
            mask: None,
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes, b"{\"sum\":15,\"initiator\":1,\"round\":9}\n".to_vec());
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn accepts_legacy_messages() {
        // no round id, R in the clear
        let msg = decode(br#"{"sum": 35, "initiator": 2, "R": 77}"#).unwrap();
        assert_eq!(msg.sum, 35);
        assert_eq!(msg.initiator, 2);
        assert_eq!(msg.round, 0);
        assert_eq!(msg.mask, Some(77));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(decode(b""), Err(DecodeError::Empty)));
        assert!(matches!(decode(b" \n"), Err(DecodeError::Empty)));
        assert!(matches!(decode(b"hello ring"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(br#"{"sum": 10}"#), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(br#"{"initiator": 1}"#), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(br#"{"sum": -4, "initiator": 1}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode(br#"{"sum": "15", "initiator": 1}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn reads_one_frame_and_stops() {
        let mut input = Cursor::new(b"{\"sum\":1,\"initiator\":3}\ntrailing".to_vec());
        let msg = read_message(&mut input).unwrap();
        assert_eq!(msg.sum, 1);
        assert_eq!(msg.initiator, 3);
    }

    #[test]
    fn reads_unterminated_frame_at_eof() {
        let mut input = Cursor::new(br#"{"sum":4,"initiator":1}"#.to_vec());
        assert_eq!(read_message(&mut input).unwrap().sum, 4);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut big = vec![b' '; MAX_FRAME_BYTES + 10];
        big.push(b'\n');
        let mut input = Cursor::new(big);
        assert!(matches!(read_message(&mut input), Err(DecodeError::TooLarge)));
    }

    #[test]
    fn frame_limit_excludes_line_terminator() {
        let head = br#"{"sum":1,"#;
        let tail = br#""initiator":2}"#;
        let mut payload = head.to_vec();
        payload.resize(MAX_FRAME_BYTES - tail.len(), b' ');
        payload.extend_from_slice(tail);
        assert_eq!(payload.len(), MAX_FRAME_BYTES);
        assert_eq!(decode(&payload).unwrap().initiator, 2);

        let mut framed = payload.clone();
        framed.push(b'\n');
        assert_eq!(read_message(&mut Cursor::new(framed)).unwrap().sum, 1);

        let mut crlf = payload.clone();
        crlf.extend_from_slice(b"\r\n");
        assert_eq!(read_message(&mut Cursor::new(crlf)).unwrap().sum, 1);

        let mut over = payload;
        over.insert(head.len(), b' ');
        over.push(b'\n');
        assert!(matches!(
            read_message(&mut Cursor::new(over)),
            Err(DecodeError::TooLarge)
        ));
    }

    #[test]
    fn ack_round_trip() {
        let mut buf = Vec::new();
        write_ack(&mut buf).unwrap();
        assert_eq!(buf, b"{\"status\":\"accepted\"}\n".to_vec());
        assert_eq!(read_ack(&mut Cursor::new(buf)).unwrap(), Ack::Accepted);
        assert!(matches!(
            read_ack(&mut Cursor::new(Vec::new())),
            Err(DecodeError::Empty)
        ));
    }
}
