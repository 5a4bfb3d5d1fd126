//! Streaming wire protocol codec.
//!
//! Control lines are terminated by `\n` or `\r\n` (interchangeably), with
//! tokens separated by a single space:
//!
//! ```text
//! PUB <subject> <#bytes>\n<payload>\n
//! SUB <subject>\n
//! UNSUB <subject>\n
//! ```
//!
//! Outbound frames are `INFO <json>\n`, `MSG <subject> <#bytes>\n<payload>\n`,
//! `-ERR <message>\n` and the terminator-less `PING`/`PONG`.
//!
//! The decoder is incremental: bytes are buffered until a full frame is
//! present, and a frame split across arbitrary chunk boundaries decodes to
//! exactly the same events as the unsplit input. The first malformed input
//! poisons the decoder; every later [`Decoder::feed`] fails with
//! [`DecodeError::Closed`], which makes a protocol violation fatal to the
//! session.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

const OP_PUB: &str = "PUB";
const OP_SUB: &str = "SUB";
const OP_UNSUB: &str = "UNSUB";
const OP_PING: &str = "PING";
const OP_PONG: &str = "PONG";

const FORMAT_PUB: &str = "PUB <subject> <#bytes>\\n<payload>\\n";
const FORMAT_SUB: &str = "SUB <subject>\\n";
const FORMAT_UNSUB: &str = "UNSUB <subject>\\n";
const FORMAT_PING: &str = "PING\\n";
const FORMAT_PONG: &str = "PONG\\n";
const FORMAT_PAYLOAD_END: &str = "<payload>\\n";

/// A routed message: a subject and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// A single operation decoded from a peer's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Publish { subject: String, payload: Bytes },
    Subscribe { subject: String },
    Unsubscribe { subject: String },
    /// Bare `PING` line; the peer expects a `PONG` frame in return.
    Ping,
    /// Bare `PONG` line, acknowledging one of our liveness probes.
    Pong,
}

/// Decoder failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Malformed input. Fatal: the decoder accepts no further input.
    #[error("expected {}, got {actual:?}", render_expected(expected))]
    Malformed {
        expected: Vec<&'static str>,
        actual: String,
    },

    /// Input offered after a previous protocol error.
    #[error("decoder is closed after a protocol error")]
    Closed,
}

fn render_expected(expected: &[&'static str]) -> String {
    match expected {
        [single] => format!("{single:?}"),
        many => format!("one of {}", many.join(", ")),
    }
}

fn malformed(expected: &'static str, actual: &str) -> DecodeError {
    DecodeError::Malformed {
        expected: vec![expected],
        actual: actual.to_string(),
    }
}

enum State {
    /// Accumulating a control line.
    Line,
    /// Consuming the declared payload bytes of a `PUB`.
    Payload { subject: String, remaining: usize },
    /// Payload complete; the closing terminator is still part of the frame.
    PayloadEnd { subject: String },
}

/// Incremental decoder for the inbound side of the protocol.
pub struct Decoder {
    buf: BytesMut,
    // Payload scratch, reused frame to frame; emitted events take a split
    // off it and own their bytes.
    payload: BytesMut,
    state: State,
    poisoned: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            payload: BytesMut::new(),
            state: State::Line,
            poisoned: false,
        }
    }

    /// Feed one chunk, appending every operation it completes to `out`.
    ///
    /// Partial input is buffered and resumed on the next call. An `Err`
    /// poisons the decoder; operations completed before the offending bytes
    /// are still appended and should be applied by the caller.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<ClientOp>) -> Result<(), DecodeError> {
        if self.poisoned {
            return Err(DecodeError::Closed);
        }
        self.buf.extend_from_slice(chunk);
        self.drain(out).inspect_err(|_| self.poisoned = true)
    }

    fn drain(&mut self, out: &mut Vec<ClientOp>) -> Result<(), DecodeError> {
        loop {
            match std::mem::replace(&mut self.state, State::Line) {
                State::Line => {
                    let Some(line) = take_line(&mut self.buf) else {
                        return Ok(());
                    };
                    self.parse_line(&line, out)?;
                }
                State::Payload {
                    subject,
                    mut remaining,
                } => {
                    let take = remaining.min(self.buf.len());
                    self.payload.extend_from_slice(&self.buf.split_to(take));
                    remaining -= take;
                    if remaining > 0 {
                        self.state = State::Payload { subject, remaining };
                        return Ok(());
                    }
                    self.state = State::PayloadEnd { subject };
                }
                State::PayloadEnd { subject } => match self.buf.first() {
                    None => {
                        self.state = State::PayloadEnd { subject };
                        return Ok(());
                    }
                    Some(b'\n') => {
                        self.buf.advance(1);
                        out.push(ClientOp::Publish {
                            subject,
                            payload: self.payload.split().freeze(),
                        });
                    }
                    Some(b'\r') => {
                        if self.buf.len() < 2 {
                            self.state = State::PayloadEnd { subject };
                            return Ok(());
                        }
                        if self.buf[1] != b'\n' {
                            return Err(self.payload_end_error());
                        }
                        self.buf.advance(2);
                        out.push(ClientOp::Publish {
                            subject,
                            payload: self.payload.split().freeze(),
                        });
                    }
                    Some(_) => return Err(self.payload_end_error()),
                },
            }
        }
    }

    fn parse_line(&mut self, line: &[u8], out: &mut Vec<ClientOp>) -> Result<(), DecodeError> {
        let Ok(text) = std::str::from_utf8(line) else {
            return Err(DecodeError::Malformed {
                expected: vec![OP_PUB, OP_SUB, OP_UNSUB],
                actual: String::from_utf8_lossy(line).into_owned(),
            });
        };
        let tokens: Vec<&str> = text.split(' ').collect();

        match tokens[0] {
            OP_PUB => {
                if tokens.len() != 3 || tokens[1].is_empty() {
                    return Err(malformed(FORMAT_PUB, text));
                }
                if tokens[2].is_empty() || !tokens[2].bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed(FORMAT_PUB, text));
                }
                let remaining: usize = tokens[2].parse().map_err(|_| malformed(FORMAT_PUB, text))?;
                self.state = State::Payload {
                    subject: tokens[1].to_string(),
                    remaining,
                };
            }
            OP_SUB => {
                if tokens.len() != 2 || tokens[1].is_empty() {
                    return Err(malformed(FORMAT_SUB, text));
                }
                out.push(ClientOp::Subscribe {
                    subject: tokens[1].to_string(),
                });
            }
            OP_UNSUB => {
                if tokens.len() != 2 || tokens[1].is_empty() {
                    return Err(malformed(FORMAT_UNSUB, text));
                }
                out.push(ClientOp::Unsubscribe {
                    subject: tokens[1].to_string(),
                });
            }
            OP_PING => {
                if tokens.len() != 1 {
                    return Err(malformed(FORMAT_PING, text));
                }
                out.push(ClientOp::Ping);
            }
            OP_PONG => {
                if tokens.len() != 1 {
                    return Err(malformed(FORMAT_PONG, text));
                }
                out.push(ClientOp::Pong);
            }
            other => {
                return Err(DecodeError::Malformed {
                    expected: vec![OP_PUB, OP_SUB, OP_UNSUB],
                    actual: other.to_string(),
                });
            }
        }
        Ok(())
    }

    fn payload_end_error(&self) -> DecodeError {
        let end = self.buf.len().min(16);
        DecodeError::Malformed {
            expected: vec![FORMAT_PAYLOAD_END],
            actual: String::from_utf8_lossy(&self.buf[..end]).into_owned(),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off the next terminated line, stripping the terminator. Returns
/// `None` while no terminator is buffered yet.
fn take_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let newline = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(newline);
    buf.advance(1);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Some(line)
}

/// Append an `INFO` frame. A JSON serialization failure degrades to a fixed
/// diagnostic body rather than an error.
pub fn encode_info(buf: &mut BytesMut, info: &crate::InfoMap) {
    buf.extend_from_slice(b"INFO ");
    match serde_json::to_vec(info) {
        Ok(json) => buf.extend_from_slice(&json),
        Err(_) => buf.extend_from_slice(br#"{"error":"error encoding info"}"#),
    }
    buf.extend_from_slice(b"\n");
}

/// Append a `MSG` frame.
pub fn encode_msg(buf: &mut BytesMut, msg: &Message) {
    buf.extend_from_slice(format!("MSG {} {}\n", msg.subject, msg.payload.len()).as_bytes());
    buf.extend_from_slice(&msg.payload);
    buf.extend_from_slice(b"\n");
}

/// Append an `-ERR` frame.
pub fn encode_err(buf: &mut BytesMut, err: &impl std::fmt::Display) {
    buf.extend_from_slice(format!("-ERR {err}\n").as_bytes());
}

/// Append a `PING` frame. No terminator.
pub fn encode_ping(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PING");
}

/// Append a `PONG` frame. No terminator.
pub fn encode_pong(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PONG");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> Vec<ClientOp> {
        let mut decoder = Decoder::new();
        let mut ops = Vec::new();
        decoder.feed(input, &mut ops).expect("decode");
        ops
    }

    fn publish(subject: &str, payload: &'static [u8]) -> ClientOp {
        ClientOp::Publish {
            subject: subject.to_string(),
            payload: Bytes::from_static(payload),
        }
    }

    fn subscribe(subject: &str) -> ClientOp {
        ClientOp::Subscribe {
            subject: subject.to_string(),
        }
    }

    fn unsubscribe(subject: &str) -> ClientOp {
        ClientOp::Unsubscribe {
            subject: subject.to_string(),
        }
    }

    #[test]
    fn decodes_control_lines() {
        let cases: Vec<(&[u8], Vec<ClientOp>)> = vec![
            (b"PUB foo 3\nbar\n", vec![publish("foo", b"bar")]),
            (b"PUB foo 3\r\nbar\r\n", vec![publish("foo", b"bar")]),
            (b"SUB foo\n", vec![subscribe("foo")]),
            (b"SUB foo\r\n", vec![subscribe("foo")]),
            (b"UNSUB foo\n", vec![unsubscribe("foo")]),
            (b"UNSUB foo\r\n", vec![unsubscribe("foo")]),
            (
                b"SUB foo\nUNSUB bar\n",
                vec![subscribe("foo"), unsubscribe("bar")],
            ),
            (b"PING\n", vec![ClientOp::Ping]),
            (b"PONG\r\n", vec![ClientOp::Pong]),
        ];
        for (input, expected) in cases {
            assert_eq!(decode(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn mixed_terminators_in_one_chunk() {
        // A \n-terminated line ahead of a \r\n-terminated one must not be
        // split at the later terminator.
        let ops = decode(b"SUB a\nSUB b\r\nSUB c\n");
        assert_eq!(ops, vec![subscribe("a"), subscribe("b"), subscribe("c")]);
    }

    #[test]
    fn zero_length_payload() {
        assert_eq!(decode(b"PUB foo 0\n\n"), vec![publish("foo", b"")]);
        assert_eq!(decode(b"PUB foo 0\r\n\r\n"), vec![publish("foo", b"")]);
    }

    #[test]
    fn payload_may_contain_terminator_bytes() {
        assert_eq!(decode(b"PUB foo 4\na\nb\r\n"), vec![publish("foo", b"a\nb\r")]);
    }

    #[test]
    fn reassembles_chunks() {
        let mut decoder = Decoder::new();
        let mut ops = Vec::new();
        for chunk in [b"PU".as_slice(), b"B foo 3\nb", b"ar\n"] {
            decoder.feed(chunk, &mut ops).expect("feed");
        }
        assert_eq!(ops, vec![publish("foo", b"bar")]);
    }

    #[test]
    fn reassembles_split_crlf_after_payload() {
        let mut decoder = Decoder::new();
        let mut ops = Vec::new();
        decoder.feed(b"PUB foo 3\r\nbar\r", &mut ops).expect("feed");
        assert!(ops.is_empty());
        decoder.feed(b"\n", &mut ops).expect("feed");
        assert_eq!(ops, vec![publish("foo", b"bar")]);
    }

    #[test]
    fn any_chunking_yields_identical_events() {
        let input: &[u8] = b"SUB a\r\nPUB foo 5\nhello\nUNSUB a\nPUB x 0\r\n\r\n";
        let expected = decode(input);
        for split in 0..=input.len() {
            let mut decoder = Decoder::new();
            let mut ops = Vec::new();
            decoder.feed(&input[..split], &mut ops).expect("first chunk");
            decoder.feed(&input[split..], &mut ops).expect("second chunk");
            assert_eq!(ops, expected, "split at {split}");
        }
    }

    #[test]
    fn unknown_op_is_fatal_and_sticky() {
        let mut decoder = Decoder::new();
        let mut ops = Vec::new();
        let err = decoder
            .feed(b"NOSUCHOP x\n", &mut ops)
            .expect_err("unknown op");
        assert_eq!(
            err,
            DecodeError::Malformed {
                expected: vec![OP_PUB, OP_SUB, OP_UNSUB],
                actual: "NOSUCHOP".to_string(),
            }
        );

        // Later writes fail without producing events.
        let err = decoder.feed(b"SUB foo\n", &mut ops).expect_err("poisoned");
        assert_eq!(err, DecodeError::Closed);
        assert!(ops.is_empty());
    }

    #[test]
    fn ops_before_the_error_are_still_emitted() {
        let mut decoder = Decoder::new();
        let mut ops = Vec::new();
        decoder
            .feed(b"SUB foo\nNOSUCHOP\n", &mut ops)
            .expect_err("unknown op");
        assert_eq!(ops, vec![subscribe("foo")]);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let cases: Vec<&[u8]> = vec![
            b"PUB foo\n",          // missing length
            b"PUB foo 3 extra\n",  // too many tokens
            b"PUB foo x\n",        // length not a number
            b"PUB foo -1\n",       // negative length
            b"PUB  3\n",           // empty subject
            b"SUB \n",             // empty subject
            b"SUB a b\n",          // too many tokens
            b"UNSUB\n",            // missing subject
            b"PING extra\n",       // PING takes no arguments
        ];
        for input in cases {
            let mut decoder = Decoder::new();
            let mut ops = Vec::new();
            assert!(
                decoder.feed(input, &mut ops).is_err(),
                "expected error for {input:?}"
            );
        }
    }

    #[test]
    fn missing_payload_terminator_is_fatal() {
        let mut decoder = Decoder::new();
        let mut ops = Vec::new();
        let err = decoder
            .feed(b"PUB foo 3\nbarXY", &mut ops)
            .expect_err("missing terminator");
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert!(ops.is_empty());

        let mut decoder = Decoder::new();
        let err = decoder
            .feed(b"PUB foo 3\nbar\rX", &mut ops)
            .expect_err("bare CR");
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn encodes_msg_frame() {
        let mut buf = BytesMut::new();
        encode_msg(&mut buf, &Message::new("foo", Bytes::from_static(b"bar")));
        assert_eq!(&buf[..], b"MSG foo 3\nbar\n");
    }

    #[test]
    fn encodes_info_frame() {
        let mut info = crate::InfoMap::new();
        info.insert("name".to_string(), serde_json::Value::String("n1".into()));
        let mut buf = BytesMut::new();
        encode_info(&mut buf, &info);
        assert_eq!(&buf[..], b"INFO {\"name\":\"n1\"}\n");
    }

    #[test]
    fn encodes_err_ping_pong() {
        let mut buf = BytesMut::new();
        encode_err(&mut buf, &DecodeError::Closed);
        assert_eq!(&buf[..], b"-ERR decoder is closed after a protocol error\n");

        buf.clear();
        encode_ping(&mut buf);
        encode_pong(&mut buf);
        assert_eq!(&buf[..], b"PINGPONG");
    }

    #[test]
    fn encoders_append_to_the_buffer() {
        let mut buf = BytesMut::new();
        encode_msg(&mut buf, &Message::new("a", Bytes::from_static(b"x")));
        encode_msg(&mut buf, &Message::new("b", Bytes::from_static(b"y")));
        assert_eq!(&buf[..], b"MSG a 1\nx\nMSG b 1\ny\n");
    }

    #[test]
    fn decoded_payloads_do_not_alias_the_scratch_buffer() {
        let mut decoder = Decoder::new();
        let mut ops = Vec::new();
        decoder.feed(b"PUB a 3\nxxx\n", &mut ops).expect("feed");
        decoder.feed(b"PUB b 3\nyyy\n", &mut ops).expect("feed");
        assert_eq!(
            ops,
            vec![publish("a", b"xxx"), publish("b", b"yyy")]
        );
    }
}
