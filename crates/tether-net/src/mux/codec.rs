//! Mux frame encoding.
//!
//! Every frame is a 9-byte header followed by a payload:
//!
//! ```text
//! +--------+----------------+----------------+------------------+
//! | op: u8 | session: u32BE | length: u32BE  | payload (length) |
//! +--------+----------------+----------------+------------------+
//! ```
//!
//! | op | frame       | payload                                        |
//! |----|-------------|------------------------------------------------|
//! | 1  | `HELLO`     | magic `TMUX`, version u8, max sessions u32 BE  |
//! | 2  | `HELLO_ACK` | same as `HELLO`                                |
//! | 3  | `OPEN`      | empty                                          |
//! | 4  | `DATA`      | session bytes                                  |
//! | 5  | `CLOSE`     | empty; the sender will write no more data      |
//! | 6  | `ABORT`     | one byte: 1 if the request was delivered       |
//! | 7  | `SHUTDOWN`  | last dispatched session u32 BE, UTF-8 reason   |
//!
//! Connection-level frames (`HELLO`, `HELLO_ACK`, `SHUTDOWN`) use session 0.
//! The length is checked against [`MAX_PAYLOAD`] before any buffer is
//! reserved for the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::MuxError;

/// Header length in bytes.
pub const HEADER_LEN: usize = 9;

/// Maximum payload length (64 KiB).
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Handshake magic.
pub const MAGIC: &[u8; 4] = b"TMUX";

/// Protocol version.
pub const VERSION: u8 = 1;

const OP_HELLO: u8 = 1;
const OP_HELLO_ACK: u8 = 2;
const OP_OPEN: u8 = 3;
const OP_DATA: u8 = 4;
const OP_CLOSE: u8 = 5;
const OP_ABORT: u8 = 6;
const OP_SHUTDOWN: u8 = 7;

const HELLO_LEN: usize = 9;

/// One mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client greeting.
    Hello {
        /// Protocol version.
        version: u8,
        /// Sessions the sender allows per connection.
        max_sessions: u32,
    },
    /// Server reply to [`Frame::Hello`].
    HelloAck {
        /// Protocol version.
        version: u8,
        /// Sessions the sender allows per connection.
        max_sessions: u32,
    },
    /// Opens a session.
    Open {
        /// Session id.
        session: u32,
    },
    /// Session data.
    Data {
        /// Session id.
        session: u32,
        /// Payload, at most [`MAX_PAYLOAD`] bytes.
        payload: Bytes,
    },
    /// Half close: the sender writes no more data on the session.
    Close {
        /// Session id.
        session: u32,
    },
    /// Aborts a session in both directions.
    Abort {
        /// Session id.
        session: u32,
        /// Whether the request reached the dispatcher.
        delivered: bool,
    },
    /// Graceful connection shutdown.
    Shutdown {
        /// Highest session id the sender dispatched.
        last_session: u32,
        /// Human-readable reason.
        reason: String,
    },
}

impl Frame {
    /// Session id carried by the frame; 0 for connection-level frames.
    #[must_use]
    pub const fn session(&self) -> u32 {
        match self {
            Self::Open { session }
            | Self::Data { session, .. }
            | Self::Close { session }
            | Self::Abort { session, .. } => *session,
            Self::Hello { .. } | Self::HelloAck { .. } | Self::Shutdown { .. } => 0,
        }
    }
}

/// Codec for [`Frame`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let op = src[0];
        let session = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        let len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(MuxError::frame_too_large(len));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut payload = src.split_to(len).freeze();

        let frame = match op {
            OP_HELLO | OP_HELLO_ACK => {
                if payload.len() != HELLO_LEN || &payload[..4] != MAGIC {
                    return Err(MuxError::invalid_frame("bad handshake payload"));
                }
                payload.advance(4);
                let version = payload.get_u8();
                let max_sessions = payload.get_u32();
                if op == OP_HELLO {
                    Frame::Hello {
                        version,
                        max_sessions,
                    }
                } else {
                    Frame::HelloAck {
                        version,
                        max_sessions,
                    }
                }
            },
            OP_OPEN => {
                expect_empty(&payload, "OPEN")?;
                Frame::Open { session }
            },
            OP_DATA => Frame::Data { session, payload },
            OP_CLOSE => {
                expect_empty(&payload, "CLOSE")?;
                Frame::Close { session }
            },
            OP_ABORT => match payload.as_ref() {
                [flag @ (0 | 1)] => Frame::Abort {
                    session,
                    delivered: *flag == 1,
                },
                _ => return Err(MuxError::invalid_frame("bad ABORT payload")),
            },
            OP_SHUTDOWN => {
                if payload.len() < 4 {
                    return Err(MuxError::invalid_frame("short SHUTDOWN payload"));
                }
                let last_session = payload.get_u32();
                let reason = String::from_utf8(payload.to_vec())
                    .map_err(|_| MuxError::invalid_frame("SHUTDOWN reason is not UTF-8"))?;
                Frame::Shutdown {
                    last_session,
                    reason,
                }
            },
            other => return Err(MuxError::invalid_frame(format!("unknown op {other}"))),
        };
        Ok(Some(frame))
    }
}

fn expect_empty(payload: &Bytes, op: &str) -> Result<(), MuxError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(MuxError::invalid_frame(format!("{op} carries a payload")))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        let session = frame.session();
        match frame {
            Frame::Hello {
                version,
                max_sessions,
            } => put_hello(dst, OP_HELLO, version, max_sessions),
            Frame::HelloAck {
                version,
                max_sessions,
            } => put_hello(dst, OP_HELLO_ACK, version, max_sessions),
            Frame::Open { .. } => put_header(dst, OP_OPEN, session, 0),
            Frame::Data { payload, .. } => {
                if payload.len() > MAX_PAYLOAD {
                    return Err(MuxError::frame_too_large(payload.len()));
                }
                put_header(dst, OP_DATA, session, payload.len());
                dst.extend_from_slice(&payload);
            },
            Frame::Close { .. } => put_header(dst, OP_CLOSE, session, 0),
            Frame::Abort { delivered, .. } => {
                put_header(dst, OP_ABORT, session, 1);
                dst.put_u8(u8::from(delivered));
            },
            Frame::Shutdown {
                last_session,
                reason,
            } => {
                let len = 4 + reason.len();
                if len > MAX_PAYLOAD {
                    return Err(MuxError::frame_too_large(len));
                }
                put_header(dst, OP_SHUTDOWN, 0, len);
                dst.put_u32(last_session);
                dst.extend_from_slice(reason.as_bytes());
            },
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn put_header(dst: &mut BytesMut, op: u8, session: u32, len: usize) {
    dst.reserve(HEADER_LEN + len);
    dst.put_u8(op);
    dst.put_u32(session);
    // len <= MAX_PAYLOAD
    dst.put_u32(len as u32);
}

fn put_hello(dst: &mut BytesMut, op: u8, version: u8, max_sessions: u32) {
    put_header(dst, op, 0, HELLO_LEN);
    dst.extend_from_slice(MAGIC);
    dst.put_u8(version);
    dst.put_u32(max_sessions);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(Frame::Data {
            session: 0x0102_0304,
            payload: Bytes::from_static(b"hi"),
        });
        assert_eq!(&buf[..], &[4, 1, 2, 3, 4, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let full = encode(Frame::Shutdown {
            last_session: 7,
            reason: "draining".into(),
        });
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(FrameCodec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(
            FrameCodec.decode(&mut partial).unwrap(),
            Some(Frame::Shutdown {
                last_session: 7,
                reason: "draining".into()
            })
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_DATA);
        buf.put_u32(1);
        buf.put_u32(u32::MAX);
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, MuxError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = encode(Frame::Hello {
            version: VERSION,
            max_sessions: 4,
        });
        buf[HEADER_LEN] = b'X';
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(MuxError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_unknown_op() {
        let mut buf = BytesMut::from(&[99u8, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(MuxError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_abort_flag() {
        let mut buf = encode(Frame::Abort {
            session: 3,
            delivered: false,
        });
        assert_eq!(
            FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Abort {
                session: 3,
                delivered: false
            })
        );

        let mut bad = BytesMut::from(&[OP_ABORT, 0, 0, 0, 3, 0, 0, 0, 1, 7][..]);
        assert!(FrameCodec.decode(&mut bad).is_err());
    }

    #[test]
    fn test_encode_rejects_large_data() {
        let mut buf = BytesMut::new();
        let err = FrameCodec
            .encode(
                Frame::Data {
                    session: 1,
                    payload: Bytes::from(vec![0u8; MAX_PAYLOAD + 1]),
                },
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, MuxError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encode(Frame::Open { session: 1 });
        buf.extend_from_slice(&encode(Frame::Close { session: 1 }));
        assert_eq!(
            FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Open { session: 1 })
        );
        assert_eq!(
            FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Close { session: 1 })
        );
        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), None);
    }
}
