//! Incremental framing of the incoming byte stream into LDAPMessages.
//!
//! One complete top-level TLV is split off per message, using the outer
//! SEQUENCE length (definite or indefinite). Any framing or decode failure
//! is fatal for the transport; there is no resynchronization.

use bytes::BytesMut;
use tracing::warn;

use crate::error::{LdapError, Result};
use crate::protocol::{decode_message, measure_tlv, Message};

/// Top-level LDAPMessage is always a SEQUENCE.
const MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Upper bound for a single message; a length beyond this is treated as a
/// framing error rather than an allocation request.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete message, or `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] != MESSAGE_SEQUENCE_TAG {
            return Err(LdapError::Protocol(format!(
                "stream does not start with an LDAPMessage SEQUENCE (tag 0x{:02X})",
                self.buf[0]
            )));
        }
        let total = match measure_tlv(&self.buf)? {
            Some(n) => n,
            None => {
                // refuse to wait for an absurd declared length
                if self.buf.len() >= 6 {
                    if let Some(declared) = declared_length(&self.buf) {
                        if declared > MAX_MESSAGE_SIZE {
                            return Err(LdapError::Protocol(format!(
                                "message length {} exceeds limit",
                                declared
                            )));
                        }
                    }
                }
                return Ok(None);
            }
        };
        if total > MAX_MESSAGE_SIZE {
            return Err(LdapError::Protocol(format!(
                "message length {} exceeds limit",
                total
            )));
        }
        let frame = self.buf.split_to(total);
        match decode_message(&frame) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                let preview: String = frame
                    .iter()
                    .take(64)
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(" ");
                warn!("failed to decode LDAP message: {} (first 64 bytes: {})", e, preview);
                Err(e)
            }
        }
    }
}

/// Declared definite length of the first TLV, if its header is complete.
fn declared_length(buf: &[u8]) -> Option<usize> {
    let first = *buf.get(1)?;
    if first & 0x80 == 0 {
        return Some(first as usize);
    }
    if first == 0x80 {
        return None;
    }
    let nlen = (first & 0x7F) as usize;
    if buf.len() < 2 + nlen {
        return None;
    }
    let mut len = 0usize;
    for i in 0..nlen.min(8) {
        len = len.saturating_mul(256) + buf[2 + i] as usize;
    }
    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_message, LdapResult, ProtocolOp};

    fn sample(id: i32) -> Vec<u8> {
        encode_message(&Message::new(
            id,
            ProtocolOp::BindResponse(LdapResult::success()),
        ))
    }

    #[test]
    fn single_message() {
        let mut fb = FrameBuffer::new();
        fb.push(&sample(1));
        let msg = fb.next_message().unwrap().unwrap();
        assert_eq!(msg.id, 1);
        assert!(fb.next_message().unwrap().is_none());
    }

    #[test]
    fn partial_then_complete() {
        let bytes = sample(2);
        let mut fb = FrameBuffer::new();
        fb.push(&bytes[..3]);
        assert!(fb.next_message().unwrap().is_none());
        fb.push(&bytes[3..]);
        assert_eq!(fb.next_message().unwrap().unwrap().id, 2);
    }

    #[test]
    fn two_messages_in_one_read() {
        let mut combined = sample(1);
        combined.extend_from_slice(&sample(2));
        let mut fb = FrameBuffer::new();
        fb.push(&combined);
        assert_eq!(fb.next_message().unwrap().unwrap().id, 1);
        assert_eq!(fb.next_message().unwrap().unwrap().id, 2);
        assert!(fb.next_message().unwrap().is_none());
    }

    #[test]
    fn byte_at_a_time() {
        let bytes = sample(3);
        let mut fb = FrameBuffer::new();
        for (i, b) in bytes.iter().enumerate() {
            fb.push(std::slice::from_ref(b));
            let got = fb.next_message().unwrap();
            if i + 1 == bytes.len() {
                assert_eq!(got.unwrap().id, 3);
            } else {
                assert!(got.is_none());
            }
        }
    }

    #[test]
    fn bad_leading_tag_is_fatal() {
        let mut fb = FrameBuffer::new();
        fb.push(&[0x04, 0x02, 0x00, 0x00]);
        assert!(fb.next_message().is_err());
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut fb = FrameBuffer::new();
        // SEQUENCE with a 4-byte length far beyond the cap
        fb.push(&[0x30, 0x84, 0x7F, 0xFF, 0xFF, 0xFF, 0x02]);
        assert!(fb.next_message().is_err());
    }

    #[test]
    fn indefinite_outer_length() {
        // SEQUENCE (indefinite) { INTEGER 4, UnbindRequest } EOC
        let bytes = [0x30, 0x80, 0x02, 0x01, 0x04, 0x42, 0x00, 0x00, 0x00];
        let mut fb = FrameBuffer::new();
        fb.push(&bytes[..6]);
        assert!(fb.next_message().unwrap().is_none());
        fb.push(&bytes[6..]);
        let msg = fb.next_message().unwrap().unwrap();
        assert_eq!(msg.id, 4);
        assert_eq!(msg.op, ProtocolOp::UnbindRequest);
    }
}
