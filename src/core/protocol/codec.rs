// src/core/protocol/codec.rs

//! A `tokio_util::codec` implementation framing controller messages.
//!
//! The outer frame is a `u32` little-endian length covering header + body.
//! The header's own `body_length` is authoritative for locating the body
//! inside the frame; a disagreement between the two is a protocol error.

use crate::core::ControllerError;
use crate::core::protocol::message::{Body, Header, Message};
use crate::core::protocol::pack::{Packer, Unpacker};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame; a batch environment can be large but a
/// frame past this size is a malformed or hostile peer.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = ControllerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body_packer = Packer::new();
        item.body.pack(&mut body_packer);
        let body = body_packer.into_bytes();

        let mut header = item.header.clone();
        header.body_length = body.len() as u32;

        let mut head_packer = Packer::new();
        header.pack(&mut head_packer);
        let head = head_packer.into_bytes();

        let total = head.len() + body.len();
        if total > MAX_FRAME_SIZE {
            return Err(ControllerError::Protocol(format!(
                "outbound frame of {total} bytes exceeds limit"
            )));
        }
        dst.reserve(LEN_PREFIX + total);
        dst.put_u32_le(total as u32);
        dst.put_slice(&head);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ControllerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let total = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total > MAX_FRAME_SIZE {
            return Err(ControllerError::Protocol(format!(
                "inbound frame of {total} bytes exceeds limit"
            )));
        }
        if src.len() < LEN_PREFIX + total {
            src.reserve(LEN_PREFIX + total - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let frame: Bytes = src.split_to(total).freeze();

        let mut u = Unpacker::new(frame);
        let header = Header::unpack(&mut u)?;
        if header.body_length as usize != u.remaining() {
            return Err(ControllerError::Protocol(format!(
                "header claims {} body bytes, frame carries {}",
                header.body_length,
                u.remaining()
            )));
        }
        let body = Body::unpack(header.msg_type, &mut u)?;
        Ok(Some(Message { header, body }))
    }
}
