//! udscs framing codec for tokio I/O.
//!
//! Framing: `[16 bytes: kind, arg1, arg2, size as little-endian u32][size bytes: payload]`

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{HEADER_LEN, Header, MAX_PAYLOAD_SIZE, MalformedPayload, Message, kind_name};

/// Codec error type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Header-then-payload codec for the vdagentd socket.
///
/// Keeps the parsed header between calls so a payload split across reads
/// is not re-parsed.
#[derive(Debug, Default)]
pub struct UdscsCodec {
    pending: Option<Header>,
}

impl UdscsCodec {
    pub fn new() -> Self {
        Self { pending: None }
    }
}

impl Decoder for UdscsCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let header = Header {
                    kind: src.get_u32_le(),
                    arg1: src.get_u32_le(),
                    arg2: src.get_u32_le(),
                    size: src.get_u32_le(),
                };
                if header.size as usize > MAX_PAYLOAD_SIZE {
                    return Err(CodecError::PayloadTooLarge(header.size as usize));
                }
                self.pending = Some(header);
                header
            }
        };

        let size = header.size as usize;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let payload = src.split_to(size).freeze();
        self.pending = None;

        tracing::debug!(
            kind = kind_name(header.kind),
            arg1 = header.arg1,
            arg2 = header.arg2,
            size = header.size,
            "received"
        );

        Ok(Some(Message::from_frame(header, payload)?))
    }
}

impl Encoder<Message> for UdscsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (header, payload) = item.into_frame();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        tracing::debug!(
            kind = kind_name(header.kind),
            arg1 = header.arg1,
            arg2 = header.arg2,
            size = header.size,
            "sent"
        );

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32_le(header.kind);
        dst.put_u32_le(header.arg1);
        dst.put_u32_le(header.arg2);
        dst.put_u32_le(header.size);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
