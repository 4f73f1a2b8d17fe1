//! AWS event-stream framing (`application/vnd.amazon.eventstream`).
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32
//! ```

use bytes::{Buf, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use futures::{Stream, StreamExt};
use relay_core::{RelayError, RelayResult};
use std::fmt::Display;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Typed header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Boolean (types 0 and 1)
    Bool(bool),
    /// Signed byte
    Byte(i8),
    /// 16-bit integer
    Short(i16),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// Byte array
    Bytes(Bytes),
    /// UTF-8 string
    String(String),
    /// Milliseconds since the epoch
    Timestamp(i64),
    /// UUID bytes
    Uuid([u8; 16]),
}

/// One decoded frame
#[derive(Debug, Clone)]
pub struct Message {
    /// Headers in wire order
    pub headers: Vec<(String, HeaderValue)>,
    /// Raw payload
    pub payload: Bytes,
}

impl Message {
    /// String value of header `name`
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(k, v)| match v {
            HeaderValue::String(s) if k == name => Some(s.as_str()),
            _ => None,
        })
    }
}

/// Incremental frame decoder
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, `Ok(None)` when more bytes are needed
    pub fn next_message(&mut self) -> RelayResult<Option<Message>> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total_len = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;
        let prelude_crc = read_u32(&self.buffer[8..12]);

        if CRC32.checksum(&self.buffer[0..8]) != prelude_crc {
            return Err(RelayError::stream("event stream prelude checksum mismatch"));
        }
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len)
            || headers_len > total_len - MIN_FRAME_LEN
        {
            return Err(RelayError::stream(format!(
                "invalid event stream frame length {total_len}"
            )));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total_len).freeze();
        let message_crc = read_u32(&frame[total_len - 4..]);
        if CRC32.checksum(&frame[..total_len - 4]) != message_crc {
            return Err(RelayError::stream("event stream message checksum mismatch"));
        }

        let headers = decode_headers(frame.slice(PRELUDE_LEN..PRELUDE_LEN + headers_len))?;
        let payload = frame.slice(PRELUDE_LEN + headers_len..total_len - 4);
        Ok(Some(Message { headers, payload }))
    }
}

/// Decode frames from a chunked byte stream
pub fn messages<S, B, E>(body: S) -> impl Stream<Item = RelayResult<Message>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::try_stream! {
        let mut body = Box::pin(body);
        let mut decoder = EventStreamDecoder::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RelayError::stream(e.to_string()))?;
            decoder.push(chunk.as_ref());
            while let Some(message) = decoder.next_message()? {
                yield message;
            }
        }

        if decoder.pending() > 0 {
            Err::<(), _>(RelayError::stream("event stream ended inside a frame"))?;
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

fn decode_headers(mut raw: Bytes) -> RelayResult<Vec<(String, HeaderValue)>> {
    let truncated = || RelayError::stream("truncated event stream header");
    let mut headers = Vec::new();

    while raw.has_remaining() {
        let name_len = usize::from(raw.get_u8());
        if raw.remaining() < name_len + 1 {
            return Err(truncated());
        }
        let name = String::from_utf8(raw.split_to(name_len).to_vec())
            .map_err(|_| RelayError::stream("non UTF-8 event stream header name"))?;

        let kind = raw.get_u8();
        let need = match kind {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            9 => 16,
            6 | 7 => {
                if raw.remaining() < 2 {
                    return Err(truncated());
                }
                2 + usize::from(u16::from_be_bytes([raw[0], raw[1]]))
            }
            other => {
                return Err(RelayError::stream(format!(
                    "unknown event stream header type {other}"
                )))
            }
        };
        if raw.remaining() < need {
            return Err(truncated());
        }

        let value = match kind {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(raw.get_i8()),
            3 => HeaderValue::Short(raw.get_i16()),
            4 => HeaderValue::Int(raw.get_i32()),
            5 => HeaderValue::Long(raw.get_i64()),
            8 => HeaderValue::Timestamp(raw.get_i64()),
            9 => {
                let mut uuid = [0u8; 16];
                raw.copy_to_slice(&mut uuid);
                HeaderValue::Uuid(uuid)
            }
            6 => {
                let len = usize::from(raw.get_u16());
                HeaderValue::Bytes(raw.split_to(len))
            }
            _ => {
                let len = usize::from(raw.get_u16());
                let value = String::from_utf8(raw.split_to(len).to_vec())
                    .map_err(|_| RelayError::stream("non UTF-8 event stream header value"))?;
                HeaderValue::String(value)
            }
        };
        headers.push((name, value));
    }

    Ok(headers)
}
