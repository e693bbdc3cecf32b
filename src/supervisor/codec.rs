//! Codec for server-streaming supervisor responses.
//!
//! The supervisor's HTTP gateway streams one JSON envelope per line:
//! `{"result": <message>}` for each message, or `{"error": {...}}` when the
//! stream fails.

use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::codec::Decoder;

use crate::common::error::SupervisorError;

/// Upper bound for a single envelope line.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error: Option<StreamStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamStatus {
    code: i32,
    message: String,
}

/// Decodes newline-delimited stream envelopes into `T`.
pub struct EnvelopeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> EnvelopeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for EnvelopeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for EnvelopeCodec<T> {
    type Item = T;
    type Error = SupervisorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(SupervisorError::Decode {
                        message: format!("stream line exceeds {} bytes", MAX_LINE_LENGTH),
                    });
                }
                return Ok(None);
            };

            let line = src.split_to(newline + 1);
            let line = line.trim_ascii();
            if line.is_empty() {
                // Keep-alive blank line
                continue;
            }

            let envelope: Envelope<T> =
                serde_json::from_slice(line).map_err(|e| SupervisorError::Decode {
                    message: e.to_string(),
                })?;

            return match envelope {
                Envelope {
                    error: Some(status),
                    ..
                } => Err(SupervisorError::Stream {
                    code: status.code,
                    message: status.message,
                }),
                Envelope {
                    result: Some(item), ..
                } => Ok(Some(item)),
                Envelope { .. } => Err(SupervisorError::Decode {
                    message: "stream envelope has neither result nor error".to_string(),
                }),
            };
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            buf.advance(buf.len());
            return Ok(None);
        }
        // Final line without a trailing newline.
        buf.extend_from_slice(b"\n");
        self.decode(buf)
    }
}
