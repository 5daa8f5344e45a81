//! Server-sent events decoding
//!
//! Network chunks do not respect line boundaries, so bytes are buffered until
//! a full line is available.

use async_stream::stream;
use futures::StreamExt;
use reqwest::Response;

use super::FragmentStream;
use crate::error::ProviderError;

/// Incremental `data:` line extractor
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning the payload of every completed `data:` line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing line that was never newline-terminated
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() {
        None
    } else {
        Some(data.to_string())
    }
}

/// Stream of `data:` payloads from a response body
pub fn data_stream(response: Response) -> FragmentStream {
    let mut body = Box::pin(response.bytes_stream());
    let payloads = stream! {
        let mut decoder = SseDecoder::new();
        let mut broken = false;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for data in decoder.push(&bytes) {
                        yield Ok(data);
                    }
                }
                Err(e) => {
                    broken = true;
                    yield Err(ProviderError::from(e));
                    break;
                }
            }
        }
        if !broken {
            if let Some(data) = decoder.finish() {
                yield Ok(data);
            }
        }
    };
    payloads.boxed()
}
