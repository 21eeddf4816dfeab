use std::io::Read;

use flate2::{Decompress, FlushDecompress, read::ZlibDecoder};
use serde::Deserialize;

use super::frame::WsFrame;
use super::types::{ClientError, ClientResult};

/// Suffix of a zlib sync flush; marks the end of one message in a compressed stream.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Inbound compression negotiated with the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    /// Each binary frame is a complete zlib message.
    Payload,
    /// One zlib context spans the whole connection.
    Stream,
}

impl Compression {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "payload" => Some(Self::Payload),
            "stream" | "zlib-stream" => Some(Self::Stream),
            _ => None,
        }
    }
}

/// Turns inbound data frames into decoded text, one instance per connection.
pub struct Inflater {
    mode: Compression,
    buffer: Vec<u8>,
    decompress: Decompress,
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Inflater {
    pub fn new(mode: Compression) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
            decompress: Decompress::new(true),
        }
    }

    pub fn mode(&self) -> Compression {
        self.mode
    }

    /// Feed one data frame. `Ok(None)` means the frame was buffered (or was not a data frame).
    pub fn push(&mut self, frame: &WsFrame) -> ClientResult<Option<String>> {
        match frame {
            WsFrame::Text(bytes) => utf8(bytes.to_vec()).map(Some),
            WsFrame::Binary(bytes) => match self.mode {
                Compression::None => utf8(bytes.to_vec()).map(Some),
                Compression::Payload => inflate_payload(bytes.as_ref()).map(Some),
                Compression::Stream => {
                    self.buffer.extend_from_slice(bytes.as_ref());
                    if !self.buffer.ends_with(&ZLIB_SUFFIX) {
                        return Ok(None);
                    }
                    let result = self.inflate_stream();
                    self.buffer.clear();
                    result.map(Some)
                }
            },
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => Ok(None),
        }
    }

    fn inflate_stream(&mut self) -> ClientResult<String> {
        let mut out = Vec::with_capacity(self.buffer.len().saturating_mul(4).max(1024));
        let mut offset = 0usize;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            self.decompress
                .decompress_vec(&self.buffer[offset..], &mut out, FlushDecompress::Sync)
                .map_err(|err| ClientError::Decode(format!("zlib stream: {err}")))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            offset += consumed;

            if offset >= self.buffer.len() && out.len() < out.capacity() {
                break;
            }
            if consumed == 0 && produced == 0 {
                return Err(ClientError::Decode(
                    "zlib stream made no progress".to_string(),
                ));
            }
        }

        utf8(out)
    }
}

fn inflate_payload(bytes: &[u8]) -> ClientResult<String> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(|err| ClientError::Decode(format!("zlib payload: {err}")))?;
    Ok(text)
}

fn utf8(bytes: Vec<u8>) -> ClientResult<String> {
    String::from_utf8(bytes).map_err(|err| ClientError::Decode(format!("utf-8: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn sync_flushed(encoder: &mut ZlibEncoder<Vec<u8>>, text: &str) -> Vec<u8> {
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.flush().unwrap();
        let chunk = encoder.get_ref().clone();
        encoder.get_mut().clear();
        chunk
    }

    #[test]
    fn stream_mode_accumulates_until_suffix() {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        let first = sync_flushed(&mut encoder, r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        let second = sync_flushed(&mut encoder, r#"{"op":11}"#);
        assert!(first.ends_with(&ZLIB_SUFFIX));

        let mut inflater = Inflater::new(Compression::Stream);
        let (head, tail) = first.split_at(first.len() / 2);
        assert_eq!(inflater.push(&WsFrame::binary(head.to_vec())).unwrap(), None);
        let text = inflater.push(&WsFrame::binary(tail.to_vec())).unwrap();
        assert_eq!(
            text.as_deref(),
            Some(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#)
        );

        // Second message depends on the shared context.
        let text = inflater.push(&WsFrame::binary(second)).unwrap();
        assert_eq!(text.as_deref(), Some(r#"{"op":11}"#));
    }

    #[test]
    fn stream_mode_handles_large_messages() {
        let big = format!(r#"{{"d":"{}"}}"#, "x".repeat(200_000));
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
        let chunk = sync_flushed(&mut encoder, &big);

        let mut inflater = Inflater::new(Compression::Stream);
        assert_eq!(
            inflater.push(&WsFrame::binary(chunk)).unwrap().as_deref(),
            Some(big.as_str())
        );
    }

    #[test]
    fn payload_mode_inflates_each_frame() {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"op":1}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut inflater = Inflater::new(Compression::Payload);
        assert_eq!(
            inflater.push(&WsFrame::binary(compressed)).unwrap().as_deref(),
            Some(r#"{"op":1}"#)
        );
        assert_eq!(
            inflater.push(&WsFrame::text("plain")).unwrap().as_deref(),
            Some("plain")
        );
    }

    #[test]
    fn corrupt_stream_is_a_decode_error() {
        let mut inflater = Inflater::new(Compression::Stream);
        let mut garbage = vec![0x12, 0x34, 0x56, 0x78, 0x9a];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(matches!(
            inflater.push(&WsFrame::binary(garbage)),
            Err(ClientError::Decode(_))
        ));
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let mut inflater = Inflater::new(Compression::None);
        assert!(matches!(
            inflater.push(&WsFrame::binary(vec![0xff, 0xfe])),
            Err(ClientError::Decode(_))
        ));
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!(Compression::parse("zlib-stream"), Some(Compression::Stream));
        assert_eq!(Compression::parse("Payload"), Some(Compression::Payload));
        assert_eq!(Compression::parse("gzip"), None);
    }
}
