//! Frame decoding: optional zlib-stream inflate, then payload decode.

use crate::{PayloadError, ServerPayload, WireMessage};
use conduit_core::Compression;
use conduit_error::{GatewayError, GatewayErrorKind};
use flate2::{Decompress, FlushDecompress, Status};
use tracing::trace;

/// Marks the end of one message in a zlib stream.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// One inflate context for the lifetime of a connection.
struct Inflater {
    decompress: Decompress,
    pending: Vec<u8>,
}

impl Inflater {
    fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    /// Buffer `chunk`; once a full message has arrived, inflate it.
    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, GatewayError> {
        self.pending.extend_from_slice(chunk);
        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            trace!(buffered = self.pending.len(), "Partial zlib message");
            return Ok(None);
        }

        let input = std::mem::take(&mut self.pending);
        let mut output = Vec::with_capacity(input.len().saturating_mul(4).max(1024));
        let mut offset = 0;

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(1024));
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(&input[offset..], &mut output, FlushDecompress::Sync)
                .map_err(|e| {
                    GatewayError::new(GatewayErrorKind::Decode(format!("inflate: {}", e)))
                })?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            offset += consumed;

            if status == Status::StreamEnd
                || (offset >= input.len() && output.len() < output.capacity())
            {
                break;
            }
            if consumed == 0 && produced == 0 {
                return Err(GatewayError::new(GatewayErrorKind::Decode(
                    "inflate made no progress".to_string(),
                )));
            }
        }

        Ok(Some(output))
    }
}

/// Turns transport messages into payloads.
pub struct FrameCodec {
    inflater: Option<Inflater>,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("zlib_stream", &self.inflater.is_some())
            .finish()
    }
}

impl FrameCodec {
    /// Codec for a fresh connection.
    pub fn new(compression: Compression) -> Self {
        let inflater = match compression {
            Compression::None => None,
            Compression::ZlibStream => Some(Inflater::new()),
        };
        Self { inflater }
    }

    /// Decode one message. `Ok(None)` means more input is needed or the
    /// message carries no payload.
    ///
    /// A corrupt compressed stream is a control failure: the inflate context
    /// cannot recover, so the connection has to be replaced.
    pub fn decode(&mut self, message: &WireMessage) -> Result<Option<ServerPayload>, PayloadError> {
        let bytes = match (message, self.inflater.as_mut()) {
            (WireMessage::Text(text), _) => return ServerPayload::decode(text.as_bytes()).map(Some),
            (WireMessage::Binary(data), Some(inflater)) => {
                match inflater.push(data).map_err(PayloadError::Control)? {
                    Some(bytes) => bytes,
                    None => return Ok(None),
                }
            }
            (WireMessage::Binary(data), None) => data.clone(),
            (WireMessage::Close { .. }, _) => return Ok(None),
        };
        ServerPayload::decode(&bytes).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hello;
    use flate2::{Compress, FlushCompress};

    fn deflate(compress: &mut Compress, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 64);
        compress
            .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
            .expect("compress");
        assert!(out.ends_with(&ZLIB_SUFFIX));
        out
    }

    #[test]
    fn test_plain_text_frames() {
        let mut codec = FrameCodec::new(Compression::None);
        let payload = codec
            .decode(&WireMessage::Text(r#"{"op":11}"#.to_string()))
            .expect("decode");
        assert_eq!(payload, Some(ServerPayload::HeartbeatAck));
    }

    #[test]
    fn test_zlib_stream_shares_context_across_messages() {
        let mut compress = Compress::new(flate2::Compression::default(), true);
        let first = deflate(&mut compress, r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        let second = deflate(&mut compress, r#"{"op":11,"d":null}"#);

        let mut codec = FrameCodec::new(Compression::ZlibStream);
        assert_eq!(
            codec.decode(&WireMessage::Binary(first)).expect("first"),
            Some(ServerPayload::Hello(Hello {
                heartbeat_interval: 41250
            }))
        );
        assert_eq!(
            codec.decode(&WireMessage::Binary(second)).expect("second"),
            Some(ServerPayload::HeartbeatAck)
        );
    }

    #[test]
    fn test_split_message_waits_for_suffix() {
        let mut compress = Compress::new(flate2::Compression::default(), true);
        let whole = deflate(&mut compress, r#"{"op":0,"s":3,"t":"TYPING_START","d":{}}"#);
        let (head, tail) = whole.split_at(whole.len() / 2);

        let mut codec = FrameCodec::new(Compression::ZlibStream);
        assert_eq!(codec.decode(&WireMessage::Binary(head.to_vec())).expect("head"), None);
        let payload = codec
            .decode(&WireMessage::Binary(tail.to_vec()))
            .expect("tail")
            .expect("complete");
        assert_eq!(payload.opcode(), crate::OpCode::Dispatch.code());
    }

    #[test]
    fn test_large_message_grows_output() {
        let mut compress = Compress::new(flate2::Compression::best(), true);
        let content = "x".repeat(200_000);
        let text = format!(r#"{{"op":0,"s":1,"t":"BIG","d":{{"content":"{}"}}}}"#, content);
        let mut data = Vec::with_capacity(text.len());
        compress
            .compress_vec(text.as_bytes(), &mut data, FlushCompress::Sync)
            .expect("compress");

        let mut codec = FrameCodec::new(Compression::ZlibStream);
        match codec.decode(&WireMessage::Binary(data)).expect("decode") {
            Some(ServerPayload::Dispatch(dispatch)) => {
                assert_eq!(dispatch.data["content"].as_str().map(str::len), Some(200_000));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_stream_is_control_failure() {
        let mut codec = FrameCodec::new(Compression::ZlibStream);
        let mut garbage = vec![0x12, 0x34, 0x56, 0x78, 0x9a];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(matches!(
            codec.decode(&WireMessage::Binary(garbage)),
            Err(PayloadError::Control(_))
        ));
    }
}
