//! Newline-delimited JSON framing for stdio transports.
//!
//! Wraps [`LinesCodec`] with a fixed maximum line length so that a
//! misbehaving peer cannot make the reader allocate without bound. Used by
//! both ends of a stdio pipe: the router side in
//! [`StdioTransport`](super::stdio::StdioTransport) and the sidecar side in
//! [`serve_stdio`](crate::server::stdio::serve_stdio).

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum accepted frame length: 1 MiB.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// NDJSON codec: one UTF-8 JSON envelope per `\n`-terminated line.
///
/// Inbound lines longer than [`MAX_FRAME_BYTES`], and lines that are not
/// valid UTF-8, are dropped with a warning and decoding moves on to the
/// next line. `FramedRead` ends the stream after any decoder error, so a
/// bad frame must never surface as one. I/O failures map to
/// [`AppError::Transport`].
#[derive(Debug)]
pub struct FrameCodec(LinesCodec);

impl FrameCodec {
    /// Create a codec with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Ok(line) => return Ok(line),
                Err(err) => skip_bad_frame(err)?,
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src) {
                Ok(line) => return Ok(line),
                Err(err) => skip_bad_frame(err)?,
            }
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        // The length limit applies to decoding only.
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// `Ok` when the offending line has been consumed and decoding can resume.
fn skip_bad_frame(e: LinesCodecError) -> Result<()> {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            warn!(max_bytes = MAX_FRAME_BYTES, "frame too long, discarding");
            Ok(())
        }
        LinesCodecError::Io(io_err) if io_err.kind() == io::ErrorKind::InvalidData => {
            warn!(error = %io_err, "frame is not valid UTF-8, discarding");
            Ok(())
        }
        other => Err(map_codec_error(other)),
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("frame too long: exceeded {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Transport(io_err.to_string()),
    }
}
