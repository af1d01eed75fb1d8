//! Newline-delimited JSON framing over async byte streams.
//!
//! Each frame is one complete JSON message terminated by `\n`. Frames
//! beyond the configured maximum length abort the connection; malformed
//! JSON is reported per-frame so the caller can drop it and keep reading.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::WireMessage;

/// Errors that can occur during wire framing.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeded the configured maximum length; the connection must
    /// be dropped since the stream position is no longer trustworthy.
    #[error("frame length {len} exceeds maximum {max}")]
    Oversize {
        /// Observed (partial) frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Frame was not valid JSON or not a known message; safe to skip.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes a message into one wire frame (JSON + trailing newline).
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Reads newline-delimited frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a reader with the given frame-length cap.
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(1024),
            max_frame_len,
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` on clean EOF. A `Malformed` error consumes the
    /// offending line, so the caller may continue reading; `Oversize` and
    /// `Io` errors leave the stream unusable.
    pub async fn read_frame(&mut self) -> Result<Option<WireMessage>, CodecError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(line)?));
            }

            if self.buf.len() > self.max_frame_len {
                return Err(CodecError::Oversize {
                    len: self.buf.len(),
                    max: self.max_frame_len,
                });
            }

            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    tracing::debug!(bytes = self.buf.len(), "connection closed with partial frame");
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes newline-delimited frames to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encodes and writes one frame, flushing it to the transport.
    pub async fn write_frame(&mut self, msg: &WireMessage) -> Result<(), CodecError> {
        let frame = encode_frame(msg)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write half.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::belief::Belief;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let msg = WireMessage::Belief(Belief::new("node-a", 5.0, 1));
        let bytes = encode_frame(&msg).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let mut reader = FrameReader::new(bytes.as_slice(), 1024);
        let got = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(got, msg);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multiple_frames_in_one_read() {
        let a = encode_frame(&WireMessage::Belief(Belief::new("a", 1.0, 1))).unwrap();
        let b = encode_frame(&WireMessage::Belief(Belief::new("b", 2.0, 2))).unwrap();
        let joined = [a, b].concat();

        let mut reader = FrameReader::new(joined.as_slice(), 1024);
        let first = reader.read_frame().await.unwrap().unwrap();
        let second = reader.read_frame().await.unwrap().unwrap();
        match (first, second) {
            (WireMessage::Belief(x), WireMessage::Belief(y)) => {
                assert_eq!(x.node_id, "a");
                assert_eq!(y.node_id, "b");
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skippable() {
        let mut bytes = b"{not json}\n".to_vec();
        bytes.extend(encode_frame(&WireMessage::Belief(Belief::new("ok", 1.0, 1))).unwrap());

        let mut reader = FrameReader::new(bytes.as_slice(), 1024);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::Malformed(_))
        ));
        // The stream stays aligned on the next frame.
        let next = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(next.kind(), "belief");
    }

    #[tokio::test]
    async fn test_oversize_frame_aborts() {
        let huge = vec![b'x'; 2048];
        let mut reader = FrameReader::new(huge.as_slice(), 256);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::Oversize { .. })
        ));
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let mut bytes = b"\n\n".to_vec();
        bytes.extend(encode_frame(&WireMessage::Belief(Belief::new("x", 1.0, 1))).unwrap());
        let mut reader = FrameReader::new(bytes.as_slice(), 1024);
        assert_eq!(reader.read_frame().await.unwrap().unwrap().kind(), "belief");
    }
}
