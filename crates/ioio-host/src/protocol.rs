//! Wire format between host and board.
//!
//! Every message is postcard-encoded and COBS-framed, so a zero byte always
//! ends a frame.

use ioio_core::{DeviceInfo, PinCommand, PinId, ResetKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Host to board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Hello,
    Configure(PinCommand),
    Reset(ResetKind),
    Goodbye,
}

/// Board to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Established(DeviceInfo),
    Ack,
    Nack(NackCode),
}

/// Why the board refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackCode {
    UnknownPin(PinId),
    Unsupported(PinId),
    Malformed,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec_cobs(message)
}

/// Decode one frame in place. The trailing zero is optional.
pub fn decode<T: DeserializeOwned>(frame: &mut [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes_cobs(frame)
}

/// Splits a byte stream into zero-terminated frames.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: BufReader::new(inner), buf: Vec::with_capacity(64) }
    }

    /// Next complete frame, or `None` on a clean end of stream.
    ///
    /// A partial frame cut off by EOF is dropped.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<&mut [u8]>> {
        loop {
            self.buf.clear();
            let n = self.inner.read_until(0, &mut self.buf).await?;
            if n == 0 || self.buf.last() != Some(&0) {
                return Ok(None);
            }
            // Back-to-back sentinels carry no frame.
            if self.buf.len() > 1 {
                return Ok(Some(self.buf.as_mut_slice()));
            }
        }
    }
}
