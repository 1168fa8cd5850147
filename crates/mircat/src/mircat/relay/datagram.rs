use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::mircat::relay::protocol::{MAX_DATAGRAM_BYTES, ProtocolError};

/// Reads `u32be len | payload` datagrams from one half of a relay stream.
pub struct DatagramReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> DatagramReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next datagram into `out`, returning `Ok(None)` on a clean end of stream.
    ///
    /// `out` must hold [`MAX_DATAGRAM_BYTES`]; longer frames are a protocol error.
    pub async fn read_datagram(&mut self, out: &mut [u8]) -> Result<Option<usize>, ProtocolError> {
        let n = match self.inner.read_u32().await {
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if n > MAX_DATAGRAM_BYTES || n as usize > out.len() {
            return Err(ProtocolError::PayloadTooLarge(n));
        }
        let n = n as usize;
        self.inner.read_exact(&mut out[..n]).await?;
        Ok(Some(n))
    }
}

/// Writes `u32be len | payload` datagrams to one half of a relay stream.
pub struct DatagramWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> DatagramWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let n: u32 = payload
            .len()
            .try_into()
            .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
        if n > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::PayloadTooLarge(n));
        }
        // One buffer so a datagram is never split across multiplexer frames mid-length.
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&n.to_be_bytes());
        frame.extend_from_slice(payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}
