//! Async frame I/O over ordered byte streams.
//!
//! Every link (QUIC stream, coordinator TCP connection, turmoil socket) is a
//! plain sequence of back-to-back frames. Reading takes the 16-byte header
//! first, then exactly `payload_size` bytes.

use bytes::Bytes;
use skein_proto::{Frame, FrameHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Read the next frame from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// - `TransportError::Truncated` if the stream ends inside a frame
/// - `TransportError::Protocol` if the header is invalid
/// - `TransportError::Io` on read failure
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; FrameHeader::SIZE];
    let read = read_full(reader, &mut header_buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if read < FrameHeader::SIZE {
        return Err(TransportError::Truncated { expected: FrameHeader::SIZE, read });
    }

    let header = *FrameHeader::from_bytes(&header_buf)?;
    let payload_size = header.payload_size() as usize;

    let mut payload = vec![0u8; payload_size];
    let read = read_full(reader, &mut payload).await?;
    if read < payload_size {
        return Err(TransportError::Truncated {
            expected: FrameHeader::SIZE + payload_size,
            read: FrameHeader::SIZE + read,
        });
    }

    Ok(Some(Frame { header, payload: Bytes::from(payload) }))
}

/// Write one frame to `writer` and flush it.
///
/// # Errors
///
/// - `TransportError::Protocol` if the payload exceeds the protocol limit
/// - `TransportError::Io` on write failure
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf = frame.to_vec()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf` unless EOF arrives first. Returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
