use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::codec::{RequestEncoder, RequestHead};
use crate::protocol::{Message, PayloadSize, SendError};

/// Serializes requests into a buffer and drains it into the socket.
///
/// Encoding is synchronous; [`write_some`](MessageWriter::write_some) performs
/// one socket operation per call, so it can sit in a `select!` without losing
/// bytes when another branch wins.
#[derive(Debug)]
pub(crate) struct MessageWriter<W> {
    writer: W,
    buffer: BytesMut,
    encoder: RequestEncoder,
    needs_flush: bool,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn with_capacity(writer: W, buffer_size: usize) -> Self {
        Self { writer, buffer: BytesMut::with_capacity(buffer_size), encoder: RequestEncoder::new(), needs_flush: false }
    }

    pub(crate) fn into_inner(self) -> W {
        self.writer
    }

    /// Bytes encoded but not yet written to the socket.
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true while bytes wait for the socket or a flush is owed.
    pub(crate) fn has_pending(&self) -> bool {
        !self.buffer.is_empty() || self.needs_flush
    }

    /// Returns true while the body of the last request is still expected.
    pub(crate) fn is_body_pending(&self) -> bool {
        self.encoder.is_body_pending()
    }

    pub(crate) fn write<D>(&mut self, item: Message<(RequestHead<'_>, PayloadSize), D>) -> Result<(), SendError>
    where
        D: Buf,
    {
        self.encoder.encode(item, &mut self.buffer)
    }

    /// Writes part of the buffer, or flushes the socket once the buffer is empty.
    pub(crate) async fn write_some(&mut self) -> Result<(), SendError> {
        if self.buffer.is_empty() {
            self.writer.flush().await?;
            self.needs_flush = false;
            return Ok(());
        }

        let written = self.writer.write_buf(&mut self.buffer).await?;
        if written == 0 {
            return Err(SendError::io(std::io::Error::from(std::io::ErrorKind::WriteZero)));
        }
        trace!(written, remaining = self.buffer.len(), "request bytes written");
        self.needs_flush = true;
        Ok(())
    }

    /// Writes everything buffered and flushes.
    pub(crate) async fn flush(&mut self) -> Result<(), SendError> {
        while self.has_pending() {
            self.write_some().await?;
        }
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> Result<(), SendError> {
        self.flush().await?;
        Ok(self.writer.shutdown().await?)
    }
}
