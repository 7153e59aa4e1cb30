//! Framed buffer over the raw stream.
//!
//! Frontend messages accumulate in the write buffer until a flush; backend
//! messages are split off the read buffer as `(msgtype, body)` frames once
//! the full length-prefixed image is available.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::{
    Result, verbose,
    net::Stream,
    protocol::{FrontendProtocol, ProtocolError, frontend},
};

// msgtype + length
const HEADER: usize = 1 + 4;

#[derive(Debug)]
pub(crate) struct BufferedStream {
    stream: Stream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    capacity: usize,
}

impl BufferedStream {
    pub fn new(stream: Stream, capacity: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(capacity),
            write_buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    /// Buffer a frontend message; nothing is written to the underlying io.
    pub fn send<F: FrontendProtocol>(&mut self, msg: F) -> Result<(), ProtocolError> {
        frontend::write(msg, &mut self.write_buf)
    }

    /// The write buffer itself, for messages with no message-type byte.
    pub fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    /// Bytes that can be buffered before the steady-state capacity is exceeded.
    pub fn write_space_left(&self) -> usize {
        self.capacity.saturating_sub(self.write_buf.len())
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Write buffered messages to the underlying io.
    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all_buf(&mut self.write_buf).await?;
        }
        self.stream.flush().await
    }

    /// Flush `prefix` ahead of the write buffer.
    ///
    /// Prepended setup messages are staged separately so they reach the wire
    /// before user messages that were buffered earlier.
    pub async fn flush_with_prefix(&mut self, prefix: &mut BytesMut) -> io::Result<()> {
        if !prefix.is_empty() {
            self.stream.write_all_buf(prefix).await?;
        }
        self.flush().await
    }

    /// Write a large payload straight to the stream, bypassing the write
    /// buffer. Pending buffered messages are flushed first so wire order is
    /// preserved.
    pub async fn write_direct(&mut self, data: &[u8]) -> io::Result<()> {
        self.flush().await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Read from the stream until at least `n` contiguous bytes are buffered.
    pub async fn ensure(&mut self, n: usize) -> Result<()> {
        if self.read_buf.len() < n {
            self.read_buf.reserve(n - self.read_buf.len());
        }
        while self.read_buf.len() < n {
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by the server",
                )
                .into());
            }
        }
        Ok(())
    }

    /// Read one backend frame, loading the whole body.
    pub async fn read_msg(&mut self) -> Result<(u8, Bytes)> {
        let (msgtype, len) = self.read_header().await?;
        self.ensure(1 + len).await?;

        self.read_buf.advance(HEADER);
        let body = self.read_buf.split_to(len - 4).freeze();

        verbose!("(B) {} {:?}", msgtype as char, body);
        Ok((msgtype, body))
    }

    /// Read one backend frame, discarding the body without retaining it.
    pub async fn skip_msg(&mut self) -> Result<u8> {
        let (msgtype, len) = self.read_header().await?;
        self.read_buf.advance(HEADER);
        self.skip(len - 4).await?;

        verbose!("(B) {} skipped", msgtype as char);
        Ok(msgtype)
    }

    /// Message type of the next frame, without consuming it.
    pub async fn peek_msgtype(&mut self) -> Result<u8> {
        self.ensure(1).await?;
        Ok(self.read_buf[0])
    }

    async fn read_header(&mut self) -> Result<(u8, usize)> {
        self.ensure(HEADER).await?;
        let msgtype = self.read_buf[0];
        let len = i32::from_be_bytes(self.read_buf[1..5].try_into().unwrap());
        if len < 4 {
            return Err(ProtocolError::InvalidLength { len }.into());
        }
        Ok((msgtype, len as usize))
    }

    /// Consume and discard `n` bytes, refilling as needed.
    async fn skip(&mut self, mut n: usize) -> Result<()> {
        loop {
            let take = n.min(self.read_buf.len());
            self.read_buf.advance(take);
            n -= take;
            if n == 0 {
                return Ok(());
            }
            self.read_buf.reserve(n.min(self.capacity));
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by the server",
                )
                .into());
            }
        }
    }

    /// Whether a complete frame is already buffered.
    pub fn has_buffered_msg(&self) -> bool {
        if self.read_buf.len() < HEADER {
            return false;
        }
        let len = i32::from_be_bytes(self.read_buf[1..5].try_into().unwrap());
        len >= 4 && self.read_buf.len() >= 1 + len as usize
    }

    /// Pull whatever is immediately available from the stream, without
    /// waiting. Returns whether any bytes arrived.
    ///
    /// For a TLS stream this polls the wrapper, so plaintext still buffered
    /// inside the TLS layer is seen even when the socket itself is idle.
    pub fn try_fill(&mut self) -> io::Result<bool> {
        use std::task::{Context, Poll, Waker};

        self.read_buf.reserve(self.capacity);

        let mut cx = Context::from_waker(Waker::noop());

        let n = {
            let dst = self.read_buf.chunk_mut();
            let dst = unsafe { dst.as_uninit_slice_mut() };
            let mut buf = tokio::io::ReadBuf::uninit(dst);

            match std::pin::Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
                Poll::Pending => return Ok(false),
                Poll::Ready(Err(err)) => return Err(err),
                Poll::Ready(Ok(())) => buf.filled().len(),
            }
        };

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by the server",
            ));
        }

        // Safety: `n` bytes were initialized and read by `poll_read`.
        unsafe { self.read_buf.advance_mut(n) };
        Ok(true)
    }

    /// Best-effort shutdown of the underlying stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
