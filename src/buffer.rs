//! Byte buffers with drain semantics, and the channel-coupled pipe that
//! adapts a push-style connection read into a pull-style reader for the
//! frame parsers.

use bytes::{Buf, BufMut, BytesMut};
use crossfire::{mpsc, AsyncRx, MAsyncTx};
use std::fmt;

/// A byte buffer that is consumed from the front.
#[derive(Default)]
pub struct IoBuffer(BytesMut);

impl IoBuffer {
    #[inline]
    pub fn with_capacity(cap: usize) -> Self {
        Self(BytesMut::with_capacity(cap))
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Discard `n` bytes from the front
    #[inline]
    pub fn drain(&mut self, n: usize) {
        self.0.advance(std::cmp::min(n, self.0.len()));
    }

    #[inline]
    pub fn write(&mut self, data: &[u8]) {
        self.0.put_slice(data);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<BytesMut> for IoBuffer {
    #[inline]
    fn from(b: BytesMut) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for IoBuffer {
    #[inline]
    fn from(v: Vec<u8>) -> Self {
        let mut b = BytesMut::with_capacity(v.len());
        b.put_slice(&v);
        Self(b)
    }
}

impl From<&[u8]> for IoBuffer {
    #[inline]
    fn from(v: &[u8]) -> Self {
        let mut b = BytesMut::with_capacity(v.len());
        b.put_slice(v);
        Self(b)
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IoBuffer({} bytes)", self.0.len())
    }
}

/// Returned by [PipeReader::read] once the transport side has closed the
/// pipe. This is the sole termination signal of a parser loop.
#[derive(Debug, PartialEq)]
pub struct PipeClosed;

/// Build the two halves of a connection pipe.
///
/// The transport read task pushes buffers through the [PipeSender]; the
/// parser pulls bytes out of the [PipeReader]. A buffer handed to
/// `dispatch` travels back and forth on the rendezvous pair until it is
/// fully drained, so the transport never reuses a buffer the parser still
/// reads, and there is exactly one outstanding send or receive at any time.
pub fn conn_pipe() -> (PipeSender, PipeReader) {
    let (data_tx, data_rx) = mpsc::bounded_async::<IoBuffer>(1);
    let (ack_tx, ack_rx) = mpsc::bounded_async::<IoBuffer>(1);
    (PipeSender { data_tx, ack_rx }, PipeReader { data_rx, ack_tx })
}

pub struct PipeSender {
    data_tx: MAsyncTx<IoBuffer>,
    ack_rx: AsyncRx<IoBuffer>,
}

impl PipeSender {
    /// Push one buffer to the parser, returning only after every byte of it
    /// has been consumed. Err means the reader side is gone.
    pub async fn dispatch(&mut self, mut buf: IoBuffer) -> Result<(), PipeClosed> {
        while !buf.is_empty() {
            if self.data_tx.send(buf).await.is_err() {
                return Err(PipeClosed);
            }
            match self.ack_rx.recv().await {
                Ok(b) => buf = b,
                Err(_) => return Err(PipeClosed),
            }
        }
        Ok(())
    }
}

pub struct PipeReader {
    data_rx: AsyncRx<IoBuffer>,
    ack_tx: MAsyncTx<IoBuffer>,
}

impl PipeReader {
    /// Receive a buffer, copy up to `p.len()` bytes, drain that many from
    /// the buffer, and hand it back to the dispatching side.
    pub async fn read(&mut self, p: &mut [u8]) -> Result<usize, PipeClosed> {
        let mut buf = match self.data_rx.recv().await {
            Ok(b) => b,
            Err(_) => return Err(PipeClosed),
        };
        let n = std::cmp::min(p.len(), buf.len());
        p[..n].copy_from_slice(&buf.bytes()[..n]);
        buf.drain(n);
        if self.ack_tx.send(buf).await.is_err() {
            return Err(PipeClosed);
        }
        Ok(n)
    }

    /// Read the exact number of bytes required to fill `buf`.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), PipeClosed> {
        let mut off = 0;
        while off < buf.len() {
            match self.read(&mut buf[off..]).await {
                Ok(0) => return Err(PipeClosed),
                Ok(n) => off += n,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_buffer_drain() {
        let mut b = IoBuffer::from(&b"hello world"[..]);
        assert_eq!(b.len(), 11);
        b.drain(6);
        assert_eq!(b.bytes(), b"world");
        b.drain(100);
        assert!(b.is_empty());
    }

    #[test]
    fn test_pipe_rendezvous() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut tx, mut rx) = conn_pipe();
            let h = tokio::spawn(async move {
                tx.dispatch(IoBuffer::from(&b"abcdef"[..])).await.expect("dispatch");
                // sender drops here: reader must see PipeClosed
            });
            let mut p = [0u8; 4];
            let n = rx.read(&mut p).await.expect("read");
            assert_eq!(&p[..n], b"abcd");
            let n = rx.read(&mut p).await.expect("read");
            assert_eq!(&p[..n], b"ef");
            assert_eq!(rx.read(&mut p).await, Err(PipeClosed));
            h.await.unwrap();
        });
    }

    #[test]
    fn test_pipe_read_exact() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut tx, mut rx) = conn_pipe();
            tokio::spawn(async move {
                for chunk in [&b"ab"[..], &b"cd"[..], &b"efgh"[..]] {
                    tx.dispatch(IoBuffer::from(chunk)).await.expect("dispatch");
                }
            });
            let mut p = [0u8; 8];
            rx.read_exact(&mut p).await.expect("read_exact");
            assert_eq!(&p, b"abcdefgh");
        });
    }
}
