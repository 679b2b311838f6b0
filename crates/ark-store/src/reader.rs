use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use ark_digest::{DigestSet, MultiDigester};
use tokio::io::{AsyncRead, ReadBuf};

/// Reader decorator that forks every byte read through it into a set of
/// digesters, so content is hashed in the same pass that stores it.
#[derive(Debug)]
pub struct DigestReader<R> {
    inner: R,
    digester: MultiDigester,
    bytes: u64,
}

impl<R> DigestReader<R> {
    pub fn new(inner: R, digester: MultiDigester) -> Self {
        Self {
            inner,
            digester,
            bytes: 0,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Finish digesting. Returns the byte count and the digest of everything
    /// read.
    pub fn finish(self) -> (u64, DigestSet) {
        (self.bytes, self.digester.finish())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        this.digester.update(fresh);
        this.bytes += fresh.len() as u64;
        Poll::Ready(Ok(()))
    }
}
