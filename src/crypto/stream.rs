// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Streaming adapters around [`BodyCipher`]
//!
//! - [`CipherStream`]: async `Stream` of `Bytes`, used for HTTP bodies
//! - [`CipherReader`] / [`CipherWriter`]: blocking `Read` / `Write` wrappers
//!
//! Every adapter transforms chunk by chunk and finalizes the cipher exactly
//! once, when the underlying stream ends or the writer is finished. Memory use
//! is bounded by the chunk size plus one block.

use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::{debug, warn};

use super::cipher::BodyCipher;
use super::error::CryptoError;

const READ_CHUNK: usize = 8 * 1024;

/// Body stream transformed by a [`BodyCipher`].
///
/// The first error (from the inner stream or the cipher) is yielded as
/// [`CryptoError::CipherIo`] and ends the stream; nothing after it is emitted.
pub struct CipherStream<S> {
    inner: S,
    cipher: BodyCipher,
    done: bool,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, cipher: BodyCipher) -> Self {
        Self {
            inner,
            cipher,
            done: false,
        }
    }
}

impl<S, E> Stream for CipherStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    type Item = Result<Bytes, CryptoError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(chunk)) => match this.cipher.update(&chunk) {
                    Ok(out) if out.is_empty() => continue,
                    Ok(out) => return Poll::Ready(Some(Ok(Bytes::from(out)))),
                    Err(e) => {
                        this.done = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(CryptoError::cipher_io(format!(
                        "body stream failed: {}",
                        e
                    )))));
                }
                None => {
                    this.done = true;
                    return match this.cipher.finish() {
                        Ok(out) if out.is_empty() => Poll::Ready(None),
                        Ok(out) => Poll::Ready(Some(Ok(Bytes::from(out)))),
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
            }
        }
    }
}

impl<S> Drop for CipherStream<S> {
    fn drop(&mut self) {
        if !self.cipher.is_finished() {
            debug!(
                "Body cipher ({:?}) dropped before end of stream",
                self.cipher.mode()
            );
        }
    }
}

/// `Read` adapter: bytes read from `inner` come out transformed
pub struct CipherReader<R> {
    inner: R,
    cipher: BodyCipher,
    scratch: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, cipher: BodyCipher) -> Self {
        Self {
            inner,
            cipher,
            scratch: vec![0u8; READ_CHUNK],
            out: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self) -> io::Result<()> {
        while self.pos >= self.out.len() && !self.eof {
            let n = match self.inner.read(&mut self.scratch) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.out = if n == 0 {
                self.eof = true;
                self.cipher.finish()?
            } else {
                self.cipher.update(&self.scratch[..n])?
            };
            self.pos = 0;
        }
        Ok(())
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.fill()?;
        let available = &self.out[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// `Write` adapter: bytes written are transformed before reaching `inner`.
///
/// Call [`finish`](CipherWriter::finish) to emit the final block and get the
/// inner writer back. A writer dropped without `finish` finalizes on drop and
/// logs any failure.
pub struct CipherWriter<W: Write> {
    inner: Option<W>,
    cipher: BodyCipher,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, cipher: BodyCipher) -> Self {
        Self {
            inner: Some(inner),
            cipher,
        }
    }

    pub fn get_ref(&self) -> Option<&W> {
        self.inner.as_ref()
    }

    /// Emit the final block, flush, and return the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        self.finalize()?;
        self.inner
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already closed"))
    }

    fn inner_mut(&mut self) -> io::Result<&mut W> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already closed"))
    }

    fn finalize(&mut self) -> io::Result<()> {
        if self.cipher.is_finished() {
            return Ok(());
        }
        let tail = self.cipher.finish()?;
        let inner = self.inner_mut()?;
        inner.write_all(&tail)?;
        inner.flush()
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let out = self.cipher.update(buf)?;
        self.inner_mut()?.write_all(&out)?;
        Ok(buf.len())
    }

    /// Flushes the inner writer; a partial block stays buffered until `finish`
    fn flush(&mut self) -> io::Result<()> {
        self.inner_mut()?.flush()
    }
}

impl<W: Write> Drop for CipherWriter<W> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            if let Err(e) = self.finalize() {
                warn!("Failed to finalize cipher writer on drop: {}", e);
            }
        }
    }
}
