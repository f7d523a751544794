//! Bidirectional copy with an idle timeout
//!
//! Copies both directions concurrently on one task. By default the copy ends
//! as soon as either side reaches EOF: the EOF is forwarded as a write
//! shutdown and both streams are released. With `half_close` set, the other
//! direction keeps running until it finishes too. Any read or write in either
//! direction pushes the idle deadline forward.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

use crate::error::PipeError;

/// Default per-direction buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Result of a bidirectional copy operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// State for one direction of transfer
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    write_done: bool,
    pos: usize,
    cap: usize,
    bytes_read: u64,
    bytes_transferred: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size.max(1)].into_boxed_slice(),
            read_done: false,
            write_done: false,
            pos: 0,
            cap: 0,
            bytes_read: 0,
            bytes_transferred: 0,
        }
    }

    /// Monotonic counter of observable activity in this direction
    fn progress(&self) -> u64 {
        self.bytes_read + self.bytes_transferred + u64::from(self.read_done)
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                if !self.write_done {
                    match writer.as_mut().poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => self.write_done = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                            self.bytes_read += n as u64;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

/// Bidirectional copy state machine with an idle deadline
struct IdleBidirectionalCopy<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    half_close: bool,
}

impl<'a, A, B> IdleBidirectionalCopy<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    fn new(
        a: &'a mut A,
        b: &'a mut B,
        buf_size: usize,
        idle_timeout: Duration,
        half_close: bool,
    ) -> Self {
        Self {
            a,
            b,
            a_to_b: TransferState::new(buf_size),
            b_to_a: TransferState::new(buf_size),
            idle_timeout,
            idle: Box::pin(sleep(idle_timeout)),
            half_close,
        }
    }

    fn progress(&self) -> u64 {
        self.a_to_b.progress() + self.b_to_a.progress()
    }
}

impl<A, B> Future for IdleBidirectionalCopy<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = Result<CopyResult, PipeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let before = this.progress();

        let a_to_b_done = match this
            .a_to_b
            .poll_transfer(cx, Pin::new(&mut *this.a), Pin::new(&mut *this.b))
        {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(PipeError::Io(e))),
            Poll::Pending => false,
        };

        let b_to_a_done = match this
            .b_to_a
            .poll_transfer(cx, Pin::new(&mut *this.b), Pin::new(&mut *this.a))
        {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(PipeError::Io(e))),
            Poll::Pending => false,
        };

        let finished = if this.half_close {
            a_to_b_done && b_to_a_done
        } else {
            a_to_b_done || b_to_a_done
        };

        if finished {
            return Poll::Ready(Ok(CopyResult {
                client_to_upstream: this.a_to_b.bytes_transferred,
                upstream_to_client: this.b_to_a.bytes_transferred,
            }));
        }

        if this.progress() != before {
            let deadline = Instant::now() + this.idle_timeout;
            this.idle.as_mut().reset(deadline);
        }

        match this.idle.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(PipeError::IdleTimeout(this.idle_timeout))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Copy between `a` and `b` until a side closes or nothing moves for
/// `idle_timeout`.
///
/// Without `half_close` the copy returns once either direction has read EOF
/// and forwarded it; with `half_close` it waits for both directions.
/// `a` is treated as the client side for the byte counts in [`CopyResult`].
///
/// # Errors
///
/// Returns `PipeError::IdleTimeout` when the deadline elapses and
/// `PipeError::Io` on the first I/O error in either direction.
pub async fn copy_bidirectional_with_idle_timeout<A, B>(
    a: &mut A,
    b: &mut B,
    buf_size: usize,
    idle_timeout: Duration,
    half_close: bool,
) -> Result<CopyResult, PipeError>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    IdleBidirectionalCopy::new(a, b, buf_size, idle_timeout, half_close).await
}
