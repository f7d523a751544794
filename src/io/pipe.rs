//! Pipe contract used by redirect sessions

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::copy::{copy_bidirectional_with_idle_timeout, CopyResult, DEFAULT_BUFFER_SIZE};
use crate::error::PipeError;
use crate::tunnel::TunnelStream;

/// Moves bytes between a redirected client and its upstream
///
/// Implementations take ownership of both connections; they are closed when
/// the call returns, whatever the outcome.
#[async_trait]
pub trait Pipe: Send + Sync {
    /// Copy in both directions until either connection closes or nothing
    /// moves for `idle_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `PipeError` on timeout or I/O failure.
    async fn pipe(
        &self,
        client: TcpStream,
        upstream: Box<dyn TunnelStream>,
        idle_timeout: Duration,
    ) -> Result<CopyResult, PipeError>;
}

/// Default [`Pipe`] built on [`copy_bidirectional_with_idle_timeout`]
///
/// Ends the session when either side closes unless half-close is enabled.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeoutPipe {
    buffer_size: usize,
    half_close: bool,
}

impl IdleTimeoutPipe {
    /// Create a pipe with the default buffer size
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            half_close: false,
        }
    }

    /// Set the per-direction buffer size
    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Keep copying the other direction after one side sends EOF
    #[must_use]
    pub const fn with_half_close(mut self, half_close: bool) -> Self {
        self.half_close = half_close;
        self
    }

    /// Per-direction buffer size
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Whether half-closed connections are kept open
    #[must_use]
    pub const fn half_close(&self) -> bool {
        self.half_close
    }
}

impl Default for IdleTimeoutPipe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipe for IdleTimeoutPipe {
    async fn pipe(
        &self,
        mut client: TcpStream,
        mut upstream: Box<dyn TunnelStream>,
        idle_timeout: Duration,
    ) -> Result<CopyResult, PipeError> {
        let result = copy_bidirectional_with_idle_timeout(
            &mut client,
            upstream.as_mut(),
            self.buffer_size,
            idle_timeout,
            self.half_close,
        )
        .await;

        if let Ok(copy) = &result {
            debug!(
                "Pipe finished: {} up / {} down bytes",
                copy.client_to_upstream, copy.upstream_to_client
            );
        }

        result
    }
}
