//! I/O utilities for tcp-redirect
//!
//! The [`Pipe`] trait is the contract a redirect session hands its two
//! connections to. [`IdleTimeoutPipe`] is the default implementation: a
//! single-task bidirectional copy whose deadline resets on every transfer.

mod copy;
mod pipe;

pub use copy::{copy_bidirectional_with_idle_timeout, CopyResult, DEFAULT_BUFFER_SIZE};
pub use pipe::{IdleTimeoutPipe, Pipe};
