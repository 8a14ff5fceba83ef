//! Errors surfaced by link operations.

use std::io;

use peerlink_core::FrameError;

use crate::config::ConfigError;

/// Error returned by [`crate::Link`] operations.
///
/// Failures on an established connection never surface here beyond the call
/// that hit them: the link drops to idle and the supervisor recovers.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("link already started; mode, transport, config and handler are fixed")]
    AlreadyStarted,
    #[error("no tokio runtime to start the link on")]
    NoRuntime,
    #[error("payload of {len} bytes exceeds the limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
}

/// Why a receive task ended a session.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
}
