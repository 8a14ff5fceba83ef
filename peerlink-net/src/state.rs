//! Link lifecycle state: one atomic value in place of separate
//! connected/terminating flags.
//!
//! ```text
//!   Idle ──connect/accept──▶ Connected
//!    ▲                           │
//!    └──peer closed / write or read failure
//!
//!   any ──stop()──▶ Terminated   (absorbing)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const CONNECTED: u8 = 1;
const TERMINATED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No peer. The supervisor retries from here.
    Idle,
    /// A peer is linked; send and receive are live.
    Connected,
    /// Stopped. Never left.
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Shared by the supervisor, the receive and heartbeat tasks and callers of `send`.
#[derive(Debug)]
pub(crate) struct LinkState(AtomicU8);

impl LinkState {
    pub(crate) fn new() -> Self {
        LinkState(AtomicU8::new(IDLE))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            IDLE => ConnectionState::Idle,
            CONNECTED => ConnectionState::Connected,
            _ => ConnectionState::Terminated,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.get() == ConnectionState::Terminated
    }

    /// Idle → Connected. False once terminated.
    pub(crate) fn connect(&self) -> bool {
        match self
            .0
            .compare_exchange(IDLE, CONNECTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CONNECTED,
        }
    }

    /// Connected → Idle. True if this call made the transition.
    pub(crate) fn disconnect(&self) -> bool {
        self.0
            .compare_exchange(CONNECTED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Any → Terminated. True on the first call.
    pub(crate) fn terminate(&self) -> bool {
        self.0.swap(TERMINATED, Ordering::AcqRel) != TERMINATED
    }
}
