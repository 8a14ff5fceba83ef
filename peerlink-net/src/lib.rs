//! peerlink runtime: a supervised point-to-point link over TCP or UDP.
//!
//! A [`Link`] is either a listener or a connector. Once started it keeps a
//! connection up on its own: connectors retry, listeners re-accept. Inbound
//! payloads go to a [`PayloadHandler`]; outbound ones through [`Link::send`].
//! Wire framing lives in `peerlink-core`.

pub mod config;
pub mod error;
pub mod link;
pub mod net;
pub mod state;

mod channel;
mod session;
mod shared;
mod supervisor;

pub use config::{ConfigError, LinkConfig};
pub use error::LinkError;
pub use link::{Link, PayloadHandler};
pub use peerlink_core::{HostInfo, Mode, Role, TransportKind};
pub use state::ConnectionState;
