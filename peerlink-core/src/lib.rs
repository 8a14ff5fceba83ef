//! peerlink wire protocol.
//! Sans-IO: block framing, checksum and cipher; the runtime crate owns sockets and tasks.

pub mod checksum;
pub mod cipher;
pub mod frame;
pub mod protocol;

pub use checksum::ChecksumTable;
pub use cipher::CipherKey;
pub use frame::{
    classify, has_sign, FrameCodec, FrameError, FrameHeader, Inbound, HEADER_LEN, HEARTBEAT_PROBE, PROBE_LEN, SIGN,
};
pub use protocol::{HostInfo, Mode, Role, TransportKind, DEFAULT_MAX_PAYLOAD};
