//! C2/C3 — the replication-protocol client session and its stream buffer.

pub mod auth;
pub mod session;
pub mod stream_buffer;

pub use session::{BaseBackupOptions, ConnectionMode, IdentifySystem, ReplicationSession, SessionError};
pub use stream_buffer::StreamBuffer;
