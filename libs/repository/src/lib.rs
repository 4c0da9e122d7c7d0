//! C11 — repository: filesystem layout, `backup.info`, the data model,
//! the single-writer lock, and ancestor-chain resolution.

pub mod backup_info;
pub mod chain;
pub mod file_type;
pub mod layout;
pub mod listing;
pub mod lock;
pub mod model;

pub use backup_info::{backup_to_document, document_to_backup, BackupInfoDocument, BackupInfoError};
pub use chain::resolve_ancestor_chain;
pub use layout::ServerLayout;
pub use lock::{BusyError, RepositoryLock, RepositoryLockGuard};
pub use model::{Backup, BackupType, CompressionKind, EncryptionKind, Server, Tablespace, Validity};
