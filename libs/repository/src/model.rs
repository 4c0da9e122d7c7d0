//! Data model types from spec.md §3: `Server` and `Backup`.

use pgmoneta_utils::lsn::Lsn;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Gzip,
    Zstd,
    Lz4,
    Bzip2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionKind {
    None,
    Aes,
    Aes128,
    Aes192,
    Aes256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablespace {
    pub name: String,
    pub oid: u32,
    pub path: String,
}

/// Immutable once sealed (spec.md §3 "Backup"). Built incrementally by a
/// workflow, then written by the `backup.info` writer at teardown.
#[derive(Debug, Clone)]
pub struct Backup {
    pub label: String,
    pub backup_type: BackupType,
    pub valid: Validity,
    pub parent_label: Option<String>,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub start_timeline: u32,
    pub end_timeline: u32,
    pub checkpoint_lsn: Lsn,
    pub wal_file_name: String,
    pub restore_size: u64,
    pub biggest_file_size: u64,
    pub major_version: u32,
    pub minor_version: u32,
    pub compression: CompressionKind,
    pub encryption: EncryptionKind,
    pub tablespaces: Vec<Tablespace>,
    pub elapsed_seconds: f64,
    pub keep: bool,
    pub comments: String,
    /// Fields this implementation does not model explicitly but must
    /// preserve verbatim on rewrite (spec.md §4.11 "unknown keys are
    /// preserved on rewrite").
    pub unknown_fields: BTreeMap<String, String>,
}

impl Backup {
    /// spec.md §3 invariant: an INCREMENTAL backup's parent must already
    /// be present and valid; `start_lsn >= parent.end_lsn`.
    pub fn validate_against_parent(&self, parent: Option<&Backup>) -> Result<(), &'static str> {
        match self.backup_type {
            BackupType::Full => Ok(()),
            BackupType::Incremental => {
                let parent = parent.ok_or("incremental backup has no parent in repository")?;
                if parent.valid != Validity::Valid {
                    return Err("parent backup is not valid");
                }
                if self.start_lsn < parent.end_lsn {
                    return Err("start_lsn precedes parent.end_lsn");
                }
                Ok(())
            }
        }
    }
}

/// spec.md §3 "Server". `online`/`valid`/`wal_streaming`/`repository` are
/// owned by the shared-memory region in the `pgmoneta` crate (C9); this
/// struct carries the rest of the per-server identity and is the value
/// `shmem` wraps atomics around.
#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub primary: bool,
    pub checksums: bool,
    pub summarize_wal: bool,
    pub slot_name: String,
    pub compression_override: Option<CompressionKind>,
    pub encryption_override: Option<EncryptionKind>,
}
