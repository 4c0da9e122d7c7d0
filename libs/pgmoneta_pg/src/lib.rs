//! Minimal analogue of `postgres_ffi`: the page/segment constants, the
//! relation-file locator, and WAL segment naming that the rest of the
//! workspace needs. Everything else about the origin server's on-disk
//! format (catalogs, control-file layout, page header internals) is out
//! of scope per spec.md §1.

pub mod constants;
pub mod waldir;

pub use constants::{ForkNumber, RelFileLocator, TimeLineId, BLCKSZ, RELSEG_SIZE, WAL_SEGMENT_SIZE};
pub use waldir::{xlog_file_name, xlog_from_file_name, XLogSegNo};
