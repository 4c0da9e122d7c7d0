//! Incremental backup format: block-reference tables (C4), the
//! incremental file layout (C5), and the reconstructor (C6).

pub mod brt;
pub mod file;
pub mod reconstruct;

pub use brt::{BlockRefTable, BrtEntry, BrtKey, SummaryRecord};
pub use file::{
    read_incremental_file, write_incremental_file, IncrementalFileError, IncrementalFileHeader,
    IncrementalFileReader,
};
pub use reconstruct::{reconstruct, AncestorSource, ReconstructError, ReconstructMode, ReconstructOutput};
