//! WAL segment naming: 24 uppercase hex chars (`<tli 8><hi 8><lo 8>`),
//! spec.md §6. Grounded on `postgres_ffi::XLogFileName`/`XLogFromFileName`
//! as used throughout `safekeeper::wal_backup`.

use crate::constants::TimeLineId;
use thiserror::Error;

pub type XLogSegNo = u64;

#[derive(Debug, Error)]
pub enum WalNameError {
    #[error("WAL segment file name must be 24 hex characters, got {0:?}")]
    BadLength(String),
    #[error("WAL segment file name contains non-hex characters: {0:?}")]
    NotHex(String),
}

/// Format `(tli, segno)` as the canonical 24-character WAL segment name.
pub fn xlog_file_name(tli: TimeLineId, segno: XLogSegNo, wal_seg_size: u64) -> String {
    let segs_per_xlogid = 0x1_0000_0000u64 / wal_seg_size;
    let log = segno / segs_per_xlogid;
    let seg = segno % segs_per_xlogid;
    format!("{:08X}{:08X}{:08X}", tli, log, seg)
}

/// Parse a 24-character WAL segment name back into `(tli, segno)`.
pub fn xlog_from_file_name(name: &str, wal_seg_size: u64) -> Result<(TimeLineId, XLogSegNo), WalNameError> {
    if name.len() != 24 {
        return Err(WalNameError::BadLength(name.to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WalNameError::NotHex(name.to_string()));
    }
    let tli = u32::from_str_radix(&name[0..8], 16).unwrap();
    let log = u64::from_str_radix(&name[8..16], 16).unwrap();
    let seg = u64::from_str_radix(&name[16..24], 16).unwrap();
    let segs_per_xlogid = 0x1_0000_0000u64 / wal_seg_size;
    Ok((tli, log * segs_per_xlogid + seg))
}

/// Strips known compression/encryption suffixes off a WAL archive file
/// name, returning the bare 24-char segment name. Spec.md §6: `.gz|.zstd
/// |.lz4|.bz2`, optionally followed by `.aes`.
pub fn strip_archive_suffixes(file_name: &str) -> &str {
    let without_aes = file_name.strip_suffix(".aes").unwrap_or(file_name);
    for suffix in [".gz", ".zstd", ".lz4", ".bz2"] {
        if let Some(stripped) = without_aes.strip_suffix(suffix) {
            return stripped;
        }
    }
    without_aes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WAL_SEGMENT_SIZE;

    #[test]
    fn name_round_trip_for_arbitrary_triples() {
        for (tli, segno) in [(1u32, 0u64), (1, 3), (7, 256), (0xABCDEF, 0xFFFF_FFF)] {
            let name = xlog_file_name(tli, segno, WAL_SEGMENT_SIZE);
            assert_eq!(name.len(), 24);
            assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
            let (tli2, segno2) = xlog_from_file_name(&name, WAL_SEGMENT_SIZE).unwrap();
            assert_eq!((tli, segno), (tli2, segno2));
        }
    }

    #[test]
    fn timeline_switch_at_0x3000000() {
        // spec.md S4: timeline 2 at LSN 0/3000000 resumes writing to
        // 000000020000000000000003.
        let segno = 0x0300_0000u64 / WAL_SEGMENT_SIZE;
        let name = xlog_file_name(2, segno, WAL_SEGMENT_SIZE);
        assert_eq!(name, "000000020000000000000003");
    }

    #[test]
    fn bad_length_is_rejected() {
        assert!(xlog_from_file_name("too_short", WAL_SEGMENT_SIZE).is_err());
    }

    #[test]
    fn strip_suffixes() {
        assert_eq!(
            strip_archive_suffixes("000000010000000000000001.zstd.aes"),
            "000000010000000000000001"
        );
        assert_eq!(
            strip_archive_suffixes("000000010000000000000001"),
            "000000010000000000000001"
        );
    }
}
