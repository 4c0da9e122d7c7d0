//! SHA-verify worker, spawned by `supervisor`'s `verification_cb`
//! (spec.md §4.9). Walks a backup's manifest and recomputes each file's
//! digest through the `external::Hasher` seam, flagging the backup
//! `Invalid` on the first mismatch.

use crate::external::Hasher;
use repository::model::Validity;
use std::collections::BTreeMap;
use std::io;

/// One manifest entry: relative path within the backup's data directory
/// and the digest recorded at backup time, hex-encoded.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub path: String,
    pub expected_digest_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

/// Recomputes every manifest entry's digest via `open_file` (injected so
/// this is testable against in-memory readers) and reports the overall
/// validity plus any mismatches found.
pub fn verify_backup<F>(
    entries: &[ManifestEntry],
    hasher: &dyn Hasher,
    mut open_file: F,
) -> Result<(Validity, Vec<Mismatch>), io::Error>
where
    F: FnMut(&str) -> io::Result<Box<dyn io::Read>>,
{
    let mut mismatches = Vec::new();
    for entry in entries {
        let mut reader = open_file(&entry.path)?;
        let digest = hasher.digest(&mut reader)?;
        let actual = hex::encode(digest);
        if actual != entry.expected_digest_hex {
            mismatches.push(Mismatch {
                path: entry.path.clone(),
                expected: entry.expected_digest_hex.clone(),
                actual,
            });
        }
    }
    let validity = if mismatches.is_empty() {
        Validity::Valid
    } else {
        Validity::Invalid
    };
    Ok((validity, mismatches))
}

/// Parses the subset of `backup_manifest`'s JSON this worker needs: a
/// `Files` array of `{Path, Checksum}` objects (the real manifest also
/// carries WAL ranges and tablespace metadata, out of scope here per
/// spec.md §1 "the JSON/ART container libraries").
pub fn parse_manifest_files(manifest_json: &serde_json::Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(files) = manifest_json.get("Files").and_then(|v| v.as_array()) {
        for file in files {
            if let (Some(path), Some(checksum)) = (
                file.get("Path").and_then(|v| v.as_str()),
                file.get("Checksum").and_then(|v| v.as_str()),
            ) {
                out.insert(path.to_string(), checksum.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::Sha256Hasher;
    use std::io::Cursor;

    #[test]
    fn matching_digest_is_valid() {
        let entries = vec![ManifestEntry {
            path: "base/1/1".into(),
            expected_digest_hex: "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into(),
        }];
        let (validity, mismatches) = verify_backup(&entries, &Sha256Hasher, |_path| {
            Ok(Box::new(Cursor::new(b"abc".to_vec())) as Box<dyn std::io::Read>)
        })
        .unwrap();
        assert_eq!(validity, Validity::Valid);
        assert!(mismatches.is_empty());
    }

    #[test]
    fn mismatched_digest_marks_the_backup_invalid() {
        let entries = vec![ManifestEntry {
            path: "base/1/1".into(),
            expected_digest_hex: "0".repeat(64),
        }];
        let (validity, mismatches) = verify_backup(&entries, &Sha256Hasher, |_path| {
            Ok(Box::new(Cursor::new(b"abc".to_vec())) as Box<dyn std::io::Read>)
        })
        .unwrap();
        assert_eq!(validity, Validity::Invalid);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].path, "base/1/1");
    }

    #[test]
    fn parses_files_array_from_manifest_json() {
        let manifest = serde_json::json!({
            "Files": [
                {"Path": "base/1/1", "Checksum": "abc123"},
                {"Path": "base/1/2", "Checksum": "def456"}
            ]
        });
        let files = parse_manifest_files(&manifest);
        assert_eq!(files.get("base/1/1"), Some(&"abc123".to_string()));
        assert_eq!(files.len(), 2);
    }
}
