//! Ancestor-chain resolution: walks `parent_label` pointers from a
//! backup back to its FULL ancestor, newest-first, for the reconstructor
//! (spec.md §4.6 / §9 "Cyclic graph of backups and labels").

use crate::model::{Backup, BackupType};
use pgmoneta_utils::error::PgmonetaError;
use std::collections::{BTreeMap, HashSet};

/// `labels` is every backup known to the repository, keyed by label.
/// Returns the ancestor chain starting at (and including) `start`,
/// newest-first; the last entry is always a FULL backup.
pub fn resolve_ancestor_chain(
    labels: &BTreeMap<String, Backup>,
    start: &str,
) -> Result<Vec<String>, PgmonetaError> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = start.to_string();

    loop {
        if !seen.insert(current.clone()) {
            return Err(PgmonetaError::MissingAncestor(format!(
                "cycle detected revisiting {current}"
            )));
        }
        let backup = labels
            .get(&current)
            .ok_or_else(|| PgmonetaError::MissingAncestor(current.clone()))?;
        chain.push(current.clone());
        match (backup.backup_type, &backup.parent_label) {
            (BackupType::Full, _) => break,
            (BackupType::Incremental, Some(parent)) => current = parent.clone(),
            (BackupType::Incremental, None) => {
                return Err(PgmonetaError::MissingAncestor(current))
            }
        }
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompressionKind, EncryptionKind, Validity};
    use pgmoneta_utils::lsn::Lsn;
    use std::collections::BTreeMap;

    fn backup(label: &str, backup_type: BackupType, parent: Option<&str>) -> Backup {
        Backup {
            label: label.to_string(),
            backup_type,
            valid: Validity::Valid,
            parent_label: parent.map(String::from),
            start_lsn: Lsn(0),
            end_lsn: Lsn(0),
            start_timeline: 1,
            end_timeline: 1,
            checkpoint_lsn: Lsn(0),
            wal_file_name: String::new(),
            restore_size: 0,
            biggest_file_size: 0,
            major_version: 16,
            minor_version: 0,
            compression: CompressionKind::None,
            encryption: EncryptionKind::None,
            tablespaces: vec![],
            elapsed_seconds: 0.0,
            keep: false,
            comments: String::new(),
            unknown_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn resolves_chain_back_to_full() {
        let mut labels = BTreeMap::new();
        labels.insert("FULL".into(), backup("FULL", BackupType::Full, None));
        labels.insert("I1".into(), backup("I1", BackupType::Incremental, Some("FULL")));
        labels.insert("I2".into(), backup("I2", BackupType::Incremental, Some("I1")));

        let chain = resolve_ancestor_chain(&labels, "I2").unwrap();
        assert_eq!(chain, vec!["I2".to_string(), "I1".to_string(), "FULL".to_string()]);
    }

    #[test]
    fn missing_parent_is_reported() {
        let mut labels = BTreeMap::new();
        labels.insert(
            "I1".into(),
            backup("I1", BackupType::Incremental, Some("GONE")),
        );
        assert!(resolve_ancestor_chain(&labels, "I1").is_err());
    }

    #[test]
    fn cycle_is_detected() {
        let mut labels = BTreeMap::new();
        labels.insert("A".into(), backup("A", BackupType::Incremental, Some("B")));
        labels.insert("B".into(), backup("B", BackupType::Incremental, Some("A")));
        assert!(resolve_ancestor_chain(&labels, "A").is_err());
    }
}
