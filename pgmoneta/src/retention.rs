//! Retention worker, spawned by `supervisor`'s `retention_cb` (spec.md
//! §4.9). Computes which backups are no longer required to satisfy the
//! configured policy, without ever selecting a backup that a still-kept
//! backup depends on through its ancestor chain.

use repository::chain::resolve_ancestor_chain;
use repository::model::Backup;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Always keep at least this many of the newest backups, regardless
    /// of age.
    pub keep_count: usize,
    /// Beyond `keep_count`, also keep any backup newer than this many
    /// seconds. `None` disables the age-based rule.
    pub keep_seconds: Option<u64>,
}

/// Labels eligible for expunging: not flagged `keep`, outside the
/// retention window, and not an ancestor of any backup that itself
/// survives this pass (spec.md §3 ancestor-chain invariant — an
/// INCREMENTAL backup's parent must remain present and valid).
pub fn plan_expunge(
    backups: &BTreeMap<String, Backup>,
    policy: &RetentionPolicy,
    label_ages_secs: &BTreeMap<String, u64>,
) -> Vec<String> {
    let mut labels: Vec<&String> = backups.keys().collect();
    labels.sort();
    labels.reverse(); // newest first, per S6 lexicographic == chronological

    let mut survivors: HashSet<String> = HashSet::new();
    for (idx, label) in labels.iter().enumerate() {
        let backup = &backups[*label];
        let within_count = idx < policy.keep_count;
        let within_age = policy
            .keep_seconds
            .zip(label_ages_secs.get(*label))
            .map(|(window, age)| *age <= window)
            .unwrap_or(false);
        if backup.keep || within_count || within_age {
            survivors.insert((*label).clone());
        }
    }

    // Keeping a backup implicitly keeps every backup on its ancestor
    // chain back to the nearest FULL, since the reconstructor needs them
    // all (spec.md §4.6).
    let mut required = HashSet::new();
    for label in &survivors {
        if let Ok(chain) = resolve_ancestor_chain(backups, label) {
            required.extend(chain);
        }
    }

    labels
        .into_iter()
        .filter(|label| !required.contains(*label))
        .cloned()
        .collect()
}
