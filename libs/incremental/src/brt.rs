//! C4 — block-reference table: in-memory map `{relation-locator, fork} ->
//! (limit_block, modified-block-set)`, built from WAL summaries, spec.md
//! §3/§4.4.

use pgmoneta_pg::ForkNumber;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BrtKey {
    pub tablespace_oid: u32,
    pub database_oid: u32,
    pub relation_number: u32,
    pub fork: ForkNumber,
}

/// One WAL-summary record covering a `(locator, fork)` pair. `limit_block
/// = None` means "no truncation observed in this summary"; callers feed
/// records in ascending-LSN order so "most recent" in the merge rule is
/// simply "last one seen".
#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub key: BrtKey,
    pub limit_block: Option<u32>,
    pub modified_blocks: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct BrtEntry {
    pub limit_block: Option<u32>,
    pub modified_blocks: BTreeSet<u32>,
}

/// Merge of every WAL summary covering `(parent.start_lsn, new_start_lsn]`.
#[derive(Debug, Default)]
pub struct BlockRefTable {
    entries: BTreeMap<BrtKey, BrtEntry>,
}

impl BlockRefTable {
    pub fn new() -> Self {
        BlockRefTable::default()
    }

    /// Builds a BRT from an ordered sequence of WAL-summary records,
    /// applying spec.md §4.4's merge rule: union the modified sets; for
    /// `limit_block` take the most recent non-infinite value (truncations
    /// supersede earlier ones).
    pub fn build(records: impl IntoIterator<Item = SummaryRecord>) -> Self {
        let mut table = BlockRefTable::new();
        for record in records {
            let entry = table.entries.entry(record.key).or_default();
            entry.modified_blocks.extend(record.modified_blocks);
            if let Some(limit) = record.limit_block {
                entry.limit_block = Some(limit);
            }
        }
        table
    }

    /// `get_entry(locator, fork) -> (limit_block, entry_ref?)`. Missing
    /// entries (e.g. because a summary file was absent from the range)
    /// return `None`, which the reconstructor treats as "no BRT coverage,
    /// fall back to full copy" per spec.md §4.4's failure semantics.
    pub fn get_entry(&self, key: &BrtKey) -> Option<(Option<u32>, &BrtEntry)> {
        self.entries.get(key).map(|e| (e.limit_block, e))
    }

    /// `get_blocks(entry, start, end) -> sorted modified block numbers in
    /// [start, end)`.
    pub fn get_blocks(entry: &BrtEntry, start: u32, end: u32) -> Vec<u32> {
        entry
            .modified_blocks
            .range(start..end)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
