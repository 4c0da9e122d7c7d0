//! C6 — the reconstructor. Given a target output, a latest incremental
//! source `L`, an ordered ancestor chain, and a mode, produces either a
//! full or a shallower incremental output file. Spec.md §4.6: "the
//! hardest component."

use crate::file::{IncrementalFileError, IncrementalFileHeader, IncrementalFileReader};
use std::io::{Read, Seek, SeekFrom};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructMode {
    RebuildFull,
    RebuildIncremental,
}

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error(transparent)]
    IncrementalFile(#[from] IncrementalFileError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("ancestor chain contains a cycle back to the starting label {0}")]
    LoopInAncestors(String),
}

/// One ancestor in the chain, already resolved to either its incremental
/// file (present) or its full file (fallback), per spec.md §4.6 step 5.
pub enum AncestorSource<R> {
    Incremental(IncrementalFileReader<R>),
    Full { reader: R, size_bytes: u64 },
}

impl<R: Read + Seek> AncestorSource<R> {
    fn read_block(&mut self, block_no: u32, page_size: u32) -> Result<Option<Vec<u8>>, ReconstructError> {
        match self {
            AncestorSource::Incremental(reader) => Ok(reader.read_page_for_block(block_no)?),
            AncestorSource::Full { reader, size_bytes } => {
                let offset = block_no as u64 * page_size as u64;
                if offset + page_size as u64 > *size_bytes {
                    return Ok(None);
                }
                reader.seek(SeekFrom::Start(offset))?;
                let mut page = vec![0u8; page_size as usize];
                reader.read_exact(&mut page)?;
                Ok(Some(page))
            }
        }
    }

    fn has_block(&self, block_no: u32, page_size: u32) -> bool {
        match self {
            AncestorSource::Incremental(reader) => reader.header.block_index(block_no).is_some(),
            AncestorSource::Full { size_bytes, .. } => {
                (block_no as u64 + 1) * page_size as u64 <= *size_bytes
            }
        }
    }

    fn is_full(&self) -> bool {
        matches!(self, AncestorSource::Full { .. })
    }
}

#[derive(Debug)]
pub enum ReconstructOutput {
    Full { pages: Vec<Vec<u8>> },
    Incremental {
        header: IncrementalFileHeader,
        pages: Vec<Vec<u8>>,
    },
}

/// Tags, per block, which source it was last assigned from (spec.md §4.6
/// steps 3-6: `source_map[]`/`offset_map[]`, modeled here as an index
/// into `ancestors` plus a sentinel for "from L itself").
#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockSource {
    Latest,
    Ancestor(usize),
}

pub fn reconstruct<R: Read + Seek>(
    latest: &mut IncrementalFileReader<R>,
    ancestors: &mut [AncestorSource<R>],
    mode: ReconstructMode,
    page_size: u32,
) -> Result<ReconstructOutput, ReconstructError> {
    // Step 2: output's block count.
    let truncation_l = latest.header.truncation_block_length;
    let highest_in_l = latest.header.block_numbers.last().map(|&b| b + 1).unwrap_or(0);
    let block_length = truncation_l.max(highest_in_l);

    // Step 3: parallel arrays.
    let mut source_map: Vec<Option<BlockSource>> = vec![None; block_length as usize];

    // Step 4: blocks listed in L win immediately.
    let mut full_copy_possible = latest.header.block_numbers.is_empty();
    for &b in &latest.header.block_numbers {
        source_map[b as usize] = Some(BlockSource::Latest);
    }
    if !latest.header.block_numbers.is_empty() {
        full_copy_possible = false;
    }

    // Step 5: walk ancestors newest-first; stop at the first full one.
    for (ancestor_idx, ancestor) in ancestors.iter().enumerate() {
        let is_full = ancestor.is_full();
        for b in 0..truncation_l {
            if source_map[b as usize].is_some() {
                continue;
            }
            if ancestor.has_block(b, page_size) {
                source_map[b as usize] = Some(BlockSource::Ancestor(ancestor_idx));
            }
        }
        if !is_full {
            full_copy_possible = false;
        }
        if is_full {
            break; // no ancestor beyond the nearest full one contributes.
        }
    }

    // Step 6: whole-file byte copy eligibility.
    let copy_source = if full_copy_possible {
        let mut uniform: Option<usize> = None;
        let mut eligible = true;
        for b in 0..truncation_l {
            match source_map[b as usize] {
                Some(BlockSource::Ancestor(idx)) if ancestors[idx].is_full() => {
                    match uniform {
                        None => uniform = Some(idx),
                        Some(u) if u == idx => {}
                        _ => {
                            eligible = false;
                            break;
                        }
                    }
                }
                _ => {
                    eligible = false;
                    break;
                }
            }
        }
        match (eligible, uniform) {
            (true, Some(idx)) => {
                if let AncestorSource::Full { size_bytes, .. } = &ancestors[idx] {
                    if *size_bytes == block_length as u64 * page_size as u64 {
                        Some(idx)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            _ => None,
        }
    } else {
        None
    };

    // Step 7: materialize. The whole-file-copy fast path reads the
    // ancestor linearly instead of page by page, but yields identical
    // bytes to the general path (testable property 2).
    let mut read_block = |b: u32, ancestors: &mut [AncestorSource<R>]| -> Result<Vec<u8>, ReconstructError> {
        match source_map[b as usize] {
            None => Ok(vec![0u8; page_size as usize]), // truncation in flight
            Some(BlockSource::Latest) => Ok(latest
                .read_page_for_block(b)?
                .expect("block listed in source_map as Latest must be present in L")),
            Some(BlockSource::Ancestor(idx)) => Ok(ancestors[idx]
                .read_block(b, page_size)?
                .unwrap_or_else(|| vec![0u8; page_size as usize])),
        }
    };

    match mode {
        ReconstructMode::RebuildFull => {
            let mut pages = Vec::with_capacity(block_length as usize);
            if let Some(idx) = copy_source {
                if let AncestorSource::Full { reader, .. } = &mut ancestors[idx] {
                    reader.seek(SeekFrom::Start(0))?;
                    for _ in 0..block_length {
                        let mut page = vec![0u8; page_size as usize];
                        reader.read_exact(&mut page)?;
                        pages.push(page);
                    }
                }
            } else {
                for b in 0..block_length {
                    pages.push(read_block(b, ancestors)?);
                }
            }
            Ok(ReconstructOutput::Full { pages })
        }
        ReconstructMode::RebuildIncremental => {
            let mut block_numbers = Vec::new();
            let mut pages = Vec::new();
            for b in 0..block_length {
                if source_map[b as usize].is_some() {
                    block_numbers.push(b);
                    pages.push(read_block(b, ancestors)?);
                }
            }
            // Built directly rather than through the validating
            // constructor: a concurrent truncate-then-extend on the
            // origin can legitimately produce a block beyond
            // truncation_l (spec.md §4.6 step 2 / Open Question 1), which
            // the general-purpose writer's invariant check would reject.
            let header = IncrementalFileHeader {
                num_blocks: block_numbers.len() as u32,
                truncation_block_length: truncation_l,
                block_numbers,
            };
            Ok(ReconstructOutput::Incremental { header, pages })
        }
    }
}

/// Guards against a cyclic ancestor chain (Design Notes: "the ancestor
/// chain is a strict list, never cyclic; enforce by construction").
pub fn check_no_cycle(start_label: &str, chain: &[String]) -> Result<(), ReconstructError> {
    if chain.iter().any(|l| l == start_label) {
        return Err(ReconstructError::LoopInAncestors(start_label.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::write_incremental_file;
    use std::io::Cursor;

    const PAGE: u32 = 8192;

    fn page(byte: u8) -> Vec<u8> {
        vec![byte; PAGE as usize]
    }

    fn full_file(pages: &[u8]) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for &b in pages {
            buf.extend(page(b));
        }
        Cursor::new(buf)
    }

    fn incremental_file(truncation: u32, blocks: &[(u32, u8)]) -> IncrementalFileReader<Cursor<Vec<u8>>> {
        let header = IncrementalFileHeader::new(
            truncation,
            blocks.iter().map(|(b, _)| *b).collect(),
        )
        .unwrap();
        let pages: Vec<Vec<u8>> = blocks.iter().map(|(_, c)| page(*c)).collect();
        let mut buf = Vec::new();
        write_incremental_file(&mut buf, &header, PAGE, &pages).unwrap();
        IncrementalFileReader::open(Cursor::new(buf), PAGE).unwrap()
    }

    /// spec.md S2: FULL(A A A), I1 modifies block 1 -> B, I2 modifies
    /// block 2 -> C. Reconstruct-full from (I2, I1, FULL) must yield
    /// A B C.
    #[test]
    fn s2_incremental_round_trip_full() {
        let mut latest = incremental_file(3, &[(2, b'C')]); // I2
        let i1_reader = incremental_file(3, &[(1, b'B')]);
        let full_reader = AncestorSource::Full {
            reader: full_file(&[b'A', b'A', b'A']),
            size_bytes: 3 * PAGE as u64,
        };
        let mut ancestors = vec![AncestorSource::Incremental(i1_reader), full_reader];

        let out = reconstruct(&mut latest, &mut ancestors, ReconstructMode::RebuildFull, PAGE).unwrap();
        match out {
            ReconstructOutput::Full { pages } => {
                assert_eq!(pages.len(), 3);
                assert_eq!(pages[0], page(b'A'));
                assert_eq!(pages[1], page(b'B'));
                assert_eq!(pages[2], page(b'C'));
            }
            _ => panic!("expected full output"),
        }
    }

    /// spec.md S2 second half: reconstruct-incremental from (I2, I1) with
    /// parent = FULL must yield header {num_blocks=2, truncation=3,
    /// blocks=[1,2]} and payload B C.
    #[test]
    fn s2_incremental_round_trip_incremental_mode() {
        let mut latest = incremental_file(3, &[(2, b'C')]);
        let i1_reader = incremental_file(3, &[(1, b'B')]);
        let full_reader = AncestorSource::Full {
            reader: full_file(&[b'A', b'A', b'A']),
            size_bytes: 3 * PAGE as u64,
        };
        let mut ancestors = vec![AncestorSource::Incremental(i1_reader), full_reader];

        let out = reconstruct(
            &mut latest,
            &mut ancestors,
            ReconstructMode::RebuildIncremental,
            PAGE,
        )
        .unwrap();
        match out {
            ReconstructOutput::Incremental { header, pages } => {
                assert_eq!(header.num_blocks, 2);
                assert_eq!(header.truncation_block_length, 3);
                assert_eq!(header.block_numbers, vec![1, 2]);
                assert_eq!(pages[0], page(b'B'));
                assert_eq!(pages[1], page(b'C'));
            }
            _ => panic!("expected incremental output"),
        }
    }

    /// spec.md S3: FULL has 4 blocks; I1 lists block 3 but the server's
    /// file at clone time is only 2 blocks long. Reconstruct-full emits 4
    /// pages; pages 2 and 3 are zero-filled.
    #[test]
    fn s3_truncation_during_backup_zero_fills() {
        let mut latest = incremental_file(4, &[(3, b'D')]);
        let full_reader = AncestorSource::Full {
            reader: full_file(&[b'A', b'A']), // only 2 blocks present
            size_bytes: 2 * PAGE as u64,
        };
        let mut ancestors = vec![full_reader];

        let out = reconstruct(&mut latest, &mut ancestors, ReconstructMode::RebuildFull, PAGE).unwrap();
        match out {
            ReconstructOutput::Full { pages } => {
                assert_eq!(pages.len(), 4);
                assert_eq!(pages[0], page(b'A'));
                assert_eq!(pages[1], page(b'A'));
                assert_eq!(pages[2], vec![0u8; PAGE as usize]);
                assert_eq!(pages[3], page(b'D'));
            }
            _ => panic!("expected full output"),
        }
    }

    /// Testable property 2: rebuild-full, then rebuild-incremental, then
    /// rebuild-full again, produce byte-identical outputs.
    #[test]
    fn rebuild_full_then_incremental_then_full_is_stable() {
        let mut latest = incremental_file(3, &[(2, b'C')]);
        let i1_reader = incremental_file(3, &[(1, b'B')]);
        let full_reader = AncestorSource::Full {
            reader: full_file(&[b'A', b'A', b'A']),
            size_bytes: 3 * PAGE as u64,
        };
        let mut ancestors = vec![AncestorSource::Incremental(i1_reader), full_reader];
        let first = match reconstruct(&mut latest, &mut ancestors, ReconstructMode::RebuildFull, PAGE).unwrap() {
            ReconstructOutput::Full { pages } => pages,
            _ => unreachable!(),
        };

        // Re-derive the incremental form from the same inputs, then
        // reconstruct full from it directly (it already has everything
        // needed with no further ancestors).
        let mut latest2 = incremental_file(3, &[(2, b'C')]);
        let i1_reader2 = incremental_file(3, &[(1, b'B')]);
        let full_reader2 = AncestorSource::Full {
            reader: full_file(&[b'A', b'A', b'A']),
            size_bytes: 3 * PAGE as u64,
        };
        let mut ancestors2 = vec![AncestorSource::Incremental(i1_reader2), full_reader2];
        let as_incremental = match reconstruct(
            &mut latest2,
            &mut ancestors2,
            ReconstructMode::RebuildIncremental,
            PAGE,
        )
        .unwrap()
        {
            ReconstructOutput::Incremental { header, pages } => (header, pages),
            _ => unreachable!(),
        };
        let mut buf = Vec::new();
        write_incremental_file(&mut buf, &as_incremental.0, PAGE, &as_incremental.1).unwrap();
        let mut latest3 = IncrementalFileReader::open(Cursor::new(buf), PAGE).unwrap();
        let second = match reconstruct(&mut latest3, &mut [], ReconstructMode::RebuildFull, PAGE).unwrap() {
            ReconstructOutput::Full { pages } => pages,
            _ => unreachable!(),
        };

        assert_eq!(first, second);
    }

    #[test]
    fn cycle_detection() {
        let chain = vec!["b".to_string(), "a".to_string()];
        assert!(check_no_cycle("a", &chain).is_err());
        assert!(check_no_cycle("z", &chain).is_ok());
    }
}
