//! C5 — incremental file: on-disk layout and serializer/deserializer for
//! one relation file, spec.md §4.5.
//!
//! Header: magic constant, `num_blocks`, `truncation_block_length`, then
//! `num_blocks` 32-bit block numbers, padded to a multiple of page size.
//! Payload: exactly `num_blocks * page_size` bytes, one page per listed
//! block number, in the same order.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

/// `0x494e4352` — "INCR" in ASCII, spelled out as the spec's conceptual
/// magic constant.
pub const MAGIC: u32 = 0x494e_4352;

const RAW_HEADER_PREFIX_LEN: usize = 4 + 4 + 4; // magic + num_blocks + truncation_block_length

#[derive(Debug, Error)]
pub enum IncrementalFileError {
    #[error("bad magic {0:#x}, expected {MAGIC:#x}")]
    BadMagic(u32),
    #[error("block count {count} exceeds header length")]
    BlockCountOverflow { count: u32 },
    #[error("block numbers are not strictly ascending: {prev} then {next}")]
    NotAscending { prev: u32, next: u32 },
    #[error("truncation_block_length {truncation} is smaller than the highest present block {highest}")]
    TruncationTooSmall { truncation: u32, highest: u32 },
    #[error("payload length {actual} does not match expected {expected} (num_blocks * page_size)")]
    PayloadLengthMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalFileHeader {
    pub num_blocks: u32,
    pub truncation_block_length: u32,
    /// Ascending order, per spec.md §4.5.
    pub block_numbers: Vec<u32>,
}

impl IncrementalFileHeader {
    pub fn new(truncation_block_length: u32, block_numbers: Vec<u32>) -> Result<Self, IncrementalFileError> {
        let mut prev: Option<u32> = None;
        for &b in &block_numbers {
            if let Some(p) = prev {
                if b <= p {
                    return Err(IncrementalFileError::NotAscending { prev: p, next: b });
                }
            }
            prev = Some(b);
        }
        if let Some(&highest) = block_numbers.last() {
            if truncation_block_length < highest + 1 {
                return Err(IncrementalFileError::TruncationTooSmall {
                    truncation: truncation_block_length,
                    highest,
                });
            }
        }
        Ok(IncrementalFileHeader {
            num_blocks: block_numbers.len() as u32,
            truncation_block_length,
            block_numbers,
        })
    }

    fn raw_len(&self) -> usize {
        RAW_HEADER_PREFIX_LEN + 4 * self.block_numbers.len()
    }

    /// Header length padded to a multiple of `page_size`.
    pub fn padded_len(&self, page_size: u32) -> u64 {
        let raw = self.raw_len() as u64;
        let page_size = page_size as u64;
        ((raw + page_size - 1) / page_size) * page_size
    }

    fn encode(&self, page_size: u32) -> Vec<u8> {
        let padded = self.padded_len(page_size) as usize;
        let mut buf = Vec::with_capacity(padded);
        buf.write_u32::<BigEndian>(MAGIC).unwrap();
        buf.write_u32::<BigEndian>(self.num_blocks).unwrap();
        buf.write_u32::<BigEndian>(self.truncation_block_length)
            .unwrap();
        for &b in &self.block_numbers {
            buf.write_u32::<BigEndian>(b).unwrap();
        }
        buf.resize(padded, 0);
        buf
    }

    fn decode<R: Read>(r: &mut R, page_size: u32) -> Result<Self, IncrementalFileError> {
        let magic = r.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(IncrementalFileError::BadMagic(magic));
        }
        let num_blocks = r.read_u32::<BigEndian>()?;
        let truncation_block_length = r.read_u32::<BigEndian>()?;

        let raw_len = RAW_HEADER_PREFIX_LEN as u64 + 4 * num_blocks as u64;
        if raw_len > (u32::MAX as u64) {
            return Err(IncrementalFileError::BlockCountOverflow { count: num_blocks });
        }

        let mut block_numbers = Vec::with_capacity(num_blocks as usize);
        let mut prev: Option<u32> = None;
        for _ in 0..num_blocks {
            let b = r.read_u32::<BigEndian>()?;
            if let Some(p) = prev {
                if b <= p {
                    return Err(IncrementalFileError::NotAscending { prev: p, next: b });
                }
            }
            prev = Some(b);
            block_numbers.push(b);
        }

        let header = IncrementalFileHeader {
            num_blocks,
            truncation_block_length,
            block_numbers,
        };
        let padded = header.padded_len(page_size);
        let already_read = raw_len;
        let pad_bytes = padded - already_read;
        if pad_bytes > 0 {
            let mut discard = vec![0u8; pad_bytes as usize];
            r.read_exact(&mut discard)?;
        }
        Ok(header)
    }

    pub fn block_index(&self, block_no: u32) -> Option<usize> {
        self.block_numbers.binary_search(&block_no).ok()
    }
}

/// Writes a complete incremental file: header, then one page per listed
/// block number, in order. `pages[i]` must be exactly `page_size` bytes
/// and correspond to `header.block_numbers[i]`.
pub fn write_incremental_file<W: Write>(
    w: &mut W,
    header: &IncrementalFileHeader,
    page_size: u32,
    pages: &[Vec<u8>],
) -> Result<(), IncrementalFileError> {
    if pages.len() != header.block_numbers.len() {
        return Err(IncrementalFileError::PayloadLengthMismatch {
            expected: header.block_numbers.len() as u64 * page_size as u64,
            actual: pages.iter().map(|p| p.len() as u64).sum(),
        });
    }
    w.write_all(&header.encode(page_size))?;
    for page in pages {
        if page.len() != page_size as usize {
            return Err(IncrementalFileError::PayloadLengthMismatch {
                expected: page_size as u64,
                actual: page.len() as u64,
            });
        }
        w.write_all(page)?;
    }
    Ok(())
}

/// Reads back an incremental file written by [`write_incremental_file`],
/// validating the payload length against `num_blocks * page_size`
/// (testable property 1).
pub fn read_incremental_file<R: Read + Seek>(
    r: &mut R,
    page_size: u32,
) -> Result<(IncrementalFileHeader, Vec<Vec<u8>>), IncrementalFileError> {
    let header = IncrementalFileHeader::decode(r, page_size)?;
    let total_len = r.seek(SeekFrom::End(0))?;
    let header_len = header.padded_len(page_size);
    let payload_len = total_len.saturating_sub(header_len);
    let expected = header.num_blocks as u64 * page_size as u64;
    if payload_len != expected {
        return Err(IncrementalFileError::PayloadLengthMismatch {
            expected,
            actual: payload_len,
        });
    }
    r.seek(SeekFrom::Start(header_len))?;
    let mut pages = Vec::with_capacity(header.num_blocks as usize);
    for _ in 0..header.num_blocks {
        let mut page = vec![0u8; page_size as usize];
        r.read_exact(&mut page)?;
        pages.push(page);
    }
    Ok((header, pages))
}

/// A handle for random-access reads of individual pages out of an
/// already-open incremental file, used by the reconstructor (C6) which
/// needs to pull single pages from several ancestor files.
pub struct IncrementalFileReader<R> {
    inner: R,
    pub header: IncrementalFileHeader,
    header_len: u64,
    page_size: u32,
}

impl<R: Read + Seek> IncrementalFileReader<R> {
    pub fn open(mut inner: R, page_size: u32) -> Result<Self, IncrementalFileError> {
        let header = IncrementalFileHeader::decode(&mut inner, page_size)?;
        let header_len = header.padded_len(page_size);
        Ok(IncrementalFileReader {
            inner,
            header,
            header_len,
            page_size,
        })
    }

    /// Byte offset of the `idx`-th listed block's page within this file.
    pub fn offset_of(&self, idx: usize) -> u64 {
        self.header_len + idx as u64 * self.page_size as u64
    }

    pub fn read_page_at_index(&mut self, idx: usize) -> Result<Vec<u8>, IncrementalFileError> {
        let offset = self.offset_of(idx);
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut page = vec![0u8; self.page_size as usize];
        self.inner.read_exact(&mut page)?;
        Ok(page)
    }

    pub fn read_page_for_block(&mut self, block_no: u32) -> Result<Option<Vec<u8>>, IncrementalFileError> {
        match self.header.block_index(block_no) {
            Some(idx) => Ok(Some(self.read_page_at_index(idx)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn page_filled(byte: u8, page_size: u32) -> Vec<u8> {
        vec![byte; page_size as usize]
    }

    /// Testable property 1: round-trip identity.
    #[test]
    fn round_trip_is_bit_identical() {
        let page_size = 8192u32;
        let header = IncrementalFileHeader::new(3, vec![1, 2]).unwrap();
        let pages = vec![page_filled(b'B', page_size), page_filled(b'C', page_size)];

        let mut buf = Vec::new();
        write_incremental_file(&mut buf, &header, page_size, &pages).unwrap();

        assert_eq!(buf.len() as u64, header.padded_len(page_size) + 2 * page_size as u64);

        let mut cursor = Cursor::new(buf);
        let (decoded_header, decoded_pages) = read_incremental_file(&mut cursor, page_size).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_pages, pages);
    }

    #[test]
    fn num_blocks_zero_is_legal() {
        let page_size = 8192u32;
        let header = IncrementalFileHeader::new(5, vec![]).unwrap();
        let mut buf = Vec::new();
        write_incremental_file(&mut buf, &header, page_size, &[]).unwrap();
        let mut cursor = Cursor::new(buf);
        let (decoded, pages) = read_incremental_file(&mut cursor, page_size).unwrap();
        assert_eq!(decoded.num_blocks, 0);
        assert!(pages.is_empty());
        assert_eq!(decoded.truncation_block_length, 5);
    }

    #[test]
    fn rejects_non_ascending_blocks() {
        assert!(matches!(
            IncrementalFileHeader::new(5, vec![2, 1]),
            Err(IncrementalFileError::NotAscending { .. })
        ));
    }

    #[test]
    fn rejects_truncation_smaller_than_highest_block() {
        assert!(matches!(
            IncrementalFileHeader::new(2, vec![1, 2]),
            Err(IncrementalFileError::TruncationTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; 64];
        buf[3] = 0xFF; // corrupt the last byte of the magic
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            IncrementalFileHeader::decode(&mut cursor, 8192),
            Err(IncrementalFileError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_payload_length_mismatch() {
        let page_size = 8192u32;
        let header = IncrementalFileHeader::new(2, vec![0, 1]).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&header.encode(page_size));
        buf.extend_from_slice(&page_filled(b'A', page_size)); // only one page, need two
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_incremental_file(&mut cursor, page_size),
            Err(IncrementalFileError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn random_access_reader_reads_individual_pages() {
        let page_size = 8192u32;
        let header = IncrementalFileHeader::new(3, vec![1, 2]).unwrap();
        let pages = vec![page_filled(b'B', page_size), page_filled(b'C', page_size)];
        let mut buf = Vec::new();
        write_incremental_file(&mut buf, &header, page_size, &pages).unwrap();

        let mut reader = IncrementalFileReader::open(Cursor::new(buf), page_size).unwrap();
        assert_eq!(reader.read_page_for_block(1).unwrap().unwrap(), pages[0]);
        assert_eq!(reader.read_page_for_block(2).unwrap().unwrap(), pages[1]);
        assert!(reader.read_page_for_block(0).unwrap().is_none());
    }
}
