//! Byte-range providers the record scanner reads from.
//!
//! The workbook stream of a compound file is stored in fixed-size sectors that are not
//! necessarily contiguous. [`ByteSpace`] hides that: the scanner addresses a virtual contiguous
//! range and only asks for headers and payload ranges.

use std::borrow::Cow;

pub trait ByteSpace {
    /// Total length of the virtual range in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The 4 bytes starting at `offset`, or `None` if fewer than 4 bytes remain.
    fn header_at(&self, offset: u64) -> Option<[u8; 4]>;

    /// `len` bytes starting at `offset`, or `None` if the range leaves the space.
    fn range_at(&self, offset: u64, len: usize) -> Option<Cow<'_, [u8]>>;
}

impl ByteSpace for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn header_at(&self, offset: u64) -> Option<[u8; 4]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(4)?;
        let bytes = self.get(start..end)?;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn range_at(&self, offset: u64, len: usize) -> Option<Cow<'_, [u8]>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        self.get(start..end).map(Cow::Borrowed)
    }
}

impl ByteSpace for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn header_at(&self, offset: u64) -> Option<[u8; 4]> {
        self.as_slice().header_at(offset)
    }

    fn range_at(&self, offset: u64, len: usize) -> Option<Cow<'_, [u8]>> {
        self.as_slice().range_at(offset, len)
    }
}

/// A virtual byte range stitched together from non-contiguous blocks.
///
/// Reads that fall inside one block are borrowed; reads that straddle a block boundary are copied.
#[derive(Debug, Clone)]
pub struct BlockByteSpace<'a> {
    blocks: Vec<&'a [u8]>,
    /// Virtual start offset of each block (parallel to `blocks`).
    starts: Vec<u64>,
    len: u64,
}

impl<'a> BlockByteSpace<'a> {
    pub fn new(blocks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut out = Self {
            blocks: Vec::new(),
            starts: Vec::new(),
            len: 0,
        };
        for block in blocks {
            if block.is_empty() {
                continue;
            }
            out.starts.push(out.len);
            out.len += block.len() as u64;
            out.blocks.push(block);
        }
        out
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn locate(&self, offset: u64) -> Option<(usize, usize)> {
        if offset >= self.len {
            return None;
        }
        let idx = self.starts.partition_point(|&start| start <= offset).checked_sub(1)?;
        let within = usize::try_from(offset - self.starts[idx]).ok()?;
        Some((idx, within))
    }

    fn copy_range(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let (mut idx, mut within) = self.locate(offset)?;
        let mut out = Vec::new();
        out.try_reserve_exact(len).ok()?;
        while out.len() < len {
            let block = self.blocks.get(idx)?;
            let take = (len - out.len()).min(block.len() - within);
            out.extend_from_slice(&block[within..within + take]);
            idx += 1;
            within = 0;
        }
        Some(out)
    }
}

impl ByteSpace for BlockByteSpace<'_> {
    fn len(&self) -> u64 {
        self.len
    }

    fn header_at(&self, offset: u64) -> Option<[u8; 4]> {
        let range = self.range_at(offset, 4)?;
        Some([range[0], range[1], range[2], range[3]])
    }

    fn range_at(&self, offset: u64, len: usize) -> Option<Cow<'_, [u8]>> {
        let end = offset.checked_add(len as u64)?;
        if end > self.len {
            return None;
        }
        if len == 0 {
            return Some(Cow::Borrowed(&[]));
        }
        let (idx, within) = self.locate(offset)?;
        let block = self.blocks[idx];
        if within + len <= block.len() {
            return Some(Cow::Borrowed(&block[within..within + len]));
        }
        self.copy_range(offset, len).map(Cow::Owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_space_bounds_checks_headers_and_ranges() {
        let bytes = [1u8, 2, 3, 4, 5];
        let space: &[u8] = &bytes;
        assert_eq!(space.header_at(0), Some([1, 2, 3, 4]));
        assert_eq!(space.header_at(2), None);
        assert_eq!(space.range_at(3, 2).as_deref(), Some(&[4u8, 5][..]));
        assert!(space.range_at(4, 2).is_none());
    }

    #[test]
    fn block_space_reads_across_block_boundaries() {
        let a = [0x09u8, 0x08];
        let b = [0x10u8];
        let c = [0x00u8, 0xAA, 0xBB];
        let space = BlockByteSpace::new([&a[..], &[][..], &b[..], &c[..]]);
        assert_eq!(space.block_count(), 3);
        assert_eq!(space.len(), 6);
        assert_eq!(space.header_at(0), Some([0x09, 0x08, 0x10, 0x00]));

        let inside = space.range_at(3, 3).unwrap();
        assert!(matches!(inside, Cow::Borrowed(_)));
        assert_eq!(inside.as_ref(), &[0x00, 0xAA, 0xBB]);

        let straddle = space.range_at(1, 4).unwrap();
        assert!(matches!(straddle, Cow::Owned(_)));
        assert_eq!(straddle.as_ref(), &[0x08, 0x10, 0x00, 0xAA]);

        assert!(space.range_at(5, 2).is_none());
        assert_eq!(space.range_at(6, 0).as_deref(), Some(&[0u8; 0][..]));
    }
}
