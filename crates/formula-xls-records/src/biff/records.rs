//! Physical record framing.
//!
//! Every BIFF record starts with a 4-byte header: `[opcode: u16 LE][length: u16 LE]`, where the
//! length excludes the header. [`RecordScanner`] walks a [`ByteSpace`] header by header, bounds
//! checking each record, and stops early on producer padding after an `EOF`.

use std::borrow::Cow;

use crate::byte_space::ByteSpace;
use crate::error::FrameError;

use super::opcodes;

pub const RECORD_HEADER_LEN: u64 = 4;

/// Opcodes that mark the remainder of the stream as padding when they directly follow an `EOF`.
const TRAILING_JUNK_OPCODES: [u16; 2] = [0x0000, 0xFFFF];

/// One physical record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub opcode: u16,
    pub length: u16,
    /// Offset of the record header in the stream.
    pub offset: u64,
    pub bytes: Cow<'a, [u8]>,
}

impl RawRecord<'_> {
    /// Offset of the first byte after this record.
    pub fn end(&self) -> u64 {
        self.offset + RECORD_HEADER_LEN + u64::from(self.length)
    }
}

/// Decode the record header at `offset`.
///
/// Returns `(opcode, length, next_offset)`, where `next_offset = offset + length + 4`.
pub fn read_header<S: ByteSpace + ?Sized>(
    space: &S,
    offset: u64,
) -> Result<(u16, u16, u64), FrameError> {
    let header = space.header_at(offset).ok_or(FrameError::TruncatedHeader {
        offset,
        len: space.len(),
    })?;
    let opcode = u16::from_le_bytes([header[0], header[1]]);
    let length = u16::from_le_bytes([header[2], header[3]]);
    let next = offset
        .checked_add(RECORD_HEADER_LEN)
        .and_then(|v| v.checked_add(u64::from(length)))
        .ok_or(FrameError::OffsetOverflow { offset })?;
    if next > space.len() {
        return Err(FrameError::PastEnd {
            offset,
            opcode,
            len: space.len(),
            end: next,
        });
    }
    Ok((opcode, length, next))
}

/// Iterator over physical records.
///
/// A framing error is yielded once and terminates iteration.
pub struct RecordScanner<'a, S: ?Sized> {
    space: &'a S,
    offset: u64,
    after_close: bool,
    trailing_junk: Option<u64>,
    finished: bool,
}

impl<'a, S: ByteSpace + ?Sized> RecordScanner<'a, S> {
    pub fn new(space: &'a S) -> Self {
        Self {
            space,
            offset: 0,
            after_close: false,
            trailing_junk: None,
            finished: false,
        }
    }

    pub fn from_offset(space: &'a S, offset: u64) -> Result<Self, FrameError> {
        if offset > space.len() {
            return Err(FrameError::TruncatedHeader {
                offset,
                len: space.len(),
            });
        }
        Ok(Self {
            offset,
            ..Self::new(space)
        })
    }

    /// Offset where producer padding after an `EOF` was detected, if any.
    pub fn trailing_junk_offset(&self) -> Option<u64> {
        self.trailing_junk
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    fn is_trailing_junk(&self) -> bool {
        if !self.after_close {
            return false;
        }
        match self.space.header_at(self.offset) {
            Some(header) => {
                let opcode = u16::from_le_bytes([header[0], header[1]]);
                TRAILING_JUNK_OPCODES.contains(&opcode)
            }
            // Fewer than 4 bytes after an EOF cannot hold a record; treat as sector padding.
            None => true,
        }
    }
}

impl<'a, S: ByteSpace + ?Sized> Iterator for RecordScanner<'a, S> {
    type Item = Result<RawRecord<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.offset >= self.space.len() {
            return None;
        }

        if self.is_trailing_junk() {
            log::debug!(
                "skipping {} bytes of padding after EOF at offset {}",
                self.space.len() - self.offset,
                self.offset
            );
            self.trailing_junk = Some(self.offset);
            self.finished = true;
            return None;
        }

        let (opcode, length, next) = match read_header(self.space, self.offset) {
            Ok(header) => header,
            Err(err) => {
                self.finished = true;
                return Some(Err(err));
            }
        };
        let space: &'a S = self.space;
        let data_start = self.offset + RECORD_HEADER_LEN;
        let Some(bytes) = space.range_at(data_start, usize::from(length)) else {
            self.finished = true;
            return Some(Err(FrameError::PastEnd {
                offset: self.offset,
                opcode,
                len: self.space.len(),
                end: next,
            }));
        };

        let record = RawRecord {
            opcode,
            length,
            offset: self.offset,
            bytes,
        };
        self.offset = next;
        self.after_close = opcode == opcodes::EOF;
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_space::BlockByteSpace;

    fn record(id: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn read_header_returns_next_position() {
        let stream = [record(0x0001, &[1, 2, 3]), record(0x0002, &[])].concat();
        assert_eq!(read_header(&stream[..], 0).unwrap(), (0x0001, 3, 7));
        assert_eq!(read_header(&stream[..], 7).unwrap(), (0x0002, 0, 11));
    }

    #[test]
    fn iterates_physical_records_with_bounds_checks() {
        let stream = [record(0x0001, &[1, 2, 3]), record(0x0002, &[4])].concat();
        let mut iter = RecordScanner::new(&stream[..]);

        let r1 = iter.next().unwrap().unwrap();
        assert_eq!(r1.offset, 0);
        assert_eq!(r1.opcode, 0x0001);
        assert_eq!(r1.bytes.as_ref(), &[1, 2, 3]);
        assert_eq!(r1.end(), 7);

        let r2 = iter.next().unwrap().unwrap();
        assert_eq!(r2.opcode, 0x0002);
        assert_eq!(r2.offset, 7);
        assert_eq!(r2.bytes.as_ref(), &[4]);

        assert!(iter.next().is_none());
    }

    #[test]
    fn errors_on_truncated_header() {
        let stream = vec![0x01, 0x02, 0x03];
        let mut iter = RecordScanner::new(&stream[..]);
        let err = iter.next().unwrap().unwrap_err();
        assert_eq!(err, FrameError::TruncatedHeader { offset: 0, len: 3 });
        assert!(iter.next().is_none());
    }

    #[test]
    fn errors_on_payload_past_end() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&0x0001u16.to_le_bytes());
        stream.extend_from_slice(&4u16.to_le_bytes());
        stream.extend_from_slice(&[1, 2]);

        let mut iter = RecordScanner::new(&stream[..]);
        let err = iter.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("extends past end of stream"), "err={err}");
        assert_eq!(err.opcode(), Some(0x0001));
        assert!(iter.next().is_none());
    }

    #[test]
    fn skips_zero_and_ffff_padding_after_eof() {
        for sentinel in [0x0000u16, 0xFFFF] {
            let mut stream = [record(opcodes::BOF, &[0u8; 16]), record(opcodes::EOF, &[])].concat();
            let junk_at = stream.len() as u64;
            stream.extend_from_slice(&sentinel.to_le_bytes());
            // A bogus length that would otherwise be a framing error.
            stream.extend_from_slice(&0x4000u16.to_le_bytes());
            stream.extend_from_slice(&[0xAB; 7]);

            let mut iter = RecordScanner::new(&stream[..]);
            let ids: Vec<u16> = iter.by_ref().map(|r| r.unwrap().opcode).collect();
            assert_eq!(ids, vec![opcodes::BOF, opcodes::EOF]);
            assert_eq!(iter.trailing_junk_offset(), Some(junk_at));
        }
    }

    #[test]
    fn short_tail_after_eof_is_padding() {
        let mut stream = record(opcodes::EOF, &[]);
        stream.extend_from_slice(&[0x12, 0x34]);
        let mut iter = RecordScanner::new(&stream[..]);
        assert_eq!(iter.next().unwrap().unwrap().opcode, opcodes::EOF);
        assert!(iter.next().is_none());
        assert_eq!(iter.trailing_junk_offset(), Some(4));
    }

    #[test]
    fn zero_opcode_not_after_eof_is_a_record() {
        let stream = [record(0x0000, &[9]), record(0x0001, &[])].concat();
        let ids: Vec<u16> = RecordScanner::new(&stream[..])
            .map(|r| r.unwrap().opcode)
            .collect();
        assert_eq!(ids, vec![0x0000, 0x0001]);
    }

    #[test]
    fn scans_records_spanning_storage_blocks() {
        let stream = [record(0x0001, &[1, 2, 3, 4, 5]), record(0x0002, &[6])].concat();
        let (a, rest) = stream.split_at(3);
        let (b, c) = rest.split_at(5);
        let space = BlockByteSpace::new([a, b, c]);

        let records: Vec<_> = RecordScanner::new(&space).map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bytes.as_ref(), &[1, 2, 3, 4, 5]);
        assert_eq!(records[1].offset, 9);
        assert_eq!(records[1].bytes.as_ref(), &[6]);
    }

    #[test]
    fn from_offset_rejects_out_of_bounds_start() {
        let stream = record(0x0001, &[]);
        assert!(RecordScanner::from_offset(&stream[..], 5).is_err());
        let mut iter = RecordScanner::from_offset(&stream[..], 4).unwrap();
        assert!(iter.next().is_none());
    }
}
