//! `CONTINUE` coalescing.
//!
//! A physical BIFF8 record carries at most [`MAX_RECORD_PAYLOAD`] bytes; larger payloads spill
//! into trailing `CONTINUE` (`0x003C`) records. [`ContinuationCoalescer`] merges those back into
//! one [`LogicalRecord`] per owner, following the owner's [`ContinuationPolicy`].

use std::borrow::Cow;

use crate::byte_space::ByteSpace;
use crate::error::{Diagnostic, DiagnosticKind, FrameError, LoadError};
use crate::options::LoadOptions;

use super::opcodes;
use super::records::{RawRecord, RecordScanner};
use super::registry::RecordFactory;
use super::strings;

/// Largest payload a single physical record may carry.
pub const MAX_RECORD_PAYLOAD: usize = 8224;

/// How an opcode claims the `CONTINUE` records that follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationPolicy {
    /// Absorb every following `CONTINUE`.
    Greedy,
    /// Absorb nothing; a following `CONTINUE` is an orphan.
    Never,
    /// `SST`: greedy, merged into canonical string layout.
    SharedStrings,
    /// `TXO`: absorb exactly the text and formatting-run fragments the record declares.
    TextObject,
}

impl ContinuationPolicy {
    pub fn is_text(self) -> bool {
        matches!(self, Self::SharedStrings | Self::TextObject)
    }
}

/// A primary record merged with the `CONTINUE` records it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRecord {
    /// The record kind the payload belongs to.
    pub opcode: u16,
    /// Opcode written in the first physical header. Differs from `opcode` for masked continuations.
    pub physical_opcode: u16,
    pub offset: u64,
    pub data: Vec<u8>,
    /// Physical payload sizes, primary first.
    pub fragment_sizes: Vec<usize>,
    /// `data` is in canonical text layout (continuation flag bytes removed).
    pub text_layout: bool,
}

impl LogicalRecord {
    pub fn is_continued(&self) -> bool {
        self.fragment_sizes.len() > 1
    }

    pub fn is_masked(&self) -> bool {
        self.physical_opcode == opcodes::CONTINUE && self.opcode != opcodes::CONTINUE
    }
}

/// Split `payload` into physical chunks of at most [`MAX_RECORD_PAYLOAD`] bytes.
///
/// An empty payload yields one empty chunk; otherwise no chunk is empty.
pub fn split_payload(payload: &[u8]) -> Vec<&[u8]> {
    if payload.is_empty() {
        return vec![payload];
    }
    payload.chunks(MAX_RECORD_PAYLOAD).collect()
}

/// Split `payload` along previously observed fragment sizes.
///
/// Returns `None` when the sizes do not describe `payload` or a size exceeds the physical limit.
pub fn split_with_sizes<'p>(payload: &'p [u8], sizes: &[usize]) -> Option<Vec<&'p [u8]>> {
    if sizes.is_empty() || sizes.iter().any(|&size| size > MAX_RECORD_PAYLOAD) {
        return None;
    }
    let total = sizes.iter().try_fold(0usize, |acc, &size| acc.checked_add(size))?;
    if total != payload.len() {
        return None;
    }
    let mut out = Vec::with_capacity(sizes.len());
    let mut rest = payload;
    for &size in sizes {
        let (head, tail) = rest.split_at(size);
        out.push(head);
        rest = tail;
    }
    Some(out)
}

pub fn merge_fragments<'f>(fragments: impl IntoIterator<Item = &'f [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for fragment in fragments {
        out.extend_from_slice(fragment);
    }
    out
}

/// Iterator of [`LogicalRecord`]s over a record scanner.
///
/// Soft failures (orphan continuations, unnormalizable text) are queued as diagnostics and can be
/// drained with [`ContinuationCoalescer::take_diagnostics`]; a framing error or an exceeded cap is
/// yielded once and ends iteration.
pub struct ContinuationCoalescer<'a, S: ?Sized> {
    scanner: RecordScanner<'a, S>,
    peeked: Option<Result<RawRecord<'a>, FrameError>>,
    factory: &'a RecordFactory,
    max_bytes: usize,
    max_fragments: usize,
    /// Record kind masked `CONTINUE`s are redirected to while a drawing run is open.
    drawing_mask: Option<u16>,
    previous_opcode: Option<u16>,
    diagnostics: Vec<Diagnostic>,
    finished: bool,
}

impl<'a, S: ByteSpace + ?Sized> ContinuationCoalescer<'a, S> {
    pub fn new(space: &'a S, factory: &'a RecordFactory, options: &LoadOptions) -> Self {
        Self {
            scanner: RecordScanner::new(space),
            peeked: None,
            factory,
            max_bytes: options.max_logical_record_bytes,
            max_fragments: options.max_logical_record_fragments.max(1),
            drawing_mask: None,
            previous_opcode: None,
            diagnostics: Vec::new(),
            finished: false,
        }
    }

    pub fn trailing_junk_offset(&self) -> Option<u64> {
        self.scanner.trailing_junk_offset()
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn next_raw(&mut self) -> Option<Result<RawRecord<'a>, FrameError>> {
        self.peeked.take().or_else(|| self.scanner.next())
    }

    fn peek_is_continue(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.scanner.next();
        }
        matches!(&self.peeked, Some(Ok(next)) if next.opcode == opcodes::CONTINUE)
    }

    /// Logical owner of a `CONTINUE` no preceding record absorbed, if a drawing run masks it.
    fn masked_owner(&self) -> Option<u16> {
        match self.previous_opcode {
            Some(opcodes::TXO) => self.drawing_mask,
            _ => None,
        }
    }

    fn wants_more(&self, policy: ContinuationPolicy, fragments: &[Cow<'a, [u8]>]) -> bool {
        match policy {
            ContinuationPolicy::Never => false,
            ContinuationPolicy::Greedy | ContinuationPolicy::SharedStrings => true,
            ContinuationPolicy::TextObject => {
                let continuations: Vec<&[u8]> = fragments[1..].iter().map(|f| f.as_ref()).collect();
                !strings::txo_is_satisfied(&fragments[0], &continuations)
            }
        }
    }

    fn update_mask(&mut self, opcode: u16) {
        match opcode {
            opcodes::MSODRAWING => self.drawing_mask = Some(opcodes::MSODRAWING),
            opcodes::OBJ | opcodes::TXO | opcodes::NOTE => {}
            _ => self.drawing_mask = None,
        }
        self.previous_opcode = Some(opcode);
    }

    fn build_payload(
        &mut self,
        opcode: u16,
        offset: u64,
        policy: ContinuationPolicy,
        fragments: &[Cow<'a, [u8]>],
    ) -> (Vec<u8>, bool) {
        let views: Vec<&[u8]> = fragments.iter().map(|f| f.as_ref()).collect();
        let canonical = match policy {
            ContinuationPolicy::SharedStrings => Some(strings::canonicalize_sst(&views)),
            ContinuationPolicy::TextObject => Some(strings::canonicalize_txo(&views)),
            ContinuationPolicy::Greedy | ContinuationPolicy::Never => None,
        };
        match canonical {
            Some(Ok(data)) => (data, true),
            Some(Err(err)) => {
                self.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::TextLayout,
                    Some(offset),
                    opcode,
                    format!("kept continued text as raw bytes: {err}"),
                ));
                (merge_fragments(views), false)
            }
            None => (merge_fragments(views), false),
        }
    }
}

impl<'a, S: ByteSpace + ?Sized> Iterator for ContinuationCoalescer<'a, S> {
    type Item = Result<LogicalRecord, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let first = match self.next_raw()? {
            Ok(record) => record,
            Err(err) => {
                self.finished = true;
                return Some(Err(err.into()));
            }
        };

        let offset = first.offset;
        let physical_opcode = first.opcode;
        let opcode = if physical_opcode == opcodes::CONTINUE {
            match self.masked_owner() {
                Some(owner) => owner,
                None => {
                    self.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::OrphanContinuation,
                        Some(offset),
                        physical_opcode,
                        "CONTINUE record with no owning record",
                    ));
                    physical_opcode
                }
            }
        } else {
            physical_opcode
        };
        let policy = self.factory.continuation_policy(opcode);

        let mut total = first.bytes.len();
        let mut fragments: Vec<Cow<'a, [u8]>> = vec![first.bytes];
        while self.wants_more(policy, &fragments) && self.peek_is_continue() {
            let next = match self.next_raw() {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
                None => break,
            };

            total = total.checked_add(next.bytes.len()).unwrap_or(usize::MAX);
            if total > self.max_bytes {
                self.finished = true;
                return Some(Err(LoadError::ContinuedTooLarge {
                    offset,
                    opcode,
                    cap: self.max_bytes,
                }));
            }
            if fragments.len() >= self.max_fragments {
                self.finished = true;
                return Some(Err(LoadError::TooManyFragments {
                    offset,
                    opcode,
                    cap: self.max_fragments,
                }));
            }
            fragments.push(next.bytes);
        }

        let fragment_sizes = fragments.iter().map(|f| f.len()).collect();
        let (data, text_layout) = self.build_payload(opcode, offset, policy, &fragments);
        self.update_mask(opcode);

        Some(Ok(LogicalRecord {
            opcode,
            physical_opcode,
            offset,
            data,
            fragment_sizes,
            text_layout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn txo_primary(cch: u16, cb_runs: u16) -> Vec<u8> {
        let mut out = vec![0u8; 18];
        out[10..12].copy_from_slice(&cch.to_le_bytes());
        out[12..14].copy_from_slice(&cb_runs.to_le_bytes());
        out
    }

    fn coalesce(stream: &[u8], options: &LoadOptions) -> Vec<Result<LogicalRecord, LoadError>> {
        let factory = RecordFactory::new();
        ContinuationCoalescer::new(stream, &factory, options).collect()
    }

    #[test]
    fn split_payload_respects_physical_limit() {
        let payload = vec![0xAB; 20_000];
        let sizes: Vec<usize> = split_payload(&payload).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![8224, 8224, 3552]);
        assert_eq!(split_payload(&[]), vec![&[0u8; 0][..]]);
        assert_eq!(split_payload(&[0u8; 8224]).len(), 1);
    }

    #[test]
    fn split_with_sizes_rejects_mismatched_layout() {
        let payload = [1u8, 2, 3, 4, 5];
        assert_eq!(
            split_with_sizes(&payload, &[2, 3]),
            Some(vec![&[1u8, 2][..], &[3, 4, 5][..]])
        );
        assert_eq!(split_with_sizes(&payload, &[2, 2]), None);
        assert_eq!(split_with_sizes(&payload, &[]), None);
    }

    #[test]
    fn greedy_owner_absorbs_all_continues() {
        let stream = [
            record(opcodes::MSODRAWINGGROUP, &[1, 2]),
            record(opcodes::CONTINUE, &[3]),
            record(opcodes::CONTINUE, &[4, 5]),
            record(opcodes::EOF, &[]),
        ]
        .concat();
        let records: Vec<_> = coalesce(&stream, &LoadOptions::default())
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, vec![1, 2, 3, 4, 5]);
        assert_eq!(records[0].fragment_sizes, vec![2, 1, 2]);
        assert!(!records[0].text_layout);
        assert_eq!(records[1].opcode, opcodes::EOF);
        assert_eq!(records[1].offset, 19);
    }

    #[test]
    fn continue_after_non_continuable_owner_is_an_orphan() {
        let stream = [record(opcodes::EOF, &[]), record(opcodes::CONTINUE, &[9])].concat();
        let factory = RecordFactory::new();
        let mut coalescer = ContinuationCoalescer::new(&stream[..], &factory, &LoadOptions::default());
        let records: Vec<_> = coalescer.by_ref().map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].opcode, opcodes::CONTINUE);
        let diagnostics = coalescer.take_diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::OrphanContinuation);
        assert_eq!(diagnostics[0].offset, Some(4));
    }

    #[test]
    fn satisfied_txo_masks_following_continue_as_drawing() {
        let runs = [0u8; 16];
        let stream = [
            record(opcodes::MSODRAWING, &[0xAA; 8]),
            record(opcodes::OBJ, &[0x15, 0x00, 0x12, 0x00, 0x19, 0x00, 0x01, 0x00]),
            record(opcodes::MSODRAWING, &[0xBB; 8]),
            record(opcodes::TXO, &txo_primary(2, 16)),
            record(opcodes::CONTINUE, &[0, b'h', b'i']),
            record(opcodes::CONTINUE, &runs),
            record(opcodes::CONTINUE, &[0xCC; 6]),
            record(opcodes::CONTINUE, &[0xDD; 2]),
            record(opcodes::EOF, &[]),
        ]
        .concat();
        let records: Vec<_> = coalesce(&stream, &LoadOptions::default())
            .into_iter()
            .map(Result::unwrap)
            .collect();
        let ids: Vec<(u16, u16)> = records.iter().map(|r| (r.opcode, r.physical_opcode)).collect();
        assert_eq!(
            ids,
            vec![
                (opcodes::MSODRAWING, opcodes::MSODRAWING),
                (opcodes::OBJ, opcodes::OBJ),
                (opcodes::MSODRAWING, opcodes::MSODRAWING),
                (opcodes::TXO, opcodes::TXO),
                (opcodes::MSODRAWING, opcodes::CONTINUE),
                (opcodes::EOF, opcodes::EOF),
            ]
        );
        let txo = &records[3];
        assert!(txo.text_layout);
        assert_eq!(txo.fragment_sizes, vec![18, 3, 16]);
        assert_eq!(&txo.data[18..21], &[0, b'h', b'i']);

        let masked = &records[4];
        assert!(masked.is_masked());
        assert_eq!(masked.data, [[0xCC; 6].as_slice(), &[0xDD; 2]].concat());
    }

    #[test]
    fn sst_is_merged_into_canonical_layout() {
        let mut first = Vec::new();
        first.extend_from_slice(&1u32.to_le_bytes());
        first.extend_from_slice(&1u32.to_le_bytes());
        first.extend_from_slice(&4u16.to_le_bytes());
        first.push(0);
        first.extend_from_slice(b"ab");
        let stream = [
            record(opcodes::SST, &first),
            record(opcodes::CONTINUE, &[0, b'c', b'd']),
        ]
        .concat();
        let records: Vec<_> = coalesce(&stream, &LoadOptions::default())
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].text_layout);
        assert_eq!(&records[0].data[8..], &[4, 0, 0, b'a', b'b', b'c', b'd']);
    }

    #[test]
    fn enforces_fragment_and_byte_caps() {
        let mut stream = record(opcodes::MSODRAWINGGROUP, &[0u8; 4]);
        for _ in 0..4 {
            stream.extend_from_slice(&record(opcodes::CONTINUE, &[0u8; 4]));
        }

        let options = LoadOptions {
            max_logical_record_fragments: 3,
            ..LoadOptions::default()
        };
        let results = coalesce(&stream, &options);
        assert!(matches!(
            results.last(),
            Some(Err(LoadError::TooManyFragments { cap: 3, offset: 0, .. }))
        ));

        let options = LoadOptions {
            max_logical_record_bytes: 10,
            ..LoadOptions::default()
        };
        let results = coalesce(&stream, &options);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(LoadError::ContinuedTooLarge { cap: 10, .. })
        ));
    }

    #[test]
    fn frame_error_after_owner_is_surfaced_on_next_call() {
        let mut stream = record(opcodes::MSODRAWINGGROUP, &[1]);
        stream.extend_from_slice(&[0x3C, 0x00, 0x10]);
        let results = coalesce(&stream, &LoadOptions::default());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().data, vec![1]);
        assert!(matches!(results[1], Err(LoadError::Frame(_))));
    }
}
