//! Re-linearize a [`DocumentGraph`] into a BIFF8 workbook stream.
//!
//! Saving runs in three steps:
//!
//! 1. **Finalize** (when [`SaveOptions::refresh_derived`] is set): rebuild payloads that cache facts
//!    about sibling entities (`DIMENSIONS`, `MERGEDCELLS`, the `MSODRAWINGGROUP` drawing count).
//! 2. **Layout**: compute the stream position of every physical record. Payload sizes are fixed
//!    at this point; the self-referential fields patched next never change a size.
//! 3. **Patch + emit**: write `BOUNDSHEET.lbPlyPos`, the `EXTSST` buckets and the absolute offsets
//!    in each sheet's `INDEX`, then write every record, splitting payloads into a primary record
//!    plus `CONTINUE` records.
//!
//! `DBCELL` offsets are relative to the row block they close, and no save step changes the size of
//! a row or cell record, so they are written as read.

use std::borrow::Cow;
use std::io::{self, Write};

use crate::error::SaveError;
use crate::graph::{DocumentGraph, Entry, Record, RecordId, Substream};
use crate::options::SaveOptions;

use super::bodies::{self, RecordBody, SubstreamKind};
use super::continuation::{split_payload, split_with_sizes, MAX_RECORD_PAYLOAD};
use super::opcodes;
use super::records::RECORD_HEADER_LEN;
use super::strings;

/// Most ranges Excel accepts in one `MERGEDCELLS` record.
pub const MAX_MERGED_RANGES_PER_RECORD: usize = 1026;

const HEADER_LEN: usize = RECORD_HEADER_LEN as usize;
const EXTSST_HEADER_LEN: usize = 2;
const EXTSST_ENTRY_LEN: usize = 8;

// OfficeArtDggContainer (0xF000) holding an OfficeArtFDGGBlock (0xF006) first.
const OFFICE_ART_DGG_CONTAINER: u16 = 0xF000;
const OFFICE_ART_FDGG_BLOCK: u16 = 0xF006;
const CDG_SAVED_OFFSET: usize = 28;

// INDEX: reserved (4), rwMic (4), rwMac (4), ibXF (4), then one stream position per DBCELL.
const INDEX_HEADER_LEN: usize = 16;
const INDEX_IB_XF_OFFSET: usize = 12;

/// Low-level writer for BIFF8 record streams.
///
/// Records are encoded as:
/// - opcode: u16 LE
/// - payload length: u16 LE (at most [`MAX_RECORD_PAYLOAD`])
/// - payload bytes
pub(crate) struct BiffWriter<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> BiffWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    pub(crate) fn write_record(&mut self, opcode: u16, payload: &[u8]) -> io::Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record 0x{opcode:04X} payload of {} bytes exceeds u16", payload.len()),
            )
        })?;
        self.write_record_header(opcode, len)?;
        self.write_raw(payload)
    }

    pub(crate) fn write_record_header(&mut self, opcode: u16, len: u16) -> io::Result<()> {
        self.write_raw(&opcode.to_le_bytes())?;
        self.write_raw(&len.to_le_bytes())
    }

    pub(crate) fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Physical fragments of one logical record.
struct Fragments<'r> {
    chunks: Vec<Cow<'r, [u8]>>,
    /// For `SST`: `(chunk index, offset within chunk)` of every string.
    string_starts: Vec<(usize, usize)>,
}

impl Fragments<'_> {
    fn emitted_len(&self) -> u64 {
        self.chunks
            .iter()
            .map(|chunk| (HEADER_LEN + chunk.len()) as u64)
            .sum()
    }
}

fn finalize_error(record: &Record, reason: impl Into<String>) -> SaveError {
    SaveError::Finalize {
        opcode: record.opcode,
        offset: record.offset,
        reason: reason.into(),
    }
}

fn plan_fragments<'r>(record: &'r Record, options: &SaveOptions) -> Result<Fragments<'r>, SaveError> {
    let payload = record.payload();
    if record.text_layout {
        match record.opcode {
            opcodes::SST => {
                let split = strings::split_sst(payload, MAX_RECORD_PAYLOAD)
                    .map_err(|reason| finalize_error(record, reason))?;
                return Ok(Fragments {
                    chunks: split.fragments.into_iter().map(Cow::Owned).collect(),
                    string_starts: split.string_starts,
                });
            }
            opcodes::TXO => {
                let chunks = strings::split_txo(payload, MAX_RECORD_PAYLOAD)
                    .map_err(|reason| finalize_error(record, reason))?;
                return Ok(Fragments {
                    chunks: chunks.into_iter().map(Cow::Owned).collect(),
                    string_starts: Vec::new(),
                });
            }
            _ => {}
        }
    }

    let preserved = (options.preserve_fragmentation && !record.is_dirty())
        .then(|| split_with_sizes(payload, &record.fragment_sizes))
        .flatten();
    let chunks = preserved.unwrap_or_else(|| split_payload(payload));
    Ok(Fragments {
        chunks: chunks.into_iter().map(Cow::Borrowed).collect(),
        string_starts: Vec::new(),
    })
}

/// Stream positions computed before emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamLayout {
    /// Position of the `BOF` of every top-level sheet substream, in order.
    pub sheet_positions: Vec<u64>,
    /// `(absolute position, offset from the enclosing physical record header)` of every `SST`
    /// string.
    pub sst_strings: Vec<(u64, u16)>,
    /// Row-block positions of every top-level sheet, in order.
    pub sheet_indexes: Vec<SheetIndexLayout>,
    pub total_len: u64,
}

/// Positions an `INDEX` record points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetIndexLayout {
    pub defcolwidth: Option<u64>,
    pub dbcells: Vec<u64>,
}

/// Serializes a [`DocumentGraph`] back into a BIFF8 workbook stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteStreamer {
    options: SaveOptions,
}

impl ByteStreamer {
    pub fn new(options: SaveOptions) -> Self {
        Self { options }
    }

    /// Check, finalize, lay out, patch and emit `graph` into `sink`. Returns the bytes written.
    pub fn save<W: Write>(&self, graph: &mut DocumentGraph, sink: W) -> Result<u64, SaveError> {
        check_balanced(graph)?;
        if self.options.refresh_derived {
            self.finalize(graph)?;
        }
        let layout = self.layout(graph)?;
        self.patch(graph, &layout)?;
        let written = self.emit(graph, sink)?;
        debug_assert_eq!(written, layout.total_len);
        Ok(written)
    }

    /// Rebuild derived payloads from the entity tables.
    pub fn finalize(&self, graph: &mut DocumentGraph) -> Result<(), SaveError> {
        for sheet in &mut graph.sheets {
            if matches!(sheet.kind, SubstreamKind::Worksheet | SubstreamKind::MacroSheet) {
                refresh_dimensions(sheet);
            }
        }
        for substream in std::iter::once(&mut graph.globals).chain(graph.sheets.iter_mut()) {
            refresh_merged_cells(substream)?;
        }
        refresh_drawing_count(graph);
        Ok(())
    }

    pub fn layout(&self, graph: &DocumentGraph) -> Result<StreamLayout, SaveError> {
        let sst = graph.context.sst;
        let mut sst_strings = Vec::new();
        let mut sheet_positions = Vec::with_capacity(graph.sheets.len());
        let mut position = 0u64;

        let mut visit = |record: &Record, is_sst: bool, position: &mut u64| -> Result<(), SaveError> {
            let fragments = plan_fragments(record, &self.options)?;
            if is_sst {
                let mut chunk_starts = Vec::with_capacity(fragments.chunks.len());
                let mut at = *position;
                for chunk in &fragments.chunks {
                    chunk_starts.push(at);
                    at += (HEADER_LEN + chunk.len()) as u64;
                }
                for &(chunk, offset) in &fragments.string_starts {
                    let header = chunk_starts.get(chunk).copied().unwrap_or(*position);
                    let in_record = HEADER_LEN + offset;
                    sst_strings.push((
                        header + in_record as u64,
                        u16::try_from(in_record).unwrap_or(u16::MAX),
                    ));
                }
            }
            *position += fragments.emitted_len();
            Ok(())
        };

        walk(&graph.globals, &mut |substream, id| match substream.record(id) {
            Some(record) => visit(record, Some(id) == sst, &mut position),
            None => Ok(()),
        })?;
        let mut sheet_indexes = Vec::with_capacity(graph.sheets.len());
        for sheet in &graph.sheets {
            sheet_positions.push(position);
            let mut index = SheetIndexLayout::default();
            walk(sheet, &mut |substream, id| match substream.record(id) {
                Some(record) => {
                    if std::ptr::eq(substream, sheet) {
                        match record.opcode {
                            opcodes::DEFCOLWIDTH => index.defcolwidth = Some(position),
                            opcodes::DBCELL => index.dbcells.push(position),
                            _ => {}
                        }
                    }
                    visit(record, false, &mut position)
                }
                None => Ok(()),
            })?;
            sheet_indexes.push(index);
        }

        Ok(StreamLayout {
            sheet_positions,
            sst_strings,
            sheet_indexes,
            total_len: position,
        })
    }

    /// Write the layout-dependent fields of `BOUNDSHEET`, `EXTSST` and `INDEX` records.
    pub fn patch(&self, graph: &mut DocumentGraph, layout: &StreamLayout) -> Result<(), SaveError> {
        let bound_sheets = graph.context.bound_sheets.clone();
        for (id, &position) in bound_sheets.iter().zip(&layout.sheet_positions) {
            let lb_ply_pos = u32::try_from(position).map_err(|_| SaveError::OffsetOverflow(position))?;
            let Some(record) = graph.globals.record_mut(*id) else {
                continue;
            };
            if !record.patch_payload(0, &lb_ply_pos.to_le_bytes()) {
                log::warn!("BOUNDSHEET payload shorter than lbPlyPos; written as read");
                continue;
            }
            if let RecordBody::BoundSheet { stream_pos, .. } = &mut record.body {
                *stream_pos = lb_ply_pos;
            }
        }

        let sst_is_canonical = graph
            .context
            .sst
            .and_then(|id| graph.globals.record(id))
            .is_some_and(|record| record.text_layout);
        if let (Some(id), true) = (graph.context.ext_sst, sst_is_canonical) {
            if let Some(record) = graph.globals.record_mut(id) {
                patch_ext_sst(record, &layout.sst_strings)?;
            }
        }

        for (sheet, index) in graph.sheets.iter_mut().zip(&layout.sheet_indexes) {
            let Some(id) = sheet.first_of(opcodes::INDEX) else {
                continue;
            };
            if let Some(record) = sheet.record_mut(id) {
                patch_index(record, index)?;
            }
        }
        Ok(())
    }

    /// Write every record of `graph` to `sink`. Returns the bytes written.
    pub fn emit<W: Write>(&self, graph: &DocumentGraph, sink: W) -> Result<u64, SaveError> {
        let mut writer = BiffWriter::new(sink);
        for substream in graph.substreams() {
            walk(substream, &mut |substream, record_id| {
                let Some(record) = substream.record(record_id) else {
                    return Ok(());
                };
                let fragments = plan_fragments(record, &self.options)?;
                for (i, chunk) in fragments.chunks.iter().enumerate() {
                    let opcode = if i == 0 {
                        record.physical_opcode
                    } else {
                        opcodes::CONTINUE
                    };
                    writer.write_record(opcode, chunk)?;
                }
                Ok(())
            })?;
        }
        writer.flush()?;
        Ok(writer.position())
    }
}

/// Visit every record of `substream` in stream order, descending into nested substreams.
fn walk<'s>(
    substream: &'s Substream,
    f: &mut dyn FnMut(&'s Substream, RecordId) -> Result<(), SaveError>,
) -> Result<(), SaveError> {
    for entry in substream.entries() {
        match *entry {
            Entry::Record(id) => f(substream, id)?,
            Entry::Nested(index) => {
                if let Some(nested) = substream.nested.get(index) {
                    walk(nested, f)?;
                }
            }
        }
    }
    Ok(())
}

fn check_balanced(graph: &DocumentGraph) -> Result<(), SaveError> {
    if !graph.globals.is_balanced() {
        return Err(SaveError::Unbalanced {
            substream: "globals".to_string(),
            detail: "missing BOF/EOF pair".to_string(),
        });
    }
    for (i, sheet) in graph.sheets.iter().enumerate() {
        if !sheet.is_balanced() {
            return Err(SaveError::Unbalanced {
                substream: format!("sheet {i} ({:?})", sheet.kind),
                detail: "missing BOF/EOF pair".to_string(),
            });
        }
    }
    Ok(())
}

fn refresh_dimensions(sheet: &mut Substream) {
    let Some(id) = sheet.tables.dimensions else {
        return;
    };
    // DIMENSIONS stores exclusive upper bounds.
    let (first_row, last_row_excl, first_col, last_col_excl) = match sheet.tables.cell_extent() {
        Some((r0, r1, c0, c1)) => (u32::from(r0), u32::from(r1) + 1, c0, c1.saturating_add(1)),
        None => (0, 0, 0, 0),
    };
    let body = RecordBody::Dimensions {
        first_row,
        last_row_excl,
        first_col,
        last_col_excl,
    };
    let Some(record) = sheet.record_mut(id) else {
        return;
    };
    if record.body != body {
        log::debug!("refreshing stale DIMENSIONS record");
        let payload = bodies::encode_dimensions(first_row, last_row_excl, first_col, last_col_excl);
        record.replace_payload(payload, body);
    }
}

fn refresh_merged_cells(substream: &mut Substream) -> Result<(), SaveError> {
    for id in substream.tables.merged.clone() {
        let Some(record) = substream.record_mut(id) else {
            continue;
        };
        let RecordBody::MergedCells(ranges) = &record.body else {
            continue;
        };
        if ranges.len() > MAX_MERGED_RANGES_PER_RECORD {
            return Err(finalize_error(
                record,
                format!(
                    "{} merged ranges exceed the per-record limit of {MAX_MERGED_RANGES_PER_RECORD}",
                    ranges.len()
                ),
            ));
        }
        let payload = bodies::encode_merged_cells(ranges).map_err(|reason| finalize_error(record, reason))?;
        if payload != record.payload() {
            let body = record.body.clone();
            record.replace_payload(payload, body);
        }
    }
    Ok(())
}

fn refresh_drawing_count(graph: &mut DocumentGraph) {
    let Some(id) = graph.context.drawing_group else {
        return;
    };
    let count = graph
        .sheets
        .iter()
        .filter(|sheet| !sheet.tables.drawings.is_empty())
        .count() as u32;
    let Some(record) = graph.globals.record_mut(id) else {
        return;
    };
    let payload = record.payload();
    let rec_type = |at: usize| payload.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
    if rec_type(2) != Some(OFFICE_ART_DGG_CONTAINER) || rec_type(10) != Some(OFFICE_ART_FDGG_BLOCK) {
        return;
    }
    let current = payload
        .get(CDG_SAVED_OFFSET..CDG_SAVED_OFFSET + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
    if current.is_some_and(|current| current != count) {
        record.patch_payload(CDG_SAVED_OFFSET, &count.to_le_bytes());
    }
}

fn patch_ext_sst(record: &mut Record, sst_strings: &[(u64, u16)]) -> Result<(), SaveError> {
    let payload = record.payload();
    let Some(dsst) = payload
        .get(..EXTSST_HEADER_LEN)
        .map(|b| usize::from(u16::from_le_bytes([b[0], b[1]])))
    else {
        return Ok(());
    };
    if dsst == 0 {
        return Ok(());
    }
    let entries = (payload.len() - EXTSST_HEADER_LEN) / EXTSST_ENTRY_LEN;
    for bucket in 0..entries {
        let Some(&(position, in_record)) = sst_strings.get(bucket * dsst) else {
            break;
        };
        let ib = u32::try_from(position).map_err(|_| SaveError::OffsetOverflow(position))?;
        let at = EXTSST_HEADER_LEN + bucket * EXTSST_ENTRY_LEN;
        record.patch_payload(at, &ib.to_le_bytes());
        record.patch_payload(at + 4, &in_record.to_le_bytes());
    }
    Ok(())
}

fn patch_index(record: &mut Record, index: &SheetIndexLayout) -> Result<(), SaveError> {
    let slots = record.payload().len().checked_sub(INDEX_HEADER_LEN);
    if slots != Some(index.dbcells.len() * 4) {
        log::debug!(
            "INDEX does not list the sheet's {} row blocks; written as read",
            index.dbcells.len()
        );
        return Ok(());
    }
    let stream_pos = |position: u64| u32::try_from(position).map_err(|_| SaveError::OffsetOverflow(position));
    if let Some(position) = index.defcolwidth {
        record.patch_payload(INDEX_IB_XF_OFFSET, &stream_pos(position)?.to_le_bytes());
    }
    for (i, &position) in index.dbcells.iter().enumerate() {
        record.patch_payload(INDEX_HEADER_LEN + i * 4, &stream_pos(position)?.to_le_bytes());
    }
    Ok(())
}

/// Serialize `graph` into `sink`. Returns the number of bytes written.
pub fn save_workbook_stream<W: Write>(
    graph: &mut DocumentGraph,
    sink: W,
    options: &SaveOptions,
) -> Result<u64, SaveError> {
    ByteStreamer::new(*options).save(graph, sink)
}

pub fn workbook_stream_to_vec(graph: &mut DocumentGraph, options: &SaveOptions) -> Result<Vec<u8>, SaveError> {
    let mut out = Vec::new();
    save_workbook_stream(graph, &mut out, options)?;
    Ok(out)
}
