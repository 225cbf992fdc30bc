//! The assembled document graph.
//!
//! Each [`Substream`] owns an arena of [`Record`]s addressed by stable [`RecordId`]s and an
//! `order` of entries describing the record sequence, where nested substreams (embedded charts)
//! appear inline at the position of their `BOF`. Entity tables reference records by id only, so
//! the validator can reorder a substream without touching them.

use std::collections::BTreeMap;

use crate::biff::bodies::{RecordBody, SubstreamKind};
use crate::biff::continuation::LogicalRecord;
use crate::biff::opcodes;
use crate::biff::registry::{RecordFactory, RuleListKind};
use crate::biff::workbook_context::WorkbookContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub(crate) u32);

impl RecordId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One logical record held in a substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub opcode: u16,
    /// Opcode of the first physical header; `CONTINUE` for a masked continuation.
    pub physical_opcode: u16,
    /// Stream offset the record was read from; `None` for synthesized records.
    pub offset: Option<u64>,
    payload: Vec<u8>,
    /// Physical fragment sizes the record was read with.
    pub fragment_sizes: Vec<usize>,
    /// The payload is in canonical text layout and must be re-split text-aware.
    pub text_layout: bool,
    pub body: RecordBody,
    dirty: bool,
}

impl Record {
    /// A record built in memory (synthesized defaults, caller edits).
    pub fn new(opcode: u16, payload: Vec<u8>, body: RecordBody) -> Self {
        Self {
            opcode,
            physical_opcode: opcode,
            offset: None,
            fragment_sizes: vec![payload.len()],
            payload,
            text_layout: false,
            body,
            dirty: true,
        }
    }

    /// Build a record from `payload`, decoding the body through `factory`.
    pub fn decoded(factory: &RecordFactory, opcode: u16, payload: Vec<u8>, codepage: u16) -> Self {
        let (body, _) = factory.decode(opcode, &payload, codepage);
        Self::new(opcode, payload, body)
    }

    pub(crate) fn from_logical(logical: LogicalRecord, body: RecordBody) -> Self {
        Self {
            opcode: logical.opcode,
            physical_opcode: logical.physical_opcode,
            offset: Some(logical.offset),
            payload: logical.data,
            fragment_sizes: logical.fragment_sizes,
            text_layout: logical.text_layout,
            body,
            dirty: false,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload and re-decode the body. Returns the decode failure, if any.
    pub fn set_payload(
        &mut self,
        payload: Vec<u8>,
        factory: &RecordFactory,
        codepage: u16,
    ) -> Option<String> {
        let (body, err) = factory.decode(self.opcode, &payload, codepage);
        self.replace_payload(payload, body);
        err
    }

    pub(crate) fn replace_payload(&mut self, payload: Vec<u8>, body: RecordBody) {
        if payload != self.payload {
            self.dirty = true;
        }
        self.payload = payload;
        self.body = body;
    }

    /// Overwrite payload bytes in place without changing the payload length or layout.
    pub(crate) fn patch_payload(&mut self, offset: usize, bytes: &[u8]) -> bool {
        match self.payload.get_mut(offset..offset + bytes.len()) {
            Some(target) => {
                target.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// True once the payload differs from what was read (or the record was built in memory).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_masked(&self) -> bool {
        self.physical_opcode == opcodes::CONTINUE && self.opcode != opcodes::CONTINUE
    }
}

/// One position in a substream's record sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Record(RecordId),
    /// Index into [`Substream::nested`].
    Nested(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellEntry {
    pub record: RecordId,
    pub first_col: u16,
    pub last_col: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowEntry {
    /// The `ROW` record, when one was seen.
    pub record: Option<RecordId>,
    pub cells: Vec<CellEntry>,
}

/// A `FORMULA` cell and the `STRING` / `SHRFMLA` / `ARRAY` / `TABLE` records attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaEntry {
    pub record: RecordId,
    pub row: u16,
    pub col: u16,
    pub details: Vec<RecordId>,
}

/// An `MSODRAWING` record with its `OBJ` / `TXO` details and embedded substreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawingEntry {
    pub record: RecordId,
    pub details: Vec<RecordId>,
    /// Indices into [`Substream::nested`] (embedded charts).
    pub embedded: Vec<usize>,
}

/// A rule-list header (`CONDFMT`, `CONDFMT12`, `DVAL`) and its detail records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleList {
    pub kind: RuleListKind,
    pub header: RecordId,
    /// Declared detail count, when the header decoded.
    pub declared: Option<u32>,
    pub details: Vec<RecordId>,
}

impl RuleList {
    pub fn is_full(&self) -> bool {
        self.declared
            .is_some_and(|declared| self.details.len() as u64 >= u64::from(declared))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotFieldEntry {
    pub record: RecordId,
    pub details: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotViewEntry {
    pub record: RecordId,
    pub fields: Vec<PivotFieldEntry>,
    pub details: Vec<RecordId>,
}

/// Entities of a sheet-like substream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetTables {
    pub rows: BTreeMap<u16, RowEntry>,
    pub formulas: Vec<FormulaEntry>,
    /// Sheet-scoped `NAME` records. These ids address the *globals* substream.
    pub local_names: Vec<RecordId>,
    pub drawings: Vec<DrawingEntry>,
    pub notes: Vec<RecordId>,
    pub rule_lists: Vec<RuleList>,
    pub pivot_views: Vec<PivotViewEntry>,
    pub merged: Vec<RecordId>,
    pub dimensions: Option<RecordId>,
    /// Records kept in sequence without an eligible owner.
    pub orphans: Vec<RecordId>,
}

impl SheetTables {
    /// Inclusive `(first_row, last_row, first_col, last_col)` over every cell, if any.
    pub fn cell_extent(&self) -> Option<(u16, u16, u16, u16)> {
        let mut extent: Option<(u16, u16, u16, u16)> = None;
        for (&row, entry) in &self.rows {
            for cell in &entry.cells {
                extent = Some(match extent {
                    None => (row, row, cell.first_col, cell.last_col),
                    Some((r0, r1, c0, c1)) => (
                        r0.min(row),
                        r1.max(row),
                        c0.min(cell.first_col),
                        c1.max(cell.last_col),
                    ),
                });
            }
        }
        extent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substream {
    pub kind: SubstreamKind,
    records: Vec<Record>,
    pub(crate) order: Vec<Entry>,
    pub nested: Vec<Substream>,
    pub tables: SheetTables,
    /// The closing `EOF` was synthesized because the stream ended first.
    pub implicitly_closed: bool,
}

impl Substream {
    pub fn new(kind: SubstreamKind) -> Self {
        Self {
            kind,
            records: Vec::new(),
            order: Vec::new(),
            nested: Vec::new(),
            tables: SheetTables::default(),
            implicitly_closed: false,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.order
    }

    pub fn record(&self, id: RecordId) -> Option<&Record> {
        self.records.get(id.index())
    }

    pub fn record_mut(&mut self, id: RecordId) -> Option<&mut Record> {
        self.records.get_mut(id.index())
    }

    /// Number of records in the arena (placed or not).
    pub fn arena_len(&self) -> usize {
        self.records.len()
    }

    /// Add `record` to the arena without placing it in the sequence.
    pub(crate) fn alloc(&mut self, record: Record) -> RecordId {
        let id = RecordId(self.records.len() as u32);
        self.records.push(record);
        id
    }

    /// Append `record` to the end of the sequence.
    pub fn push_record(&mut self, record: Record) -> RecordId {
        let id = self.alloc(record);
        self.order.push(Entry::Record(id));
        id
    }

    /// Insert `record` at `position` in the sequence (clamped to the end).
    pub fn insert_record(&mut self, position: usize, record: Record) -> RecordId {
        let id = self.alloc(record);
        let position = position.min(self.order.len());
        self.order.insert(position, Entry::Record(id));
        id
    }

    /// Append a closed nested substream at the end of the sequence.
    pub fn push_nested(&mut self, nested: Substream) -> usize {
        let index = self.nested.len();
        self.nested.push(nested);
        self.order.push(Entry::Nested(index));
        index
    }

    /// Records of this substream level in sequence order (nested substreams skipped).
    pub fn records(&self) -> impl Iterator<Item = (RecordId, &Record)> + '_ {
        self.order.iter().filter_map(move |entry| match entry {
            Entry::Record(id) => self.record(*id).map(|record| (*id, record)),
            Entry::Nested(_) => None,
        })
    }

    /// Every record in stream order, nested substreams inline.
    pub fn flatten(&self) -> Vec<&Record> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'s>(&'s self, out: &mut Vec<&'s Record>) {
        for entry in &self.order {
            match entry {
                Entry::Record(id) => {
                    if let Some(record) = self.record(*id) {
                        out.push(record);
                    }
                }
                Entry::Nested(index) => {
                    if let Some(nested) = self.nested.get(*index) {
                        nested.flatten_into(out);
                    }
                }
            }
        }
    }

    pub fn first_of(&self, opcode: u16) -> Option<RecordId> {
        self.records()
            .find(|(_, record)| record.opcode == opcode)
            .map(|(id, _)| id)
    }

    pub fn count_of(&self, opcode: u16) -> usize {
        self.records().filter(|(_, record)| record.opcode == opcode).count()
    }

    /// The substream opens with a `BOF` and closes with an `EOF`. Orphans kept after the `EOF`
    /// (records found between substreams) do not count against the close.
    pub fn is_balanced(&self) -> bool {
        let opcode_at = |entry: Option<&Entry>| match entry {
            Some(Entry::Record(id)) => self.record(*id).map(|r| r.opcode),
            _ => None,
        };
        let is_orphan =
            |entry: &&Entry| matches!(entry, Entry::Record(id) if self.tables.orphans.contains(id));
        let mut tail = self.order.iter().rev().skip_while(is_orphan);
        opcode_at(self.order.first()).is_some_and(opcodes::is_bof)
            && opcode_at(tail.next()) == Some(opcodes::EOF)
            && self.nested.iter().all(Substream::is_balanced)
    }
}

/// The assembled workbook: global context, the globals substream, and sheet-like substreams in
/// stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentGraph {
    pub context: WorkbookContext,
    pub globals: Substream,
    pub sheets: Vec<Substream>,
}

impl DocumentGraph {
    pub fn new(globals: Substream) -> Self {
        Self {
            context: WorkbookContext::default(),
            globals,
            sheets: Vec::new(),
        }
    }

    /// Globals first, then every sheet.
    pub fn substreams(&self) -> impl Iterator<Item = &Substream> + '_ {
        std::iter::once(&self.globals).chain(self.sheets.iter())
    }

    /// The logical record sequence of the whole stream.
    pub fn logical_records(&self) -> Vec<&Record> {
        self.substreams().flat_map(Substream::flatten).collect()
    }

    /// The sheet a `BOUNDSHEET` / `NAME` `itab` (1-based) refers to.
    pub fn sheet_by_itab(&self, itab: u16) -> Option<&Substream> {
        self.sheets.get(usize::from(itab).checked_sub(1)?)
    }

    /// Tear the document down, releasing every record and table.
    pub fn clear(&mut self) {
        self.context.clear();
        self.globals = Substream::new(SubstreamKind::Globals);
        self.sheets.clear();
    }
}
