//! Substream assembly.
//!
//! BIFF encodes ownership through adjacency: a `CF` belongs to the `CONDFMT` before it, a `STRING`
//! to the `FORMULA` before it, an embedded chart to the drawing that precedes its `BOF`. The
//! [`SubstreamAssembler`] replays the logical record sequence and keeps one cursor per adjacency
//! family so each record lands in the entity table that owns it. Records with no eligible owner
//! stay in the flat sequence as orphans and raise a diagnostic; assembly never stops on them.

use std::collections::{BTreeMap, HashMap};

use crate::byte_space::ByteSpace;
use crate::error::{Diagnostic, DiagnosticKind, Diagnostics, LoadError};
use crate::graph::{
    CellEntry, DocumentGraph, DrawingEntry, FormulaEntry, PivotFieldEntry, PivotViewEntry, Record,
    RecordId, RuleList, Substream,
};
use crate::options::LoadOptions;

use super::bodies::{RecordBody, SubstreamKind};
use super::continuation::{ContinuationCoalescer, LogicalRecord};
use super::opcodes;
use super::registry::{RecordFactory, RecordFamily, RuleListKind};
use super::validator::SubstreamValidator;
use super::workbook_context::{PivotCacheEntry, SupBookEntry, WorkbookContext};

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub graph: DocumentGraph,
    /// Soft failures, in stream order (validator diagnostics last).
    pub diagnostics: Vec<Diagnostic>,
    /// Where producer padding after the final `EOF` started, if any.
    pub trailing_junk_offset: Option<u64>,
}

/// Load a workbook stream with the built-in record registry.
pub fn load_workbook_stream<S: ByteSpace + ?Sized>(
    space: &S,
    options: &LoadOptions,
) -> Result<LoadResult, LoadError> {
    let factory = RecordFactory::new();
    load_workbook_stream_with(space, &factory, options)
}

/// Load a workbook stream with a caller-provided record registry.
pub fn load_workbook_stream_with<S: ByteSpace + ?Sized>(
    space: &S,
    factory: &RecordFactory,
    options: &LoadOptions,
) -> Result<LoadResult, LoadError> {
    if space.is_empty() {
        return Err(LoadError::EmptyStream);
    }

    let mut coalescer = ContinuationCoalescer::new(space, factory, options);
    let mut assembler = SubstreamAssembler::new(factory, options.max_diagnostics);
    while let Some(logical) = coalescer.next() {
        let logical = logical?;
        assembler.extend_diagnostics(coalescer.take_diagnostics());
        assembler.push(logical)?;
    }
    assembler.extend_diagnostics(coalescer.take_diagnostics());
    let trailing_junk_offset = coalescer.trailing_junk_offset();

    let (mut graph, mut diagnostics) = assembler.finish_with_diagnostics()?;
    if options.defensive {
        for diagnostic in SubstreamValidator::standard().validate(&mut graph, factory) {
            diagnostics.push_logged(diagnostic);
        }
    }

    Ok(LoadResult {
        graph,
        diagnostics: diagnostics.into_vec(),
        trailing_junk_offset,
    })
}

/// "Most recent record of kind K" cursors, per open substream.
#[derive(Debug, Default)]
struct Cursors {
    /// Index into `formulas`; replaced only by the next `FORMULA`.
    pending_formula: Option<usize>,
    /// Index into `rule_lists`, per header family.
    rule_lists: HashMap<RuleListKind, usize>,
    /// Index into `drawings`.
    drawing: Option<usize>,
    /// Index into `pivot_views`.
    pivot_view: Option<usize>,
    /// `(view, field)` indices.
    pivot_field: Option<(usize, usize)>,
}

#[derive(Debug)]
struct OpenSubstream {
    substream: Substream,
    cursors: Cursors,
}

/// Stateful builder of a [`DocumentGraph`] from logical records.
pub struct SubstreamAssembler<'f> {
    factory: &'f RecordFactory,
    stack: Vec<OpenSubstream>,
    globals: Option<Substream>,
    sheets: Vec<Substream>,
    context: WorkbookContext,
    /// Sheet-scoped names keyed by `itab`, distributed to sheets once all are known.
    local_names: BTreeMap<u16, Vec<RecordId>>,
    supbook_cursor: Option<usize>,
    pivot_cache_cursor: Option<usize>,
    diagnostics: Diagnostics,
    seen_any: bool,
}

impl<'f> SubstreamAssembler<'f> {
    pub fn new(factory: &'f RecordFactory, max_diagnostics: usize) -> Self {
        Self {
            factory,
            stack: Vec::new(),
            globals: None,
            sheets: Vec::new(),
            context: WorkbookContext::default(),
            local_names: BTreeMap::new(),
            supbook_cursor: None,
            pivot_cache_cursor: None,
            diagnostics: Diagnostics::new(max_diagnostics),
            seen_any: false,
        }
    }

    /// Current nesting depth (number of open substreams).
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn extend_diagnostics(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(diagnostics);
    }

    /// The open top-level substream is the first one, i.e. the workbook globals.
    fn in_globals(&self) -> bool {
        self.stack.len() == 1 && self.globals.is_none()
    }

    pub fn push(&mut self, logical: LogicalRecord) -> Result<(), LoadError> {
        if !self.seen_any {
            self.seen_any = true;
            if !opcodes::is_bof(logical.opcode) {
                return Err(LoadError::MissingBof {
                    offset: logical.offset,
                    opcode: logical.opcode,
                });
            }
        }

        let opcode = logical.opcode;
        let offset = logical.offset;
        let (body, err) = self
            .factory
            .decode(opcode, &logical.data, self.context.codepage);
        if let Some(err) = err {
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::MalformedPayload,
                Some(offset),
                opcode,
                err,
            ));
        }
        let record = Record::from_logical(logical, body);

        match self.factory.family(opcode) {
            RecordFamily::Bof => self.open(record),
            RecordFamily::Eof if !self.stack.is_empty() => self.close(record),
            _ if self.stack.is_empty() => self.orphan_between_substreams(record),
            family => self.attach(record, family),
        }
        Ok(())
    }

    fn open(&mut self, record: Record) {
        let kind = match record.body {
            RecordBody::Bof { kind, .. } => kind,
            _ => SubstreamKind::Other(0),
        };
        let mut substream = Substream::new(kind);
        substream.push_record(record);
        self.stack.push(OpenSubstream {
            substream,
            cursors: Cursors::default(),
        });
    }

    fn close(&mut self, record: Record) {
        let Some(mut open) = self.stack.pop() else {
            return;
        };
        open.substream.push_record(record);
        check_declared_counts(&open.substream, &mut self.diagnostics);
        self.attach_closed(open.substream);
    }

    fn attach_closed(&mut self, substream: Substream) {
        if let Some(parent) = self.stack.last_mut() {
            let index = parent.substream.push_nested(substream);
            let drawing = parent
                .cursors
                .drawing
                .and_then(|d| parent.substream.tables.drawings.get_mut(d));
            if let Some(drawing) = drawing {
                drawing.embedded.push(index);
            }
        } else if self.globals.is_none() {
            self.globals = Some(substream);
        } else {
            self.sheets.push(substream);
        }
    }

    fn orphan_between_substreams(&mut self, record: Record) {
        let opcode = record.opcode;
        let offset = record.offset;
        let target = match self.sheets.last_mut() {
            Some(sheet) => sheet,
            None => match self.globals.as_mut() {
                Some(globals) => globals,
                None => return,
            },
        };
        let id = target.push_record(record);
        target.tables.orphans.push(id);
        self.diagnostics.push(Diagnostic::new(
            DiagnosticKind::OrphanRecord,
            offset,
            opcode,
            "record outside any substream; kept after the preceding EOF",
        ));
    }

    fn attach(&mut self, record: Record, family: RecordFamily) {
        let in_globals = self.in_globals();
        let Some(open) = self.stack.last_mut() else {
            return;
        };

        let opcode = record.opcode;
        let offset = record.offset;
        let leading_u16 = record
            .payload()
            .get(0..2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]));
        let body = record.body.clone();
        let id = open.substream.push_record(record);
        let tables = &mut open.substream.tables;
        let cursors = &mut open.cursors;

        type F = RecordFamily;
        let orphan_reason: Option<&'static str> = match family {
            F::Cell | F::Formula => {
                if let Some((row, col)) = body.cell_anchor() {
                    let last_col = match body {
                        RecordBody::CellRun { last_col, .. } => last_col,
                        _ => col,
                    };
                    tables.rows.entry(row).or_default().cells.push(CellEntry {
                        record: id,
                        first_col: col,
                        last_col,
                    });
                    if family == F::Formula {
                        tables.formulas.push(FormulaEntry {
                            record: id,
                            row,
                            col,
                            details: Vec::new(),
                        });
                        cursors.pending_formula = Some(tables.formulas.len() - 1);
                    }
                }
                None
            }
            F::FormulaDetail => {
                match cursors
                    .pending_formula
                    .and_then(|i| tables.formulas.get_mut(i))
                {
                    Some(formula) => {
                        formula.details.push(id);
                        None
                    }
                    None => Some("formula detail with no preceding FORMULA"),
                }
            }
            F::Row => {
                if let RecordBody::Row { row, .. } = body {
                    tables.rows.entry(row).or_default().record = Some(id);
                }
                None
            }
            F::Dimensions => {
                tables.dimensions = Some(id);
                None
            }
            F::MergedCells => {
                tables.merged.push(id);
                None
            }
            F::RuleListHeader(kind) => {
                let declared = match body {
                    RecordBody::RuleListHeader { rule_count } => Some(rule_count),
                    _ => None,
                };
                tables.rule_lists.push(RuleList {
                    kind,
                    header: id,
                    declared,
                    details: Vec::new(),
                });
                cursors.rule_lists.insert(kind, tables.rule_lists.len() - 1);
                None
            }
            F::RuleListDetail(kind) => {
                match cursors
                    .rule_lists
                    .get(&kind)
                    .and_then(|&i| tables.rule_lists.get_mut(i))
                {
                    Some(list) if !list.is_full() => {
                        list.details.push(id);
                        None
                    }
                    Some(_) => Some("rule detail after its header's declared count was reached"),
                    None => Some("rule detail with no preceding header"),
                }
            }
            F::Drawing => {
                tables.drawings.push(DrawingEntry {
                    record: id,
                    details: Vec::new(),
                    embedded: Vec::new(),
                });
                cursors.drawing = Some(tables.drawings.len() - 1);
                None
            }
            F::DrawingDetail => match cursors.drawing.and_then(|i| tables.drawings.get_mut(i)) {
                Some(drawing) => {
                    drawing.details.push(id);
                    None
                }
                None => Some("drawing detail with no preceding MSODRAWING"),
            },
            F::Note => {
                tables.notes.push(id);
                None
            }
            F::PivotView => {
                tables.pivot_views.push(PivotViewEntry {
                    record: id,
                    fields: Vec::new(),
                    details: Vec::new(),
                });
                cursors.pivot_view = Some(tables.pivot_views.len() - 1);
                cursors.pivot_field = None;
                None
            }
            F::PivotField => {
                let view = cursors
                    .pivot_view
                    .and_then(|v| tables.pivot_views.get_mut(v).map(|view| (v, view)));
                match view {
                    Some((v, view)) => {
                        view.fields.push(PivotFieldEntry {
                            record: id,
                            details: Vec::new(),
                        });
                        cursors.pivot_field = Some((v, view.fields.len() - 1));
                        None
                    }
                    None => Some("pivot field with no preceding SXVIEW"),
                }
            }
            F::PivotFieldDetail => {
                let field = cursors.pivot_field.and_then(|(v, f)| {
                    tables
                        .pivot_views
                        .get_mut(v)
                        .and_then(|view| view.fields.get_mut(f))
                });
                match field {
                    Some(field) => {
                        field.details.push(id);
                        None
                    }
                    None => Some("pivot item with no preceding SXVD"),
                }
            }
            F::PivotViewDetail => {
                match cursors
                    .pivot_view
                    .and_then(|v| tables.pivot_views.get_mut(v))
                {
                    Some(view) => {
                        view.details.push(id);
                        None
                    }
                    None => Some("pivot view detail with no preceding SXVIEW"),
                }
            }
            F::Continue => {
                // Already reported by the coalescer.
                tables.orphans.push(id);
                None
            }
            F::Name if in_globals => {
                self.context.names.push(id);
                match body {
                    RecordBody::Name { itab: 0, .. } => self.context.global_names.push(id),
                    RecordBody::Name { itab, .. } => {
                        self.local_names.entry(itab).or_default().push(id)
                    }
                    _ => {}
                }
                None
            }
            F::ExternSheet if in_globals => {
                if let RecordBody::ExternSheet(entries) = body {
                    self.context.extern_sheets.extend(entries);
                }
                self.context.extern_sheet_records.push(id);
                None
            }
            F::BoundSheet if in_globals => {
                self.context.bound_sheets.push(id);
                None
            }
            F::SharedStrings if in_globals => {
                self.context.sst = Some(id);
                None
            }
            F::CodePage if in_globals => {
                if let Some(codepage) = leading_u16 {
                    self.context.codepage = codepage;
                }
                None
            }
            F::Font if in_globals => {
                self.context.fonts.push(id);
                None
            }
            F::Format if in_globals => {
                self.context.formats.push(id);
                None
            }
            F::Xf if in_globals => {
                self.context.xfs.push(id);
                None
            }
            F::Style if in_globals => {
                self.context.styles.push(id);
                None
            }
            F::DrawingGroup if in_globals => {
                self.context.drawing_group = Some(id);
                None
            }
            F::SupBook if in_globals => {
                self.context.supbooks.push(SupBookEntry {
                    record: id,
                    details: Vec::new(),
                });
                self.supbook_cursor = Some(self.context.supbooks.len() - 1);
                None
            }
            F::SupBookDetail if in_globals => {
                match self
                    .supbook_cursor
                    .and_then(|i| self.context.supbooks.get_mut(i))
                {
                    Some(supbook) => {
                        supbook.details.push(id);
                        None
                    }
                    None => Some("external name with no preceding SUPBOOK"),
                }
            }
            F::PivotCache if in_globals => {
                let stream_id = match body {
                    RecordBody::PivotCacheId(stream_id) => Some(stream_id),
                    _ => None,
                };
                self.context.pivot_caches.push(PivotCacheEntry {
                    record: id,
                    stream_id,
                    details: Vec::new(),
                });
                self.pivot_cache_cursor = Some(self.context.pivot_caches.len() - 1);
                None
            }
            F::PivotCacheDetail if in_globals => {
                match self
                    .pivot_cache_cursor
                    .and_then(|i| self.context.pivot_caches.get_mut(i))
                {
                    Some(cache) => {
                        cache.details.push(id);
                        None
                    }
                    None => Some("pivot cache source with no preceding SXIDSTM"),
                }
            }
            F::Other if in_globals && opcode == opcodes::EXTSST => {
                self.context.ext_sst = Some(id);
                None
            }
            _ => None,
        };

        if let Some(reason) = orphan_reason {
            tables.orphans.push(id);
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::OrphanRecord,
                offset,
                opcode,
                reason,
            ));
        }
    }

    /// Close every still-open substream and return the graph.
    pub fn finish(self) -> Result<(DocumentGraph, Vec<Diagnostic>), LoadError> {
        let (graph, diagnostics) = self.finish_with_diagnostics()?;
        Ok((graph, diagnostics.into_vec()))
    }

    pub(crate) fn finish_with_diagnostics(
        mut self,
    ) -> Result<(DocumentGraph, Diagnostics), LoadError> {
        if !self.seen_any {
            return Err(LoadError::EmptyStream);
        }

        while let Some(mut open) = self.stack.pop() {
            let bof_offset = open
                .substream
                .records()
                .next()
                .and_then(|(_, record)| record.offset);
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::UnbalancedSubstream,
                bof_offset,
                opcodes::BOF,
                "substream still open at end of stream; synthesized its EOF",
            ));
            open.substream
                .push_record(Record::new(opcodes::EOF, Vec::new(), RecordBody::Eof));
            open.substream.implicitly_closed = true;
            check_declared_counts(&open.substream, &mut self.diagnostics);
            self.attach_closed(open.substream);
        }

        let Some(globals) = self.globals.take() else {
            return Err(LoadError::EmptyStream);
        };
        let mut graph = DocumentGraph {
            context: std::mem::take(&mut self.context),
            globals,
            sheets: std::mem::take(&mut self.sheets),
        };

        for (itab, ids) in std::mem::take(&mut self.local_names) {
            let sheet = usize::from(itab)
                .checked_sub(1)
                .and_then(|index| graph.sheets.get_mut(index));
            match sheet {
                Some(sheet) => sheet.tables.local_names.extend(ids),
                None => {
                    for id in ids {
                        let offset = graph.globals.record(id).and_then(|r| r.offset);
                        self.diagnostics.push(Diagnostic::new(
                            DiagnosticKind::NameScope,
                            offset,
                            opcodes::NAME,
                            format!("NAME scoped to sheet index {itab}, which does not exist"),
                        ));
                        graph.context.unresolved_local_names.push(id);
                    }
                }
            }
        }

        Ok((graph, self.diagnostics))
    }
}

fn check_declared_counts(substream: &Substream, diagnostics: &mut Diagnostics) {
    let offset_of = |id: RecordId| substream.record(id).and_then(|r| r.offset);
    let tables = &substream.tables;

    for list in &tables.rule_lists {
        if let Some(declared) = list.declared {
            if (list.details.len() as u64) < u64::from(declared) {
                let opcode = substream.record(list.header).map_or(0, |r| r.opcode);
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::CountMismatch,
                    offset_of(list.header),
                    opcode,
                    format!(
                        "header declares {declared} rules but {} follow",
                        list.details.len()
                    ),
                ));
            }
        }
    }

    for view in &tables.pivot_views {
        let Some(record) = substream.record(view.record) else {
            continue;
        };
        if let RecordBody::PivotView { field_count, .. } = record.body {
            if usize::from(field_count) != view.fields.len() {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::CountMismatch,
                    record.offset,
                    record.opcode,
                    format!(
                        "SXVIEW declares {field_count} fields but {} follow",
                        view.fields.len()
                    ),
                ));
            }
        }
        for field in &view.fields {
            let Some(record) = substream.record(field.record) else {
                continue;
            };
            let items = field
                .details
                .iter()
                .filter_map(|&id| substream.record(id))
                .filter(|r| r.opcode == opcodes::SXVI)
                .count();
            if let RecordBody::PivotField { item_count } = record.body {
                if usize::from(item_count) != items {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::CountMismatch,
                        record.offset,
                        record.opcode,
                        format!("SXVD declares {item_count} items but {items} follow"),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Entry;

    fn logical(opcode: u16, data: &[u8], offset: u64) -> LogicalRecord {
        LogicalRecord {
            opcode,
            physical_opcode: opcode,
            offset,
            data: data.to_vec(),
            fragment_sizes: vec![data.len()],
            text_layout: false,
        }
    }

    fn bof(dt: u16) -> Vec<u8> {
        let mut out = vec![0u8; 16];
        out[0..2].copy_from_slice(&0x0600u16.to_le_bytes());
        out[2..4].copy_from_slice(&dt.to_le_bytes());
        out
    }

    fn assemble(records: Vec<(u16, Vec<u8>)>) -> (DocumentGraph, Vec<Diagnostic>) {
        let factory = RecordFactory::new();
        let mut assembler = SubstreamAssembler::new(&factory, 100);
        for (i, (opcode, data)) in records.into_iter().enumerate() {
            assembler.push(logical(opcode, &data, i as u64 * 100)).unwrap();
        }
        assembler.finish().unwrap()
    }

    fn cell(opcode: u16, row: u16, col: u16) -> (u16, Vec<u8>) {
        let mut data = Vec::new();
        data.extend_from_slice(&row.to_le_bytes());
        data.extend_from_slice(&col.to_le_bytes());
        data.extend_from_slice(&15u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        (opcode, data)
    }

    fn formula(row: u16, col: u16) -> (u16, Vec<u8>) {
        let mut data = vec![0u8; 20];
        data[0..2].copy_from_slice(&row.to_le_bytes());
        data[2..4].copy_from_slice(&col.to_le_bytes());
        (opcodes::FORMULA, data)
    }

    #[test]
    fn rejects_stream_without_leading_bof() {
        let factory = RecordFactory::new();
        let mut assembler = SubstreamAssembler::new(&factory, 10);
        let err = assembler
            .push(logical(opcodes::WINDOW1, &[0; 18], 0))
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::MissingBof {
                offset: 0,
                opcode: opcodes::WINDOW1
            }
        ));
    }

    #[test]
    fn first_substream_is_globals_and_cells_attach_to_rows() {
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            cell(opcodes::NUMBER, 2, 1),
            cell(opcodes::LABELSST, 2, 4),
            (opcodes::EOF, vec![]),
        ]);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        assert_eq!(graph.globals.kind, SubstreamKind::Globals);
        assert_eq!(graph.sheets.len(), 1);
        let row = &graph.sheets[0].tables.rows[&2];
        assert_eq!(row.cells.len(), 2);
        assert_eq!(graph.sheets[0].tables.cell_extent(), Some((2, 2, 1, 4)));
    }

    #[test]
    fn formula_details_attach_to_pending_formula() {
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            (opcodes::STRING, vec![1, 0, 0, b'x']),
            formula(0, 0),
            (opcodes::SHRFMLA, vec![0, 0, 4, 0, 0, 0, 0, 0, 0, 0]),
            cell(opcodes::NUMBER, 1, 1),
            (opcodes::STRING, vec![1, 0, 0, b'y']),
            formula(5, 0),
            (opcodes::ARRAY, vec![5, 0, 5, 0, 0, 1, 0, 0]),
            (opcodes::EOF, vec![]),
        ]);
        let sheet = &graph.sheets[0];
        assert_eq!(sheet.tables.formulas.len(), 2);
        assert_eq!(sheet.tables.formulas[0].details.len(), 2);
        assert_eq!(sheet.tables.formulas[1].details.len(), 1);
        assert_eq!(sheet.tables.orphans.len(), 1);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::OrphanRecord);
        assert_eq!(diagnostics[0].opcode, opcodes::STRING);
    }

    #[test]
    fn rule_details_attach_to_their_own_family() {
        let mut condfmt12 = vec![0u8; 14];
        condfmt12[12] = 1;
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            (opcodes::CONDFMT12, condfmt12),
            (opcodes::CONDFMT, vec![2, 0, 0, 0]),
            (opcodes::CF, vec![1]),
            (opcodes::CF12, vec![2]),
            (opcodes::CF, vec![3]),
            (opcodes::CF, vec![4]),
            (opcodes::EOF, vec![]),
        ]);
        let lists = &graph.sheets[0].tables.rule_lists;
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].kind, RuleListKind::ConditionalFormat12);
        assert_eq!(lists[0].details.len(), 1);
        assert_eq!(lists[1].kind, RuleListKind::ConditionalFormat);
        assert_eq!(lists[1].details.len(), 2);
        // The third CF exceeds the declared count.
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].opcode, opcodes::CF);
    }

    #[test]
    fn rule_details_follow_the_latest_header_of_their_family() {
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            (opcodes::CONDFMT, vec![3, 0, 0, 0]),
            (opcodes::CF, vec![1]),
            (opcodes::CONDFMT, vec![2, 0, 0, 0]),
            (opcodes::CF, vec![2]),
            (opcodes::CF, vec![3]),
            (opcodes::EOF, vec![]),
        ]);
        let sheet = &graph.sheets[0];
        let lists = &sheet.tables.rule_lists;
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].details.len(), 1);
        assert!(!lists[0].is_full());
        let payloads: Vec<&[u8]> = lists[1]
            .details
            .iter()
            .map(|&id| sheet.record(id).unwrap().payload())
            .collect();
        assert_eq!(payloads, vec![&[2u8][..], &[3u8][..]]);

        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert_eq!(diagnostics[0].kind, DiagnosticKind::CountMismatch);
        assert_eq!(diagnostics[0].opcode, opcodes::CONDFMT);
        assert_eq!(
            diagnostics[0].offset,
            sheet.record(lists[0].header).unwrap().offset
        );
    }

    #[test]
    fn names_route_by_scope() {
        let name = |itab: u16, text: &str| {
            let mut data = vec![0u8; 15];
            data[3] = text.len() as u8;
            data[8..10].copy_from_slice(&itab.to_le_bytes());
            data.extend_from_slice(text.as_bytes());
            (opcodes::NAME, data)
        };
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            name(0, "Global"),
            name(1, "Local"),
            name(7, "Lost"),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            (opcodes::EOF, vec![]),
        ]);
        assert_eq!(graph.context.names.len(), 3);
        assert_eq!(graph.context.global_names.len(), 1);
        assert_eq!(graph.sheets[0].tables.local_names.len(), 1);
        assert_eq!(graph.context.unresolved_local_names.len(), 1);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::NameScope);
    }

    #[test]
    fn nested_chart_attaches_at_bof_position_and_links_to_drawing() {
        let factory = RecordFactory::new();
        let mut assembler = SubstreamAssembler::new(&factory, 100);
        let records = vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            (opcodes::MSODRAWING, vec![0; 8]),
            (opcodes::OBJ, vec![0x15, 0, 0x12, 0, 0x05, 0, 0x01, 0]),
            (opcodes::BOF, bof(0x0020)),
            (0x1002, vec![0; 16]),
            (opcodes::EOF, vec![]),
            (opcodes::WINDOW2, vec![0; 18]),
            (opcodes::EOF, vec![]),
        ];
        let mut depths = Vec::new();
        for (i, (opcode, data)) in records.into_iter().enumerate() {
            assembler.push(logical(opcode, &data, i as u64)).unwrap();
            depths.push(assembler.depth());
        }
        assert_eq!(depths, vec![1, 0, 1, 1, 1, 2, 2, 1, 1, 0]);

        let (graph, diagnostics) = assembler.finish().unwrap();
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let sheet = &graph.sheets[0];
        assert_eq!(sheet.nested.len(), 1);
        assert_eq!(sheet.nested[0].kind, SubstreamKind::Chart);
        assert_eq!(sheet.entries()[3], Entry::Nested(0));
        assert_eq!(sheet.tables.drawings[0].details.len(), 1);
        assert_eq!(sheet.tables.drawings[0].embedded, vec![0]);
    }

    #[test]
    fn unclosed_substream_gets_synthesized_eof() {
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            cell(opcodes::BLANK, 0, 0),
        ]);
        let sheet = &graph.sheets[0];
        assert!(sheet.implicitly_closed);
        assert!(sheet.is_balanced());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::UnbalancedSubstream);
    }

    #[test]
    fn records_between_substreams_are_kept_as_orphans() {
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (0x7777, vec![1, 2]),
            (opcodes::BOF, bof(0x0010)),
            (opcodes::EOF, vec![]),
        ]);
        let last = graph.globals.records().last().unwrap().1;
        assert_eq!(last.opcode, 0x7777);
        assert_eq!(graph.globals.tables.orphans.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::OrphanRecord);
        assert_eq!(graph.sheets.len(), 1);
        assert!(graph.globals.is_balanced());
        assert!(graph.sheets[0].is_balanced());
    }

    #[test]
    fn global_tables_index_supbooks_and_pivot_caches() {
        let mut extern_sheet = 2u16.to_le_bytes().to_vec();
        extern_sheet.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 1, 0]);
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::CODEPAGE, 1251u16.to_le_bytes().to_vec()),
            (opcodes::SUPBOOK, vec![1, 0, 1, 4]),
            (opcodes::EXTERNNAME, vec![0; 6]),
            (opcodes::EXTERNSHEET, extern_sheet),
            (opcodes::SXIDSTM, vec![3, 0]),
            (opcodes::SXVS, vec![1, 0]),
            (opcodes::DCONREF, vec![0; 8]),
            (opcodes::EOF, vec![]),
        ]);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let ctx = &graph.context;
        assert_eq!(ctx.codepage, 1251);
        assert_eq!(ctx.supbooks[0].details.len(), 1);
        assert_eq!(ctx.extern_sheets.len(), 2);
        assert_eq!(ctx.extern_sheets[1].itab_first, 1);
        assert_eq!(ctx.pivot_caches[0].stream_id, Some(3));
        assert_eq!(ctx.pivot_caches[0].details.len(), 2);
    }

    #[test]
    fn pivot_items_attach_to_most_recent_field() {
        let mut sxview = vec![0u8; 24];
        sxview[22] = 2;
        let (graph, diagnostics) = assemble(vec![
            (opcodes::BOF, bof(0x0005)),
            (opcodes::EOF, vec![]),
            (opcodes::BOF, bof(0x0010)),
            (opcodes::SXVIEW, sxview),
            (opcodes::SXVD, vec![1, 0, 0, 0, 0, 0, 1, 0]),
            (opcodes::SXVI, vec![0; 8]),
            (opcodes::SXVD, vec![2, 0, 0, 0, 0, 0, 0, 0]),
            (opcodes::SXVDEX, vec![0; 20]),
            (opcodes::SXIVD, vec![0, 0]),
            (opcodes::EOF, vec![]),
        ]);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let view = &graph.sheets[0].tables.pivot_views[0];
        assert_eq!(view.fields.len(), 2);
        assert_eq!(view.fields[0].details.len(), 1);
        assert_eq!(view.fields[1].details.len(), 1);
        assert_eq!(view.details.len(), 1);
    }
}
