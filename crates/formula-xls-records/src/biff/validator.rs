//! Defensive substream repair driven by canonical record-order templates.
//!
//! A template lists record kinds in the order Excel writes them. Each entry may be required (and
//! then carries the payload synthesized when it is missing), may list `alternate_predecessors`
//! (kinds allowed directly before it even though the template ranks them later), and may share
//! a slot with the previous entry for families that interleave freely (the cell table, drawing
//! records, pivot views).
//!
//! Records whose kind the template does not list are unranked: they travel with the ranked record
//! before them. Nested substreams are unranked too and so stay behind their drawing.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::{Diagnostic, DiagnosticKind};
use crate::graph::{DocumentGraph, Entry, Record, Substream};

use super::bodies::SubstreamKind;
use super::opcodes::*;
use super::registry::RecordFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEntry {
    pub opcode: u16,
    pub required: bool,
    /// Payload of the record synthesized when a required kind is missing.
    pub default_payload: Cow<'static, [u8]>,
    /// Kinds that may directly precede this one despite ranking after it.
    pub alternate_predecessors: Cow<'static, [u16]>,
    /// Shares the previous entry's slot: the two kinds may interleave.
    pub shares_slot: bool,
}

impl TemplateEntry {
    pub const fn optional(opcode: u16) -> Self {
        Self {
            opcode,
            required: false,
            default_payload: Cow::Borrowed(&[]),
            alternate_predecessors: Cow::Borrowed(&[]),
            shares_slot: false,
        }
    }

    pub const fn required(opcode: u16, default_payload: &'static [u8]) -> Self {
        Self {
            opcode,
            required: true,
            default_payload: Cow::Borrowed(default_payload),
            alternate_predecessors: Cow::Borrowed(&[]),
            shares_slot: false,
        }
    }

    pub const fn shared(opcode: u16) -> Self {
        Self {
            opcode,
            required: false,
            default_payload: Cow::Borrowed(&[]),
            alternate_predecessors: Cow::Borrowed(&[]),
            shares_slot: true,
        }
    }

    pub const fn after_any_of(opcode: u16, alternates: &'static [u16]) -> Self {
        Self {
            opcode,
            required: false,
            default_payload: Cow::Borrowed(&[]),
            alternate_predecessors: Cow::Borrowed(alternates),
            shares_slot: false,
        }
    }
}

// BOF: vers=0x0600, dt, rupBuild=0x0DBB, rupYear=0x07CC, bfh=0x41, sfo=6.
const BOF_GLOBALS_DEFAULT: [u8; 16] = [
    0x00, 0x06, 0x05, 0x00, 0xBB, 0x0D, 0xCC, 0x07, 0x41, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00,
];
const BOF_WORKSHEET_DEFAULT: [u8; 16] = [
    0x00, 0x06, 0x10, 0x00, 0xBB, 0x0D, 0xCC, 0x07, 0x41, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00,
];
/// Codepage 1200 (UTF-16).
const CODEPAGE_DEFAULT: [u8; 2] = [0xB0, 0x04];
// WINDOW1: x=0x168, y=0x10E, dx=0x3A5C, dy=0x23BE, grbit=0x38, itabCur=0, itabFirst=0, ctabSel=1,
// wTabRatio=0x258.
const WINDOW1_DEFAULT: [u8; 18] = [
    0x68, 0x01, 0x0E, 0x01, 0x5C, 0x3A, 0xBE, 0x23, 0x38, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
    0x58, 0x02,
];
const DATEMODE_DEFAULT: [u8; 2] = [0x00, 0x00];
const WSBOOL_DEFAULT: [u8; 2] = [0xC1, 0x04];
// WINDOW2: grbit=0x06B6, rwTop=0, colLeft=0, icvHdr=0x40, scales 0, reserved.
const WINDOW2_DEFAULT: [u8; 18] = [
    0xB6, 0x06, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];
const EOF_DEFAULT: [u8; 0] = [];

use TemplateEntry as T;

pub static GLOBALS_TEMPLATE: &[TemplateEntry] = &[
    T::required(BOF, &BOF_GLOBALS_DEFAULT),
    T::optional(INTERFACEHDR),
    T::optional(MMS),
    T::optional(INTERFACEEND),
    T::optional(WRITEACCESS),
    T::required(CODEPAGE, &CODEPAGE_DEFAULT),
    T::optional(DSF),
    T::optional(EXCEL9FILE),
    T::optional(TABID),
    T::optional(FNGROUPCOUNT),
    T::optional(WINDOWPROTECT),
    T::optional(PROTECT),
    T::optional(PASSWORD),
    T::optional(PROT4REV),
    T::optional(PROT4REVPASS),
    T::required(WINDOW1, &WINDOW1_DEFAULT),
    T::optional(BACKUP),
    T::optional(HIDEOBJ),
    T::required(DATEMODE, &DATEMODE_DEFAULT),
    T::optional(PRECISION),
    T::optional(REFRESHALL),
    T::optional(BOOKBOOL),
    T::optional(FONT),
    T::optional(FORMAT),
    T::optional(XF),
    T::optional(STYLE),
    T::optional(PALETTE),
    T::optional(SXIDSTM),
    T::shared(SXVS),
    T::shared(DCONREF),
    T::shared(DCONNAME),
    T::shared(DCONBIN),
    T::optional(USESELFS),
    T::optional(BOUNDSHEET),
    T::optional(COUNTRY),
    T::optional(SUPBOOK),
    T::shared(EXTERNNAME),
    T::shared(CRN),
    T::optional(EXTERNSHEET),
    T::optional(NAME),
    T::optional(MSODRAWINGGROUP),
    T::optional(SST),
    T::optional(EXTSST),
    T::required(EOF, &EOF_DEFAULT),
];

pub static WORKSHEET_TEMPLATE: &[TemplateEntry] = &[
    T::required(BOF, &BOF_WORKSHEET_DEFAULT),
    T::optional(INDEX),
    T::optional(CALCMODE),
    T::optional(CALCCOUNT),
    T::optional(REFMODE),
    T::optional(ITERATION),
    T::optional(DELTA),
    T::optional(SAVERECALC),
    T::optional(PRINTHEADERS),
    T::optional(PRINTGRIDLINES),
    T::optional(GRIDSET),
    T::optional(GUTS),
    T::optional(DEFAULTROWHEIGHT),
    T::required(WSBOOL, &WSBOOL_DEFAULT),
    T::optional(HORIZONTALPAGEBREAKS),
    T::optional(VERTICALPAGEBREAKS),
    T::optional(HEADER),
    T::optional(FOOTER),
    T::optional(HCENTER),
    T::optional(VCENTER),
    T::optional(LEFTMARGIN),
    T::optional(RIGHTMARGIN),
    T::optional(TOPMARGIN),
    T::optional(BOTTOMMARGIN),
    T::optional(SETUP),
    T::optional(PROTECT),
    T::optional(SCENPROTECT),
    T::optional(OBJPROTECT),
    T::optional(PASSWORD),
    T::optional(DEFCOLWIDTH),
    T::optional(COLINFO),
    T::optional(DIMENSIONS),
    // Cell table.
    T::optional(ROW),
    T::shared(BLANK),
    T::shared(NUMBER),
    T::shared(LABEL),
    T::shared(BOOLERR),
    T::shared(RK),
    T::shared(RSTRING),
    T::shared(LABELSST),
    T::shared(MULRK),
    T::shared(MULBLANK),
    T::shared(FORMULA),
    T::shared(STRING),
    T::shared(SHRFMLA),
    T::shared(ARRAY),
    T::shared(TABLE),
    T::shared(DBCELL),
    // Drawing layer.
    T::optional(MSODRAWING),
    T::shared(OBJ),
    T::shared(TXO),
    T::optional(NOTE),
    // Pivot views.
    T::optional(SXVIEW),
    T::shared(SXVD),
    T::shared(SXVI),
    T::shared(SXIVD),
    T::shared(SXLI),
    T::shared(SXPI),
    T::shared(SXDI),
    T::shared(SXEX),
    T::shared(SXFORMAT),
    T::shared(SXVDEX),
    T::shared(QSISXTAG),
    T::shared(SXVIEWEX9),
    // Excel writes PANE after WINDOW2 (and PLV / SCL); a missing WINDOW2 still goes after it.
    T::after_any_of(PANE, &[WINDOW2, PLV, SCL]),
    T::required(WINDOW2, &WINDOW2_DEFAULT),
    T::optional(PLV),
    T::optional(SCL),
    T::optional(SELECTION),
    T::optional(MERGEDCELLS),
    T::optional(CONDFMT),
    T::shared(CF),
    T::optional(CONDFMT12),
    T::shared(CF12),
    T::optional(HLINK),
    T::optional(DVAL),
    T::shared(DV),
    T::optional(SHEETEXT),
    T::required(EOF, &EOF_DEFAULT),
];

/// An owned, extendable template for one substream kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstreamTemplate {
    pub kind: SubstreamKind,
    entries: Vec<TemplateEntry>,
    ranks: HashMap<u16, usize>,
}

impl SubstreamTemplate {
    pub fn new(kind: SubstreamKind, entries: Vec<TemplateEntry>) -> Self {
        let mut template = Self {
            kind,
            entries,
            ranks: HashMap::new(),
        };
        template.reindex();
        template
    }

    pub fn globals() -> Self {
        Self::new(SubstreamKind::Globals, GLOBALS_TEMPLATE.to_vec())
    }

    pub fn worksheet() -> Self {
        Self::new(SubstreamKind::Worksheet, WORKSHEET_TEMPLATE.to_vec())
    }

    pub fn entries(&self) -> &[TemplateEntry] {
        &self.entries
    }

    /// Insert `entry` directly after the entry for `after`, or at the end if `after` is absent.
    pub fn insert_after(&mut self, after: u16, entry: TemplateEntry) {
        let position = self
            .entries
            .iter()
            .position(|e| e.opcode == after)
            .map_or(self.entries.len(), |i| i + 1);
        self.entries.insert(position, entry);
        self.reindex();
    }

    /// Append `entry` before the closing `EOF` entry.
    pub fn push(&mut self, entry: TemplateEntry) {
        let position = self
            .entries
            .iter()
            .rposition(|e| e.opcode == EOF)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
        self.reindex();
    }

    fn reindex(&mut self) {
        self.ranks.clear();
        let mut slot = 0usize;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 && !entry.shares_slot {
                slot += 1;
            }
            self.ranks.entry(entry.opcode).or_insert(slot);
        }
    }

    /// Slot index of `opcode`, or `None` when the template does not list it.
    pub fn rank_of(&self, opcode: u16) -> Option<usize> {
        self.ranks.get(&opcode).copied()
    }

    fn entry(&self, opcode: u16) -> Option<&TemplateEntry> {
        self.entries.iter().find(|e| e.opcode == opcode)
    }

    /// `later` lists `earlier` among the kinds allowed directly before it.
    pub fn is_exempt(&self, earlier: u16, later: u16) -> bool {
        self.entry(later)
            .is_some_and(|e| e.alternate_predecessors.contains(&earlier))
    }
}

/// A maximal span of `order` holding records of one rank plus the unranked records after them.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize,
    end: usize,
    rank: Option<usize>,
    opcode: u16,
}

fn entry_opcode(substream: &Substream, entry: &Entry) -> Option<u16> {
    match entry {
        Entry::Record(id) => substream.record(*id).map(|r| r.opcode),
        Entry::Nested(_) => None,
    }
}

fn runs(substream: &Substream, template: &SubstreamTemplate) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::new();
    for (index, entry) in substream.entries().iter().enumerate() {
        let opcode = entry_opcode(substream, entry);
        let rank = opcode.and_then(|op| template.rank_of(op));
        match out.last_mut() {
            Some(last) if rank.is_none() || rank == last.rank => last.end = index + 1,
            _ => out.push(Run {
                start: index,
                end: index + 1,
                rank,
                opcode: opcode.unwrap_or(0),
            }),
        }
    }
    out
}

/// `runs[i]` may stand before `runs[j]` out of rank only when it and every run up to `runs[j]`
/// are alternate predecessors of `runs[j]`.
fn is_exempt_pair(runs: &[Run], i: usize, j: usize, template: &SubstreamTemplate) -> bool {
    let later = runs[j].opcode;
    runs[i..j]
        .iter()
        .all(|run| template.is_exempt(run.opcode, later))
}

/// First `(earlier, later)` pair of runs the template orders the other way round.
fn first_violation(runs: &[Run], template: &SubstreamTemplate) -> Option<(usize, usize)> {
    for (j, later) in runs.iter().enumerate() {
        let Some(later_rank) = later.rank else {
            continue;
        };
        for (i, earlier) in runs[..j].iter().enumerate() {
            let Some(earlier_rank) = earlier.rank else {
                continue;
            };
            if earlier_rank > later_rank && !is_exempt_pair(runs, i, j, template) {
                return Some((i, j));
            }
        }
    }
    None
}

/// `(earlier opcode, later opcode)` for every out-of-order pair of runs.
pub fn order_violations(substream: &Substream, template: &SubstreamTemplate) -> Vec<(u16, u16)> {
    let runs = runs(substream, template);
    let mut out = Vec::new();
    for (j, later) in runs.iter().enumerate() {
        for (i, earlier) in runs[..j].iter().enumerate() {
            if let (Some(a), Some(b)) = (earlier.rank, later.rank) {
                if a > b && !is_exempt_pair(&runs, i, j, template) {
                    out.push((earlier.opcode, later.opcode));
                }
            }
        }
    }
    out
}

/// Synthesizes missing required records and restores template order.
#[derive(Debug, Clone)]
pub struct SubstreamValidator {
    pub globals: SubstreamTemplate,
    pub worksheet: SubstreamTemplate,
}

impl SubstreamValidator {
    pub fn standard() -> Self {
        Self {
            globals: SubstreamTemplate::globals(),
            worksheet: SubstreamTemplate::worksheet(),
        }
    }

    pub fn template_for(&self, kind: SubstreamKind) -> Option<&SubstreamTemplate> {
        match kind {
            SubstreamKind::Globals => Some(&self.globals),
            SubstreamKind::Worksheet => Some(&self.worksheet),
            _ => None,
        }
    }

    /// Repair the globals substream and every worksheet. Idempotent.
    pub fn validate(&self, graph: &mut DocumentGraph, factory: &RecordFactory) -> Vec<Diagnostic> {
        let codepage = graph.context.codepage;
        let mut diagnostics = self.validate_substream(&self.globals, &mut graph.globals, factory, codepage);
        for sheet in &mut graph.sheets {
            if sheet.kind == self.worksheet.kind {
                diagnostics.extend(self.validate_substream(&self.worksheet, sheet, factory, codepage));
            }
        }
        diagnostics
    }

    pub fn validate_substream(
        &self,
        template: &SubstreamTemplate,
        substream: &mut Substream,
        factory: &RecordFactory,
        codepage: u16,
    ) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        synthesize_missing(template, substream, factory, codepage, &mut diagnostics);
        restore_order(template, substream, &mut diagnostics);
        for diagnostic in &diagnostics {
            log::warn!("{diagnostic}");
        }
        diagnostics
    }
}

fn synthesize_missing(
    template: &SubstreamTemplate,
    substream: &mut Substream,
    factory: &RecordFactory,
    codepage: u16,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for entry in template.entries().iter().filter(|e| e.required) {
        if substream.first_of(entry.opcode).is_some() {
            continue;
        }
        let Some(rank) = template.rank_of(entry.opcode) else {
            continue;
        };
        // After the last run of the highest rank below the missing kind.
        let position = runs(substream, template)
            .iter()
            .filter(|run| run.rank.is_some_and(|r| r < rank))
            .max_by_key(|run| (run.rank, run.start))
            .map_or(0, |run| run.end);

        let record = Record::decoded(factory, entry.opcode, entry.default_payload.to_vec(), codepage);
        substream.insert_record(position, record);
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::SynthesizedRecord,
            None,
            entry.opcode,
            format!("synthesized missing required record at position {position}"),
        ));
    }
}

fn restore_order(
    template: &SubstreamTemplate,
    substream: &mut Substream,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let max_passes = substream.entries().len().saturating_mul(2).max(16);
    for _ in 0..max_passes {
        let runs = runs(substream, template);
        let Some((i, j)) = first_violation(&runs, template) else {
            return;
        };
        let (target, moved) = (runs[i], runs[j]);
        let order = &substream.order;
        let mut reordered = Vec::with_capacity(order.len());
        reordered.extend_from_slice(&order[..target.start]);
        reordered.extend_from_slice(&order[moved.start..moved.end]);
        reordered.extend_from_slice(&order[target.start..moved.start]);
        reordered.extend_from_slice(&order[moved.end..]);

        let offset = match order.get(moved.start) {
            Some(Entry::Record(id)) => substream.record(*id).and_then(|r| r.offset),
            _ => None,
        };
        substream.order = reordered;
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::ReorderedRecord,
            offset,
            moved.opcode,
            format!(
                "moved {} entries before record 0x{:04X}",
                moved.end - moved.start,
                target.opcode
            ),
        ));
    }
    log::warn!("substream order did not stabilize after {max_passes} passes");
}
