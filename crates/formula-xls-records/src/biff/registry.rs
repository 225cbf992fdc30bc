//! Opcode registry.
//!
//! Maps an opcode to a static [`RecordDescriptor`]: a display name, the continuation policy the
//! coalescer applies, the adjacency family the assembler routes on, and the payload decoder.
//! Unregistered opcodes decode to [`RecordBody::Opaque`].

use std::collections::HashMap;

use super::bodies::{self, DecodeFn, RecordBody};
use super::continuation::ContinuationPolicy;
use super::opcodes::*;

/// Detail-record families that attach to the most recent header of their kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleListKind {
    ConditionalFormat,
    ConditionalFormat12,
    DataValidation,
}

/// How the assembler routes a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFamily {
    Bof,
    Eof,
    Continue,
    Cell,
    Formula,
    /// `STRING`, `SHRFMLA`, `ARRAY`, `TABLE`: attach to the pending formula.
    FormulaDetail,
    Row,
    Dimensions,
    Name,
    ExternSheet,
    BoundSheet,
    SharedStrings,
    CodePage,
    Font,
    Format,
    Xf,
    Style,
    DrawingGroup,
    SupBook,
    /// `EXTERNNAME`, `CRN`: attach to the most recent `SUPBOOK`.
    SupBookDetail,
    PivotCache,
    /// `SXVS`, `DCONREF`, `DCONNAME`, `DCONBIN`: attach to the most recent `SXIDSTM`.
    PivotCacheDetail,
    RuleListHeader(RuleListKind),
    RuleListDetail(RuleListKind),
    Drawing,
    /// `OBJ`, `TXO`: attach to the most recent `MSODRAWING`.
    DrawingDetail,
    Note,
    PivotView,
    PivotField,
    /// `SXVI`, `SXVDEX`: attach to the most recent `SXVD`.
    PivotFieldDetail,
    /// Other pivot records: attach to the most recent `SXVIEW`.
    PivotViewDetail,
    MergedCells,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordDescriptor {
    pub opcode: u16,
    pub name: &'static str,
    pub policy: ContinuationPolicy,
    pub family: RecordFamily,
    pub decode: DecodeFn,
}

const fn desc(
    opcode: u16,
    name: &'static str,
    policy: ContinuationPolicy,
    family: RecordFamily,
    decode: DecodeFn,
) -> RecordDescriptor {
    RecordDescriptor {
        opcode,
        name,
        policy,
        family,
        decode,
    }
}

const fn known(opcode: u16, name: &'static str) -> RecordDescriptor {
    desc(
        opcode,
        name,
        ContinuationPolicy::Greedy,
        RecordFamily::Other,
        bodies::decode_known,
    )
}

const fn family(opcode: u16, name: &'static str, family: RecordFamily) -> RecordDescriptor {
    desc(
        opcode,
        name,
        ContinuationPolicy::Greedy,
        family,
        bodies::decode_known,
    )
}

const fn decoded(
    opcode: u16,
    name: &'static str,
    family: RecordFamily,
    decode: DecodeFn,
) -> RecordDescriptor {
    desc(opcode, name, ContinuationPolicy::Greedy, family, decode)
}

use ContinuationPolicy as P;
use RecordFamily as F;
use RuleListKind as R;

/// Descriptors registered by [`RecordFactory::new`].
pub static BUILTIN_DESCRIPTORS: &[RecordDescriptor] = &[
    // Stream structure.
    desc(BOF, "BOF", P::Never, F::Bof, bodies::decode_bof),
    desc(BOF_BIFF5, "BOF", P::Never, F::Bof, bodies::decode_bof),
    desc(BOF_BIFF3, "BOF", P::Never, F::Bof, bodies::decode_bof),
    desc(BOF_BIFF4, "BOF", P::Never, F::Bof, bodies::decode_bof),
    desc(EOF, "EOF", P::Never, F::Eof, bodies::decode_eof),
    family(CONTINUE, "CONTINUE", F::Continue),
    known(INDEX, "INDEX"),
    known(DBCELL, "DBCELL"),
    // Workbook globals.
    known(INTERFACEHDR, "INTERFACEHDR"),
    known(MMS, "MMS"),
    known(INTERFACEEND, "INTERFACEEND"),
    known(WRITEACCESS, "WRITEACCESS"),
    family(CODEPAGE, "CODEPAGE", F::CodePage),
    known(DSF, "DSF"),
    known(EXCEL9FILE, "EXCEL9FILE"),
    known(TABID, "TABID"),
    known(FNGROUPCOUNT, "FNGROUPCOUNT"),
    known(WINDOWPROTECT, "WINDOWPROTECT"),
    known(PROTECT, "PROTECT"),
    known(PASSWORD, "PASSWORD"),
    known(PROT4REV, "PROT4REV"),
    known(PROT4REVPASS, "PROT4REVPASS"),
    known(WINDOW1, "WINDOW1"),
    known(BACKUP, "BACKUP"),
    known(HIDEOBJ, "HIDEOBJ"),
    known(DATEMODE, "DATEMODE"),
    known(PRECISION, "PRECISION"),
    known(REFRESHALL, "REFRESHALL"),
    known(BOOKBOOL, "BOOKBOOL"),
    family(FONT, "FONT", F::Font),
    family(FORMAT, "FORMAT", F::Format),
    family(XF, "XF", F::Xf),
    family(STYLE, "STYLE", F::Style),
    known(PALETTE, "PALETTE"),
    known(USESELFS, "USESELFS"),
    decoded(BOUNDSHEET, "BOUNDSHEET", F::BoundSheet, bodies::decode_bound_sheet),
    known(COUNTRY, "COUNTRY"),
    family(SUPBOOK, "SUPBOOK", F::SupBook),
    family(EXTERNNAME, "EXTERNNAME", F::SupBookDetail),
    family(CRN, "CRN", F::SupBookDetail),
    decoded(EXTERNSHEET, "EXTERNSHEET", F::ExternSheet, bodies::decode_extern_sheet),
    decoded(NAME, "NAME", F::Name, bodies::decode_name),
    family(MSODRAWINGGROUP, "MSODRAWINGGROUP", F::DrawingGroup),
    desc(SST, "SST", P::SharedStrings, F::SharedStrings, bodies::decode_sst),
    known(EXTSST, "EXTSST"),
    // Pivot caches.
    decoded(SXIDSTM, "SXIDSTM", F::PivotCache, bodies::decode_sxidstm),
    family(SXVS, "SXVS", F::PivotCacheDetail),
    family(DCONREF, "DCONREF", F::PivotCacheDetail),
    family(DCONNAME, "DCONNAME", F::PivotCacheDetail),
    family(DCONBIN, "DCONBIN", F::PivotCacheDetail),
    // Worksheet settings.
    known(CALCMODE, "CALCMODE"),
    known(CALCCOUNT, "CALCCOUNT"),
    known(REFMODE, "REFMODE"),
    known(ITERATION, "ITERATION"),
    known(DELTA, "DELTA"),
    known(SAVERECALC, "SAVERECALC"),
    known(PRINTHEADERS, "PRINTHEADERS"),
    known(PRINTGRIDLINES, "PRINTGRIDLINES"),
    known(GRIDSET, "GRIDSET"),
    known(GUTS, "GUTS"),
    known(DEFAULTROWHEIGHT, "DEFAULTROWHEIGHT"),
    known(WSBOOL, "WSBOOL"),
    known(HORIZONTALPAGEBREAKS, "HORIZONTALPAGEBREAKS"),
    known(VERTICALPAGEBREAKS, "VERTICALPAGEBREAKS"),
    known(HEADER, "HEADER"),
    known(FOOTER, "FOOTER"),
    known(HCENTER, "HCENTER"),
    known(VCENTER, "VCENTER"),
    known(LEFTMARGIN, "LEFTMARGIN"),
    known(RIGHTMARGIN, "RIGHTMARGIN"),
    known(TOPMARGIN, "TOPMARGIN"),
    known(BOTTOMMARGIN, "BOTTOMMARGIN"),
    known(SETUP, "SETUP"),
    known(SCENPROTECT, "SCENPROTECT"),
    known(OBJPROTECT, "OBJPROTECT"),
    known(DEFCOLWIDTH, "DEFCOLWIDTH"),
    known(COLINFO, "COLINFO"),
    decoded(DIMENSIONS, "DIMENSIONS", F::Dimensions, bodies::decode_dimensions),
    // Cell table.
    decoded(ROW, "ROW", F::Row, bodies::decode_row),
    decoded(BLANK, "BLANK", F::Cell, bodies::decode_cell),
    decoded(NUMBER, "NUMBER", F::Cell, bodies::decode_cell),
    decoded(LABEL, "LABEL", F::Cell, bodies::decode_cell),
    decoded(BOOLERR, "BOOLERR", F::Cell, bodies::decode_cell),
    decoded(RK, "RK", F::Cell, bodies::decode_cell),
    decoded(RSTRING, "RSTRING", F::Cell, bodies::decode_cell),
    decoded(LABELSST, "LABELSST", F::Cell, bodies::decode_cell),
    decoded(MULRK, "MULRK", F::Cell, bodies::decode_cell_run),
    decoded(MULBLANK, "MULBLANK", F::Cell, bodies::decode_cell_run),
    decoded(FORMULA, "FORMULA", F::Formula, bodies::decode_formula),
    family(STRING, "STRING", F::FormulaDetail),
    decoded(SHRFMLA, "SHRFMLA", F::FormulaDetail, bodies::decode_range_aux),
    decoded(ARRAY, "ARRAY", F::FormulaDetail, bodies::decode_range_aux),
    decoded(TABLE, "TABLE", F::FormulaDetail, bodies::decode_range_aux),
    // Drawing layer.
    family(MSODRAWING, "MSODRAWING", F::Drawing),
    decoded(OBJ, "OBJ", F::DrawingDetail, bodies::decode_obj),
    desc(TXO, "TXO", P::TextObject, F::DrawingDetail, bodies::decode_known),
    family(NOTE, "NOTE", F::Note),
    // Pivot views.
    decoded(SXVIEW, "SXVIEW", F::PivotView, bodies::decode_sxview),
    decoded(SXVD, "SXVD", F::PivotField, bodies::decode_sxvd),
    family(SXVI, "SXVI", F::PivotFieldDetail),
    family(SXVDEX, "SXVDEX", F::PivotFieldDetail),
    family(SXIVD, "SXIVD", F::PivotViewDetail),
    family(SXLI, "SXLI", F::PivotViewDetail),
    family(SXPI, "SXPI", F::PivotViewDetail),
    family(SXDI, "SXDI", F::PivotViewDetail),
    family(SXEX, "SXEX", F::PivotViewDetail),
    family(SXFORMAT, "SXFORMAT", F::PivotViewDetail),
    family(QSISXTAG, "QSISXTAG", F::PivotViewDetail),
    family(SXVIEWEX9, "SXVIEWEX9", F::PivotViewDetail),
    // Window / view.
    known(PANE, "PANE"),
    known(WINDOW2, "WINDOW2"),
    known(PLV, "PLV"),
    known(SCL, "SCL"),
    known(SELECTION, "SELECTION"),
    // Sheet features.
    decoded(MERGEDCELLS, "MERGEDCELLS", F::MergedCells, bodies::decode_merged_cells),
    decoded(
        CONDFMT,
        "CONDFMT",
        F::RuleListHeader(R::ConditionalFormat),
        bodies::decode_condfmt,
    ),
    family(CF, "CF", F::RuleListDetail(R::ConditionalFormat)),
    decoded(
        CONDFMT12,
        "CONDFMT12",
        F::RuleListHeader(R::ConditionalFormat12),
        bodies::decode_condfmt12,
    ),
    family(CF12, "CF12", F::RuleListDetail(R::ConditionalFormat12)),
    known(HLINK, "HLINK"),
    decoded(
        DVAL,
        "DVAL",
        F::RuleListHeader(R::DataValidation),
        bodies::decode_dval,
    ),
    family(DV, "DV", F::RuleListDetail(R::DataValidation)),
    known(SHEETEXT, "SHEETEXT"),
];

/// Opcode → descriptor table. Extendable with [`RecordFactory::register`].
#[derive(Debug, Clone)]
pub struct RecordFactory {
    descriptors: HashMap<u16, RecordDescriptor>,
}

impl Default for RecordFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordFactory {
    pub fn new() -> Self {
        let mut descriptors = HashMap::with_capacity(BUILTIN_DESCRIPTORS.len());
        for descriptor in BUILTIN_DESCRIPTORS {
            descriptors.insert(descriptor.opcode, *descriptor);
        }
        Self { descriptors }
    }

    /// Register or replace the descriptor for `descriptor.opcode`.
    pub fn register(&mut self, descriptor: RecordDescriptor) -> Option<RecordDescriptor> {
        self.descriptors.insert(descriptor.opcode, descriptor)
    }

    pub fn descriptor(&self, opcode: u16) -> Option<&RecordDescriptor> {
        self.descriptors.get(&opcode)
    }

    pub fn is_registered(&self, opcode: u16) -> bool {
        self.descriptors.contains_key(&opcode)
    }

    pub fn name(&self, opcode: u16) -> Option<&'static str> {
        self.descriptor(opcode).map(|d| d.name)
    }

    pub fn continuation_policy(&self, opcode: u16) -> ContinuationPolicy {
        self.descriptor(opcode)
            .map_or(ContinuationPolicy::Greedy, |d| d.policy)
    }

    pub fn family(&self, opcode: u16) -> RecordFamily {
        self.descriptor(opcode).map_or(RecordFamily::Other, |d| d.family)
    }

    /// Decode `payload` as `opcode`.
    ///
    /// Unregistered opcodes yield `Opaque`. A registered decoder that fails also yields `Opaque`,
    /// together with the reason so the caller can raise a diagnostic.
    pub fn decode(&self, opcode: u16, payload: &[u8], codepage: u16) -> (RecordBody, Option<String>) {
        let Some(descriptor) = self.descriptor(opcode) else {
            log::debug!("unknown BIFF record 0x{opcode:04X}; keeping {} bytes opaque", payload.len());
            return (RecordBody::Opaque, None);
        };
        match (descriptor.decode)(payload, codepage) {
            Ok(body) => (body, None),
            Err(err) => (
                RecordBody::Opaque,
                Some(format!("malformed {} payload: {err}", descriptor.name)),
            ),
        }
    }
}
