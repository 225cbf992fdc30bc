//! Typed views of the record payloads the assembler routes on.
//!
//! The raw payload stays the source of truth: a [`RecordBody`] is decoded from it when a record
//! is loaded or its payload is replaced, and is never serialized on its own. Only the fields the
//! assembler, the finalize hooks and the validator need are decoded; everything else stays in the
//! payload bytes.

use super::strings;

/// Hard cap on decoded `EXTERNSHEET` entries.
const MAX_XTI_ENTRIES: usize = 16_384;

// NAME option flags. See [MS-XLS] 2.4.150.
const NAME_FLAG_BUILTIN: u16 = 0x0020;
// FORMULA option flags. See [MS-XLS] 2.4.127.
pub(crate) const FORMULA_FLAG_SHARED: u16 = 0x0008;

/// Substream type (`dt`) from a `BOF` record. See [MS-XLS] 2.4.21.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubstreamKind {
    Globals,
    VbModule,
    Worksheet,
    Chart,
    MacroSheet,
    Workspace,
    Other(u16),
}

impl SubstreamKind {
    pub fn from_dt(dt: u16) -> Self {
        match dt {
            0x0005 => Self::Globals,
            0x0006 => Self::VbModule,
            0x0010 => Self::Worksheet,
            0x0020 => Self::Chart,
            0x0040 => Self::MacroSheet,
            0x0100 => Self::Workspace,
            other => Self::Other(other),
        }
    }

    pub fn dt(self) -> u16 {
        match self {
            Self::Globals => 0x0005,
            Self::VbModule => 0x0006,
            Self::Worksheet => 0x0010,
            Self::Chart => 0x0020,
            Self::MacroSheet => 0x0040,
            Self::Workspace => 0x0100,
            Self::Other(dt) => dt,
        }
    }
}

/// A rectangular cell range with inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub first_row: u16,
    pub last_row: u16,
    pub first_col: u16,
    pub last_col: u16,
}

impl CellRange {
    pub fn contains(&self, row: u16, col: u16) -> bool {
        (self.first_row..=self.last_row).contains(&row)
            && (self.first_col..=self.last_col).contains(&col)
    }
}

/// One `XTI` entry of the `EXTERNSHEET` table. See [MS-XLS] 2.5.172.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xti {
    /// Index of the referenced `SUPBOOK` record.
    pub supbook: u16,
    pub itab_first: i16,
    pub itab_last: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Bof {
        version: u16,
        kind: SubstreamKind,
    },
    Eof,
    BoundSheet {
        /// `lbPlyPos`: absolute stream position of the sheet's `BOF`.
        stream_pos: u32,
        visibility: u8,
        sheet_type: u8,
        name: String,
    },
    /// A single-cell record (`BLANK`, `NUMBER`, `LABEL`, `BOOLERR`, `RK`, `RSTRING`, `LABELSST`).
    Cell { row: u16, col: u16, xf: u16 },
    /// `MULRK` / `MULBLANK`.
    CellRun {
        row: u16,
        first_col: u16,
        last_col: u16,
    },
    Formula {
        row: u16,
        col: u16,
        xf: u16,
        flags: u16,
    },
    /// `SHRFMLA`, `ARRAY` and `TABLE`: the range the formula detail applies to.
    RangeAux(CellRange),
    Row {
        row: u16,
        first_col: u16,
        last_col_excl: u16,
    },
    Dimensions {
        first_row: u32,
        last_row_excl: u32,
        first_col: u16,
        last_col_excl: u16,
    },
    Name {
        flags: u16,
        /// 1-based sheet index the name is scoped to; 0 for workbook scope.
        itab: u16,
        name: String,
    },
    ExternSheet(Vec<Xti>),
    SharedStrings {
        total: u32,
        unique: u32,
    },
    /// `CONDFMT`, `CONDFMT12` and `DVAL`: a header declaring how many detail records follow.
    RuleListHeader { rule_count: u32 },
    PivotView {
        cache_index: u16,
        field_count: u16,
    },
    PivotField { item_count: u16 },
    PivotCacheId(u16),
    MergedCells(Vec<CellRange>),
    DrawingObject { object_type: u16, id: u16 },
    /// Registered, with no fields the engine interprets.
    Known,
    /// Unregistered or undecodable; kept as raw bytes.
    Opaque,
}

impl RecordBody {
    pub fn is_opaque(&self) -> bool {
        matches!(self, RecordBody::Opaque)
    }

    /// The `(row, col)` a cell-table record is anchored at.
    pub fn cell_anchor(&self) -> Option<(u16, u16)> {
        match self {
            RecordBody::Cell { row, col, .. } | RecordBody::Formula { row, col, .. } => {
                Some((*row, *col))
            }
            RecordBody::CellRun { row, first_col, .. } => Some((*row, *first_col)),
            _ => None,
        }
    }
}

/// Decoder signature used by the registry: `(payload, codepage)`.
pub type DecodeFn = fn(&[u8], u16) -> Result<RecordBody, String>;

fn u16_at(data: &[u8], offset: usize) -> Result<u16, String> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| format!("payload too short ({} bytes, need {})", data.len(), offset + 2))
}

fn u32_at(data: &[u8], offset: usize) -> Result<u32, String> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| format!("payload too short ({} bytes, need {})", data.len(), offset + 4))
}

fn u8_at(data: &[u8], offset: usize) -> Result<u8, String> {
    data.get(offset)
        .copied()
        .ok_or_else(|| format!("payload too short ({} bytes, need {})", data.len(), offset + 1))
}

pub(crate) fn decode_known(_: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::Known)
}

pub(crate) fn decode_bof(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::Bof {
        version: u16_at(data, 0)?,
        kind: SubstreamKind::from_dt(u16_at(data, 2)?),
    })
}

pub(crate) fn decode_eof(_: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::Eof)
}

pub(crate) fn decode_bound_sheet(data: &[u8], codepage: u16) -> Result<RecordBody, String> {
    let stream_pos = u32_at(data, 0)?;
    let visibility = u8_at(data, 4)? & 0x03;
    let sheet_type = u8_at(data, 5)?;
    let (name, _) = strings::parse_biff8_short_string(data.get(6..).unwrap_or_default(), codepage)?;
    Ok(RecordBody::BoundSheet {
        stream_pos,
        visibility,
        sheet_type,
        name,
    })
}

pub(crate) fn decode_cell(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::Cell {
        row: u16_at(data, 0)?,
        col: u16_at(data, 2)?,
        xf: u16_at(data, 4)?,
    })
}

pub(crate) fn decode_cell_run(data: &[u8], _: u16) -> Result<RecordBody, String> {
    // [rw][colFirst][rgrec...][colLast]
    if data.len() < 6 {
        return Err(format!("cell run payload too short ({} bytes)", data.len()));
    }
    let row = u16_at(data, 0)?;
    let first_col = u16_at(data, 2)?;
    let last_col = u16_at(data, data.len() - 2)?;
    if last_col < first_col {
        return Err(format!("cell run columns out of order ({first_col}..{last_col})"));
    }
    Ok(RecordBody::CellRun {
        row,
        first_col,
        last_col,
    })
}

pub(crate) fn decode_formula(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::Formula {
        row: u16_at(data, 0)?,
        col: u16_at(data, 2)?,
        xf: u16_at(data, 4)?,
        flags: u16_at(data, 14)?,
    })
}

/// `RefU` [MS-XLS 2.5.207]: `[rwFirst: u16][rwLast: u16][colFirst: u8][colLast: u8]`.
pub(crate) fn decode_range_aux(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::RangeAux(CellRange {
        first_row: u16_at(data, 0)?,
        last_row: u16_at(data, 2)?,
        first_col: u16::from(u8_at(data, 4)?),
        last_col: u16::from(u8_at(data, 5)?),
    }))
}

pub(crate) fn decode_row(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::Row {
        row: u16_at(data, 0)?,
        first_col: u16_at(data, 2)?,
        last_col_excl: u16_at(data, 4)?,
    })
}

pub(crate) fn decode_dimensions(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::Dimensions {
        first_row: u32_at(data, 0)?,
        last_row_excl: u32_at(data, 4)?,
        first_col: u16_at(data, 8)?,
        last_col_excl: u16_at(data, 10)?,
    })
}

/// Name of a built-in defined name (`fBuiltin`), by its one-character code.
fn builtin_name(code: u8) -> Option<&'static str> {
    Some(match code {
        0x00 => "Consolidate_Area",
        0x01 => "Auto_Open",
        0x02 => "Auto_Close",
        0x03 => "Extract",
        0x04 => "Database",
        0x05 => "Criteria",
        0x06 => "Print_Area",
        0x07 => "Print_Titles",
        0x08 => "Recorder",
        0x09 => "Data_Form",
        0x0A => "Auto_Activate",
        0x0B => "Auto_Deactivate",
        0x0C => "Sheet_Title",
        0x0D => "_FilterDatabase",
        _ => return None,
    })
}

pub(crate) fn decode_name(data: &[u8], codepage: u16) -> Result<RecordBody, String> {
    // [grbit: u16][chKey: u8][cch: u8][cce: u16][reserved: u16][itab: u16][reserved: 4][name]
    let flags = u16_at(data, 0)?;
    let cch = usize::from(u8_at(data, 3)?);
    let itab = u16_at(data, 8)?;
    let name_flags = u8_at(data, 14)?;
    let (name, _) = strings::decode_biff8_chars(
        data.get(15..).unwrap_or_default(),
        cch,
        name_flags,
        codepage,
    )?;
    let name = if flags & NAME_FLAG_BUILTIN != 0 {
        let code = name.chars().next().map(|c| c as u32).unwrap_or(u32::MAX);
        u8::try_from(code)
            .ok()
            .and_then(builtin_name)
            .map(str::to_string)
            .unwrap_or(name)
    } else {
        name
    };
    Ok(RecordBody::Name { flags, itab, name })
}

pub(crate) fn decode_extern_sheet(data: &[u8], _: u16) -> Result<RecordBody, String> {
    let count = usize::from(u16_at(data, 0)?);
    if count > MAX_XTI_ENTRIES {
        return Err(format!("EXTERNSHEET declares {count} entries (cap {MAX_XTI_ENTRIES})"));
    }
    let body = data.get(2..).unwrap_or_default();
    if body.len() < count * 6 {
        return Err(format!(
            "EXTERNSHEET declares {count} entries but carries {} bytes",
            body.len()
        ));
    }
    let entries = body
        .chunks_exact(6)
        .take(count)
        .map(|chunk| Xti {
            supbook: u16::from_le_bytes([chunk[0], chunk[1]]),
            itab_first: i16::from_le_bytes([chunk[2], chunk[3]]),
            itab_last: i16::from_le_bytes([chunk[4], chunk[5]]),
        })
        .collect();
    Ok(RecordBody::ExternSheet(entries))
}

pub(crate) fn decode_sst(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::SharedStrings {
        total: u32_at(data, 0)?,
        unique: u32_at(data, 4)?,
    })
}

/// `CONDFMT`: `ccf` at offset 0.
pub(crate) fn decode_condfmt(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::RuleListHeader {
        rule_count: u32::from(u16_at(data, 0)?),
    })
}

/// `CONDFMT12`: a 12-byte `FrtRefHeaderU`, then `ccf`.
pub(crate) fn decode_condfmt12(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::RuleListHeader {
        rule_count: u32::from(u16_at(data, 12)?),
    })
}

/// `DVAL`: `idvMac` at offset 14.
pub(crate) fn decode_dval(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::RuleListHeader {
        rule_count: u32_at(data, 14)?,
    })
}

pub(crate) fn decode_sxview(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::PivotView {
        cache_index: u16_at(data, 14)?,
        field_count: u16_at(data, 22)?,
    })
}

pub(crate) fn decode_sxvd(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::PivotField {
        item_count: u16_at(data, 6)?,
    })
}

pub(crate) fn decode_sxidstm(data: &[u8], _: u16) -> Result<RecordBody, String> {
    Ok(RecordBody::PivotCacheId(u16_at(data, 0)?))
}

pub(crate) fn decode_merged_cells(data: &[u8], _: u16) -> Result<RecordBody, String> {
    let count = usize::from(u16_at(data, 0)?);
    let body = data.get(2..).unwrap_or_default();
    if body.len() < count * 8 {
        return Err(format!(
            "MERGEDCELLS declares {count} ranges but carries {} bytes",
            body.len()
        ));
    }
    let ranges = body
        .chunks_exact(8)
        .take(count)
        .map(|chunk| CellRange {
            first_row: u16::from_le_bytes([chunk[0], chunk[1]]),
            last_row: u16::from_le_bytes([chunk[2], chunk[3]]),
            first_col: u16::from_le_bytes([chunk[4], chunk[5]]),
            last_col: u16::from_le_bytes([chunk[6], chunk[7]]),
        })
        .collect();
    Ok(RecordBody::MergedCells(ranges))
}

/// `OBJ`: the leading `FtCmo` sub-record carries the object type and id.
pub(crate) fn decode_obj(data: &[u8], _: u16) -> Result<RecordBody, String> {
    const FT_CMO: u16 = 0x0015;
    let ft = u16_at(data, 0)?;
    if ft != FT_CMO {
        return Err(format!("OBJ does not start with FtCmo (ft=0x{ft:04X})"));
    }
    Ok(RecordBody::DrawingObject {
        object_type: u16_at(data, 4)?,
        id: u16_at(data, 6)?,
    })
}

pub(crate) fn encode_dimensions(
    first_row: u32,
    last_row_excl: u32,
    first_col: u16,
    last_col_excl: u16,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(14);
    out.extend_from_slice(&first_row.to_le_bytes());
    out.extend_from_slice(&last_row_excl.to_le_bytes());
    out.extend_from_slice(&first_col.to_le_bytes());
    out.extend_from_slice(&last_col_excl.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

pub(crate) fn encode_merged_cells(ranges: &[CellRange]) -> Result<Vec<u8>, String> {
    let count = u16::try_from(ranges.len())
        .map_err(|_| format!("{} merged ranges do not fit a u16 count", ranges.len()))?;
    let mut out = Vec::with_capacity(2 + ranges.len() * 8);
    out.extend_from_slice(&count.to_le_bytes());
    for range in ranges {
        out.extend_from_slice(&range.first_row.to_le_bytes());
        out.extend_from_slice(&range.last_row.to_le_bytes());
        out.extend_from_slice(&range.first_col.to_le_bytes());
        out.extend_from_slice(&range.last_col.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bof_substream_kind() {
        let payload = [0x00, 0x06, 0x10, 0x00, 0, 0, 0, 0];
        assert_eq!(
            decode_bof(&payload, 1252).unwrap(),
            RecordBody::Bof {
                version: 0x0600,
                kind: SubstreamKind::Worksheet
            }
        );
        assert_eq!(SubstreamKind::from_dt(0x0077), SubstreamKind::Other(0x0077));
        assert_eq!(SubstreamKind::Chart.dt(), 0x0020);
    }

    #[test]
    fn decodes_bound_sheet_name() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1234u32.to_le_bytes());
        payload.extend_from_slice(&[0x01, 0x00, 6, 0]);
        payload.extend_from_slice(b"Sheet1");
        assert_eq!(
            decode_bound_sheet(&payload, 1252).unwrap(),
            RecordBody::BoundSheet {
                stream_pos: 1234,
                visibility: 1,
                sheet_type: 0,
                name: "Sheet1".to_string()
            }
        );
    }

    #[test]
    fn decodes_local_and_builtin_names() {
        let mut payload = vec![0u8; 15];
        payload[3] = 3;
        payload[8..10].copy_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(b"Foo");
        assert_eq!(
            decode_name(&payload, 1252).unwrap(),
            RecordBody::Name {
                flags: 0,
                itab: 2,
                name: "Foo".to_string()
            }
        );

        let mut builtin = vec![0u8; 15];
        builtin[0..2].copy_from_slice(&NAME_FLAG_BUILTIN.to_le_bytes());
        builtin[3] = 1;
        builtin.push(0x06);
        let RecordBody::Name { name, itab, .. } = decode_name(&builtin, 1252).unwrap() else {
            panic!("expected NAME body");
        };
        assert_eq!(name, "Print_Area");
        assert_eq!(itab, 0);
    }

    #[test]
    fn decodes_cell_run_bounds() {
        // MULBLANK row 3, cols 1..=3
        let payload = [3, 0, 1, 0, 15, 0, 15, 0, 15, 0, 3, 0];
        assert_eq!(
            decode_cell_run(&payload, 1252).unwrap(),
            RecordBody::CellRun {
                row: 3,
                first_col: 1,
                last_col: 3
            }
        );
        assert!(decode_cell_run(&[3, 0, 5, 0, 15, 0, 1, 0], 1252).is_err());
    }

    #[test]
    fn extern_sheet_rejects_short_tables() {
        let mut payload = 2u16.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0, 0, 1, 0, 1, 0]);
        assert!(decode_extern_sheet(&payload, 1252).is_err());
        payload.extend_from_slice(&[1, 0, 0xFE, 0xFF, 0xFE, 0xFF]);
        let RecordBody::ExternSheet(entries) = decode_extern_sheet(&payload, 1252).unwrap() else {
            panic!("expected EXTERNSHEET body");
        };
        assert_eq!(entries[1].itab_first, -2);
    }

    #[test]
    fn merged_cells_encode_matches_decode() {
        let ranges = vec![
            CellRange {
                first_row: 0,
                last_row: 1,
                first_col: 0,
                last_col: 2,
            },
            CellRange {
                first_row: 5,
                last_row: 5,
                first_col: 3,
                last_col: 4,
            },
        ];
        let payload = encode_merged_cells(&ranges).unwrap();
        assert_eq!(payload.len(), 18);
        assert_eq!(
            decode_merged_cells(&payload, 1252).unwrap(),
            RecordBody::MergedCells(ranges)
        );
    }

    #[test]
    fn rule_list_headers_read_declared_counts() {
        let mut dval = vec![0u8; 18];
        dval[14..18].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(
            decode_dval(&dval, 1252).unwrap(),
            RecordBody::RuleListHeader { rule_count: 3 }
        );
        let mut condfmt12 = vec![0u8; 14];
        condfmt12[12] = 2;
        assert_eq!(
            decode_condfmt12(&condfmt12, 1252).unwrap(),
            RecordBody::RuleListHeader { rule_count: 2 }
        );
    }
}
