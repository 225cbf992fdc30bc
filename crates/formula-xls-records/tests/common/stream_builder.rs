#![allow(dead_code)]

use std::io::{Cursor, Write};

use formula_xls_records::biff::opcodes::*;

// This builder writes just enough BIFF8 to exercise the record engine. Payload helpers only fill
// the fields the engine reads; everything else stays zeroed.
pub const BOF_VERSION_BIFF8: u16 = 0x0600;
pub const BOF_DT_WORKBOOK_GLOBALS: u16 = 0x0005;
pub const BOF_DT_WORKSHEET: u16 = 0x0010;
pub const BOF_DT_CHART: u16 = 0x0020;

const OBJ_TYPE_CHART: u16 = 0x0005;
const OBJ_TYPE_TEXT_BOX: u16 = 0x0006;

/// Appends physical records to an in-memory workbook stream.
#[derive(Debug, Default, Clone)]
pub struct StreamBuilder {
    out: Vec<u8>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn record(&mut self, id: u16, data: &[u8]) -> &mut Self {
        self.out.extend_from_slice(&id.to_le_bytes());
        self.out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        self.out.extend_from_slice(data);
        self
    }

    /// Write `fragments[0]` under `id` and the rest as `CONTINUE` records.
    pub fn continued(&mut self, id: u16, fragments: &[&[u8]]) -> &mut Self {
        for (i, fragment) in fragments.iter().enumerate() {
            self.record(if i == 0 { id } else { CONTINUE }, fragment);
        }
        self
    }

    pub fn bof(&mut self, dt: u16) -> &mut Self {
        self.record(BOF, &bof(dt))
    }

    pub fn eof(&mut self) -> &mut Self {
        self.record(EOF, &[])
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.extend_from_slice(bytes);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.out.clone()
    }
}

pub fn bof(dt: u16) -> [u8; 16] {
    // [0..2] BIFF version, [2..4] substream type (dt), then build/year metadata.
    let mut out = [0u8; 16];
    out[0..2].copy_from_slice(&BOF_VERSION_BIFF8.to_le_bytes());
    out[2..4].copy_from_slice(&dt.to_le_bytes());
    out[4..6].copy_from_slice(&0x0DBBu16.to_le_bytes());
    out[6..8].copy_from_slice(&0x07CCu16.to_le_bytes());
    out
}

pub fn codepage(cp: u16) -> Vec<u8> {
    cp.to_le_bytes().to_vec()
}

pub fn bound_sheet(lb_ply_pos: u32, name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&lb_ply_pos.to_le_bytes());
    out.extend_from_slice(&[0, 0]); // visible worksheet
    out.push(name.len() as u8);
    out.push(0);
    out.extend_from_slice(name.as_bytes());
    out
}

/// `NAME` with a compressed 8-bit name; `itab` is 0 for workbook scope.
pub fn name(itab: u16, text: &str) -> Vec<u8> {
    let mut out = vec![0u8; 14];
    out[3] = text.len() as u8;
    out[8..10].copy_from_slice(&itab.to_le_bytes());
    out.push(0);
    out.extend_from_slice(text.as_bytes());
    out
}

pub fn extern_sheet(entries: &[(u16, i16, i16)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for &(supbook, first, last) in entries {
        out.extend_from_slice(&supbook.to_le_bytes());
        out.extend_from_slice(&first.to_le_bytes());
        out.extend_from_slice(&last.to_le_bytes());
    }
    out
}

/// `SST` with compressed strings.
pub fn sst(strings: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    for s in strings {
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
        out.push(0);
        out.extend_from_slice(s.as_bytes());
    }
    out
}

/// `EXTSST` with `buckets` zeroed entries.
pub fn ext_sst(dsst: u16, buckets: usize) -> Vec<u8> {
    let mut out = dsst.to_le_bytes().to_vec();
    out.extend(std::iter::repeat(0u8).take(buckets * 8));
    out
}

pub fn number(row: u16, col: u16, value: f64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&row.to_le_bytes());
    out.extend_from_slice(&col.to_le_bytes());
    out.extend_from_slice(&15u16.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out
}

pub fn label_sst(row: u16, col: u16, isst: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&row.to_le_bytes());
    out.extend_from_slice(&col.to_le_bytes());
    out.extend_from_slice(&15u16.to_le_bytes());
    out.extend_from_slice(&isst.to_le_bytes());
    out
}

/// `FORMULA` with a cached string result (so a `STRING` record follows) and no tokens.
pub fn formula(row: u16, col: u16) -> Vec<u8> {
    let mut out = vec![0u8; 22];
    out[0..2].copy_from_slice(&row.to_le_bytes());
    out[2..4].copy_from_slice(&col.to_le_bytes());
    out[4..6].copy_from_slice(&15u16.to_le_bytes());
    out[12..14].copy_from_slice(&0xFFFFu16.to_le_bytes());
    out
}

pub fn string_result(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(text.len() as u16).to_le_bytes());
    out.push(0);
    out.extend_from_slice(text.as_bytes());
    out
}

pub fn row(row: u16, first_col: u16, last_col_excl: u16) -> Vec<u8> {
    let mut out = vec![0u8; 16];
    out[0..2].copy_from_slice(&row.to_le_bytes());
    out[2..4].copy_from_slice(&first_col.to_le_bytes());
    out[4..6].copy_from_slice(&last_col_excl.to_le_bytes());
    out[6..8].copy_from_slice(&0x00FFu16.to_le_bytes());
    out
}

pub fn dimensions(first_row: u32, last_row_excl: u32, first_col: u16, last_col_excl: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&first_row.to_le_bytes());
    out.extend_from_slice(&last_row_excl.to_le_bytes());
    out.extend_from_slice(&first_col.to_le_bytes());
    out.extend_from_slice(&last_col_excl.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// `MERGEDCELLS` from `(first_row, last_row, first_col, last_col)` ranges.
pub fn merged_cells(ranges: &[(u16, u16, u16, u16)]) -> Vec<u8> {
    let mut out = (ranges.len() as u16).to_le_bytes().to_vec();
    for &(r0, r1, c0, c1) in ranges {
        for v in [r0, r1, c0, c1] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

pub fn wsbool() -> Vec<u8> {
    vec![0xC1, 0x04]
}

pub fn window2() -> Vec<u8> {
    let mut out = vec![0u8; 18];
    out[0..2].copy_from_slice(&0x06B6u16.to_le_bytes());
    out[6] = 0x40;
    out
}

pub fn pane() -> Vec<u8> {
    let mut out = vec![0u8; 10];
    out[0..2].copy_from_slice(&1u16.to_le_bytes());
    out[2..4].copy_from_slice(&1u16.to_le_bytes());
    out
}

pub fn selection() -> Vec<u8> {
    vec![3, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]
}

/// `OBJ` with just an `FtCmo` subrecord.
pub fn obj(object_type: u16, id: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0x0015u16.to_le_bytes());
    out.extend_from_slice(&0x0012u16.to_le_bytes());
    out.extend_from_slice(&object_type.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&[0u8; 14]);
    out.extend_from_slice(&[0u8; 4]); // ftEnd
    out
}

pub fn chart_obj(id: u16) -> Vec<u8> {
    obj(OBJ_TYPE_CHART, id)
}

pub fn text_box_obj(id: u16) -> Vec<u8> {
    obj(OBJ_TYPE_TEXT_BOX, id)
}

/// `TXO` fragments: fixed part, one compressed text fragment, one 16-byte run fragment.
pub fn txo_fragments(text: &str) -> Vec<Vec<u8>> {
    let mut primary = vec![0u8; 18];
    primary[10..12].copy_from_slice(&(text.len() as u16).to_le_bytes());
    primary[12..14].copy_from_slice(&16u16.to_le_bytes());
    let mut chars = vec![0u8];
    chars.extend_from_slice(text.as_bytes());
    let mut runs = vec![0u8; 16];
    runs[0..2].copy_from_slice(&0u16.to_le_bytes());
    runs[8..10].copy_from_slice(&(text.len() as u16).to_le_bytes());
    vec![primary, chars, runs]
}

pub fn condfmt(rule_count: u16) -> Vec<u8> {
    let mut out = vec![0u8; 14];
    out[0..2].copy_from_slice(&rule_count.to_le_bytes());
    out
}

pub fn condfmt12(rule_count: u16) -> Vec<u8> {
    let mut out = vec![0u8; 20];
    out[0..2].copy_from_slice(&CONDFMT12.to_le_bytes());
    out[12..14].copy_from_slice(&rule_count.to_le_bytes());
    out
}

pub fn cf() -> Vec<u8> {
    vec![1, 3, 0, 0, 0, 0, 0xFF, 0x3F, 0x00, 0x00, 0x00, 0x00]
}

pub fn sxview(field_count: u16) -> Vec<u8> {
    let mut out = vec![0u8; 44];
    out[22..24].copy_from_slice(&field_count.to_le_bytes());
    out
}

pub fn sxvd(item_count: u16) -> Vec<u8> {
    let mut out = vec![0u8; 10];
    out[0..2].copy_from_slice(&1u16.to_le_bytes());
    out[6..8].copy_from_slice(&item_count.to_le_bytes());
    out
}

pub fn sxvi() -> Vec<u8> {
    vec![0u8; 8]
}

/// `MSODRAWINGGROUP` holding an `OfficeArtDggContainer` with an `FDGG` block.
pub fn drawing_group(cdg_saved: u32) -> Vec<u8> {
    let mut out = vec![0u8; 32];
    out[0..2].copy_from_slice(&0x000Fu16.to_le_bytes());
    out[2..4].copy_from_slice(&0xF000u16.to_le_bytes());
    out[4..8].copy_from_slice(&24u32.to_le_bytes());
    out[10..12].copy_from_slice(&0xF006u16.to_le_bytes());
    out[12..16].copy_from_slice(&16u32.to_le_bytes());
    out[28..32].copy_from_slice(&cdg_saved.to_le_bytes());
    out
}

/// Wrap a workbook stream in an in-memory compound file.
pub fn xls_bytes(workbook_stream: &[u8]) -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut ole = cfb::CompoundFile::create(cursor).expect("create cfb");
    {
        let mut stream = ole.create_stream("Workbook").expect("Workbook stream");
        stream
            .write_all(workbook_stream)
            .expect("write Workbook stream");
    }
    ole.into_inner().into_inner()
}

/// A two-sheet workbook touching every adjacency family the engine tracks.
///
/// `BOUNDSHEET` positions and `EXTSST` buckets are left zeroed; saving fills them in.
pub fn rich_workbook() -> Vec<u8> {
    let mut b = StreamBuilder::new();
    b.bof(BOF_DT_WORKBOOK_GLOBALS)
        .record(CODEPAGE, &codepage(1252))
        .record(WINDOW1, &[0u8; 18])
        .record(DATEMODE, &[0, 0])
        .record(FONT, &[0u8; 20])
        .record(XF, &[0u8; 20])
        .record(BOUNDSHEET, &bound_sheet(0, "Data"))
        .record(BOUNDSHEET, &bound_sheet(0, "Pivot"))
        .record(EXTERNSHEET, &extern_sheet(&[(0, 0, 0), (0, 1, 1)]))
        .record(NAME, &name(0, "Total"))
        .record(NAME, &name(2, "Local"))
        .record(MSODRAWINGGROUP, &drawing_group(1))
        .record(SST, &sst(&["alpha", "beta", "gamma"]))
        .record(EXTSST, &ext_sst(8, 1))
        .eof();

    let txo = txo_fragments("note");
    let txo: Vec<&[u8]> = txo.iter().map(Vec::as_slice).collect();
    b.bof(BOF_DT_WORKSHEET)
        .record(WSBOOL, &wsbool())
        .record(DIMENSIONS, &dimensions(0, 3, 0, 2))
        .record(ROW, &row(0, 0, 2))
        .record(NUMBER, &number(0, 0, 1.0))
        .record(LABELSST, &label_sst(0, 1, 2))
        .record(FORMULA, &formula(2, 1))
        .record(STRING, &string_result("x"))
        .record(MSODRAWING, &[0u8; 24])
        .record(OBJ, &text_box_obj(1))
        .continued(TXO, &txo)
        .record(CONTINUE, &[0u8; 12])
        .record(MSODRAWING, &[0u8; 16])
        .record(OBJ, &chart_obj(2))
        .bof(BOF_DT_CHART)
        .record(0x1002, &[0u8; 16])
        .eof()
        .record(WINDOW2, &window2())
        .record(MERGEDCELLS, &merged_cells(&[(0, 1, 0, 1)]))
        .record(CONDFMT12, &condfmt12(1))
        .record(CF12, &[0u8; 8])
        .record(CONDFMT, &condfmt(2))
        .record(CF, &cf())
        .record(CF, &cf())
        .eof();

    b.bof(BOF_DT_WORKSHEET)
        .record(WSBOOL, &wsbool())
        .record(SXVIEW, &sxview(1))
        .record(SXVD, &sxvd(2))
        .record(SXVI, &sxvi())
        .record(SXVI, &sxvi())
        .record(SXIVD, &[0, 0])
        .record(WINDOW2, &window2())
        .eof();
    b.build()
}
