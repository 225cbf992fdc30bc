//! BIFF8 record ids.
//!
//! See [MS-XLS] 2.3 (record enumeration). Only records the engine classifies, finalizes or
//! lists in a validator template are named here; everything else flows through as `Opaque`.

// Stream structure.
pub const BOF: u16 = 0x0809;
/// Older `BOF` ids (the BIFF2 id also shows up in some BIFF5 writers); accepted as substream
/// open markers.
pub const BOF_BIFF5: u16 = 0x0009;
pub const BOF_BIFF3: u16 = 0x0209;
pub const BOF_BIFF4: u16 = 0x0409;
pub const EOF: u16 = 0x000A;
pub const CONTINUE: u16 = 0x003C;
pub const INDEX: u16 = 0x020B;
pub const DBCELL: u16 = 0x00D7;

// Workbook globals.
pub const INTERFACEHDR: u16 = 0x00E1;
pub const MMS: u16 = 0x00C1;
pub const INTERFACEEND: u16 = 0x00E2;
pub const WRITEACCESS: u16 = 0x005C;
pub const CODEPAGE: u16 = 0x0042;
pub const DSF: u16 = 0x0161;
pub const EXCEL9FILE: u16 = 0x01C0;
pub const TABID: u16 = 0x013D;
pub const FNGROUPCOUNT: u16 = 0x009C;
pub const WINDOWPROTECT: u16 = 0x0019;
pub const PROTECT: u16 = 0x0012;
pub const PASSWORD: u16 = 0x0013;
pub const PROT4REV: u16 = 0x01AF;
pub const PROT4REVPASS: u16 = 0x01BC;
pub const WINDOW1: u16 = 0x003D;
pub const BACKUP: u16 = 0x0040;
pub const HIDEOBJ: u16 = 0x008D;
pub const DATEMODE: u16 = 0x0022;
pub const PRECISION: u16 = 0x000E;
pub const REFRESHALL: u16 = 0x01B7;
pub const BOOKBOOL: u16 = 0x00DA;
pub const FONT: u16 = 0x0031;
pub const FORMAT: u16 = 0x041E;
pub const XF: u16 = 0x00E0;
pub const STYLE: u16 = 0x0293;
pub const PALETTE: u16 = 0x0092;
pub const USESELFS: u16 = 0x0160;
pub const BOUNDSHEET: u16 = 0x0085;
pub const COUNTRY: u16 = 0x008C;
pub const SUPBOOK: u16 = 0x01AE;
pub const EXTERNNAME: u16 = 0x0023;
pub const CRN: u16 = 0x005A;
pub const EXTERNSHEET: u16 = 0x0017;
pub const NAME: u16 = 0x0018;
pub const MSODRAWINGGROUP: u16 = 0x00EB;
pub const SST: u16 = 0x00FC;
pub const EXTSST: u16 = 0x00FF;

// Pivot cache registry (workbook globals).
pub const SXIDSTM: u16 = 0x00D5;
pub const SXVS: u16 = 0x00E3;
pub const DCONREF: u16 = 0x0051;
pub const DCONNAME: u16 = 0x0052;
pub const DCONBIN: u16 = 0x01B5;

// Worksheet settings.
pub const CALCMODE: u16 = 0x000D;
pub const CALCCOUNT: u16 = 0x000C;
pub const REFMODE: u16 = 0x000F;
pub const ITERATION: u16 = 0x0011;
pub const DELTA: u16 = 0x0010;
pub const SAVERECALC: u16 = 0x005F;
pub const PRINTHEADERS: u16 = 0x002A;
pub const PRINTGRIDLINES: u16 = 0x002B;
pub const GRIDSET: u16 = 0x0082;
pub const GUTS: u16 = 0x0080;
pub const DEFAULTROWHEIGHT: u16 = 0x0225;
pub const WSBOOL: u16 = 0x0081;
pub const HORIZONTALPAGEBREAKS: u16 = 0x001B;
pub const VERTICALPAGEBREAKS: u16 = 0x001A;
pub const HEADER: u16 = 0x0014;
pub const FOOTER: u16 = 0x0015;
pub const HCENTER: u16 = 0x0083;
pub const VCENTER: u16 = 0x0084;
pub const LEFTMARGIN: u16 = 0x0026;
pub const RIGHTMARGIN: u16 = 0x0027;
pub const TOPMARGIN: u16 = 0x0028;
pub const BOTTOMMARGIN: u16 = 0x0029;
pub const SETUP: u16 = 0x00A1;
pub const SCENPROTECT: u16 = 0x00DD;
pub const OBJPROTECT: u16 = 0x0063;
pub const DEFCOLWIDTH: u16 = 0x0055;
pub const COLINFO: u16 = 0x007D;
pub const DIMENSIONS: u16 = 0x0200;

// Cell table.
pub const ROW: u16 = 0x0208;
pub const BLANK: u16 = 0x0201;
pub const NUMBER: u16 = 0x0203;
pub const LABEL: u16 = 0x0204;
pub const BOOLERR: u16 = 0x0205;
pub const RK: u16 = 0x027E;
pub const RSTRING: u16 = 0x00D6;
pub const LABELSST: u16 = 0x00FD;
pub const MULRK: u16 = 0x00BD;
pub const MULBLANK: u16 = 0x00BE;
pub const FORMULA: u16 = 0x0006;
/// Cached string result of the preceding `FORMULA`.
pub const STRING: u16 = 0x0207;
pub const SHRFMLA: u16 = 0x04BC;
pub const ARRAY: u16 = 0x0221;
pub const TABLE: u16 = 0x0236;

// Drawing layer.
pub const MSODRAWING: u16 = 0x00EC;
pub const OBJ: u16 = 0x005D;
pub const TXO: u16 = 0x01B6;
pub const NOTE: u16 = 0x001C;

// Pivot views.
pub const SXVIEW: u16 = 0x00B0;
pub const SXVD: u16 = 0x00B1;
pub const SXVI: u16 = 0x00B2;
pub const SXIVD: u16 = 0x00B4;
pub const SXLI: u16 = 0x00B5;
pub const SXPI: u16 = 0x00B6;
pub const SXDI: u16 = 0x00C5;
pub const SXEX: u16 = 0x00F1;
pub const SXFORMAT: u16 = 0x00FB;
pub const SXVDEX: u16 = 0x0100;
pub const QSISXTAG: u16 = 0x0802;
pub const SXVIEWEX9: u16 = 0x0810;

// Window / view.
pub const PANE: u16 = 0x0041;
pub const WINDOW2: u16 = 0x023E;
pub const PLV: u16 = 0x088B;
pub const SCL: u16 = 0x00A0;
pub const SELECTION: u16 = 0x001D;

// Sheet features.
pub const MERGEDCELLS: u16 = 0x00E5;
pub const CONDFMT: u16 = 0x01B0;
pub const CF: u16 = 0x01B1;
pub const CONDFMT12: u16 = 0x0879;
pub const CF12: u16 = 0x087A;
pub const HLINK: u16 = 0x01B8;
pub const DVAL: u16 = 0x01B2;
pub const DV: u16 = 0x01BE;
pub const SHEETEXT: u16 = 0x0862;

/// Returns true for every BIFF2-BIFF8 `BOF` id.
pub fn is_bof(opcode: u16) -> bool {
    matches!(opcode, BOF | BOF_BIFF5 | BOF_BIFF3 | BOF_BIFF4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_every_bof_id() {
        for id in [0x0009, 0x0209, 0x0409, 0x0809] {
            assert!(is_bof(id), "0x{id:04X}");
        }
        assert!(!is_bof(EOF));
        assert!(!is_bof(0x0609));
    }
}
