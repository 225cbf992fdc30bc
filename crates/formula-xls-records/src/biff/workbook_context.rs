//! Workbook-global tables built while the globals substream is assembled.
//!
//! Records in the globals substream that other parts of the document address by position
//! (defined names by `PtgName` index, `EXTERNSHEET` entries by `ixti`, sheets by `BOUNDSHEET`
//! order) are indexed here. Every table stores [`RecordId`]s into the globals substream's arena,
//! so reordering the globals record sequence never invalidates them.

use crate::graph::RecordId;

use super::bodies::Xti;

/// BIFF8 writers almost always declare Windows-1252 when no `CODEPAGE` record is present.
pub const DEFAULT_CODEPAGE: u16 = 1252;

/// A `SUPBOOK` record and the `EXTERNNAME` / `CRN` records that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupBookEntry {
    pub record: RecordId,
    pub details: Vec<RecordId>,
}

/// An `SXIDSTM` pivot-cache declaration and its source description records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotCacheEntry {
    pub record: RecordId,
    /// Stream id of the cache storage (`idstm`), when the record decoded.
    pub stream_id: Option<u16>,
    pub details: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkbookContext {
    pub codepage: u16,
    /// Every `NAME` record in encounter order; `PtgName` indices are 1-based into this list.
    pub names: Vec<RecordId>,
    /// `NAME` records scoped to the workbook (`itab == 0`).
    pub global_names: Vec<RecordId>,
    /// Sheet-scoped `NAME` records whose `itab` names no sheet substream.
    pub unresolved_local_names: Vec<RecordId>,
    /// `EXTERNSHEET` XTI entries, addressed by position (`ixti`).
    pub extern_sheets: Vec<Xti>,
    pub extern_sheet_records: Vec<RecordId>,
    pub supbooks: Vec<SupBookEntry>,
    pub sst: Option<RecordId>,
    pub ext_sst: Option<RecordId>,
    pub fonts: Vec<RecordId>,
    pub formats: Vec<RecordId>,
    pub xfs: Vec<RecordId>,
    pub styles: Vec<RecordId>,
    pub drawing_group: Option<RecordId>,
    pub pivot_caches: Vec<PivotCacheEntry>,
    /// `BOUNDSHEET` records in order; the n-th one describes the n-th sheet substream.
    pub bound_sheets: Vec<RecordId>,
}

impl Default for WorkbookContext {
    fn default() -> Self {
        Self {
            codepage: DEFAULT_CODEPAGE,
            names: Vec::new(),
            global_names: Vec::new(),
            unresolved_local_names: Vec::new(),
            extern_sheets: Vec::new(),
            extern_sheet_records: Vec::new(),
            supbooks: Vec::new(),
            sst: None,
            ext_sst: None,
            fonts: Vec::new(),
            formats: Vec::new(),
            xfs: Vec::new(),
            styles: Vec::new(),
            drawing_group: None,
            pivot_caches: Vec::new(),
            bound_sheets: Vec::new(),
        }
    }
}

impl WorkbookContext {
    /// Resolve a 1-based `PtgName` index.
    pub fn name_by_index(&self, index: u32) -> Option<RecordId> {
        let index = usize::try_from(index).ok()?.checked_sub(1)?;
        self.names.get(index).copied()
    }

    pub fn extern_sheet(&self, ixti: u16) -> Option<&Xti> {
        self.extern_sheets.get(usize::from(ixti))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_indices_are_one_based() {
        let mut ctx = WorkbookContext::default();
        ctx.names = vec![RecordId(4), RecordId(9)];
        assert_eq!(ctx.name_by_index(0), None);
        assert_eq!(ctx.name_by_index(1), Some(RecordId(4)));
        assert_eq!(ctx.name_by_index(2), Some(RecordId(9)));
        assert_eq!(ctx.name_by_index(3), None);
    }

    #[test]
    fn clear_restores_default_codepage() {
        let mut ctx = WorkbookContext {
            codepage: 932,
            ..Default::default()
        };
        ctx.extern_sheets.push(Xti {
            supbook: 0,
            itab_first: 0,
            itab_last: 0,
        });
        ctx.clear();
        assert_eq!(ctx, WorkbookContext::default());
    }
}
