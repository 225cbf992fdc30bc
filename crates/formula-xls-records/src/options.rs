/// Options controlling how a workbook stream is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Run the [`crate::SubstreamValidator`] over the assembled graph before returning it.
    ///
    /// Without it, documents missing required records are returned as-is and may fail to open in
    /// downstream consumers.
    pub defensive: bool,
    /// Hard cap on the merged size of one logical record (primary plus CONTINUE fragments).
    pub max_logical_record_bytes: usize,
    /// Hard cap on the number of physical fragments merged into one logical record.
    pub max_logical_record_fragments: usize,
    /// Diagnostics beyond this count are dropped (a single suppression entry is kept).
    pub max_diagnostics: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            defensive: false,
            max_logical_record_bytes: 16 * 1024 * 1024,
            max_logical_record_fragments: 4096,
            max_diagnostics: 1000,
        }
    }
}

impl LoadOptions {
    pub fn defensive() -> Self {
        Self {
            defensive: true,
            ..Self::default()
        }
    }
}

/// Options controlling how a graph is streamed back to bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Re-emit unchanged plain records using the CONTINUE boundaries they were read with.
    pub preserve_fragmentation: bool,
    /// Run the finalize hooks that rebuild derived payloads (`DIMENSIONS`, `MERGEDCELLS`,
    /// `MSODRAWINGGROUP`).
    pub refresh_derived: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            preserve_fragmentation: true,
            refresh_derived: true,
        }
    }
}
