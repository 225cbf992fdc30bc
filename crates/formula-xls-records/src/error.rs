//! Error and diagnostic types surfaced by load/save.

use std::fmt;

use thiserror::Error;

/// A physical record header could not be framed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("truncated BIFF record header at offset {offset} (len={len})")]
    TruncatedHeader { offset: u64, len: u64 },
    #[error(
        "BIFF record 0x{opcode:04X} at offset {offset} extends past end of stream (len={len}, end={end})"
    )]
    PastEnd {
        offset: u64,
        opcode: u16,
        len: u64,
        end: u64,
    },
    #[error("BIFF record offset overflow at offset {offset}")]
    OffsetOverflow { offset: u64 },
}

impl FrameError {
    pub fn offset(&self) -> u64 {
        match self {
            FrameError::TruncatedHeader { offset, .. }
            | FrameError::PastEnd { offset, .. }
            | FrameError::OffsetOverflow { offset } => *offset,
        }
    }

    pub fn opcode(&self) -> Option<u16> {
        match self {
            FrameError::PastEnd { opcode, .. } => Some(*opcode),
            _ => None,
        }
    }
}

/// Fatal load failure. No partial graph is returned.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("empty workbook stream")]
    EmptyStream,
    #[error("workbook stream does not start with a BOF record (found 0x{opcode:04X} at offset {offset})")]
    MissingBof { offset: u64, opcode: u16 },
    #[error(
        "logical BIFF record 0x{opcode:04X} at offset {offset} exceeds max continued size ({cap} bytes)"
    )]
    ContinuedTooLarge { offset: u64, opcode: u16, cap: usize },
    #[error(
        "logical BIFF record 0x{opcode:04X} at offset {offset} exceeds max continued fragments ({cap} fragments)"
    )]
    TooManyFragments { offset: u64, opcode: u16, cap: usize },
}

impl LoadError {
    /// Stream offset of the offending record header, when known.
    pub fn offset(&self) -> Option<u64> {
        match self {
            LoadError::Frame(err) => Some(err.offset()),
            LoadError::EmptyStream => None,
            LoadError::MissingBof { offset, .. }
            | LoadError::ContinuedTooLarge { offset, .. }
            | LoadError::TooManyFragments { offset, .. } => Some(*offset),
        }
    }

    pub fn opcode(&self) -> Option<u16> {
        match self {
            LoadError::Frame(err) => err.opcode(),
            LoadError::EmptyStream => None,
            LoadError::MissingBof { opcode, .. }
            | LoadError::ContinuedTooLarge { opcode, .. }
            | LoadError::TooManyFragments { opcode, .. } => Some(*opcode),
        }
    }
}

/// Fatal save failure.
///
/// A graph produced by the assembler never trips these; they indicate a caller broke a graph
/// invariant between load and save.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("unbalanced substream `{substream}`: {detail}")]
    Unbalanced { substream: String, detail: String },
    #[error("failed to finalize record 0x{opcode:04X}: {reason}")]
    Finalize {
        opcode: u16,
        offset: Option<u64>,
        reason: String,
    },
    #[error("stream position {0} does not fit a 32-bit offset field")]
    OffsetOverflow(u64),
    #[error("failed to write workbook stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reading or writing the compound-file container around the workbook stream.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("missing workbook stream (expected `Workbook` or `Book`)")]
    MissingWorkbookStream,
    #[error("compound file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A registered record whose payload could not be interpreted; kept as raw bytes.
    MalformedPayload,
    /// A record with no eligible owner; kept in the flat sequence.
    OrphanRecord,
    /// A CONTINUE record that no preceding record claimed.
    OrphanContinuation,
    /// A text-bearing record whose continued layout could not be normalized.
    TextLayout,
    /// A BOF/EOF imbalance repaired implicitly during assembly.
    UnbalancedSubstream,
    /// A NAME record whose scope names no sheet.
    NameScope,
    /// A declared child count disagrees with the attached children.
    CountMismatch,
    /// A record synthesized by the validator.
    SynthesizedRecord,
    /// A record run moved by the validator.
    ReorderedRecord,
    /// Emitted once when the diagnostic cap is reached.
    Suppressed,
}

/// A soft failure reported alongside a successful load or validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub offset: Option<u64>,
    pub opcode: u16,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        kind: DiagnosticKind,
        offset: Option<u64>,
        opcode: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            offset,
            opcode,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => write!(
                f,
                "{:?} (record 0x{:04X} at offset {offset}): {}",
                self.kind, self.opcode, self.message
            ),
            None => write!(
                f,
                "{:?} (record 0x{:04X}): {}",
                self.kind, self.opcode, self.message
            ),
        }
    }
}

const DIAGNOSTICS_SUPPRESSED_MESSAGE: &str = "additional diagnostics suppressed";

/// Bounded diagnostic collector so a crafted stream cannot allocate unbounded warning lists.
#[derive(Debug, Clone)]
pub(crate) struct Diagnostics {
    items: Vec<Diagnostic>,
    cap: usize,
}

impl Diagnostics {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            cap,
        }
    }

    pub(crate) fn push(&mut self, diagnostic: Diagnostic) {
        if self.items.len() < self.cap {
            log::warn!("{diagnostic}");
        }
        self.push_logged(diagnostic);
    }

    /// Push a diagnostic its producer has already logged.
    pub(crate) fn push_logged(&mut self, diagnostic: Diagnostic) {
        if self.items.len() < self.cap {
            self.items.push(diagnostic);
            return;
        }
        if self.items.len() == self.cap {
            self.items.push(Diagnostic::new(
                DiagnosticKind::Suppressed,
                None,
                0,
                DIAGNOSTICS_SUPPRESSED_MESSAGE,
            ));
        }
    }

    pub(crate) fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.push(diagnostic);
        }
    }

    pub(crate) fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
