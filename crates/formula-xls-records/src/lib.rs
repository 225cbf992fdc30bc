//! Legacy Excel 97-2003 `.xls` (BIFF8) record-stream load and save.
//!
//! The workbook stream of an `.xls` file is a flat sequence of opcode-tagged records whose
//! relationships are encoded only by adjacency and order. [`load_workbook_stream`] decodes it into
//! a cross-referenced [`DocumentGraph`]; [`save_workbook_stream`] re-linearizes the graph into the
//! same binary shape, re-splitting oversized payloads into `CONTINUE` records and patching
//! self-referential stream offsets.
//!
//! Field-level payload codecs are limited to what ownership, scoping and offset patching need;
//! everything else is carried as raw bytes.

pub mod biff;
pub mod byte_space;
pub mod error;
pub mod graph;
pub mod options;

pub use biff::assembler::{load_workbook_stream, load_workbook_stream_with, LoadResult, SubstreamAssembler};
pub use biff::bodies::{CellRange, RecordBody, SubstreamKind, Xti};
pub use biff::continuation::{
    merge_fragments, split_payload, ContinuationCoalescer, ContinuationPolicy, LogicalRecord,
    MAX_RECORD_PAYLOAD,
};
pub use biff::records::{RawRecord, RecordScanner};
pub use biff::registry::{RecordDescriptor, RecordFactory, RecordFamily};
pub use biff::streamer::{save_workbook_stream, workbook_stream_to_vec, ByteStreamer};
pub use biff::validator::{order_violations, SubstreamTemplate, SubstreamValidator, TemplateEntry};
pub use biff::workbook_context::WorkbookContext;
pub use biff::{detect_biff_version, read_workbook_stream_from_xls, write_workbook_stream_to_cfb, BiffVersion};
pub use byte_space::{BlockByteSpace, ByteSpace};
pub use error::{ContainerError, Diagnostic, DiagnosticKind, FrameError, LoadError, SaveError};
pub use graph::{DocumentGraph, Entry, Record, RecordId, Substream};
pub use options::{LoadOptions, SaveOptions};
