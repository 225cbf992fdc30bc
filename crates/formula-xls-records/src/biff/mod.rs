//! BIFF8 record-stream load/save.
//!
//! Load: [`ByteSpace`](crate::byte_space::ByteSpace) → [`records::RecordScanner`] →
//! [`continuation::ContinuationCoalescer`] → [`assembler::SubstreamAssembler`] →
//! [`DocumentGraph`](crate::graph::DocumentGraph), optionally repaired by
//! [`validator::SubstreamValidator`]. Save: [`streamer::ByteStreamer`].

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::ContainerError;

pub mod assembler;
pub mod bodies;
pub mod continuation;
pub mod opcodes;
pub mod records;
pub mod registry;
pub mod streamer;
pub(crate) mod strings;
pub mod validator;
pub mod workbook_context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiffVersion {
    Biff5,
    Biff8,
}

// BIFF version numbers stored in the BOF record payload.
const BOF_VERSION_BIFF5: u16 = 0x0500;
const BOF_VERSION_BIFF8: u16 = 0x0600;
// Some BIFF5 producers write version 0 with a worksheet dt.
const BOF_DT_WORKSHEET: u16 = 0x1000;

/// Stream names tried, in order, when opening the workbook stream of a compound file.
const WORKBOOK_STREAM_CANDIDATES: [&str; 4] = ["/Workbook", "/Book", "Workbook", "Book"];

/// Guess the BIFF version from the leading `BOF`. Anything unrecognized is treated as BIFF8.
pub fn detect_biff_version(workbook_stream: &[u8]) -> BiffVersion {
    let Ok((opcode, length, _)) = records::read_header(workbook_stream, 0) else {
        return BiffVersion::Biff8;
    };
    if !opcodes::is_bof(opcode) {
        return BiffVersion::Biff8;
    }
    let data = workbook_stream
        .get(4..4 + usize::from(length))
        .unwrap_or_default();
    let Some(version) = data.get(0..2).map(|v| u16::from_le_bytes([v[0], v[1]])) else {
        return BiffVersion::Biff8;
    };
    let dt = data
        .get(2..4)
        .map(|v| u16::from_le_bytes([v[0], v[1]]))
        .unwrap_or(0);

    match version {
        BOF_VERSION_BIFF5 => BiffVersion::Biff5,
        BOF_VERSION_BIFF8 => BiffVersion::Biff8,
        0 if dt == BOF_DT_WORKSHEET => BiffVersion::Biff5,
        _ => BiffVersion::Biff8,
    }
}

/// Read the workbook stream bytes from an `.xls` compound file.
pub fn read_workbook_stream_from_xls(path: &Path) -> Result<Vec<u8>, ContainerError> {
    let mut comp = cfb::open(path)?;
    read_workbook_stream(&mut comp)
}

/// Read the workbook stream bytes from an already opened compound file.
pub fn read_workbook_stream<R: Read + Seek>(
    comp: &mut cfb::CompoundFile<R>,
) -> Result<Vec<u8>, ContainerError> {
    let mut stream = open_xls_workbook_stream(comp)?;
    let mut workbook_stream = Vec::new();
    stream.read_to_end(&mut workbook_stream)?;
    Ok(workbook_stream)
}

pub fn open_xls_workbook_stream<R: Read + Seek>(
    comp: &mut cfb::CompoundFile<R>,
) -> Result<cfb::Stream<R>, ContainerError> {
    for candidate in WORKBOOK_STREAM_CANDIDATES {
        if let Ok(stream) = comp.open_stream(candidate) {
            return Ok(stream);
        }
    }
    Err(ContainerError::MissingWorkbookStream)
}

/// Create a new compound file at `path` holding `workbook_stream` as its `Workbook` stream.
pub fn write_workbook_stream_to_cfb(path: &Path, workbook_stream: &[u8]) -> Result<(), ContainerError> {
    let mut comp = cfb::create(path)?;
    {
        let mut stream = comp.create_stream("Workbook")?;
        stream.write_all(workbook_stream)?;
        stream.flush()?;
    }
    comp.flush()?;
    Ok(())
}
