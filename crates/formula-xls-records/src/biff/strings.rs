//! BIFF8 string helpers, including continued-string normalization.
//!
//! When a BIFF8 string's character array crosses a `CONTINUE` boundary, Excel inserts a 1-byte
//! option flags prefix at the start of the continued fragment; only its `fHighByte` bit matters,
//! and it may switch the encoding of the remaining characters. Two records carry such strings in
//! the engine's scope:
//!
//! - `SST`: many `XLUnicodeRichExtendedString`s, split anywhere except inside a string header.
//! - `TXO`: the text lives in the continuation records following the fixed-size primary record,
//!   each of which starts with a flags byte, followed by the formatting runs.
//!
//! The coalescer turns such records into a *canonical* payload: continuation flag bytes are
//! removed and every string is stored in a single encoding (mixed strings are widened to UTF-16).
//! The streamer inverts that with [`split_sst`] / [`split_txo`], re-inserting flag bytes wherever a
//! new fragment starts inside character data.

use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};

use encoding_rs::{
    Encoding, BIG5, EUC_KR, GBK, SHIFT_JIS, UTF_8, WINDOWS_1250, WINDOWS_1251, WINDOWS_1252,
    WINDOWS_1253, WINDOWS_1254, WINDOWS_1255, WINDOWS_1256, WINDOWS_1257, WINDOWS_1258,
    WINDOWS_874,
};

// BIFF8 string option flags. See [MS-XLS] 2.5.293 and 2.5.268.
pub(crate) const STR_FLAG_HIGH_BYTE: u8 = 0x01;
const STR_FLAG_EXT: u8 = 0x04;
const STR_FLAG_RICH_TEXT: u8 = 0x08;

/// `SST` fixed header: `[cstTotal: u32][cstUnique: u32]`.
const SST_HEADER_LEN: usize = 8;

/// Offsets inside the fixed part of a `TXO` record. See [MS-XLS] 2.4.329.
const TXO_CCH_TEXT_OFFSET: usize = 10;
const TXO_CB_RUNS_OFFSET: usize = 12;
const TXO_FMLA_OFFSET: usize = 16;

pub(crate) fn encoding_for_codepage(codepage: u16) -> Option<&'static Encoding> {
    Some(match codepage as u32 {
        874 => WINDOWS_874,
        932 => SHIFT_JIS,
        936 => GBK,
        949 => EUC_KR,
        950 => BIG5,
        1250 => WINDOWS_1250,
        1251 => WINDOWS_1251,
        1252 => WINDOWS_1252,
        1253 => WINDOWS_1253,
        1254 => WINDOWS_1254,
        1255 => WINDOWS_1255,
        1256 => WINDOWS_1256,
        1257 => WINDOWS_1257,
        1258 => WINDOWS_1258,
        65001 => UTF_8,
        _ => return None,
    })
}

pub(crate) fn decode_ansi(codepage: u16, bytes: &[u8]) -> String {
    if let Some(encoding) = encoding_for_codepage(codepage) {
        let (cow, _, _) = encoding.decode(bytes);
        return cow.into_owned();
    }

    warn_unsupported_codepage(codepage);

    // Lossless byte-to-Unicode mapping keeps ASCII intact for codepages `encoding_rs` lacks
    // (including 1200, the UTF-16 marker BIFF8 writers use).
    bytes.iter().copied().map(char::from).collect()
}

fn warn_unsupported_codepage(codepage: u16) {
    static WARNED: OnceLock<Mutex<BTreeSet<u16>>> = OnceLock::new();

    let warned = WARNED.get_or_init(|| Mutex::new(BTreeSet::new()));
    let mut warned = match warned.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if warned.insert(codepage) {
        log::debug!(
            "unsupported BIFF CODEPAGE {codepage}; decoding 8-bit strings using lossless byte-to-Unicode mapping"
        );
    }
}

/// Decode `cch` characters of a BIFF8 string body whose option flags were already read.
pub(crate) fn decode_biff8_chars(
    input: &[u8],
    cch: usize,
    flags: u8,
    codepage: u16,
) -> Result<(String, usize), String> {
    if flags & STR_FLAG_HIGH_BYTE != 0 {
        let len = cch
            .checked_mul(2)
            .ok_or_else(|| "string length overflow".to_string())?;
        let bytes = input
            .get(..len)
            .ok_or_else(|| "unexpected end of string".to_string())?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok((String::from_utf16_lossy(&units), len))
    } else {
        let bytes = input
            .get(..cch)
            .ok_or_else(|| "unexpected end of string".to_string())?;
        Ok((decode_ansi(codepage, bytes), cch))
    }
}

/// BIFF8 `ShortXLUnicodeString` [MS-XLS 2.5.240]: `[cch: u8][flags: u8][chars]`.
pub(crate) fn parse_biff8_short_string(
    input: &[u8],
    codepage: u16,
) -> Result<(String, usize), String> {
    if input.len() < 2 {
        return Err("unexpected end of string".to_string());
    }
    let cch = input[0] as usize;
    let flags = input[1];
    let (text, consumed) = decode_biff8_chars(&input[2..], cch, flags, codepage)?;
    Ok((text, 2 + consumed))
}

/// Read cursor over the physical fragments of one logical record.
struct FragmentCursor<'a> {
    fragments: &'a [&'a [u8]],
    frag_idx: usize,
    offset: usize,
}

impl<'a> FragmentCursor<'a> {
    fn new(fragments: &'a [&'a [u8]], frag_idx: usize) -> Self {
        Self {
            fragments,
            frag_idx,
            offset: 0,
        }
    }

    fn remaining_in_fragment(&self) -> usize {
        self.fragments
            .get(self.frag_idx)
            .map(|f| f.len().saturating_sub(self.offset))
            .unwrap_or(0)
    }

    fn at_end(&self) -> bool {
        self.remaining_in_fragment() == 0
            && self
                .fragments
                .get(self.frag_idx.saturating_add(1)..)
                .map_or(true, |rest| rest.iter().all(|f| f.is_empty()))
    }

    fn advance_fragment(&mut self) -> Result<(), String> {
        self.frag_idx = self
            .frag_idx
            .checked_add(1)
            .ok_or_else(|| "fragment index overflow".to_string())?;
        self.offset = 0;
        if self.frag_idx >= self.fragments.len() {
            return Err("unexpected end of record".to_string());
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        loop {
            let frag = self
                .fragments
                .get(self.frag_idx)
                .ok_or_else(|| "unexpected end of record".to_string())?;
            if self.offset < frag.len() {
                let b = frag[self.offset];
                self.offset += 1;
                return Ok(b);
            }
            self.advance_fragment()?;
        }
    }

    fn read_u16_le(&mut self) -> Result<u16, String> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read_u32_le(&mut self) -> Result<u32, String> {
        let lo = self.read_u16_le()?;
        let hi = self.read_u16_le()?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    fn read_exact_from_current(&mut self, n: usize) -> Result<&'a [u8], String> {
        let frag = self
            .fragments
            .get(self.frag_idx)
            .ok_or_else(|| "unexpected end of record".to_string())?;
        let end = self
            .offset
            .checked_add(n)
            .ok_or_else(|| "offset overflow".to_string())?;
        if end > frag.len() {
            return Err("unexpected end of record".to_string());
        }
        let out = &frag[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    /// Copy `n` bytes that carry no continuation flags (headers, runs, `ExtRst`).
    fn copy_plain(&mut self, mut n: usize, out: &mut Vec<u8>) -> Result<(), String> {
        while n > 0 {
            if self.remaining_in_fragment() == 0 {
                self.advance_fragment()?;
                continue;
            }
            let take = n.min(self.remaining_in_fragment());
            out.extend_from_slice(self.read_exact_from_current(take)?);
            n -= take;
        }
        Ok(())
    }

    fn copy_rest(&mut self, out: &mut Vec<u8>) {
        while let Some(frag) = self.fragments.get(self.frag_idx) {
            if let Some(rest) = frag.get(self.offset..) {
                out.extend_from_slice(rest);
            }
            self.frag_idx += 1;
            self.offset = 0;
        }
    }

    /// Read `cch` characters, consuming the flags byte at the start of every fragment entered
    /// while characters remain. Returns the characters in a single encoding and whether that
    /// encoding is UTF-16.
    fn read_continued_chars(&mut self, cch: usize, flags: u8) -> Result<(Vec<u8>, bool), String> {
        let mut is_unicode = flags & STR_FLAG_HIGH_BYTE != 0;
        let mut segments: Vec<(bool, &'a [u8])> = Vec::new();
        let mut remaining_chars = cch;

        while remaining_chars > 0 {
            if self.remaining_in_fragment() == 0 {
                self.advance_fragment()?;
                let cont_flags = self.read_u8()?;
                is_unicode = cont_flags & STR_FLAG_HIGH_BYTE != 0;
                continue;
            }

            let bytes_per_char = if is_unicode { 2 } else { 1 };
            let available_chars = self.remaining_in_fragment() / bytes_per_char;
            if available_chars == 0 {
                return Err("string continuation split mid-character".to_string());
            }
            let take_chars = remaining_chars.min(available_chars);
            let bytes = self.read_exact_from_current(take_chars * bytes_per_char)?;
            segments.push((is_unicode, bytes));
            remaining_chars -= take_chars;
        }

        let widen = segments.iter().any(|(unicode, _)| *unicode)
            || (cch == 0 && flags & STR_FLAG_HIGH_BYTE != 0);
        let mut out = Vec::new();
        out.try_reserve_exact(if widen { cch * 2 } else { cch })
            .map_err(|_| "allocation failed (continued string)".to_string())?;
        for (unicode, bytes) in segments {
            if widen && !unicode {
                // Compressed BIFF8 characters are the low bytes of UTF-16 code units.
                for &b in bytes {
                    out.extend_from_slice(&[b, 0]);
                }
            } else {
                out.extend_from_slice(bytes);
            }
        }
        Ok((out, widen))
    }
}

fn read_u16_at(bytes: &[u8], offset: usize) -> Option<u16> {
    let b = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Merge the physical fragments of an `SST` record into its canonical payload.
pub(crate) fn canonicalize_sst(fragments: &[&[u8]]) -> Result<Vec<u8>, String> {
    let mut cursor = FragmentCursor::new(fragments, 0);
    let total: usize = fragments.iter().map(|f| f.len()).sum();
    let mut out = Vec::new();
    out.try_reserve(total)
        .map_err(|_| "allocation failed (SST)".to_string())?;

    cursor.copy_plain(SST_HEADER_LEN, &mut out)?;
    let cst_unique = u32::from_le_bytes([out[4], out[5], out[6], out[7]]);

    for _ in 0..cst_unique {
        if cursor.at_end() {
            break;
        }
        // XLUnicodeRichExtendedString [MS-XLS 2.5.293].
        let cch = cursor.read_u16_le()?;
        let flags = cursor.read_u8()?;
        let runs = if flags & STR_FLAG_RICH_TEXT != 0 {
            Some(cursor.read_u16_le()?)
        } else {
            None
        };
        let ext_len = if flags & STR_FLAG_EXT != 0 {
            Some(cursor.read_u32_le()?)
        } else {
            None
        };

        let (chars, unicode) = cursor.read_continued_chars(cch as usize, flags)?;
        let flags = if unicode {
            flags | STR_FLAG_HIGH_BYTE
        } else {
            flags & !STR_FLAG_HIGH_BYTE
        };

        out.extend_from_slice(&cch.to_le_bytes());
        out.push(flags);
        if let Some(runs) = runs {
            out.extend_from_slice(&runs.to_le_bytes());
        }
        if let Some(ext_len) = ext_len {
            out.extend_from_slice(&ext_len.to_le_bytes());
        }
        out.extend_from_slice(&chars);

        let extra = usize::from(runs.unwrap_or(0)) * 4 + ext_len.unwrap_or(0) as usize;
        cursor.copy_plain(extra, &mut out)?;
    }

    cursor.copy_rest(&mut out);
    Ok(out)
}

/// Accumulates output fragments no larger than `max` bytes.
struct ChunkWriter {
    chunks: Vec<Vec<u8>>,
    max: usize,
}

impl ChunkWriter {
    fn new(max: usize) -> Self {
        Self {
            chunks: vec![Vec::new()],
            max,
        }
    }

    fn current(&mut self) -> &mut Vec<u8> {
        if self.chunks.is_empty() {
            self.chunks.push(Vec::new());
        }
        let last = self.chunks.len() - 1;
        &mut self.chunks[last]
    }

    fn room(&self) -> usize {
        let used = self.chunks.last().map_or(0, |c| c.len());
        self.max.saturating_sub(used)
    }

    fn position(&self) -> (usize, usize) {
        let idx = self.chunks.len().saturating_sub(1);
        (idx, self.chunks.last().map_or(0, |c| c.len()))
    }

    fn new_chunk(&mut self) {
        self.chunks.push(Vec::new());
    }

    /// Write bytes that may be split at any byte boundary.
    fn write_plain(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.room() == 0 {
                self.new_chunk();
            }
            let take = bytes.len().min(self.room());
            self.current().extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }

    /// Write character data; every new fragment opened mid-string starts with `flags`.
    fn write_chars(&mut self, mut bytes: &[u8], bytes_per_char: usize, flags: u8) {
        while !bytes.is_empty() {
            let room = self.room() / bytes_per_char * bytes_per_char;
            if room == 0 {
                self.new_chunk();
                self.current().push(flags);
                continue;
            }
            let take = bytes.len().min(room);
            self.current().extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }
}

/// Physical layout of a canonical `SST` payload re-split for emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SstFragments {
    pub(crate) fragments: Vec<Vec<u8>>,
    /// `(fragment index, offset within fragment payload)` of every string header, in order.
    pub(crate) string_starts: Vec<(usize, usize)>,
}

/// Split a canonical `SST` payload into fragments of at most `max` bytes.
///
/// String headers are never split, and each fragment that begins inside a character array starts
/// with a flags byte.
pub(crate) fn split_sst(payload: &[u8], max: usize) -> Result<SstFragments, String> {
    if max < 16 {
        return Err(format!("fragment size {max} too small for SST strings"));
    }
    let header = payload
        .get(..SST_HEADER_LEN)
        .ok_or_else(|| "SST payload shorter than its header".to_string())?;
    let cst_unique = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut writer = ChunkWriter::new(max);
    writer.write_plain(header);
    let mut string_starts = Vec::new();
    let mut pos = SST_HEADER_LEN;

    for _ in 0..cst_unique {
        if pos >= payload.len() {
            break;
        }
        let cch = read_u16_at(payload, pos).ok_or_else(|| "truncated SST string header".to_string())?
            as usize;
        let flags = *payload
            .get(pos + 2)
            .ok_or_else(|| "truncated SST string header".to_string())?;
        let mut header_len = 3;
        let runs = if flags & STR_FLAG_RICH_TEXT != 0 {
            let runs = read_u16_at(payload, pos + header_len)
                .ok_or_else(|| "truncated SST string header".to_string())?;
            header_len += 2;
            usize::from(runs)
        } else {
            0
        };
        let ext_len = if flags & STR_FLAG_EXT != 0 {
            let b = payload
                .get(pos + header_len..pos + header_len + 4)
                .ok_or_else(|| "truncated SST string header".to_string())?;
            header_len += 4;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        } else {
            0
        };
        let bytes_per_char = if flags & STR_FLAG_HIGH_BYTE != 0 { 2 } else { 1 };
        let char_len = cch * bytes_per_char;
        let extra_len = runs * 4 + ext_len;

        let chars_start = pos + header_len;
        let extra_start = chars_start + char_len;
        let end = extra_start + extra_len;
        if end > payload.len() {
            return Err("SST string extends past end of payload".to_string());
        }

        let needed = header_len + if cch > 0 { bytes_per_char } else { 0 };
        if writer.room() < needed {
            writer.new_chunk();
        }
        string_starts.push(writer.position());
        writer.write_plain(&payload[pos..chars_start]);
        writer.write_chars(&payload[chars_start..extra_start], bytes_per_char, flags & STR_FLAG_HIGH_BYTE);
        writer.write_plain(&payload[extra_start..end]);
        pos = end;
    }

    writer.write_plain(&payload[pos..]);
    Ok(SstFragments {
        fragments: writer.chunks,
        string_starts,
    })
}

/// `cchText` and `cbRuns` from the fixed part of a `TXO` record.
pub(crate) fn txo_text_lengths(primary: &[u8]) -> Option<(usize, usize)> {
    let cch = read_u16_at(primary, TXO_CCH_TEXT_OFFSET)?;
    let cb_runs = read_u16_at(primary, TXO_CB_RUNS_OFFSET)?;
    Some((usize::from(cch), usize::from(cb_runs)))
}

/// Length of the fixed (primary) part of a `TXO` record: 16 bytes, then `ObjFmla`
/// (`[cbFmla: u16]` followed by `cbFmla` bytes).
pub(crate) fn txo_primary_len(payload: &[u8]) -> usize {
    match read_u16_at(payload, TXO_FMLA_OFFSET) {
        Some(cb_fmla) => (TXO_FMLA_OFFSET + 2 + usize::from(cb_fmla)).min(payload.len()),
        None => payload.len(),
    }
}

/// Returns true once `continuations` carry all the text and run bytes the `TXO` declares.
///
/// A `TXO` whose fixed part cannot be read is never satisfied, so it keeps absorbing.
pub(crate) fn txo_is_satisfied(primary: &[u8], continuations: &[&[u8]]) -> bool {
    let Some((cch, cb_runs)) = txo_text_lengths(primary) else {
        return false;
    };
    let mut chars = 0usize;
    let mut run_bytes = 0usize;
    for frag in continuations {
        if chars < cch {
            let Some((&flags, rest)) = frag.split_first() else {
                continue;
            };
            let bytes_per_char = if flags & STR_FLAG_HIGH_BYTE != 0 { 2 } else { 1 };
            chars += rest.len() / bytes_per_char;
        } else {
            run_bytes += frag.len();
        }
    }
    chars >= cch && run_bytes >= cb_runs
}

/// Merge the physical fragments of a `TXO` record into `primary ‖ flags ‖ chars ‖ runs`.
pub(crate) fn canonicalize_txo(fragments: &[&[u8]]) -> Result<Vec<u8>, String> {
    let primary = fragments
        .first()
        .ok_or_else(|| "TXO record has no fragments".to_string())?;
    let expected = read_u16_at(primary, TXO_FMLA_OFFSET)
        .map(|cb_fmla| TXO_FMLA_OFFSET + 2 + usize::from(cb_fmla))
        .ok_or_else(|| "TXO primary fragment too short".to_string())?;
    if primary.len() != expected {
        return Err(format!(
            "TXO primary fragment is {} bytes, expected {expected}",
            primary.len()
        ));
    }
    let (cch, _) = txo_text_lengths(primary)
        .ok_or_else(|| "TXO primary fragment too short".to_string())?;

    let mut out = primary.to_vec();
    let mut cursor = FragmentCursor::new(fragments, 0);
    cursor.offset = primary.len();
    if cch > 0 {
        // The text always starts in its own CONTINUE record, which begins with a flags byte.
        cursor.advance_fragment()?;
        let flags = cursor.read_u8()?;
        let (chars, unicode) = cursor.read_continued_chars(cch, flags)?;
        out.push(if unicode { STR_FLAG_HIGH_BYTE } else { 0 });
        out.extend_from_slice(&chars);
    }
    cursor.copy_rest(&mut out);
    Ok(out)
}

/// Split a canonical `TXO` payload: the fixed part, text fragments (each starting with a flags
/// byte), then the formatting runs.
pub(crate) fn split_txo(payload: &[u8], max: usize) -> Result<Vec<Vec<u8>>, String> {
    let primary_len = txo_primary_len(payload);
    let (cch, _) = txo_text_lengths(payload)
        .ok_or_else(|| "TXO payload too short".to_string())?;
    let mut fragments = vec![payload[..primary_len].to_vec()];
    let mut rest = &payload[primary_len..];

    if cch > 0 {
        let (&flags, after_flags) = rest
            .split_first()
            .ok_or_else(|| "TXO text missing".to_string())?;
        let bytes_per_char = if flags & STR_FLAG_HIGH_BYTE != 0 { 2 } else { 1 };
        let char_len = cch * bytes_per_char;
        let chars = after_flags
            .get(..char_len)
            .ok_or_else(|| "TXO text shorter than cchText".to_string())?;
        let per_fragment = (max - 1) / bytes_per_char * bytes_per_char;
        for piece in chars.chunks(per_fragment) {
            let mut fragment = Vec::with_capacity(piece.len() + 1);
            fragment.push(flags);
            fragment.extend_from_slice(piece);
            fragments.push(fragment);
        }
        rest = &after_flags[char_len..];
    }

    fragments.extend(rest.chunks(max).map(<[u8]>::to_vec));
    Ok(fragments)
}
