// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tagged wire format for IR and analysis artifacts.
//!
//! Every value is a nest of segments `tag (u16) | length (varint) | payload`
//! where the payload is either a primitive or a list of nested segments.
//! Strings already written to a buffer are re-encoded as a `CACHE_STRING`
//! segment holding the ordinal of the earlier occurrence. Buffers above a
//! size threshold are stored compressed under a header carrying the
//! decompressed length; readers accept both variants.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use checker_config::COMPRESS_THRESHOLD;

use crate::error::{CheckerError, CheckerResult};

pub type Tag = u16;

/// Wire tags. Values are part of the on-disk format and must not change.
pub mod tags {
    use super::Tag;

    pub const STRING: Tag = 0x0001;
    pub const CACHE_STRING: Tag = 0x0002;
    pub const UINT: Tag = 0x0003;
    pub const INT_STR: Tag = 0x0004;
    pub const TRUE: Tag = 0x0005;
    pub const FALSE: Tag = 0x0006;
    pub const KIND: Tag = 0x0007;
    pub const INDEX: Tag = 0x0008;
    pub const NAME: Tag = 0x0009;
    pub const WIDTH: Tag = 0x000a;
    pub const SIGN: Tag = 0x000b;
    pub const COUNT: Tag = 0x000c;
    pub const OFFSET: Tag = 0x000d;
    pub const LOCATION: Tag = 0x000e;

    pub const TYPE: Tag = 0x0010;
    pub const FIELD: Tag = 0x0011;
    pub const COMPOSITE_CSU: Tag = 0x0012;
    pub const DATA_FIELD: Tag = 0x0013;
    pub const FUNCTION_FIELD: Tag = 0x0014;
    pub const BASE_CLASS: Tag = 0x0015;
    pub const VARIABLE: Tag = 0x0016;
    pub const EXP: Tag = 0x0017;
    pub const BIT: Tag = 0x0018;

    pub const BLOCK_ID: Tag = 0x0020;
    pub const BLOCK_PPOINT: Tag = 0x0021;
    pub const BLOCK_CFG: Tag = 0x0022;
    pub const DEFINE_VARIABLE: Tag = 0x0023;
    pub const PPOINT: Tag = 0x0024;
    pub const LOOP_HEAD: Tag = 0x0025;
    pub const LOOP_ISOMORPHIC: Tag = 0x0026;
    pub const PEDGE: Tag = 0x0027;

    pub const ESCAPE_EDGE_SET: Tag = 0x0030;
    pub const ESCAPE_EDGE: Tag = 0x0031;
    pub const ESCAPE_ACCESS_SET: Tag = 0x0032;
    pub const ESCAPE_ACCESS: Tag = 0x0033;
    pub const CALL_EDGE_SET: Tag = 0x0034;
    pub const CALL_EDGE: Tag = 0x0035;
    pub const TRACE: Tag = 0x0036;

    pub const BLOCK_MEMORY: Tag = 0x0040;
    pub const MEMORY_ASSIGN: Tag = 0x0041;
    pub const MEMORY_GUARD: Tag = 0x0042;
    pub const BLOCK_MODSET: Tag = 0x0043;
    pub const MODSET_ENTRY: Tag = 0x0044;
    pub const MODSET_CALL_ASSIGN: Tag = 0x0045;
    pub const BLOCK_SUMMARY: Tag = 0x0046;
    pub const SUMMARY_ASSERT: Tag = 0x0047;

    /// Header tag of the compressed buffer variant.
    pub const COMPRESSED: Tag = 0xffff;
}

/// Growable write buffer with the per-buffer string table.
pub struct Buffer {
    bytes: Vec<u8>,
    string_index: HashMap<Vec<u8>, u64>,
    string_count: u64,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            bytes: Vec::new(),
            string_index: HashMap::new(),
            string_count: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn put_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn put_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.bytes.push(byte);
                break;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    /// Write one segment: the tag, then the body, then splice the varint
    /// length in front of the body once its extent is known.
    pub fn open<F: FnOnce(&mut Buffer)>(&mut self, tag: Tag, body: F) {
        self.put_u16(tag);
        let at = self.bytes.len();
        body(self);
        let len = (self.bytes.len() - at) as u64;
        let mut prefix = Vec::with_capacity(5);
        let mut v = len;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                prefix.push(byte);
                break;
            }
            prefix.push(byte | 0x80);
        }
        self.bytes.splice(at..at, prefix);
    }

    /// An empty segment carrying only its tag.
    pub fn put_empty(&mut self, tag: Tag) {
        self.open(tag, |_| ());
    }

    pub fn put_uint(&mut self, tag: Tag, value: u64) {
        self.open(tag, |buf| buf.put_varint(value));
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_empty(if value { tags::TRUE } else { tags::FALSE });
    }

    /// Write a string under `tag`, or a `CACHE_STRING` back-reference when
    /// the same bytes were written to this buffer before.
    pub fn put_str(&mut self, tag: Tag, value: &str) {
        if let Some(ordinal) = self.string_index.get(value.as_bytes()).copied() {
            self.put_uint(tags::CACHE_STRING, ordinal);
            return;
        }
        let ordinal = self.string_count;
        self.string_count += 1;
        self.string_index.insert(value.as_bytes().to_vec(), ordinal);
        self.open(tag, |buf| buf.bytes.extend_from_slice(value.as_bytes()));
    }

    /// Raw bytes, never cached.
    pub fn put_bytes(&mut self, tag: Tag, value: &[u8]) {
        self.open(tag, |buf| buf.bytes.extend_from_slice(value));
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

/// Cursor over one serialized buffer. `enter`/`leave` bracket a segment and
/// bound all reads to its payload.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
    strings: Vec<Vec<u8>>,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader {
            bytes,
            pos: 0,
            end: bytes.len(),
            strings: Vec::new(),
        }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.end
    }

    fn get_u16(&mut self) -> CheckerResult<u16> {
        if self.pos + 2 > self.end {
            return Err(CheckerError::Truncated("tag"));
        }
        let value = u16::from_le_bytes([self.bytes[self.pos], self.bytes[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn get_varint(&mut self) -> CheckerResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            if self.pos >= self.end || shift >= 64 {
                return Err(CheckerError::Truncated("varint"));
            }
            let byte = self.bytes[self.pos];
            self.pos += 1;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// The tag of the next segment, without consuming it.
    pub fn peek(&self) -> Option<Tag> {
        if self.pos + 2 > self.end {
            return None;
        }
        Some(u16::from_le_bytes([
            self.bytes[self.pos],
            self.bytes[self.pos + 1],
        ]))
    }

    /// Enter a segment with the expected tag; returns the enclosing bound to
    /// restore with [`Reader::leave`].
    pub fn enter(&mut self, tag: Tag) -> CheckerResult<usize> {
        let found = self.get_u16()?;
        if found != tag {
            return Err(CheckerError::Corrupt(found));
        }
        let len = self.get_varint()? as usize;
        if self.pos + len > self.end {
            return Err(CheckerError::Truncated("segment length"));
        }
        let outer_end = self.end;
        self.end = self.pos + len;
        Ok(outer_end)
    }

    /// Leave the current segment, skipping any unread payload.
    pub fn leave(&mut self, outer_end: usize) {
        self.pos = self.end;
        self.end = outer_end;
    }

    /// Skip one whole segment without interpreting it.
    pub fn skip(&mut self) -> CheckerResult<()> {
        let tag = self.get_u16()?;
        let len = self.get_varint()? as usize;
        if self.pos + len > self.end {
            return Err(CheckerError::Corrupt(tag));
        }
        self.pos += len;
        Ok(())
    }

    pub fn get_uint(&mut self, tag: Tag) -> CheckerResult<u64> {
        let outer = self.enter(tag)?;
        let value = self.get_varint()?;
        self.leave(outer);
        Ok(value)
    }

    pub fn get_bool(&mut self) -> CheckerResult<bool> {
        match self.peek() {
            Some(tags::TRUE) => {
                let outer = self.enter(tags::TRUE)?;
                self.leave(outer);
                Ok(true)
            }
            Some(tags::FALSE) => {
                let outer = self.enter(tags::FALSE)?;
                self.leave(outer);
                Ok(false)
            }
            Some(other) => Err(CheckerError::Corrupt(other)),
            None => Err(CheckerError::Truncated("boolean")),
        }
    }

    /// Read a string written with [`Buffer::put_str`], resolving cache
    /// back-references and registering first occurrences.
    pub fn get_str(&mut self, tag: Tag) -> CheckerResult<String> {
        if self.peek() == Some(tags::CACHE_STRING) {
            let ordinal = self.get_uint(tags::CACHE_STRING)? as usize;
            let bytes = self
                .strings
                .get(ordinal)
                .ok_or(CheckerError::Truncated("string cache ordinal"))?;
            return String::from_utf8(bytes.clone())
                .map_err(|_| CheckerError::Truncated("utf8 string"));
        }
        let outer = self.enter(tag)?;
        let bytes = self.bytes[self.pos..self.end].to_vec();
        self.leave(outer);
        self.strings.push(bytes.clone());
        String::from_utf8(bytes).map_err(|_| CheckerError::Truncated("utf8 string"))
    }

    pub fn get_bytes(&mut self, tag: Tag) -> CheckerResult<Vec<u8>> {
        let outer = self.enter(tag)?;
        let bytes = self.bytes[self.pos..self.end].to_vec();
        self.leave(outer);
        Ok(bytes)
    }
}

/// Values with a wire representation in the tagged format.
pub trait Serial: Sized {
    fn write(&self, buf: &mut Buffer);
    fn read(reader: &mut Reader<'_>) -> CheckerResult<Self>;

    /// Concatenation of items; the reader stops at buffer end.
    fn write_list(items: &[Self], buf: &mut Buffer) {
        for item in items {
            item.write(buf);
        }
    }

    fn read_list(reader: &mut Reader<'_>) -> CheckerResult<Vec<Self>> {
        let mut items = Vec::new();
        while !reader.at_end() {
            items.push(Self::read(reader)?);
        }
        Ok(items)
    }
}

/// Compress a buffer when it crosses the size threshold. The compressed
/// variant is `COMPRESSED (u16) | decompressed length (varint) | zlib data`.
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() < COMPRESS_THRESHOLD {
        return bytes.to_vec();
    }
    let mut out = Buffer::new();
    out.put_u16(tags::COMPRESSED);
    out.put_varint(bytes.len() as u64);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("in-memory write");
    let compressed = encoder.finish().expect("in-memory finish");
    let mut result = out.into_bytes();
    result.extend_from_slice(&compressed);
    result
}

/// Accepts both the raw and the compressed variant.
pub fn decompress(bytes: &[u8]) -> CheckerResult<Vec<u8>> {
    if bytes.len() < 2 {
        return Ok(bytes.to_vec());
    }
    let tag = u16::from_le_bytes([bytes[0], bytes[1]]);
    if tag != tags::COMPRESSED {
        return Ok(bytes.to_vec());
    }
    let mut reader = Reader::new(&bytes[2..]);
    let expected = reader.get_varint()? as usize;
    let mut decoder = ZlibDecoder::new(&bytes[2 + reader.pos..]);
    let mut out = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| CheckerError::Truncated("compressed payload"))?;
    if out.len() != expected {
        return Err(CheckerError::Truncated("decompressed length mismatch"));
    }
    Ok(out)
}
