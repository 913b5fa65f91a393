//! EBML primitives
//!
//! Element IDs are kept in their encoded form (marker bits included), so an
//! ID's byte width is simply the number of significant bytes.

use std::io::{self, Read};

/// Element IDs used by the Matroska writer and reader
pub mod id {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;

    pub const INFO: u32 = 0x1549_A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const COLOUR_SPACE: u32 = 0x2E_B524;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const REFERENCE_BLOCK: u32 = 0xFB;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;

    pub const VOID: u32 = 0xEC;
}

/// Size field of 8 bytes with all value bits set
pub const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Largest size an 8-byte vint can carry
pub const MAX_SIZE: u64 = (1 << 56) - 2;

pub fn id_len(id: u32) -> usize {
    match id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

pub fn write_id(buf: &mut Vec<u8>, id: u32) {
    let len = id_len(id);
    buf.extend_from_slice(&id.to_be_bytes()[4 - len..]);
}

/// Bytes needed to encode `value` as a size vint
pub fn size_len(value: u64) -> usize {
    let mut len = 1;
    // All-ones is reserved for "unknown"
    while len < 8 && value >= (1u64 << (7 * len)) - 1 {
        len += 1;
    }
    len
}

/// Encode `value` as a vint of exactly `len` bytes
pub fn encode_vint(value: u64, len: usize) -> Vec<u8> {
    let marked = value | (1u64 << (7 * len));
    marked.to_be_bytes()[8 - len..].to_vec()
}

pub fn write_size(buf: &mut Vec<u8>, size: u64) {
    buf.extend_from_slice(&encode_vint(size, size_len(size)));
}

fn uint_len(value: u64) -> usize {
    (8 - value.leading_zeros() as usize / 8).max(1)
}

pub fn write_uint(buf: &mut Vec<u8>, id: u32, value: u64) {
    let len = uint_len(value);
    write_id(buf, id);
    write_size(buf, len as u64);
    buf.extend_from_slice(&value.to_be_bytes()[8 - len..]);
}

pub fn write_float(buf: &mut Vec<u8>, id: u32, value: f64) {
    write_id(buf, id);
    write_size(buf, 8);
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_str(buf: &mut Vec<u8>, id: u32, value: &str) {
    write_bytes(buf, id, value.as_bytes());
}

pub fn write_bytes(buf: &mut Vec<u8>, id: u32, value: &[u8]) {
    write_id(buf, id);
    write_size(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Write a master element around an already encoded body
pub fn write_master(buf: &mut Vec<u8>, id: u32, body: &[u8]) {
    write_bytes(buf, id, body);
}

// ============================================================================
// Reading
// ============================================================================

/// Decoded element header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    /// None for unknown-size elements
    pub size: Option<u64>,
    /// Bytes taken by ID and size
    pub header_len: usize,
}

fn read_byte<R: Read>(r: &mut R) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read an element header; `Ok(None)` at a clean end of input
pub fn read_header<R: Read>(r: &mut R) -> io::Result<Option<ElementHeader>> {
    let Some(first) = read_byte(r)? else {
        return Ok(None);
    };
    let id_len = first.leading_zeros() as usize + 1;
    if id_len > 4 {
        return Err(invalid("invalid element ID"));
    }
    let mut id = first as u32;
    for _ in 1..id_len {
        let b = read_byte(r)?.ok_or_else(|| invalid("truncated element ID"))?;
        id = (id << 8) | b as u32;
    }

    let first = read_byte(r)?.ok_or_else(|| invalid("truncated element size"))?;
    let size_len = first.leading_zeros() as usize + 1;
    if size_len > 8 {
        return Err(invalid("invalid element size"));
    }
    let mut value = (first as u64) & (0xFF >> size_len);
    let mut all_ones = value == (0xFF >> size_len) as u64;
    for _ in 1..size_len {
        let b = read_byte(r)?.ok_or_else(|| invalid("truncated element size"))?;
        value = (value << 8) | b as u64;
        all_ones &= b == 0xFF;
    }

    Ok(Some(ElementHeader {
        id,
        size: if all_ones { None } else { Some(value) },
        header_len: id_len + size_len,
    }))
}

/// Decode a vint at the start of `data`, returning (value, length)
pub fn parse_vint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let len = first.leading_zeros() as usize + 1;
    if len > 8 || data.len() < len {
        return None;
    }
    let mut value = (first as u64) & (0xFF >> len);
    for b in &data[1..len] {
        value = (value << 8) | *b as u64;
    }
    Some((value, len))
}

pub fn parse_uint(data: &[u8]) -> u64 {
    data.iter().take(8).fold(0, |acc, b| (acc << 8) | *b as u64)
}

pub fn parse_float(data: &[u8]) -> Option<f64> {
    match data.len() {
        4 => Some(f32::from_be_bytes(data.try_into().ok()?) as f64),
        8 => Some(f64::from_be_bytes(data.try_into().ok()?)),
        0 => Some(0.0),
        _ => None,
    }
}

/// Iterate the direct children of an in-memory master element body
pub fn children(body: &[u8]) -> Children<'_> {
    Children { body, pos: 0 }
}

pub struct Children<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Children<'a> {
    /// (id, payload)
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let mut rest = &self.body[self.pos..];
        let header = read_header(&mut rest).ok()??;
        let size = header.size? as usize;
        let start = self.pos + header.header_len;
        let end = start.checked_add(size)?;
        if end > self.body.len() {
            return None;
        }
        self.pos = end;
        Some((header.id, &self.body[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_vints() {
        assert_eq!(encode_vint(1, 1), vec![0x81]);
        assert_eq!(size_len(126), 1);
        // 127 is all ones in one byte
        assert_eq!(size_len(127), 2);
        assert_eq!(encode_vint(127, 2), vec![0x40, 0x7F]);
        assert_eq!(encode_vint(5, 8), vec![0x01, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(parse_vint(&[0x40, 0x7F]), Some((127, 2)));
    }

    #[test]
    fn test_ids() {
        let mut buf = Vec::new();
        write_id(&mut buf, id::SIMPLE_BLOCK);
        write_id(&mut buf, id::TIMESTAMP_SCALE);
        write_id(&mut buf, id::SEGMENT);
        assert_eq!(buf, vec![0xA3, 0x2A, 0xD7, 0xB1, 0x18, 0x53, 0x80, 0x67]);
    }

    #[test]
    fn test_uint_element() {
        let mut buf = Vec::new();
        write_uint(&mut buf, id::TIMESTAMP_SCALE, 1_000_000);
        assert_eq!(buf, vec![0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]);

        let mut buf = Vec::new();
        write_uint(&mut buf, id::FLAG_LACING, 0);
        assert_eq!(buf, vec![0x9C, 0x81, 0x00]);
    }

    #[test]
    fn test_read_header() {
        let mut data: &[u8] = &[0x1A, 0x45, 0xDF, 0xA3, 0x84];
        let header = read_header(&mut data).unwrap().unwrap();
        assert_eq!(header.id, id::EBML);
        assert_eq!(header.size, Some(4));
        assert_eq!(header.header_len, 5);

        let mut unknown = vec![0x18, 0x53, 0x80, 0x67];
        unknown.extend_from_slice(&UNKNOWN_SIZE);
        let header = read_header(&mut unknown.as_slice()).unwrap().unwrap();
        assert_eq!(header.size, None);

        let mut empty: &[u8] = &[];
        assert!(read_header(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_children() {
        let mut body = Vec::new();
        write_uint(&mut body, id::TRACK_NUMBER, 1);
        write_str(&mut body, id::CODEC_ID, "A_AAC");
        let kids: Vec<_> = children(&body).collect();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[0], (id::TRACK_NUMBER, &[1u8][..]));
        assert_eq!(kids[1].1, b"A_AAC");
    }

    #[test]
    fn test_float_round_trip() {
        let mut buf = Vec::new();
        write_float(&mut buf, id::DURATION, 625.0);
        let (_, payload) = children(&buf).next().unwrap();
        assert_eq!(parse_float(payload), Some(625.0));
    }
}
