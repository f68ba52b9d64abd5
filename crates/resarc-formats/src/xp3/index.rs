//! XP3 index records
//!
//! The index is a flat sequence of tagged chunks. `File` chunks describe one
//! entry through `info`, `segm` and `adlr` sections. Other chunks either
//! carry hash-to-name records for filename recovery or are ignored.
//!
//! Malformed entries are voided one at a time; parsing continues with the
//! next chunk. Names are resolved only after every chunk has been read.

use std::io::Cursor;

use binrw::BinRead;
use tracing::{debug, warn};

use super::entry::{Segment, Xp3Entry};
use super::names::FilenameTable;
use crate::error::{ArchiveError, ArchiveResult};
use crate::registry::TypeHint;

/// `File` chunk tag
pub const TAG_FILE: u32 = u32::from_le_bytes(*b"File");
/// Entry attributes and name
pub const TAG_INFO: u32 = u32::from_le_bytes(*b"info");
/// Segment table
pub const TAG_SEGM: u32 = u32::from_le_bytes(*b"segm");
/// Adler-32 of the plaintext
pub const TAG_ADLR: u32 = u32::from_le_bytes(*b"adlr");
/// Engine-private index extension, skipped
const TAG_HXV4: u32 = u32::from_le_bytes(*b"Hxv4");

/// Size of one `segm` record
pub const SEGMENT_RECORD_SIZE: u64 = 0x1C;

/// Longest accepted entry name, in UTF-16 code units
pub const MAX_NAME_LEN: usize = 0x100;

/// Size of a chunk or section header
const CHUNK_HEADER_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
struct ChunkHeader {
    tag: u32,
    size: u64,
}

#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct InfoRecord {
    flags: u32,
    size: u64,
    packed_size: u64,
    name_len: u16,
    #[br(count = name_len)]
    name: Vec<u16>,
}

#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
struct SegmentRecord {
    flags: u32,
    offset: u64,
    size: u64,
    packed_size: u64,
}

#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct NameRecord {
    hash: u32,
    name_len: i16,
}

/// Container facts the index is checked against
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexLayout {
    /// Container length in bytes
    pub container_len: u64,
    /// Offset added to every segment offset
    pub base_offset: u64,
    /// Names may carry `dir/../` hops; such entries are decoys
    pub obfuscated_index: bool,
}

/// Entry as described by the index, before name resolution
#[derive(Debug, Clone, Default)]
struct FileRecord {
    seen_info: bool,
    name: String,
    hash: u32,
    flags: u32,
    size: u64,
    packed_size: u64,
    segments: Vec<Segment>,
}

/// Why an entry was dropped
enum Void {
    DuplicateInfo,
    Oversized,
    BadName(&'static str),
    SegmentOutOfRange(u64),
}

impl std::fmt::Display for Void {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateInfo => f.write_str("duplicate info record"),
            Self::Oversized => f.write_str("size exceeds 4 GiB or container"),
            Self::BadName(why) => write!(f, "unreadable name ({why})"),
            Self::SegmentOutOfRange(offset) => {
                write!(f, "segment at {offset:#x} outside container")
            }
        }
    }
}

/// Parse an index block into entries.
///
/// Hash-to-name records found in the index are added to `names`, which may
/// already hold recovered candidates.
pub fn parse_index(
    index: &[u8],
    layout: &IndexLayout,
    names: &mut FilenameTable,
) -> ArchiveResult<Vec<Xp3Entry>> {
    let mut records = Vec::new();
    let mut cursor = Cursor::new(index);
    let end = index.len() as u64;

    while cursor.position() < end {
        let header = ChunkHeader::read(&mut cursor)
            .map_err(|e| ArchiveError::invalid_index(format!("truncated chunk header: {e}")))?;
        let start = cursor.position();
        if header.size > i64::MAX as u64 {
            return Err(ArchiveError::invalid_index(format!(
                "negative chunk size at {:#x}",
                start - CHUNK_HEADER_SIZE
            )));
        }
        let Some(chunk_end) = start.checked_add(header.size).filter(|&e| e <= end) else {
            return Err(ArchiveError::invalid_index(format!(
                "chunk at {:#x} extends past index",
                start - CHUNK_HEADER_SIZE
            )));
        };
        let body = &index[start as usize..chunk_end as usize];

        if header.tag == TAG_FILE {
            match parse_file(body, layout) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(void) => warn!("Dropped index entry at {start:#x}: {void}"),
            }
        } else if header.tag >> 24 == u32::from(b':') || header.tag == TAG_HXV4 {
            debug!("Skipped {} chunk", tag_name(header.tag));
        } else if header.size > 7 {
            read_name_record(body, names);
        }

        cursor.set_position(chunk_end);
    }

    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let name = if names.is_empty() {
            record.name
        } else {
            names
                .resolve(record.hash, &record.name)
                .map_or(record.name, str::to_string)
        };
        let units = name.encode_utf16().count();
        if units > MAX_NAME_LEN {
            warn!("Dropped entry with overlong name ({units} chars)");
            continue;
        }
        entries.push(Xp3Entry {
            type_hint: TypeHint::from_name(&name),
            name,
            hash: record.hash,
            flags: record.flags,
            is_encrypted: record.flags != 0,
            unpacked_size: record.size,
            packed_size: record.packed_size,
            segments: record.segments,
        });
    }

    if entries.is_empty() {
        return Err(ArchiveError::NoEntries);
    }
    debug!("Parsed {} index entries", entries.len());
    Ok(entries)
}

fn parse_file(body: &[u8], layout: &IndexLayout) -> Result<Option<FileRecord>, Void> {
    let mut record = FileRecord::default();
    let mut cursor = Cursor::new(body);
    let mut remaining = body.len() as u64;

    while remaining >= CHUNK_HEADER_SIZE {
        let Ok(section) = ChunkHeader::read(&mut cursor) else {
            break;
        };
        remaining -= CHUNK_HEADER_SIZE;
        let mut size = section.size;
        if size > remaining {
            // oversized info sections are clamped, anything else ends the chunk
            if section.tag != TAG_INFO {
                break;
            }
            size = remaining;
        }
        remaining -= size;

        let start = cursor.position() as usize;
        let data = &body[start..start + size as usize];
        match section.tag {
            TAG_INFO => read_info(data, layout, &mut record)?,
            TAG_SEGM => read_segments(data, layout, &mut record)?,
            TAG_ADLR if size == 4 => {
                record.hash = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            }
            _ => {}
        }
        cursor.set_position((start + size as usize) as u64);
    }

    if record.name.is_empty() || record.segments.is_empty() {
        debug!("Skipped entry without name or segments");
        return Ok(None);
    }

    if layout.obfuscated_index {
        record.segments.truncate(1);
        let first = record.segments[0];
        record.size = first.size;
        record.packed_size = first.stored_size();
    }

    let total: u64 = record.segments.iter().map(|s| s.size).sum();
    if total != record.size {
        warn!(
            "Dropped {}: segments hold {total} bytes, info declares {}",
            record.name, record.size
        );
        return Ok(None);
    }

    Ok(Some(record))
}

fn read_info(data: &[u8], layout: &IndexLayout, record: &mut FileRecord) -> Result<(), Void> {
    if record.seen_info {
        return Err(Void::DuplicateInfo);
    }
    record.seen_info = true;

    let info =
        InfoRecord::read(&mut Cursor::new(data)).map_err(|_| Void::BadName("truncated"))?;
    if info.size >= u64::from(u32::MAX)
        || info.packed_size > u64::from(u32::MAX)
        || info.packed_size > layout.container_len
    {
        return Err(Void::Oversized);
    }

    let name = String::from_utf16(&info.name).map_err(|_| Void::BadName("invalid UTF-16"))?;
    if layout.obfuscated_index && has_parent_hop(&name) {
        return Err(Void::BadName("obfuscated path"));
    }

    record.flags = info.flags;
    record.size = info.size;
    record.packed_size = info.packed_size;
    record.name = name;
    Ok(())
}

fn read_segments(data: &[u8], layout: &IndexLayout, record: &mut FileRecord) -> Result<(), Void> {
    let count = data.len() as u64 / SEGMENT_RECORD_SIZE;
    let mut cursor = Cursor::new(data);
    for _ in 0..count {
        let Ok(raw) = SegmentRecord::read(&mut cursor) else {
            break;
        };
        let Some(offset) = layout.base_offset.checked_add(raw.offset) else {
            return Err(Void::SegmentOutOfRange(raw.offset));
        };
        let segment = Segment {
            offset,
            size: raw.size,
            packed_size: raw.packed_size,
            is_compressed: raw.flags != 0,
        };
        let fits = offset
            .checked_add(segment.stored_size())
            .is_some_and(|end| end <= layout.container_len);
        if !fits || raw.packed_size > layout.container_len {
            return Err(Void::SegmentOutOfRange(offset));
        }
        record.segments.push(segment);
    }
    Ok(())
}

/// Hash-to-name side record: u32 hash, i16 length, UTF-16LE name
fn read_name_record(body: &[u8], names: &mut FilenameTable) {
    let mut cursor = Cursor::new(body);
    let Ok(header) = NameRecord::read(&mut cursor) else {
        return;
    };
    let Ok(len) = usize::try_from(header.name_len) else {
        return;
    };
    if len == 0 || len * 2 > body.len() - 6 {
        return;
    }
    let units: Vec<u16> = body[6..6 + len * 2]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    match String::from_utf16(&units) {
        Ok(name) => names.add(header.hash, name),
        Err(_) => warn!("Ignored name record with invalid UTF-16 for {:08x}", header.hash),
    }
}

/// Whether `name` contains a `component/../` hop
pub fn has_parent_hop(name: &str) -> bool {
    let parts: Vec<&str> = name.split(['/', '\\']).collect();
    parts
        .windows(3)
        .any(|w| !w[0].is_empty() && w[1] == "..")
}

fn tag_name(tag: u32) -> String {
    tag.to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}
