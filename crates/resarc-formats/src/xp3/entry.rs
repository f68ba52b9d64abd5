//! XP3 entry and segment records

use crate::registry::{EntryInfo, TypeHint};

/// One contiguous, independently compressed span of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Absolute offset in the container
    pub offset: u64,
    /// Size after decompression
    pub size: u64,
    /// Size as stored in the container
    pub packed_size: u64,
    /// Whether the span is zlib-compressed
    pub is_compressed: bool,
}

impl Segment {
    /// Bytes occupied in the container
    pub fn stored_size(&self) -> u64 {
        if self.is_compressed {
            self.packed_size
        } else {
            self.size
        }
    }
}

/// A file stored in an XP3 archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xp3Entry {
    /// Resolved name
    pub name: String,
    /// Content type guess from the name
    pub type_hint: TypeHint,
    /// Adler-32 of the plaintext; keys the cipher
    pub hash: u32,
    /// Raw flags from the `info` record
    pub flags: u32,
    /// Whether reads go through the entry cipher
    pub is_encrypted: bool,
    /// Plaintext size
    pub unpacked_size: u64,
    /// Stored size
    pub packed_size: u64,
    /// Segments in plaintext order
    pub segments: Vec<Segment>,
}

impl Xp3Entry {
    /// Whether any segment is compressed
    pub fn is_packed(&self) -> bool {
        self.segments.iter().any(|s| s.is_compressed)
    }

    /// Container offset of the first segment
    pub fn offset(&self) -> u64 {
        self.segments.first().map_or(0, |s| s.offset)
    }

    /// Public summary of this entry
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            name: self.name.clone(),
            type_hint: self.type_hint,
            size: self.unpacked_size,
            is_encrypted: self.is_encrypted,
        }
    }
}
