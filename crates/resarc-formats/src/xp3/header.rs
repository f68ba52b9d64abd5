//! XP3 container header and index block
//!
//! The container starts with an 11-byte signature followed by the offset of
//! the index block. The index is either stored raw or zlib-compressed, and
//! may be reached through a continuation record. Archives embedded in an
//! executable are found by scanning for the signature.

use std::io::{Cursor, Read};

use binrw::BinRead;
use flate2::read::ZlibDecoder;
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::source::{ByteSource, RangeReader};

/// XP3 signature bytes
pub const XP3_SIGNATURE: [u8; 11] = [
    0x58, 0x50, 0x33, 0x0D, 0x0A, 0x20, 0x0A, 0x1A, 0x8B, 0x67, 0x01,
];

/// Smallest valid index offset (signature plus the offset field)
pub const MIN_INDEX_OFFSET: u64 = 0x13;

/// Marker of an index continuation record
const INDEX_CONTINUE: u32 = 0x80;

/// Executable images are scanned at this alignment
const EXE_SCAN_ALIGN: u64 = 0x10;

/// Bytes scanned per read when searching executables
const EXE_SCAN_WINDOW: usize = 0x10000;

/// Index block header
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub enum IndexHeader {
    /// Uncompressed index of `size` bytes
    #[br(magic = 0u8)]
    Raw {
        /// Index size
        size: u64,
    },
    /// Zlib-compressed index
    #[br(magic = 1u8)]
    Zlib {
        /// Compressed size
        packed_size: u64,
        /// Declared size after inflation
        unpacked_size: u64,
    },
}

impl IndexHeader {
    /// Bytes occupied by the header itself
    pub fn header_size(&self) -> u64 {
        match self {
            Self::Raw { .. } => 9,
            Self::Zlib { .. } => 17,
        }
    }

    /// Stored bytes following the header
    pub fn stored_size(&self) -> u64 {
        match self {
            Self::Raw { size } => *size,
            Self::Zlib { packed_size, .. } => *packed_size,
        }
    }
}

/// Location of an XP3 container within its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xp3Header {
    /// Offset of the signature; segment offsets are relative to it
    pub base_offset: u64,
    /// Absolute offset of the index block header
    pub index_offset: u64,
}

impl Xp3Header {
    /// Find the signature and the index block.
    pub fn locate(source: &dyn ByteSource) -> ArchiveResult<Self> {
        let mut magic = [0u8; 2];
        source.read_at(0, &mut magic)?;

        let base_offset = if &magic == b"MZ" {
            let base = find_embedded(source)?.ok_or(ArchiveError::InvalidSignature)?;
            debug!("Found XP3 signature in executable at {base:#x}");
            base
        } else {
            0
        };

        let mut signature = [0u8; 11];
        if source.read_at(base_offset, &mut signature)? != signature.len()
            || signature != XP3_SIGNATURE
        {
            return Err(ArchiveError::InvalidSignature);
        }

        let mut index_offset = base_offset
            .checked_add(read_u64(source, base_offset + 0x0B)?)
            .ok_or_else(|| ArchiveError::invalid_index("index offset overflows"))?;
        check_index_offset(source, index_offset)?;

        if read_u32(source, index_offset)? == INDEX_CONTINUE {
            let target = read_u64(source, index_offset + 9)?;
            index_offset = base_offset
                .checked_add(target)
                .ok_or_else(|| ArchiveError::invalid_index("index offset overflows"))?;
            check_index_offset(source, index_offset)?;
            debug!("Followed index continuation to {index_offset:#x}");
        }

        Ok(Self {
            base_offset,
            index_offset,
        })
    }

    /// Read the index block header.
    pub fn index_header(&self, source: &dyn ByteSource) -> ArchiveResult<IndexHeader> {
        let mut raw = [0u8; 17];
        let n = source.read_at(self.index_offset, &mut raw)?;
        IndexHeader::read(&mut Cursor::new(&raw[..n]))
            .map_err(|e| ArchiveError::invalid_index(format!("bad index header: {e}")))
    }

    /// Read and, if needed, inflate the index block.
    pub fn read_index(&self, source: &dyn ByteSource) -> ArchiveResult<Vec<u8>> {
        let header = self.index_header(source)?;
        let stored = header.stored_size();
        if stored > u64::from(u32::MAX) {
            return Err(ArchiveError::invalid_index(format!(
                "index too large: {stored} bytes"
            )));
        }

        let data_offset = self.index_offset + header.header_size();
        if !source.contains_range(data_offset, stored) {
            return Err(ArchiveError::invalid_index(
                "index extends past end of container",
            ));
        }

        match header {
            IndexHeader::Raw { size } => {
                debug!("Reading raw index: {size} bytes");
                Ok(source.read_vec(data_offset, stored as usize)?)
            }
            IndexHeader::Zlib {
                packed_size,
                unpacked_size,
            } => {
                debug!("Inflating index: {packed_size} -> {unpacked_size} bytes");
                let mut out = Vec::new();
                ZlibDecoder::new(RangeReader::new(source, data_offset, packed_size))
                    .take(unpacked_size.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(|e| ArchiveError::invalid_index(format!("index inflate: {e}")))?;
                if out.len() as u64 != unpacked_size {
                    return Err(ArchiveError::IndexSizeMismatch {
                        expected: unpacked_size,
                        actual: out.len() as u64,
                    });
                }
                Ok(out)
            }
        }
    }
}

fn check_index_offset(source: &dyn ByteSource, offset: u64) -> ArchiveResult<()> {
    if offset < MIN_INDEX_OFFSET || offset >= source.len() {
        return Err(ArchiveError::invalid_index(format!(
            "index offset {offset:#x} outside container"
        )));
    }
    Ok(())
}

fn read_u32(source: &dyn ByteSource, offset: u64) -> ArchiveResult<u32> {
    let mut buf = [0u8; 4];
    source
        .read_exact_at(offset, &mut buf)
        .map_err(|_| ArchiveError::invalid_index(format!("truncated field at {offset:#x}")))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(source: &dyn ByteSource, offset: u64) -> ArchiveResult<u64> {
    let mut buf = [0u8; 8];
    source
        .read_exact_at(offset, &mut buf)
        .map_err(|_| ArchiveError::invalid_index(format!("truncated field at {offset:#x}")))?;
    Ok(u64::from_le_bytes(buf))
}

/// Search an executable image for an embedded container.
///
/// Candidates sit at 16-byte aligned offsets and must be followed by a
/// non-zero index offset.
pub fn find_embedded(source: &dyn ByteSource) -> ArchiveResult<Option<u64>> {
    let tail = XP3_SIGNATURE.len() + 4;
    let mut window = vec![0u8; EXE_SCAN_WINDOW + tail];
    let mut start = 0u64;

    while start < source.len() {
        let n = source.read_at(start, &mut window)?;
        if n < tail {
            break;
        }
        let mut pos = 0;
        while pos + tail <= n {
            let candidate = &window[pos..pos + tail];
            if candidate[..XP3_SIGNATURE.len()] == XP3_SIGNATURE
                && candidate[XP3_SIGNATURE.len()..] != [0, 0, 0, 0]
            {
                return Ok(Some(start + pos as u64));
            }
            pos += EXE_SCAN_ALIGN as usize;
        }
        start += EXE_SCAN_WINDOW as u64;
    }
    Ok(None)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    fn container(index: &[u8], compressed: bool) -> Vec<u8> {
        let mut out = XP3_SIGNATURE.to_vec();
        out.extend_from_slice(&0x13u64.to_le_bytes());
        if compressed {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(index).unwrap();
            let packed = enc.finish().unwrap();
            out.push(1);
            out.extend_from_slice(&(packed.len() as u64).to_le_bytes());
            out.extend_from_slice(&(index.len() as u64).to_le_bytes());
            out.extend_from_slice(&packed);
        } else {
            out.push(0);
            out.extend_from_slice(&(index.len() as u64).to_le_bytes());
            out.extend_from_slice(index);
        }
        out
    }

    #[test]
    fn test_raw_index() {
        let data = container(b"index bytes", false);
        let header = Xp3Header::locate(&data).unwrap();
        assert_eq!(header.base_offset, 0);
        assert_eq!(header.index_offset, 0x13);
        assert_eq!(header.read_index(&data).unwrap(), b"index bytes");
    }

    #[test]
    fn test_zlib_index() {
        let index: Vec<u8> = (0..500u32).flat_map(u32::to_le_bytes).collect();
        let data = container(&index, true);
        let header = Xp3Header::locate(&data).unwrap();
        assert!(matches!(
            header.index_header(&data).unwrap(),
            IndexHeader::Zlib { unpacked_size: 2000, .. }
        ));
        assert_eq!(header.read_index(&data).unwrap(), index);
    }

    #[test]
    fn test_zlib_size_mismatch() {
        let mut data = container(b"twelve bytes", true);
        // declared unpacked size lives after type byte and packed size
        data[0x13 + 9..0x13 + 17].copy_from_slice(&20u64.to_le_bytes());
        let header = Xp3Header::locate(&data).unwrap();
        assert!(matches!(
            header.read_index(&data),
            Err(ArchiveError::IndexSizeMismatch {
                expected: 20,
                actual: 12
            })
        ));
    }

    #[test]
    fn test_bad_signature() {
        let mut data = container(b"x", false);
        data[1] = b'Q';
        assert!(matches!(
            Xp3Header::locate(&data),
            Err(ArchiveError::InvalidSignature)
        ));
    }

    #[test]
    fn test_index_offset_out_of_range() {
        let mut data = container(b"x", false);
        data[0x0B..0x13].copy_from_slice(&0x1000u64.to_le_bytes());
        let err = Xp3Header::locate(&data).unwrap_err();
        assert!(err.is_format_error());

        data[0x0B..0x13].copy_from_slice(&0x12u64.to_le_bytes());
        assert!(Xp3Header::locate(&data).unwrap_err().is_format_error());
    }

    #[test]
    fn test_unknown_index_type() {
        let mut data = container(b"x", false);
        data[0x13] = 7;
        let header = Xp3Header::locate(&data).unwrap();
        assert!(matches!(
            header.read_index(&data),
            Err(ArchiveError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn test_raw_index_past_end() {
        let mut data = container(b"abc", false);
        data[0x14..0x1C].copy_from_slice(&100u64.to_le_bytes());
        let header = Xp3Header::locate(&data).unwrap();
        assert!(header.read_index(&data).unwrap_err().is_format_error());
    }

    #[test]
    fn test_embedded_in_executable() {
        let mut exe = b"MZ".to_vec();
        exe.resize(0x21, 0);
        // unaligned decoy is ignored
        exe.extend_from_slice(&XP3_SIGNATURE);
        exe.resize(0x40, 0);
        // aligned signature followed by a zero offset is ignored
        exe.extend_from_slice(&XP3_SIGNATURE);
        exe.resize(0x80, 0);
        let base = exe.len() as u64;

        let mut xp3 = container(b"embedded", false);
        exe.append(&mut xp3);

        let header = Xp3Header::locate(&exe).unwrap();
        assert_eq!(header.base_offset, base);
        assert_eq!(header.index_offset, base + 0x13);
        assert_eq!(header.read_index(&exe).unwrap(), b"embedded");
    }

    #[test]
    fn test_executable_without_archive() {
        let mut exe = b"MZ".to_vec();
        exe.resize(0x3000, 0x90);
        assert!(matches!(
            Xp3Header::locate(&exe),
            Err(ArchiveError::InvalidSignature)
        ));
    }
}
