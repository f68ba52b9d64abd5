//! Forward-only reader over a segmented XP3 entry

use std::io::{self, Read, Take};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use resarc_crypto::EntryCipher;

use super::entry::{Segment, Xp3Entry};
use crate::error::ArchiveError;
use crate::source::{ByteSource, RangeReader};

enum SegmentStream {
    Raw(RangeReader),
    Zlib(Take<ZlibDecoder<RangeReader>>),
}

impl SegmentStream {
    fn open(source: &Arc<dyn ByteSource>, segment: &Segment) -> Self {
        let range = RangeReader::new(
            Arc::clone(source),
            segment.offset,
            segment.stored_size(),
        );
        if segment.is_compressed {
            Self::Zlib(ZlibDecoder::new(range).take(segment.size))
        } else {
            Self::Raw(range)
        }
    }
}

/// Decompressed, decrypted contents of one entry.
///
/// Segments are read in order. The cipher always sees the logical offset
/// of a byte within the whole entry, so segment boundaries do not affect
/// the key stream.
pub struct EntryReader {
    source: Arc<dyn ByteSource>,
    name: String,
    hash: u32,
    cipher: Option<Arc<dyn EntryCipher>>,
    segments: std::vec::IntoIter<Segment>,
    current: Option<(Segment, SegmentStream)>,
    produced: u64,
    position: u64,
    len: u64,
}

impl EntryReader {
    /// Reader over `entry`; `cipher` is applied when given.
    pub fn new(
        source: Arc<dyn ByteSource>,
        entry: &Xp3Entry,
        cipher: Option<Arc<dyn EntryCipher>>,
    ) -> Self {
        Self {
            source,
            name: entry.name.clone(),
            hash: entry.hash,
            cipher,
            segments: entry.segments.clone().into_iter(),
            current: None,
            produced: 0,
            position: 0,
            len: entry.unpacked_size,
        }
    }

    /// Plaintext length of the entry
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the entry is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Logical offset of the next byte
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether reads are decrypted
    pub fn is_decrypting(&self) -> bool {
        self.cipher.is_some()
    }

    /// Drop the remaining segments; later reads report end of entry.
    fn abandon(&mut self) {
        self.current = None;
        self.segments = Vec::new().into_iter();
    }
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("name", &self.name)
            .field("position", &self.position)
            .field("len", &self.len)
            .field("decrypting", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.current.is_none() {
                let Some(next) = self.segments.next() else {
                    return Ok(0);
                };
                self.current = Some((next, SegmentStream::open(&self.source, &next)));
                self.produced = 0;
            }
            let Some((segment, stream)) = &mut self.current else {
                return Ok(0);
            };

            let read = match stream {
                SegmentStream::Raw(reader) => reader.read(buf),
                SegmentStream::Zlib(reader) => reader.read(buf).map_err(|source| {
                    io::Error::other(ArchiveError::Decompression {
                        entry: self.name.clone(),
                        source,
                    })
                }),
            };
            let n = match read {
                Ok(n) => n,
                Err(err) => {
                    self.abandon();
                    return Err(err);
                }
            };

            if n == 0 {
                if self.produced < segment.size {
                    let err = ArchiveError::ShortSegment {
                        entry: self.name.clone(),
                        expected: segment.size,
                        actual: self.produced,
                    };
                    self.abandon();
                    return Err(io::Error::other(err));
                }
                self.current = None;
                continue;
            }

            if let Some(cipher) = &self.cipher
                && let Err(e) = cipher.decrypt(self.hash, self.position, &mut buf[..n])
            {
                self.abandon();
                return Err(io::Error::other(ArchiveError::from(e)));
            }
            self.produced += n as u64;
            self.position += n as u64;
            return Ok(n);
        }
    }
}
