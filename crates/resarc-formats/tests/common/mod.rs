//! XP3 image builder shared by integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use resarc_crypto::control_block::{CONTROL_BLOCK_MARKER, CONTROL_BLOCK_SIZE, CONTROL_BLOCK_WORDS};
use resarc_crypto::{CipherScheme, ControlBlock, CxEncryption};
use resarc_formats::xp3::XP3_SIGNATURE;

/// Route library logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scheme used across tests; known answers are computed against it
pub fn test_scheme() -> CipherScheme {
    CipherScheme::new(
        0x17C,
        0x682,
        [1, 0, 2],
        [2, 1, 4, 5, 0, 3],
        [4, 6, 1, 5, 2, 7, 0, 3],
    )
}

/// Inline control block words matching [`test_scheme`] known answers
pub fn test_words() -> Vec<u32> {
    (0..CONTROL_BLOCK_WORDS as u32)
        .map(|i| i.wrapping_mul(0x9E37_79B9) ^ 0x5A5A_5A5A)
        .collect()
}

/// Test scheme with its inline control block
pub fn inline_scheme() -> CipherScheme {
    test_scheme().with_control_block(test_words())
}

/// Cipher used to encrypt test entries
pub fn test_cipher() -> CxEncryption {
    CxEncryption::new(test_scheme(), ControlBlock::from_words(&test_words()).unwrap()).unwrap()
}

/// Raw 4096-byte control block as stored in a plugin, starting with the marker
pub fn raw_control_block() -> Vec<u8> {
    let mut raw = CONTROL_BLOCK_MARKER.to_vec();
    let mut x = 0x1234_5678u32;
    while raw.len() < CONTROL_BLOCK_SIZE {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        raw.push(x as u8);
    }
    raw
}

/// Plugin file embedding [`raw_control_block`] after some padding
pub fn companion_file() -> Vec<u8> {
    let mut file = b"MZ".to_vec();
    file.resize(0x100, 0xCC);
    file.extend_from_slice(&raw_control_block());
    file.extend_from_slice(&[0u8; 16]);
    file
}

/// Deterministic filler bytes
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
        .collect()
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn utf16(units: &[u16]) -> Vec<u8> {
    units.iter().flat_map(|u| u.to_le_bytes()).collect()
}

fn section(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = tag.to_vec();
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// One entry to place in a built archive
#[derive(Debug, Clone)]
pub struct FileSpec {
    name: Vec<u16>,
    data: Vec<u8>,
    flags: u32,
    hash: Option<u32>,
    spans: Vec<(usize, bool)>,
    encrypt: bool,
}

impl FileSpec {
    /// Single raw segment, unencrypted
    pub fn new(name: &str, data: &[u8]) -> Self {
        Self {
            name: name.encode_utf16().collect(),
            data: data.to_vec(),
            flags: 0,
            hash: None,
            spans: Vec::new(),
            encrypt: false,
        }
    }

    /// Entry whose stored name is the given UTF-16 code units
    pub fn with_name_units(units: &[u16], data: &[u8]) -> Self {
        Self {
            name: units.to_vec(),
            ..Self::new("", data)
        }
    }

    /// Encrypt with [`test_cipher`] and set the encrypted flag.
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self.flags = 0x8000_0000;
        self
    }

    /// Set the `info` flags without encrypting.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Override the `adlr` hash (defaults to Adler-32 of the plaintext).
    pub fn hash(mut self, hash: u32) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Segment layout: `(length, compressed)` spans covering the data.
    pub fn spans(mut self, spans: &[(usize, bool)]) -> Self {
        self.spans = spans.to_vec();
        self
    }
}

/// Builds XP3 images in memory
#[derive(Debug, Default)]
pub struct Xp3Builder {
    prefix: Vec<u8>,
    body: Vec<u8>,
    index: Vec<u8>,
    compress_index: bool,
    indirect_index: bool,
}

impl Xp3Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the index zlib-compressed.
    pub fn compressed_index(mut self) -> Self {
        self.compress_index = true;
        self
    }

    /// Reach the index through a continuation record.
    pub fn indirect_index(mut self) -> Self {
        self.indirect_index = true;
        self
    }

    /// Place the archive after an executable stub.
    pub fn inside_executable(mut self, stub_len: usize) -> Self {
        let mut stub = b"MZ".to_vec();
        stub.resize(stub_len, 0);
        self.prefix = stub;
        self
    }

    /// Append a hash-to-name side record.
    pub fn name_record(mut self, tag: &[u8; 4], hash: u32, name: &str) -> Self {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut body = hash.to_le_bytes().to_vec();
        body.extend_from_slice(&(units.len() as i16).to_le_bytes());
        body.extend_from_slice(&utf16(&units));
        self.index.extend_from_slice(&section(tag, &body));
        self
    }

    /// Append an arbitrary index chunk.
    pub fn raw_chunk(mut self, chunk: &[u8]) -> Self {
        self.index.extend_from_slice(chunk);
        self
    }

    /// Append an entry.
    pub fn file(mut self, spec: FileSpec) -> Self {
        self.add_file(spec);
        self
    }

    /// Append an entry; returns the hash it was stored with.
    pub fn add_file(&mut self, spec: FileSpec) -> u32 {
        let hash = spec.hash.unwrap_or_else(|| adler2::adler32_slice(&spec.data));
        let mut stored = spec.data.clone();
        if spec.encrypt {
            test_cipher().encrypt(hash, 0, &mut stored).unwrap();
        }

        let spans = if spec.spans.is_empty() {
            vec![(stored.len(), false)]
        } else {
            spec.spans.clone()
        };
        assert_eq!(
            spans.iter().map(|s| s.0).sum::<usize>(),
            stored.len(),
            "spans must cover the data"
        );

        let mut segm = Vec::new();
        let mut packed_total = 0u64;
        let mut pos = 0;
        for (len, compressed) in spans {
            let chunk = &stored[pos..pos + len];
            pos += len;
            let bytes = if compressed { zlib(chunk) } else { chunk.to_vec() };
            let offset = (XP3_SIGNATURE.len() + 8 + self.body.len()) as u64;
            segm.extend_from_slice(&u32::from(compressed).to_le_bytes());
            segm.extend_from_slice(&offset.to_le_bytes());
            segm.extend_from_slice(&(len as u64).to_le_bytes());
            segm.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            packed_total += bytes.len() as u64;
            self.body.extend_from_slice(&bytes);
        }

        let mut info = spec.flags.to_le_bytes().to_vec();
        info.extend_from_slice(&(stored.len() as u64).to_le_bytes());
        info.extend_from_slice(&packed_total.to_le_bytes());
        info.extend_from_slice(&(spec.name.len() as u16).to_le_bytes());
        info.extend_from_slice(&utf16(&spec.name));

        let chunk = [
            section(b"info", &info),
            section(b"segm", &segm),
            section(b"adlr", &hash.to_le_bytes()),
        ]
        .concat();
        self.index.extend_from_slice(&section(b"File", &chunk));
        hash
    }

    /// Serialize the image.
    pub fn build(self) -> Vec<u8> {
        let mut archive = XP3_SIGNATURE.to_vec();
        let index_offset = (XP3_SIGNATURE.len() + 8 + self.body.len()) as u64;
        archive.extend_from_slice(&index_offset.to_le_bytes());
        archive.extend_from_slice(&self.body);

        let mut index_block = Vec::new();
        if self.compress_index {
            let packed = zlib(&self.index);
            index_block.push(1);
            index_block.extend_from_slice(&(packed.len() as u64).to_le_bytes());
            index_block.extend_from_slice(&(self.index.len() as u64).to_le_bytes());
            index_block.extend_from_slice(&packed);
        } else {
            index_block.push(0);
            index_block.extend_from_slice(&(self.index.len() as u64).to_le_bytes());
            index_block.extend_from_slice(&self.index);
        }

        if self.indirect_index {
            // continuation record, then the real index right after it
            let target = index_offset + 17;
            archive.push(0x80);
            archive.extend_from_slice(&0u64.to_le_bytes());
            archive.extend_from_slice(&target.to_le_bytes());
        }
        archive.extend_from_slice(&index_block);

        let mut out = self.prefix;
        out.extend_from_slice(&archive);
        out
    }
}
