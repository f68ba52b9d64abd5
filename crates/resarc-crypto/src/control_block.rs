//! Encryption control block recovery
//!
//! The table-lookup opcode of a cipher program indexes a 1024-word constant
//! table that the game ships inside a companion plugin file (usually a
//! `.tpm`). The table begins with the ASCII text `" Encryption control
//! block"`, so it is located by scanning the companion for that marker on
//! 4-byte boundaries.
//!
//! Words are stored complemented, matching the in-memory layout the engine
//! uses; the interpreter complements them again on lookup.

use std::fmt;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::SchemeError;

/// Number of 32-bit words in a control block
pub const CONTROL_BLOCK_WORDS: usize = 1024;

/// Size of a control block in bytes
pub const CONTROL_BLOCK_SIZE: usize = CONTROL_BLOCK_WORDS * 4;

/// Marker found at the start of every control block
pub const CONTROL_BLOCK_MARKER: &[u8] = b" Encryption control block";

/// The 1024-word constant table used by cipher programs
#[derive(Clone, PartialEq, Eq)]
pub struct ControlBlock(Box<[u32; CONTROL_BLOCK_WORDS]>);

impl ControlBlock {
    /// Build from words in stored (already complemented) form.
    pub fn from_words(words: &[u32]) -> Result<Self, SchemeError> {
        let boxed: Box<[u32; CONTROL_BLOCK_WORDS]> = words
            .to_vec()
            .into_boxed_slice()
            .try_into()
            .map_err(|_| SchemeError::InvalidControlBlockLength(words.len()))?;
        Ok(Self(boxed))
    }

    /// Build from 4096 raw little-endian bytes as they appear in the plugin.
    ///
    /// Returns `None` if `raw` is shorter than a control block.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        let raw = raw.get(..CONTROL_BLOCK_SIZE)?;
        let mut words = Box::new([0u32; CONTROL_BLOCK_WORDS]);
        for (word, bytes) in words.iter_mut().zip(raw.chunks_exact(4)) {
            *word = !u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Some(Self(words))
    }

    /// Scan `data` for the control block marker.
    ///
    /// Only 4-byte aligned positions that leave room for a full block are
    /// considered. The first match wins.
    pub fn find_in(data: &[u8]) -> Option<Self> {
        if data.len() < CONTROL_BLOCK_SIZE {
            return None;
        }
        let end = (data.len() - CONTROL_BLOCK_SIZE) & !3;
        (0..end)
            .step_by(4)
            .find(|&pos| data[pos..].starts_with(CONTROL_BLOCK_MARKER))
            .and_then(|pos| {
                debug!("Found control block marker at {pos:#x}");
                Self::from_raw(&data[pos..])
            })
    }

    /// Load the control block from a companion file.
    ///
    /// A file of exactly 4096 bytes with a `.bin` extension is taken to be a
    /// raw dump of the block. Anything else is scanned for the marker.
    pub fn load(path: &Path) -> Result<Self, SchemeError> {
        let io_error = |source| SchemeError::CompanionIo {
            path: path.display().to_string(),
            source,
        };

        let file = File::open(path).map_err(io_error)?;
        let size = file.metadata().map_err(io_error)?.len();
        if size < CONTROL_BLOCK_SIZE as u64 {
            warn!("Companion file {} too small: {size} bytes", path.display());
            return Err(SchemeError::CompanionTooSmall { size });
        }

        // SAFETY: the mapping is read-only and dropped before returning;
        // the companion is not expected to change while it is scanned.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file) }.map_err(io_error)?;

        let is_dump = size == CONTROL_BLOCK_SIZE as u64
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));

        let block = if is_dump {
            Self::from_raw(&map)
        } else {
            Self::find_in(&map)
        };

        block.ok_or_else(|| SchemeError::ControlBlockNotFound(path.display().to_string()))
    }

    /// Stored word at `index`, if in range
    pub fn get(&self, index: u32) -> Option<u32> {
        self.0.get(index as usize).copied()
    }

    /// All stored words
    pub fn words(&self) -> &[u32; CONTROL_BLOCK_WORDS] {
        &self.0
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ControlBlock([{:08X}, {:08X}, ..; {CONTROL_BLOCK_WORDS}])",
            self.0[0], self.0[1]
        )
    }
}
