//! Per-entry Cx cipher
//!
//! Every entry is split at a boundary derived from its hash. Bytes before
//! the boundary are keyed by the hash itself, bytes after it by
//! `(hash >> 16) ^ hash`. A key selects a synthesized program by its low 7
//! bits and feeds the remaining bits through it twice (plain and
//! complemented). The two results give a uniform XOR byte plus two single
//! byte corrections at fixed positions within the entry.
//!
//! The transform is an involution, so encryption and decryption are the
//! same operation.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::cipher::EntryCipher;
use crate::control_block::ControlBlock;
use crate::error::{CryptoError, SchemeError, SynthesisError};
use crate::program::Program;
use crate::scheme::CipherScheme;
use crate::synth::synthesize;

/// Number of distinct synthesis seeds
pub const SEED_COUNT: usize = 0x80;

/// An activated Cx scheme with its program cache
#[derive(Debug)]
pub struct CxEncryption {
    scheme: CipherScheme,
    block: ControlBlock,
    programs: DashMap<u8, Arc<Program>>,
}

impl CxEncryption {
    /// Bind a scheme to its control block.
    pub fn new(scheme: CipherScheme, block: ControlBlock) -> Result<Self, SchemeError> {
        scheme.validate()?;
        Ok(Self {
            scheme,
            block,
            programs: DashMap::with_capacity(SEED_COUNT),
        })
    }

    /// Scheme parameters
    pub fn scheme(&self) -> &CipherScheme {
        &self.scheme
    }

    /// Control block used by table lookups
    pub fn control_block(&self) -> &ControlBlock {
        &self.block
    }

    /// Number of programs synthesized so far
    pub fn cached_programs(&self) -> usize {
        self.programs.len()
    }

    /// Program for `seed` (masked to 7 bits), synthesized on first use.
    ///
    /// Concurrent callers may both synthesize; the first insert wins and
    /// every caller gets the cached instance.
    pub fn program(&self, seed: u8) -> Result<Arc<Program>, SynthesisError> {
        let seed = seed & 0x7F;
        if let Some(program) = self.programs.get(&seed) {
            return Ok(Arc::clone(program.value()));
        }

        let program = Arc::new(synthesize(seed, &self.scheme)?);
        let cached = self.programs.entry(seed).or_insert(program);
        Ok(Arc::clone(cached.value()))
    }

    /// Evaluate the program selected by `key` on its input and on the
    /// complemented input.
    pub fn execute_xcode(&self, key: u32) -> Result<(u32, u32), SynthesisError> {
        let program = self.program((key & 0x7F) as u8)?;
        let input = key >> 7;
        let r1 = program.execute(&self.block, input)?;
        let r2 = program.execute(&self.block, !input)?;
        Ok((r1, r2))
    }

    /// Apply one key to a run starting at logical `offset`.
    fn decode(&self, key: u32, offset: u64, buf: &mut [u8]) -> Result<(), SynthesisError> {
        let (r1, r2) = self.execute_xcode(key)?;

        let key_lo = r2 >> 16;
        let mut key_hi = r2 & 0xFFFF;
        let mut fill = r1 as u8;
        if key_lo == key_hi {
            key_hi += 1;
        }
        if fill == 0 {
            fill = 1;
        }

        let run = offset..offset + buf.len() as u64;
        if run.contains(&u64::from(key_hi)) {
            buf[(u64::from(key_hi) - offset) as usize] ^= (r1 >> 16) as u8;
        }
        if run.contains(&u64::from(key_lo)) {
            buf[(u64::from(key_lo) - offset) as usize] ^= (r1 >> 8) as u8;
        }
        for byte in buf.iter_mut() {
            *byte ^= fill;
        }
        Ok(())
    }

    /// Boundary between head and tail key regions for `hash`
    pub fn boundary(&self, hash: u32) -> u64 {
        u64::from((hash & self.scheme.mask).wrapping_add(self.scheme.offset))
    }

    /// Decrypt `buf` holding entry bytes at logical `offset`.
    pub fn decrypt(&self, hash: u32, offset: u64, buf: &mut [u8]) -> Result<(), SynthesisError> {
        let boundary = self.boundary(hash);
        let mut offset = offset;
        let mut rest = buf;

        if offset < boundary {
            let head_len =
                usize::try_from(boundary - offset).map_or(rest.len(), |n| n.min(rest.len()));
            let (head, tail) = rest.split_at_mut(head_len);
            self.decode(hash, offset, head)?;
            offset += head_len as u64;
            rest = tail;
        }
        if !rest.is_empty() {
            self.decode((hash >> 16) ^ hash, offset, rest)?;
        }
        Ok(())
    }

    /// Encrypt `buf` holding entry bytes at logical `offset`.
    pub fn encrypt(&self, hash: u32, offset: u64, buf: &mut [u8]) -> Result<(), SynthesisError> {
        self.decrypt(hash, offset, buf)
    }

    /// Synthesize every program up front.
    pub fn warm_up(&self) -> Result<(), SynthesisError> {
        for seed in 0..SEED_COUNT as u8 {
            self.program(seed)?;
        }
        debug!("Cached {} cipher programs", self.programs.len());
        Ok(())
    }
}

impl EntryCipher for CxEncryption {
    fn decrypt(&self, hash: u32, offset: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        Self::decrypt(self, hash, offset, buf).map_err(CryptoError::from)
    }

    fn startup_tjs_not_encrypted(&self) -> bool {
        self.scheme.startup_tjs_not_encrypted
    }

    fn obfuscated_index(&self) -> bool {
        self.scheme.obfuscated_index
    }
}
