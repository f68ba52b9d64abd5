//! Per-title cipher scheme configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::control_block::{CONTROL_BLOCK_WORDS, ControlBlock};
use crate::cx::CxEncryption;
use crate::error::{CryptoError, SchemeError};

/// Number of prolog variants
pub const PROLOG_VARIANTS: u8 = 3;
/// Number of odd-branch variants
pub const ODD_BRANCH_VARIANTS: u8 = 6;
/// Number of even-branch variants
pub const EVEN_BRANCH_VARIANTS: u8 = 8;

/// Cipher parameters for one title.
///
/// Schemes are usually loaded from a JSON catalog. The control block is
/// either given inline (1024 words in stored, complemented form) or
/// recovered from a companion plugin next to the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherScheme {
    /// Mask applied to the entry hash to place the head/tail boundary
    pub mask: u32,
    /// Offset added to the masked hash
    pub offset: u32,
    /// Permutation over the 3 prolog variants
    pub prolog_order: [u8; 3],
    /// Permutation over the 6 odd-branch variants
    pub odd_branch_order: [u8; 6],
    /// Permutation over the 8 even-branch variants
    pub even_branch_order: [u8; 8],
    /// Inline control block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_block: Option<Vec<u32>>,
    /// Companion file holding the control block, relative to the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_file_name: Option<String>,
    /// Seeds the xorshift program generator instead of the default LCG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u32>,
    /// `startup.tjs` is stored in plain text
    #[serde(default)]
    pub startup_tjs_not_encrypted: bool,
    /// Index names are obfuscated with `dir/../` prefixes
    #[serde(default)]
    pub obfuscated_index: bool,
}

impl CipherScheme {
    /// Scheme with the given parameters and no control block source.
    pub fn new(
        mask: u32,
        offset: u32,
        prolog_order: [u8; 3],
        odd_branch_order: [u8; 6],
        even_branch_order: [u8; 8],
    ) -> Self {
        Self {
            mask,
            offset,
            prolog_order,
            odd_branch_order,
            even_branch_order,
            control_block: None,
            tpm_file_name: None,
            random_seed: None,
            startup_tjs_not_encrypted: false,
            obfuscated_index: false,
        }
    }

    /// Attach an inline control block.
    #[must_use]
    pub fn with_control_block(mut self, words: Vec<u32>) -> Self {
        self.control_block = Some(words);
        self
    }

    /// Attach a companion file name.
    #[must_use]
    pub fn with_tpm_file(mut self, name: impl Into<String>) -> Self {
        self.tpm_file_name = Some(name.into());
        self
    }

    /// Use the xorshift program generator.
    #[must_use]
    pub fn with_random_seed(mut self, seed: u32) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Check that every order table is a permutation of its variants.
    pub fn validate(&self) -> Result<(), SchemeError> {
        check_order("prolog", &self.prolog_order, PROLOG_VARIANTS)?;
        check_order("odd branch", &self.odd_branch_order, ODD_BRANCH_VARIANTS)?;
        check_order("even branch", &self.even_branch_order, EVEN_BRANCH_VARIANTS)?;
        if let Some(words) = &self.control_block
            && words.len() != CONTROL_BLOCK_WORDS
        {
            return Err(SchemeError::InvalidControlBlockLength(words.len()));
        }
        Ok(())
    }

    /// Resolve the control block and build the cipher.
    ///
    /// `archive_dir` is the directory the companion file name is resolved
    /// against. An inline control block takes precedence.
    pub fn activate(&self, archive_dir: &Path) -> Result<CxEncryption, CryptoError> {
        self.validate()?;

        let block = if let Some(words) = &self.control_block {
            debug!("Using inline control block");
            ControlBlock::from_words(words)?
        } else if let Some(name) = &self.tpm_file_name {
            let path = archive_dir.join(name);
            info!("Loading control block from {}", path.display());
            ControlBlock::load(&path)?
        } else {
            return Err(SchemeError::NoControlBlockSource.into());
        };

        CxEncryption::new(self.clone(), block).map_err(CryptoError::from)
    }
}

fn check_order(table: &'static str, order: &[u8], limit: u8) -> Result<(), SchemeError> {
    let mut seen = [false; EVEN_BRANCH_VARIANTS as usize];
    for (index, &value) in order.iter().enumerate() {
        if value >= limit {
            return Err(SchemeError::InvalidOrder {
                table,
                index,
                value,
                limit,
            });
        }
        let slot = &mut seen[usize::from(value)];
        if *slot {
            return Err(SchemeError::NotPermutation { table, value });
        }
        *slot = true;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn scheme() -> CipherScheme {
        CipherScheme::new(0x17C, 0x682, [1, 0, 2], [2, 1, 4, 5, 0, 3], [4, 6, 1, 5, 2, 7, 0, 3])
    }

    #[test]
    fn test_validate_accepts_permutations() {
        assert!(scheme().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_entry() {
        let mut bad = scheme();
        bad.even_branch_order = [4, 6, 1, 5, 2, 7, 4, 3];
        let err = bad.validate().unwrap_err();
        assert!(matches!(
            err,
            SchemeError::NotPermutation {
                table: "even branch",
                value: 4
            }
        ));

        let mut bad = scheme();
        bad.prolog_order = [1, 1, 2];
        assert!(matches!(
            bad.validate(),
            Err(SchemeError::NotPermutation {
                table: "prolog",
                value: 1
            })
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut bad = scheme();
        bad.odd_branch_order[4] = 6;
        let err = bad.validate().unwrap_err();
        assert!(matches!(
            err,
            SchemeError::InvalidOrder {
                index: 4,
                value: 6,
                limit: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_short_control_block() {
        let bad = scheme().with_control_block(vec![0; 12]);
        assert!(matches!(
            bad.validate(),
            Err(SchemeError::InvalidControlBlockLength(12))
        ));
    }

    #[test]
    fn test_activate_without_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = scheme().activate(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::Scheme(SchemeError::NoControlBlockSource)
        ));
    }

    #[test]
    fn test_activate_with_missing_companion_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = scheme()
            .with_tpm_file("plugin/missing.tpm")
            .activate(dir.path())
            .unwrap_err();
        assert!(matches!(
            err,
            CryptoError::Scheme(SchemeError::CompanionIo { .. })
        ));
    }

    #[test]
    fn test_activate_inline() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = scheme()
            .with_control_block(vec![0; CONTROL_BLOCK_WORDS])
            .activate(dir.path())
            .unwrap();
        assert_eq!(cipher.scheme().mask, 0x17C);
    }

    #[test]
    fn test_json_round_trip() {
        let json = r#"{
            "mask": 380,
            "offset": 1666,
            "prolog_order": [1, 0, 2],
            "odd_branch_order": [2, 1, 4, 5, 0, 3],
            "even_branch_order": [4, 6, 1, 5, 2, 7, 0, 3],
            "tpm_file_name": "plugin/game.tpm",
            "startup_tjs_not_encrypted": true
        }"#;
        let parsed: CipherScheme = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.mask, 0x17C);
        assert_eq!(parsed.tpm_file_name.as_deref(), Some("plugin/game.tpm"));
        assert!(parsed.startup_tjs_not_encrypted);
        assert!(!parsed.obfuscated_index);
        assert_eq!(parsed.random_seed, None);

        let back: CipherScheme =
            serde_json::from_str(&serde_json::to_string(&parsed).unwrap()).unwrap();
        assert_eq!(back, parsed);
    }
}
