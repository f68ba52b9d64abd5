//! Cipher primitives for obfuscated game resource archives
//!
//! This crate implements the Cx entry cipher used by KiriKiri XP3 archives.
//! The cipher key for every entry is produced by a small register program
//! synthesized from a 7-bit seed and a per-title [`CipherScheme`].
//!
//! # Components
//!
//! - **Scheme**: per-title parameters, loadable with serde
//! - **Control block**: 1024-word table recovered from a companion plugin
//! - **Synthesis**: deterministic program generation under a slot budget
//! - **Interpreter**: pure evaluation of synthesized programs
//! - **Cipher**: [`CxEncryption`] and the [`EntryCipher`] seam used by readers
//!
//! # Examples
//!
//! ```
//! use resarc_crypto::{CipherScheme, ControlBlock, CxEncryption};
//!
//! let scheme = CipherScheme::new(
//!     0x17C,
//!     0x682,
//!     [1, 0, 2],
//!     [2, 1, 4, 5, 0, 3],
//!     [4, 6, 1, 5, 2, 7, 0, 3],
//! );
//! let block = ControlBlock::from_words(&[0u32; 1024]).expect("valid length");
//! let cx = CxEncryption::new(scheme, block).expect("valid scheme");
//!
//! let mut data = *b"some entry bytes";
//! cx.encrypt(0x1234_5678, 0, &mut data).expect("synthesis succeeds");
//! cx.decrypt(0x1234_5678, 0, &mut data).expect("synthesis succeeds");
//! assert_eq!(&data, b"some entry bytes");
//! ```

#![warn(missing_docs)]

pub mod cipher;
pub mod control_block;
pub mod cx;
pub mod error;
pub mod program;
pub mod scheme;
pub mod synth;

pub use cipher::EntryCipher;
pub use control_block::ControlBlock;
pub use cx::CxEncryption;
pub use error::{CryptoError, SchemeError, SynthesisError};
pub use program::{Op, Program};
pub use scheme::CipherScheme;
pub use synth::{synthesize, synthesize_with_limit};
