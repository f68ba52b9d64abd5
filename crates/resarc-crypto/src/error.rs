//! Error types for cipher schemes and program synthesis

use thiserror::Error;

/// Errors that make a cipher scheme unusable for a title.
///
/// These surface as "decoding unavailable": the archive itself stays open,
/// only decrypted reads are blocked.
#[derive(Debug, Error)]
pub enum SchemeError {
    /// No scheme is known for the title
    #[error("no cipher scheme known for title: {0}")]
    UnknownTitle(String),

    /// A permutation table holds a value outside its branch range
    #[error("invalid {table} table: value {value} at index {index} exceeds {limit}")]
    InvalidOrder {
        /// Name of the offending table
        table: &'static str,
        /// Index within the table
        index: usize,
        /// Value found
        value: u8,
        /// Exclusive upper bound for values in this table
        limit: u8,
    },

    /// A permutation table selects the same variant twice
    #[error("invalid {table} table: value {value} appears more than once")]
    NotPermutation {
        /// Name of the offending table
        table: &'static str,
        /// Repeated value
        value: u8,
    },

    /// Inline control block has the wrong number of words
    #[error("invalid control block length: expected 1024 words, got {0}")]
    InvalidControlBlockLength(usize),

    /// Neither an inline control block nor a companion file was configured
    #[error("scheme has no control block and no companion file")]
    NoControlBlockSource,

    /// Companion file is too small to hold a control block
    #[error("companion file too small: {size} bytes (need at least 4096)")]
    CompanionTooSmall {
        /// Actual file size
        size: u64,
    },

    /// The control block marker was not found in the companion file
    #[error("no control block found in companion file {0}")]
    ControlBlockNotFound(String),

    /// Companion file could not be read
    #[error("cannot read companion file {path}: {source}")]
    CompanionIo {
        /// Path that was opened
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Scheme activation failed earlier; decrypted reads are blocked
    #[error("decoding unavailable: {0}")]
    Unavailable(String),
}

/// Internal failures of program synthesis or interpretation.
///
/// All of these point at a wrong or corrupted scheme table and are never
/// recovered automatically.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    /// Every stage from 5 down to 1 exceeded the opcode slot budget
    #[error("cipher program for seed {seed:#04x} exceeds {limit} slots at every stage")]
    ProgramTooLarge {
        /// Synthesis seed
        seed: u8,
        /// Slot budget
        limit: usize,
    },

    /// RETURN executed with values left on the stack
    #[error("imbalanced stack in cipher program ({0} values left)")]
    UnbalancedStack(usize),

    /// POP executed on an empty stack
    #[error("stack underflow in cipher program")]
    StackUnderflow,

    /// Table lookup outside the control block
    #[error("control block index out of range: {0:#x}")]
    TableIndexOutOfRange(u32),

    /// Program ran off its end
    #[error("cipher program without RETURN")]
    MissingReturn,
}

/// Any error raised by this crate
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Scheme is unusable
    #[error(transparent)]
    Scheme(#[from] SchemeError),

    /// Program synthesis or execution failed
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}
