//! Error types for archive operations

use std::io;

use resarc_crypto::{CryptoError, SchemeError, SynthesisError};
use thiserror::Error;

/// Archive operation result type
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors raised while opening archives or reading their entries
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Container does not start with a recognized signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// Directory block is malformed
    #[error("Invalid archive index: {reason}")]
    InvalidIndex {
        /// Detailed description of the problem
        reason: String,
    },

    /// Decompressed directory size differs from the declared size
    #[error("Index size mismatch: expected {expected} bytes, got {actual}")]
    IndexSizeMismatch {
        /// Declared unpacked size
        expected: u64,
        /// Actual unpacked size
        actual: u64,
    },

    /// Directory parsed but yielded no usable entries
    #[error("Archive contains no entries")]
    NoEntries,

    /// Cipher scheme is unknown or could not be activated
    #[error(transparent)]
    Scheme(#[from] SchemeError),

    /// Cipher program synthesis or execution failed
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// A segment produced fewer bytes than declared
    #[error("Short segment in {entry}: expected {expected} bytes, got {actual}")]
    ShortSegment {
        /// Entry name
        entry: String,
        /// Declared uncompressed size
        expected: u64,
        /// Bytes actually produced
        actual: u64,
    },

    /// Segment data failed to inflate
    #[error("Decompression failed in {entry}: {source}")]
    Decompression {
        /// Entry name
        entry: String,
        /// Inflate error
        #[source]
        source: io::Error,
    },

    /// Entry index out of range
    #[error("Entry not found: index {0}")]
    EntryNotFound(usize),

    /// Candidate name template could not be parsed
    #[error("Invalid name template {template:?}: {reason}")]
    InvalidTemplate {
        /// Template text
        template: String,
        /// What is wrong with it
        reason: String,
    },

    /// No registered format accepted the container
    #[error("No matching archive format for {0}")]
    NoMatchingFormat(String),

    /// Binary read error
    #[error("Binary format error: {0}")]
    BinRead(#[from] binrw::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Catalog parse error
    #[error("Catalog error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CryptoError> for ArchiveError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Scheme(e) => Self::Scheme(e),
            CryptoError::Synthesis(e) => Self::Synthesis(e),
        }
    }
}

impl ArchiveError {
    /// Shorthand for an [`ArchiveError::InvalidIndex`]
    pub fn invalid_index(reason: impl Into<String>) -> Self {
        Self::InvalidIndex {
            reason: reason.into(),
        }
    }

    /// The container is not in this format; the next format may be tried
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature
                | Self::InvalidIndex { .. }
                | Self::IndexSizeMismatch { .. }
                | Self::NoEntries
                | Self::BinRead(_)
        )
    }

    /// Failure confined to a single entry; sibling entries stay readable
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::ShortSegment { .. } | Self::Decompression { .. }
        )
    }

    /// Recover an archive error carried through an [`io::Error`].
    ///
    /// Entry streams implement [`io::Read`], so their failures travel as
    /// `io::Error::other(ArchiveError)`.
    pub fn from_io(err: io::Error) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<Self>())
        {
            return Self::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Self>()) {
            Some(Ok(archive)) => *archive,
            Some(Err(other)) => Self::Io(io::Error::new(kind, other)),
            None => Self::Io(io::Error::from(kind)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_format_errors_fall_through() {
        assert!(ArchiveError::InvalidSignature.is_format_error());
        assert!(ArchiveError::invalid_index("bad").is_format_error());
        assert!(!ArchiveError::EntryNotFound(3).is_format_error());
        assert!(!ArchiveError::Scheme(SchemeError::UnknownTitle("x".into())).is_format_error());
    }

    #[test]
    fn test_round_trip_through_io() {
        let err = ArchiveError::ShortSegment {
            entry: "a.txt".into(),
            expected: 10,
            actual: 4,
        };
        let recovered = ArchiveError::from_io(io::Error::other(err));
        assert!(recovered.is_decode_error());
        assert!(matches!(
            recovered,
            ArchiveError::ShortSegment { actual: 4, .. }
        ));
    }

    #[test]
    fn test_plain_io_error_kept() {
        let recovered =
            ArchiveError::from_io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(
            recovered,
            ArchiveError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn test_crypto_error_mapping() {
        let err: ArchiveError = CryptoError::from(SynthesisError::MissingReturn).into();
        assert!(matches!(err, ArchiveError::Synthesis(SynthesisError::MissingReturn)));
    }
}
