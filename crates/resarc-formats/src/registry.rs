//! Format registration and the archive-facing API
//!
//! Formats announce 32-bit little-endian signatures and file extensions.
//! [`FormatRegistry::open`] tries every format whose signature matches the
//! first four bytes of the container, then every format claiming the file
//! extension, moving on whenever a format reports a format error.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ArchiveError, ArchiveResult};
use crate::source::{ByteSource, MappedFile};
use crate::xp3::Xp3Format;

/// Coarse content type guessed from an entry name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeHint {
    /// Image data
    Image,
    /// Audio data
    Audio,
    /// Script or text
    Script,
    /// Nested archive
    Archive,
    /// Anything else
    Unknown,
}

impl TypeHint {
    /// Guess from the extension of `name`.
    pub fn from_name(name: &str) -> Self {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return Self::Unknown;
        };
        match ext.to_ascii_lowercase().as_str() {
            "tlg" | "bmp" | "png" | "jpg" | "jpeg" => Self::Image,
            "ogg" | "wav" => Self::Audio,
            "tjs" | "ks" | "txt" | "csv" | "asd" | "anm" => Self::Script,
            "xp3" => Self::Archive,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TypeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Script => "script",
            Self::Archive => "archive",
            Self::Unknown => "",
        };
        f.write_str(name)
    }
}

/// Public view of one archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Resolved entry name
    pub name: String,
    /// Content type guess
    pub type_hint: TypeHint,
    /// Plaintext size in bytes
    pub size: u64,
    /// Whether reads go through the entry cipher
    pub is_encrypted: bool,
}

/// An opened archive
pub trait ResourceArchive: Send + Sync {
    /// Tag of the format that opened this archive
    fn format_tag(&self) -> &'static str;

    /// All entries in directory order
    fn entries(&self) -> Vec<EntryInfo>;

    /// Decoded stream for the entry at `index`
    fn open_entry(&self, index: usize) -> ArchiveResult<Box<dyn Read + Send>>;

    /// Decoded contents of the entry at `index`
    fn read_entry(&self, index: usize) -> ArchiveResult<Vec<u8>> {
        let mut out = Vec::new();
        self.open_entry(index)?
            .read_to_end(&mut out)
            .map_err(ArchiveError::from_io)?;
        Ok(out)
    }
}

/// A container format that can be probed and opened
pub trait ArchiveFormat: Send + Sync {
    /// Short format tag
    fn tag(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// Little-endian first-four-byte signatures this format claims
    fn signatures(&self) -> &[u32];

    /// File extensions this format claims, lowercase without a dot
    fn extensions(&self) -> &[&'static str];

    /// Try to open `source`; `path` locates companion files and catalogs.
    fn try_open(
        &self,
        source: Arc<dyn ByteSource>,
        path: Option<&Path>,
    ) -> ArchiveResult<Box<dyn ResourceArchive>>;
}

/// Ordered set of archive formats
#[derive(Default)]
pub struct FormatRegistry {
    formats: Vec<Box<dyn ArchiveFormat>>,
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.formats.iter().map(|format| format.tag()))
            .finish()
    }
}

impl FormatRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in format using default options
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(Xp3Format::default()));
        registry
    }

    /// Add a format. Earlier registrations are tried first.
    pub fn register(&mut self, format: Box<dyn ArchiveFormat>) {
        debug!("Registered archive format {}", format.tag());
        self.formats.push(format);
    }

    /// Registered formats
    pub fn formats(&self) -> impl Iterator<Item = &dyn ArchiveFormat> {
        self.formats.iter().map(AsRef::as_ref)
    }

    /// Look up a format by tag.
    pub fn get(&self, tag: &str) -> Option<&dyn ArchiveFormat> {
        self.formats()
            .find(|format| format.tag().eq_ignore_ascii_case(tag))
    }

    /// Formats to try for a container, signature matches before extension
    /// matches, each format at most once.
    pub fn candidates(&self, signature: u32, extension: Option<&str>) -> Vec<&dyn ArchiveFormat> {
        let by_signature = self
            .formats()
            .filter(|format| format.signatures().contains(&signature));
        let by_extension = self.formats().filter(|format| {
            extension.is_some_and(|ext| {
                format
                    .extensions()
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
        });

        let mut out: Vec<&dyn ArchiveFormat> = Vec::new();
        for format in by_signature.chain(by_extension) {
            if !out.iter().any(|seen| seen.tag() == format.tag()) {
                out.push(format);
            }
        }
        out
    }

    /// Open `source` with the first format that accepts it.
    pub fn open(
        &self,
        source: Arc<dyn ByteSource>,
        path: Option<&Path>,
    ) -> ArchiveResult<Box<dyn ResourceArchive>> {
        let mut head = [0u8; 4];
        let n = source.read_at(0, &mut head)?;
        let signature = if n == 4 { u32::from_le_bytes(head) } else { 0 };
        let extension = path
            .and_then(|p| p.extension())
            .and_then(|ext| ext.to_str());

        for format in self.candidates(signature, extension) {
            match format.try_open(Arc::clone(&source), path) {
                Ok(archive) => {
                    info!("Opened archive as {}", format.tag());
                    return Ok(archive);
                }
                Err(err) if err.is_format_error() => {
                    debug!("Format {} rejected container: {err}", format.tag());
                }
                Err(err) => return Err(err),
            }
        }

        let name = path.map_or_else(|| "<memory>".to_string(), |p| p.display().to_string());
        Err(ArchiveError::NoMatchingFormat(name))
    }

    /// Map `path` and open it.
    pub fn open_path(&self, path: impl AsRef<Path>) -> ArchiveResult<Box<dyn ResourceArchive>> {
        let path = path.as_ref();
        let source: Arc<dyn ByteSource> = Arc::new(MappedFile::open(path)?);
        self.open(source, Some(path))
    }
}
