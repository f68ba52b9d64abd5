//! KiriKiri XP3 archives
//!
//! An XP3 archive is a signature, a (possibly compressed) index block and
//! the entry data. Every entry is a list of segments that are each stored
//! raw or zlib-compressed. Encrypted entries go through an
//! [`EntryCipher`], normally the Cx cipher activated from a
//! [`CipherScheme`].
//!
//! The cipher is resolved when the archive is opened. A scheme that cannot
//! be activated does not prevent opening: the archive lists its entries
//! and reads of plain entries work, while encrypted entries report the
//! activation failure.

pub mod entry;
pub mod header;
pub mod index;
pub mod names;
pub mod stream;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use resarc_crypto::{CipherScheme, EntryCipher, SchemeError};
use tracing::{info, warn};

pub use entry::{Segment, Xp3Entry};
pub use header::{IndexHeader, XP3_SIGNATURE, Xp3Header};
pub use index::IndexLayout;
pub use names::{CandidateGrammar, FilenameTable};
pub use stream::EntryReader;

use crate::catalog::{CatalogMatch, SchemeCatalog};
use crate::error::{ArchiveError, ArchiveResult};
use crate::registry::{ArchiveFormat, EntryInfo, ResourceArchive};
use crate::source::{ByteSource, MappedFile};

/// Name of the script that some schemes leave unencrypted
pub const STARTUP_SCRIPT: &str = "startup.tjs";

/// Format tag
pub const XP3_TAG: &str = "XP3";

/// Cipher available to an opened archive
#[derive(Debug, Clone)]
pub enum CipherState {
    /// No entry needs decryption
    None,
    /// Encrypted entries are decrypted with this cipher
    Ready(Arc<dyn EntryCipher>),
    /// Encrypted entries cannot be read
    Unavailable(String),
}

impl CipherState {
    /// Whether encrypted entries can be read
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl std::fmt::Display for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Ready(_) => f.write_str("ready"),
            Self::Unavailable(reason) => write!(f, "unavailable ({reason})"),
        }
    }
}

/// How XP3 archives are opened
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Scheme to activate, taking precedence over the catalog
    pub scheme: Option<CipherScheme>,
    /// Catalog consulted when no scheme is given
    pub catalog: Option<Arc<SchemeCatalog>>,
    /// Ready-made cipher, taking precedence over everything else
    pub cipher: Option<Arc<dyn EntryCipher>>,
    /// Treat every entry as encrypted when a scheme is known
    pub force_encryption: bool,
    /// Naming conventions used to recover hashed entry names
    pub candidates: Vec<CandidateGrammar>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            scheme: None,
            catalog: None,
            cipher: None,
            force_encryption: true,
            candidates: Vec::new(),
        }
    }
}

impl OpenOptions {
    /// Default options: no scheme, forced encryption
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `scheme` on open.
    #[must_use]
    pub fn with_scheme(mut self, scheme: CipherScheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    /// Look schemes up in `catalog`.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<SchemeCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Use an already activated cipher.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn EntryCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Only decrypt entries whose `info` flags say so.
    #[must_use]
    pub fn honor_entry_flags(mut self) -> Self {
        self.force_encryption = false;
        self
    }

    /// Add a naming convention for hashed names.
    #[must_use]
    pub fn with_candidates(mut self, grammar: CandidateGrammar) -> Self {
        self.candidates.push(grammar);
        self
    }
}

/// Cipher resolution before the index is parsed
enum Resolution {
    Active(Arc<dyn EntryCipher>),
    Failed {
        reason: String,
        obfuscated_index: bool,
        startup_tjs_not_encrypted: bool,
    },
    NoCrypt,
    Unconfigured(String),
}

impl Resolution {
    fn obfuscated_index(&self) -> bool {
        match self {
            Self::Active(cipher) => cipher.obfuscated_index(),
            Self::Failed {
                obfuscated_index, ..
            } => *obfuscated_index,
            Self::NoCrypt | Self::Unconfigured(_) => false,
        }
    }

    fn startup_tjs_not_encrypted(&self) -> bool {
        match self {
            Self::Active(cipher) => cipher.startup_tjs_not_encrypted(),
            Self::Failed {
                startup_tjs_not_encrypted,
                ..
            } => *startup_tjs_not_encrypted,
            Self::NoCrypt | Self::Unconfigured(_) => false,
        }
    }
}

fn activate(scheme: &CipherScheme, path: Option<&Path>) -> Resolution {
    let dir = path
        .and_then(Path::parent)
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match scheme.activate(dir) {
        Ok(cx) => Resolution::Active(Arc::new(cx)),
        Err(err) => {
            warn!("Cipher scheme unavailable: {err}");
            Resolution::Failed {
                reason: err.to_string(),
                obfuscated_index: scheme.obfuscated_index,
                startup_tjs_not_encrypted: scheme.startup_tjs_not_encrypted,
            }
        }
    }
}

fn resolve_cipher(path: Option<&Path>, options: &OpenOptions) -> Resolution {
    if let Some(cipher) = &options.cipher {
        return Resolution::Active(Arc::clone(cipher));
    }
    if let Some(scheme) = &options.scheme {
        return activate(scheme, path);
    }
    if let (Some(catalog), Some(path)) = (&options.catalog, path) {
        return match catalog.resolve(path) {
            CatalogMatch::Scheme { title, scheme } => {
                info!("Using cipher scheme of {title}");
                activate(scheme, Some(path))
            }
            CatalogMatch::NoCrypt { title } => {
                info!("{title} stores plain archives");
                Resolution::NoCrypt
            }
            CatalogMatch::Unknown => Resolution::Unconfigured(
                SchemeError::UnknownTitle(path.display().to_string()).to_string(),
            ),
        };
    }
    Resolution::Unconfigured("no cipher scheme configured".to_string())
}

/// An opened XP3 archive
pub struct Xp3Archive {
    source: Arc<dyn ByteSource>,
    header: Xp3Header,
    entries: Vec<Xp3Entry>,
    cipher: CipherState,
}

impl std::fmt::Debug for Xp3Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xp3Archive")
            .field("len", &self.source.len())
            .field("header", &self.header)
            .field("entries", &self.entries.len())
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl Xp3Archive {
    /// Open an archive held in memory or behind any byte source.
    ///
    /// `path` names the archive file; it locates companion files and is
    /// used for catalog lookups.
    pub fn open(
        source: Arc<dyn ByteSource>,
        path: Option<&Path>,
        options: &OpenOptions,
    ) -> ArchiveResult<Self> {
        let header = Xp3Header::locate(source.as_ref())?;
        let index = header.read_index(source.as_ref())?;

        let resolution = resolve_cipher(path, options);

        let mut names = FilenameTable::new();
        for grammar in &options.candidates {
            names.add_candidates(grammar);
        }
        let layout = IndexLayout {
            container_len: source.len(),
            base_offset: header.base_offset,
            obfuscated_index: resolution.obfuscated_index(),
        };
        let mut entries = index::parse_index(&index, &layout, &mut names)?;

        let startup_exempt = resolution.startup_tjs_not_encrypted();
        let force = options.force_encryption;
        let mark_scheme_entries = |entries: &mut [Xp3Entry]| {
            for entry in entries {
                entry.is_encrypted = (entry.flags != 0 || force)
                    && !(startup_exempt && entry.name == STARTUP_SCRIPT);
            }
        };
        let cipher = match resolution {
            Resolution::Active(cipher) => {
                mark_scheme_entries(&mut entries);
                CipherState::Ready(cipher)
            }
            Resolution::Failed { reason, .. } => {
                mark_scheme_entries(&mut entries);
                CipherState::Unavailable(reason)
            }
            Resolution::NoCrypt => {
                for entry in &mut entries {
                    entry.is_encrypted = false;
                }
                CipherState::None
            }
            Resolution::Unconfigured(reason) => {
                if entries.iter().any(|e| e.is_encrypted) {
                    warn!("Archive has encrypted entries but {reason}");
                    CipherState::Unavailable(reason)
                } else {
                    CipherState::None
                }
            }
        };

        info!(
            "Opened XP3 archive: {} entries, cipher {cipher}",
            entries.len()
        );
        Ok(Self {
            source,
            header,
            entries,
            cipher,
        })
    }

    /// Map the file at `path` and open it.
    pub fn open_path(path: impl AsRef<Path>, options: &OpenOptions) -> ArchiveResult<Self> {
        let path = path.as_ref();
        let source: Arc<dyn ByteSource> = Arc::new(MappedFile::open(path)?);
        Self::open(source, Some(path), options)
    }

    /// Entries in index order
    pub fn entries(&self) -> &[Xp3Entry] {
        &self.entries
    }

    /// Entry at `index`
    pub fn entry(&self, index: usize) -> Option<&Xp3Entry> {
        self.entries.get(index)
    }

    /// Entry named `name`, ignoring ASCII case
    pub fn find(&self, name: &str) -> Option<&Xp3Entry> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// Cipher state resolved on open
    pub fn cipher_state(&self) -> &CipherState {
        &self.cipher
    }

    /// Offset of the archive within its source
    pub fn base_offset(&self) -> u64 {
        self.header.base_offset
    }

    /// Stream over the contents of `entry`.
    pub fn reader(&self, entry: &Xp3Entry) -> ArchiveResult<EntryReader> {
        let cipher = if entry.is_encrypted {
            match &self.cipher {
                CipherState::Ready(cipher) => Some(Arc::clone(cipher)),
                CipherState::Unavailable(reason) => {
                    return Err(SchemeError::Unavailable(reason.clone()).into());
                }
                CipherState::None => {
                    return Err(SchemeError::Unavailable("no cipher configured".into()).into());
                }
            }
        } else {
            None
        };
        Ok(EntryReader::new(Arc::clone(&self.source), entry, cipher))
    }

    /// Decoded contents of `entry`.
    pub fn read_entry(&self, entry: &Xp3Entry) -> ArchiveResult<Vec<u8>> {
        let mut reader = self.reader(entry)?;
        let mut out = Vec::with_capacity(usize::try_from(entry.unpacked_size).unwrap_or(0));
        reader
            .read_to_end(&mut out)
            .map_err(ArchiveError::from_io)?;
        Ok(out)
    }

    /// Whether the decoded contents of `entry` match its Adler-32 hash.
    pub fn verify_entry(&self, entry: &Xp3Entry) -> ArchiveResult<bool> {
        let mut reader = self.reader(entry)?;
        let mut checksum = adler2::Adler32::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(ArchiveError::from_io)?;
            if n == 0 {
                break;
            }
            checksum.write_slice(&buf[..n]);
        }
        Ok(checksum.checksum() == entry.hash)
    }
}

impl ResourceArchive for Xp3Archive {
    fn format_tag(&self) -> &'static str {
        XP3_TAG
    }

    fn entries(&self) -> Vec<EntryInfo> {
        self.entries.iter().map(Xp3Entry::info).collect()
    }

    fn open_entry(&self, index: usize) -> ArchiveResult<Box<dyn Read + Send>> {
        let entry = self
            .entries
            .get(index)
            .ok_or(ArchiveError::EntryNotFound(index))?;
        Ok(Box::new(self.reader(entry)?))
    }
}

/// XP3 format registration
#[derive(Debug, Clone, Default)]
pub struct Xp3Format {
    options: OpenOptions,
}

impl Xp3Format {
    /// Format that opens archives with `options`
    pub fn new(options: OpenOptions) -> Self {
        Self { options }
    }

    /// Options used for every archive
    pub fn options(&self) -> &OpenOptions {
        &self.options
    }
}

impl ArchiveFormat for Xp3Format {
    fn tag(&self) -> &'static str {
        XP3_TAG
    }

    fn description(&self) -> &'static str {
        "KiriKiri engine resource archive"
    }

    fn signatures(&self) -> &[u32] {
        // "XP3\r" and "MZ" executables with an embedded archive
        &[0x0D33_5058, 0x0090_5A4D]
    }

    fn extensions(&self) -> &[&'static str] {
        &["xp3", "exe"]
    }

    fn try_open(
        &self,
        source: Arc<dyn ByteSource>,
        path: Option<&Path>,
    ) -> ArchiveResult<Box<dyn ResourceArchive>> {
        Ok(Box::new(Xp3Archive::open(source, path, &self.options)?))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    // `adlr` hashes are plain Adler-32; these pin the values entries are keyed on.

    #[test]
    fn test_checksum_empty() {
        assert_eq!(adler2::adler32_slice(b""), 1);
    }

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(adler2::adler32_slice(b"Wikipedia"), 0x11E6_0398);
        assert_eq!(adler2::adler32_slice(b"a"), 0x0062_0062);
        assert_eq!(adler2::adler32_slice(b"abc"), 0x024D_0127);
    }

    #[test]
    fn test_checksum_large_input_reduces() {
        let data = vec![0xFFu8; 100_000];
        let sum = adler2::adler32_slice(&data);
        assert!(sum & 0xFFFF < 65521);
        assert!(sum >> 16 < 65521);
    }

    #[test]
    fn test_checksum_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut state = adler2::Adler32::new();
        for chunk in data.chunks(777) {
            state.write_slice(chunk);
        }
        assert_eq!(state.checksum(), adler2::adler32_slice(&data));
    }
}
