//! Title-keyed cipher scheme catalog
//!
//! A catalog maps game titles to cipher schemes and archive or executable
//! file names to titles. It is loaded from JSON:
//!
//! ```json
//! {
//!   "schemes": { "Some Title": { "mask": 380, "offset": 1666, ... } },
//!   "no_crypt_titles": ["Plain Title"],
//!   "games": { "game.exe": "Some Title", "data.xp3": "Plain Title" }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use resarc_crypto::CipherScheme;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ArchiveResult;

/// Known cipher schemes and the files that identify their titles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeCatalog {
    /// Title to scheme
    #[serde(default)]
    pub schemes: BTreeMap<String, CipherScheme>,
    /// Titles whose archives are not encrypted
    #[serde(default)]
    pub no_crypt_titles: BTreeSet<String>,
    /// File name to title
    #[serde(default)]
    pub games: BTreeMap<String, String>,
}

/// Outcome of looking up an archive in a catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogMatch<'a> {
    /// Title with a cipher scheme
    Scheme {
        /// Title
        title: &'a str,
        /// Scheme for the title
        scheme: &'a CipherScheme,
    },
    /// Title known to store plain archives
    NoCrypt {
        /// Title
        title: &'a str,
    },
    /// Nothing identifies the archive
    Unknown,
}

impl SchemeCatalog {
    /// Parse a JSON catalog.
    pub fn from_json(json: &str) -> ArchiveResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON catalog file.
    pub fn load(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref();
        let catalog = Self::from_json(&fs::read_to_string(path)?)?;
        debug!(
            "Loaded {} schemes and {} game mappings from {}",
            catalog.schemes.len(),
            catalog.games.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Scheme registered for `title`
    pub fn get(&self, title: &str) -> Option<&CipherScheme> {
        self.schemes.get(title)
    }

    /// Title registered for a file name, ignoring ASCII case
    pub fn title_for(&self, file_name: &str) -> Option<&str> {
        self.games
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(file_name))
            .map(|(_, title)| title.as_str())
    }

    fn classify<'a>(&'a self, title: &'a str) -> Option<CatalogMatch<'a>> {
        if let Some((title, scheme)) = self.schemes.get_key_value(title) {
            return Some(CatalogMatch::Scheme { title, scheme });
        }
        self.no_crypt_titles
            .get(title)
            .map(|title| CatalogMatch::NoCrypt { title })
    }

    /// Identify the title of the archive at `path`.
    ///
    /// The archive file name is tried first, then every executable in the
    /// same directory in name order.
    pub fn resolve(&self, path: &Path) -> CatalogMatch<'_> {
        let mut keys: Vec<String> = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .into_iter()
            .collect();

        if let Some(dir) = path.parent() {
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            if let Ok(read_dir) = fs::read_dir(dir) {
                let mut exes: Vec<String> = read_dir
                    .filter_map(Result::ok)
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .filter(|name| {
                        Path::new(name)
                            .extension()
                            .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
                    })
                    .collect();
                exes.sort();
                keys.extend(exes);
            }
        }

        for key in &keys {
            if let Some(found) = self.title_for(key).and_then(|title| self.classify(title)) {
                debug!("Identified {} via {key}", path.display());
                return found;
            }
        }
        CatalogMatch::Unknown
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs::File;

    const CATALOG: &str = r#"{
        "schemes": {
            "Encrypted Title": {
                "mask": 380,
                "offset": 1666,
                "prolog_order": [1, 0, 2],
                "odd_branch_order": [2, 1, 4, 5, 0, 3],
                "even_branch_order": [4, 6, 1, 5, 2, 7, 0, 3],
                "tpm_file_name": "plugin/cx.tpm"
            }
        },
        "no_crypt_titles": ["Plain Title"],
        "games": {
            "Game.exe": "Encrypted Title",
            "plain.xp3": "Plain Title",
            "orphan.xp3": "Missing Title"
        }
    }"#;

    #[test]
    fn test_parse() {
        let catalog = SchemeCatalog::from_json(CATALOG).unwrap();
        let scheme = catalog.get("Encrypted Title").unwrap();
        assert_eq!(scheme.mask, 0x17C);
        assert_eq!(scheme.offset, 0x682);
        assert_eq!(scheme.tpm_file_name.as_deref(), Some("plugin/cx.tpm"));
        assert!(!scheme.obfuscated_index);
        assert_eq!(catalog.title_for("GAME.EXE"), Some("Encrypted Title"));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            SchemeCatalog::from_json("{ not json"),
            Err(crate::error::ArchiveError::Json(_))
        ));
    }

    #[test]
    fn test_resolve_by_archive_name() {
        let catalog = SchemeCatalog::from_json(CATALOG).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            catalog.resolve(&dir.path().join("plain.xp3")),
            CatalogMatch::NoCrypt {
                title: "Plain Title"
            }
        );
    }

    #[test]
    fn test_resolve_by_sibling_executable() {
        let catalog = SchemeCatalog::from_json(CATALOG).unwrap();
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("game.exe")).unwrap();

        match catalog.resolve(&dir.path().join("data.xp3")) {
            CatalogMatch::Scheme { title, scheme } => {
                assert_eq!(title, "Encrypted Title");
                assert_eq!(scheme.prolog_order, [1, 0, 2]);
            }
            other => unreachable!("unexpected match {other:?}"),
        }
    }

    #[test]
    fn test_unknown() {
        let catalog = SchemeCatalog::from_json(CATALOG).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            catalog.resolve(&dir.path().join("data.xp3")),
            CatalogMatch::Unknown
        );
        // mapped title without a scheme or plain entry
        assert_eq!(
            catalog.resolve(&dir.path().join("orphan.xp3")),
            CatalogMatch::Unknown
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(&path, CATALOG).unwrap();
        let catalog = SchemeCatalog::load(&path).unwrap();
        assert_eq!(catalog.schemes.len(), 1);
        assert!(catalog.no_crypt_titles.contains("Plain Title"));
    }
}
