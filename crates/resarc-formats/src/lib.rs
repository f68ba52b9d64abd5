//! Container parsers for obfuscated game resource archives
//!
//! This crate opens KiriKiri XP3 archives, lists their entries and streams
//! entry contents with segment decompression and Cx decryption applied.
//!
//! # Components
//!
//! - **Sources**: random-access container bytes, in memory or memory-mapped
//! - **XP3**: header location, index parsing, segmented entry reader
//! - **Names**: recovery of hashed entry names from side records or
//!   enumerated naming conventions
//! - **Catalog**: title-keyed cipher schemes loaded from JSON
//! - **Registry**: signature and extension based format detection
//!
//! # Examples
//!
//! ```no_run
//! use std::io::Read;
//!
//! use resarc_formats::xp3::{OpenOptions, Xp3Archive};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let archive = Xp3Archive::open_path("data.xp3", &OpenOptions::new())?;
//! for entry in archive.entries() {
//!     let mut data = Vec::new();
//!     archive.reader(entry)?.read_to_end(&mut data)?;
//!     println!("{} ({} bytes)", entry.name, data.len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod error;
pub mod registry;
pub mod source;
pub mod xp3;

pub use catalog::{CatalogMatch, SchemeCatalog};
pub use error::{ArchiveError, ArchiveResult};
pub use registry::{ArchiveFormat, EntryInfo, FormatRegistry, ResourceArchive, TypeHint};
pub use source::{ByteSource, MappedFile, RangeReader};
pub use xp3::{CipherState, OpenOptions, Xp3Archive, Xp3Entry, Xp3Format};
