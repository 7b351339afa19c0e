// registry.rs — Auxiliary source file registry
//
// Project-wide, content-addressed store of auxiliary source files. Blocks
// reference files by hash and register themselves as users; the registry
// owns the file contents. A file is compiled as its own crate, named after
// the file stem, and linked into the referencing block's primary unit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::block::BlockId;

// ── Data types ──────────────────────────────────────────────────────────────

/// Hex SHA-256 of a file's contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileHash(pub String);

impl FileHash {
    pub fn of(contents: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(contents.as_bytes());
        let digest = hasher.finalize();
        let mut s = String::with_capacity(64);
        for b in digest.iter() {
            let _ = write!(s, "{:02x}", b);
        }
        FileHash(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An auxiliary source file as consumed by the compile path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliarySourceFile {
    /// File name including extension, e.g. `filters.rs`.
    pub name: String,
    pub contents: String,
    pub hash: FileHash,
}

impl AuxiliarySourceFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        let contents = contents.into();
        let hash = FileHash::of(&contents);
        AuxiliarySourceFile {
            name: name.into(),
            contents,
            hash,
        }
    }

    /// Crate name the file compiles to: the file stem.
    pub fn crate_name(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }
}

/// Whether `name` can be used as a crate name by the toolchain.
pub fn is_valid_crate_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown auxiliary file {0}")]
    UnknownFile(String),
    #[error("{missing} additional source file(s) missing for block {block}")]
    MissingFiles { block: String, missing: usize },
    #[error("auxiliary file '{name}' does not map to a valid crate name")]
    InvalidName { name: String },
    #[error("auxiliary file '{name}' has the same contents as '{existing}'")]
    DuplicateContents { name: String, existing: String },
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    file: AuxiliarySourceFile,
    users: BTreeSet<BlockId>,
}

/// In-memory file registry with per-file user sets.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    files: BTreeMap<FileHash, Entry>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file; returns its hash. Re-adding the same file is a no-op.
    ///
    /// Files are identified by contents, so a second name for contents that
    /// are already registered is rejected rather than aliased to the first.
    pub fn insert(&mut self, file: AuxiliarySourceFile) -> Result<FileHash, RegistryError> {
        if !is_valid_crate_name(file.crate_name()) {
            return Err(RegistryError::InvalidName { name: file.name });
        }
        let hash = file.hash.clone();
        if let Some(entry) = self.files.get(&hash) {
            if entry.file.name != file.name {
                return Err(RegistryError::DuplicateContents {
                    name: file.name,
                    existing: entry.file.name.clone(),
                });
            }
            return Ok(hash);
        }
        self.files.insert(
            hash.clone(),
            Entry {
                file,
                users: BTreeSet::new(),
            },
        );
        Ok(hash)
    }

    pub fn get(&self, hash: &FileHash) -> Result<&AuxiliarySourceFile, RegistryError> {
        self.files
            .get(hash)
            .map(|e| &e.file)
            .ok_or_else(|| RegistryError::UnknownFile(hash.0.clone()))
    }

    pub fn add_user(&mut self, hash: &FileHash, block: &BlockId) -> Result<(), RegistryError> {
        let entry = self
            .files
            .get_mut(hash)
            .ok_or_else(|| RegistryError::UnknownFile(hash.0.clone()))?;
        entry.users.insert(block.clone());
        Ok(())
    }

    pub fn remove_user(&mut self, hash: &FileHash, block: &BlockId) -> Result<(), RegistryError> {
        let entry = self
            .files
            .get_mut(hash)
            .ok_or_else(|| RegistryError::UnknownFile(hash.0.clone()))?;
        entry.users.remove(block);
        Ok(())
    }

    pub fn user_count(&self, hash: &FileHash) -> usize {
        self.files.get(hash).map(|e| e.users.len()).unwrap_or(0)
    }

    /// Drop files no block uses any more. Returns how many were removed.
    pub fn prune_unused(&mut self) -> usize {
        let before = self.files.len();
        self.files.retain(|_, e| !e.users.is_empty());
        before - self.files.len()
    }

    pub fn files(&self) -> impl Iterator<Item = &AuxiliarySourceFile> {
        self.files.values().map(|e| &e.file)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
