// artifact.rs — Compiled artifact store
//
// Name-keyed map of compiled binaries and the source text each one was built
// from. The whole set is replaced atomically on a successful compile and is
// persisted as an opaque, versioned MessagePack blob.
//
// Blob formats:
//   1: legacy: map of name → payload (no source text, no toolchain).
//   2: envelope { format, toolchain, artifacts[] }.
// Readers accept both; writers always emit the current format.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

pub const BLOB_FORMAT: u32 = 2;

/// What an artifact is linked as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// Loadable library holding the procedure table.
    Primary,
    /// Library crate built from an auxiliary file, linked into the primary.
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub name: String,
    pub kind: ArtifactKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub source_text: String,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("failed to encode artifact blob: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("unreadable artifact blob: {0}")]
    Decode(String),
    #[error("artifact blob format {0} is newer than supported format {BLOB_FORMAT}")]
    UnsupportedFormat(u32),
    #[error("artifacts were built by '{stored}', current toolchain is '{current}'")]
    ToolchainMismatch { stored: String, current: String },
}

// ── Store ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactStore {
    artifacts: BTreeMap<String, CompiledArtifact>,
    /// Fingerprint of the toolchain that produced the payloads.
    toolchain: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BlobEnvelope {
    format: u32,
    toolchain: Option<String>,
    artifacts: Vec<CompiledArtifact>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_toolchain(toolchain: impl Into<String>) -> Self {
        ArtifactStore {
            artifacts: BTreeMap::new(),
            toolchain: Some(toolchain.into()),
        }
    }

    pub fn put(
        &mut self,
        name: impl Into<String>,
        kind: ArtifactKind,
        payload: Vec<u8>,
        source_text: impl Into<String>,
    ) {
        let name = name.into();
        self.artifacts.insert(
            name.clone(),
            CompiledArtifact {
                name,
                kind,
                payload,
                source_text: source_text.into(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&CompiledArtifact> {
        self.artifacts.get(name)
    }

    /// Replace the whole set with `other` (used on recompile success).
    pub fn replace_all(&mut self, other: ArtifactStore) {
        *self = other;
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &CompiledArtifact> {
        self.artifacts.values()
    }

    pub fn toolchain(&self) -> Option<&str> {
        self.toolchain.as_deref()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Names of auxiliary artifacts: every key except `primary` that was
    /// built from an auxiliary file.
    pub fn auxiliary_names(&self, primary: &str) -> Vec<String> {
        self.artifacts
            .values()
            .filter(|a| a.name != primary && a.kind == ArtifactKind::Auxiliary)
            .map(|a| a.name.clone())
            .collect()
    }

    // ── Persistence ─────────────────────────────────────────────────────

    pub fn to_blob(&self) -> Result<Vec<u8>, BlobError> {
        let envelope = BlobEnvelope {
            format: BLOB_FORMAT,
            toolchain: self.toolchain.clone(),
            artifacts: self.artifacts.values().cloned().collect(),
        };
        Ok(rmp_serde::to_vec_named(&envelope)?)
    }

    /// Decode a persisted blob.
    ///
    /// `primary` classifies legacy entries. When `current_toolchain` is given
    /// and the blob names a different one, the payloads are unusable and
    /// `ToolchainMismatch` is returned.
    pub fn from_blob(
        bytes: &[u8],
        primary: &str,
        current_toolchain: Option<&str>,
    ) -> Result<ArtifactStore, BlobError> {
        let store = match rmp_serde::from_slice::<BlobEnvelope>(bytes) {
            Ok(envelope) => {
                if envelope.format > BLOB_FORMAT {
                    return Err(BlobError::UnsupportedFormat(envelope.format));
                }
                let artifacts = envelope
                    .artifacts
                    .into_iter()
                    .map(|a| (a.name.clone(), a))
                    .collect();
                ArtifactStore {
                    artifacts,
                    toolchain: envelope.toolchain,
                }
            }
            Err(envelope_err) => {
                let legacy: BTreeMap<String, ByteBuf> = rmp_serde::from_slice(bytes)
                    .map_err(|_| BlobError::Decode(envelope_err.to_string()))?;
                let mut store = ArtifactStore::new();
                for (name, payload) in legacy {
                    let kind = if name.starts_with(primary) {
                        ArtifactKind::Primary
                    } else {
                        ArtifactKind::Auxiliary
                    };
                    store.put(name, kind, payload.into_vec(), "");
                }
                store
            }
        };
        if let (Some(stored), Some(current)) = (store.toolchain.as_deref(), current_toolchain) {
            if stored != current {
                return Err(BlobError::ToolchainMismatch {
                    stored: stored.to_string(),
                    current: current.to_string(),
                });
            }
        }
        Ok(store)
    }

    /// Write the primary artifact as a loadable library into `dir`, where the
    /// directory resolver can find it in a later session.
    pub fn export_primary(&self, primary: &str, dir: &Path) -> std::io::Result<PathBuf> {
        let artifact = self.get(primary).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no artifact named {primary}"),
            )
        })?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(library_file_name(primary));
        std::fs::write(&path, &artifact.payload)?;
        Ok(path)
    }
}

/// Platform file name of a loadable library for `name`.
pub fn library_file_name(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}
