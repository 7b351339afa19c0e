// persist.rs — Project file persistence
//
// A project is a JSON document holding the auxiliary file registry and one
// record per code block. Block records use fixed tags; the artifact store
// travels as an opaque hex-encoded blob under `classMapBytes`.
//
// Loading never fails because of compiled artifacts: an absent, unreadable
// or incompatible blob downgrades the block to `NotCompiled` and is
// reported as a warning.

use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::{ArtifactStore, BlobError};
use crate::block::{Block, BlockId};
use crate::compile::ERROR_TRAILER;
use crate::fragments::SourceFragments;
use crate::registry::{AuxiliarySourceFile, FileHash, FileRegistry, RegistryError};
use crate::shape::SignalShape;
use crate::state::{CompileRecord, CompileState, CompileStatus};

pub const PROJECT_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("cannot access project file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed project file: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("project format {0} is newer than supported format {PROJECT_FORMAT}")]
    UnsupportedFormat(u32),
}

/// Something that was dropped while loading but did not fail the load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistWarning {
    MissingFiles(RegistryError),
    FileSkipped(RegistryError),
    ArtifactsDiscarded { block: String, reason: String },
}

impl fmt::Display for PersistWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistWarning::MissingFiles(e) => write!(f, "{e}"),
            PersistWarning::FileSkipped(e) => write!(f, "{e}; file skipped"),
            PersistWarning::ArtifactsDiscarded { block, reason } => {
                write!(f, "compiled code of block {block} discarded: {reason}")
            }
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    #[serde(rename = "sourceCode", default)]
    pub source_code: String,
    #[serde(rename = "importsCode", default)]
    pub imports_code: String,
    #[serde(rename = "initCode", default)]
    pub init_code: String,
    #[serde(rename = "variablesCode", default)]
    pub variables_code: String,
    #[serde(rename = "extraSourceFiles", default)]
    pub extra_source_files: Vec<FileHash>,
    #[serde(rename = "className", default)]
    pub class_name: String,
    #[serde(rename = "CompileStatus", default)]
    pub compile_status: u32,
    #[serde(rename = "classMapBytes", default, skip_serializing_if = "Option::is_none")]
    pub class_map_bytes: Option<String>,
    #[serde(rename = "signalShape", default)]
    pub shape: SignalShape,
}

impl BlockRecord {
    pub fn from_block(block: &Block) -> Result<Self, PersistError> {
        let fragments = block.fragments();
        let class_map_bytes = match block.state().store() {
            Some(store) => Some(bytes_to_hex(&store.to_blob()?)),
            None => None,
        };
        Ok(BlockRecord {
            id: block.id().clone(),
            source_code: fragments.body().to_string(),
            imports_code: fragments.imports().to_string(),
            init_code: fragments.init_code().to_string(),
            variables_code: fragments.field_declarations().to_string(),
            extra_source_files: block.aux_hashes(),
            class_name: block.artifact_name(),
            compile_status: block.compile_status().ordinal(),
            class_map_bytes,
            shape: block.shape().clone(),
        })
    }

    /// Rebuild the block. Auxiliary references are re-linked against
    /// `registry`; `toolchain` is the fingerprint of the compiler now in use.
    pub fn into_block(
        self,
        registry: &mut FileRegistry,
        toolchain: Option<&str>,
        warnings: &mut Vec<PersistWarning>,
    ) -> Block {
        let fragments = SourceFragments::builder()
            .body(self.source_code)
            .imports(self.imports_code)
            .init_code(self.init_code)
            .field_declarations(self.variables_code)
            .build();
        let mut block = Block::new(self.id, self.shape).with_fragments(fragments);
        match block.relink_files(registry, &self.extra_source_files) {
            Ok(()) => {}
            Err(e @ RegistryError::MissingFiles { .. }) => warnings.push(PersistWarning::MissingFiles(e)),
            Err(e) => warnings.push(PersistWarning::ArtifactsDiscarded {
                block: block.id().to_string(),
                reason: e.to_string(),
            }),
        }

        let status = CompileStatus::from_ordinal(self.compile_status)
            .unwrap_or(CompileStatus::NotCompiled);
        match restore_state(
            status,
            &self.class_name,
            &block.artifact_name(),
            self.class_map_bytes.as_deref(),
            toolchain,
        ) {
            Ok(state) => block.restore_state(state),
            Err(reason) => {
                tracing::info!(block = %block.id(), %reason, "compiled artifacts not restored");
                warnings.push(PersistWarning::ArtifactsDiscarded {
                    block: block.id().to_string(),
                    reason,
                });
            }
        }
        block
    }
}

fn restore_state(
    status: CompileStatus,
    class_name: &str,
    artifact_name: &str,
    blob_hex: Option<&str>,
    toolchain: Option<&str>,
) -> Result<CompileState, String> {
    if status == CompileStatus::NotCompiled {
        return Ok(CompileState::Uncompiled);
    }
    if class_name != artifact_name {
        return Err(format!(
            "artifact '{class_name}' does not belong to this block ('{artifact_name}')"
        ));
    }
    let hex = blob_hex.ok_or_else(|| "no compiled artifacts stored".to_string())?;
    let bytes = hex_to_bytes(hex).ok_or_else(|| "artifact blob is not valid hex".to_string())?;
    let store =
        ArtifactStore::from_blob(&bytes, class_name, toolchain).map_err(|e| e.to_string())?;
    let primary = store
        .get(class_name)
        .ok_or_else(|| format!("artifact blob lacks '{class_name}'"))?;
    let record = CompileRecord {
        artifact_name: class_name.to_string(),
        source_text: primary.source_text.clone(),
        aux_names: store
            .auxiliary_names(class_name)
            .into_iter()
            .collect::<BTreeSet<_>>(),
        message: String::new(),
    };
    Ok(match status {
        CompileStatus::Error => CompileState::Failed {
            record: CompileRecord {
                message: format!("{ERROR_TRAILER}\n"),
                ..record
            },
            diagnostics: Vec::new(),
            retained: Some(store),
        },
        _ => CompileState::Compiled { record, store },
    })
}

// ── Project ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct ProjectFile {
    format: u32,
    #[serde(default)]
    files: Vec<StoredFile>,
    #[serde(default)]
    blocks: Vec<BlockRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredFile {
    name: String,
    contents: String,
}

/// In-memory project: registry plus blocks.
#[derive(Debug, Default)]
pub struct Project {
    pub registry: FileRegistry,
    pub blocks: Vec<Block>,
}

impl Project {
    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id() == id)
    }

    pub fn block_mut(&mut self, id: &BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id() == id)
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        let file = ProjectFile {
            format: PROJECT_FORMAT,
            files: self
                .registry
                .files()
                .map(|f| StoredFile {
                    name: f.name.clone(),
                    contents: f.contents.clone(),
                })
                .collect(),
            blocks: self
                .blocks
                .iter()
                .map(BlockRecord::from_block)
                .collect::<Result<_, _>>()?,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn from_json(
        text: &str,
        toolchain: Option<&str>,
    ) -> Result<(Project, Vec<PersistWarning>), PersistError> {
        let file: ProjectFile = serde_json::from_str(text)?;
        if file.format > PROJECT_FORMAT {
            return Err(PersistError::UnsupportedFormat(file.format));
        }
        let mut project = Project::default();
        let mut warnings = Vec::new();
        for stored in file.files {
            let file = AuxiliarySourceFile::new(stored.name, stored.contents);
            if let Err(e) = project.registry.insert(file) {
                tracing::warn!(error = %e, "auxiliary file not restored");
                warnings.push(PersistWarning::FileSkipped(e));
            }
        }
        for record in file.blocks {
            let block = record.into_block(&mut project.registry, toolchain, &mut warnings);
            project.blocks.push(block);
        }
        Ok((project, warnings))
    }

    pub fn load(
        path: &Path,
        toolchain: Option<&str>,
    ) -> Result<(Project, Vec<PersistWarning>), PersistError> {
        let text = std::fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Project::from_json(&text, toolchain)
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ── Hex ─────────────────────────────────────────────────────────────────────

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
