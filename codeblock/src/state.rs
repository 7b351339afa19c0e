// state.rs — Compile state of a block
//
// `CompileState` is the single source of truth; the persisted / displayed
// `CompileStatus` is derived from it.

use std::collections::BTreeSet;
use std::fmt;

use crate::artifact::ArtifactStore;
use crate::diag::Diagnostic;

/// Externally visible status. Ordinals are persisted and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileStatus {
    NotCompiled,
    Success,
    Error,
}

impl CompileStatus {
    pub fn ordinal(self) -> u32 {
        match self {
            CompileStatus::NotCompiled => 0,
            CompileStatus::Success => 1,
            CompileStatus::Error => 2,
        }
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        match ordinal {
            0 => Some(CompileStatus::NotCompiled),
            1 => Some(CompileStatus::Success),
            2 => Some(CompileStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for CompileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileStatus::NotCompiled => write!(f, "not compiled"),
            CompileStatus::Success => write!(f, "compiled"),
            CompileStatus::Error => write!(f, "compile error"),
        }
    }
}

/// What the last compile attempt was run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRecord {
    pub artifact_name: String,
    /// Unit text handed to the compiler.
    pub source_text: String,
    /// Crate names of the auxiliary files compiled alongside.
    pub aux_names: BTreeSet<String>,
    /// Human-readable compiler output including the status trailer.
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub enum CompileState {
    #[default]
    Uncompiled,
    Compiled {
        record: CompileRecord,
        store: ArtifactStore,
    },
    Failed {
        record: CompileRecord,
        diagnostics: Vec<Diagnostic>,
        /// Artifacts of the last success, kept until an explicit reset.
        retained: Option<ArtifactStore>,
    },
}

impl CompileState {
    pub fn status(&self) -> CompileStatus {
        match self {
            CompileState::Uncompiled => CompileStatus::NotCompiled,
            CompileState::Compiled { .. } => CompileStatus::Success,
            CompileState::Failed { .. } => CompileStatus::Error,
        }
    }

    pub fn record(&self) -> Option<&CompileRecord> {
        match self {
            CompileState::Uncompiled => None,
            CompileState::Compiled { record, .. } | CompileState::Failed { record, .. } => {
                Some(record)
            }
        }
    }

    /// The artifact set currently held, successful or retained.
    pub fn store(&self) -> Option<&ArtifactStore> {
        match self {
            CompileState::Uncompiled => None,
            CompileState::Compiled { store, .. } => Some(store),
            CompileState::Failed { retained, .. } => retained.as_ref(),
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileState::Failed { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }

    /// Transition for a failed attempt: keeps whatever store was held.
    pub(crate) fn into_failed(self, record: CompileRecord, diagnostics: Vec<Diagnostic>) -> Self {
        let retained = match self {
            CompileState::Uncompiled => None,
            CompileState::Compiled { store, .. } => Some(store),
            CompileState::Failed { retained, .. } => retained,
        };
        CompileState::Failed {
            record,
            diagnostics,
            retained,
        }
    }
}
