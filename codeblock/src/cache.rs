// cache.rs — Compile-cache controller
//
// Decides whether a block's previous compile is still valid. The check is a
// re-assembly with the previous artifact name plus a set comparison of
// auxiliary crate names; both are cheap next to a compiler invocation and
// run on every simulation start.

use std::collections::BTreeSet;
use std::fmt;

use crate::assemble::assemble_source;
use crate::fragments::SourceFragments;
use crate::shape::SignalShape;
use crate::state::CompileState;

/// Outcome of a cache check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    NeverCompiled,
    SourceChanged,
    AuxiliaryAdded(String),
    AuxiliaryRemoved(String),
}

impl Staleness {
    pub fn recompile_required(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::Fresh => write!(f, "up to date"),
            Staleness::NeverCompiled => write!(f, "never compiled"),
            Staleness::SourceChanged => write!(f, "generated source changed"),
            Staleness::AuxiliaryAdded(name) => write!(f, "auxiliary file '{name}' added"),
            Staleness::AuxiliaryRemoved(name) => write!(f, "auxiliary file '{name}' removed"),
        }
    }
}

/// Compare the current inputs against the state of the last compile.
pub fn check(
    fragments: &SourceFragments,
    shape: &SignalShape,
    aux_names: &BTreeSet<String>,
    state: &CompileState,
) -> Staleness {
    let Some(record) = state.record() else {
        return Staleness::NeverCompiled;
    };

    let text = assemble_source(fragments, shape, &record.artifact_name);
    if text != record.source_text {
        return Staleness::SourceChanged;
    }

    if let Some(added) = aux_names.difference(&record.aux_names).next() {
        return Staleness::AuxiliaryAdded(added.clone());
    }
    if let Some(removed) = record.aux_names.difference(aux_names).next() {
        return Staleness::AuxiliaryRemoved(removed.clone());
    }
    Staleness::Fresh
}
