// block.rs — Code block: fragments, shape, auxiliary files, compile state
//
// A `Block` owns exactly one fragments bundle, one signal shape, its
// auxiliary file references and its compile state. All mutation from the
// editor side goes through `request_recompile` or the fragment setters;
// compile results come back through `apply_compile_result`, which discards
// results for inputs that have since changed.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::assemble::assemble_source;
use crate::cache::{self, Staleness};
use crate::compile::{CompileJob, CompileOutcome, CompileRequest};
use crate::diag::Diagnostic;
use crate::exec::ActiveRun;
use crate::fragments::{FragmentKind, SourceFragments};
use crate::registry::{AuxiliarySourceFile, FileHash, FileRegistry, RegistryError};
use crate::shape::{BusWidth, SignalShape};
use crate::state::{CompileRecord, CompileState, CompileStatus};
use crate::toolchain::{Toolchain, ToolchainError};

// ── Identity ────────────────────────────────────────────────────────────────

/// Stable block identity. Artifact names derive from it, so they never
/// change across compiles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        BlockId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `unit_<id>` with every character that cannot appear in a crate name
    /// replaced by `_`.
    pub fn artifact_name(&self) -> String {
        let mut name = String::with_capacity(self.0.len() + 5);
        name.push_str("unit_");
        name.extend(
            self.0
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }),
        );
        name
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Block ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) fragments: SourceFragments,
    pub(crate) shape: SignalShape,
    pub(crate) aux_files: Vec<AuxiliarySourceFile>,
    pub(crate) state: CompileState,
    pub(crate) run: Option<ActiveRun>,
}

impl Block {
    pub fn new(id: BlockId, shape: SignalShape) -> Self {
        Block {
            id,
            fragments: SourceFragments::default(),
            shape,
            aux_files: Vec::new(),
            state: CompileState::Uncompiled,
            run: None,
        }
    }

    pub fn with_fragments(mut self, fragments: SourceFragments) -> Self {
        self.fragments = fragments;
        self
    }

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn fragments(&self) -> &SourceFragments {
        &self.fragments
    }

    pub fn shape(&self) -> &SignalShape {
        &self.shape
    }

    pub fn state(&self) -> &CompileState {
        &self.state
    }

    pub fn artifact_name(&self) -> String {
        self.id.artifact_name()
    }

    pub fn aux_files(&self) -> &[AuxiliarySourceFile] {
        &self.aux_files
    }

    pub fn aux_hashes(&self) -> Vec<FileHash> {
        self.aux_files.iter().map(|f| f.hash.clone()).collect()
    }

    pub fn aux_names(&self) -> BTreeSet<String> {
        self.aux_files
            .iter()
            .map(|f| f.crate_name().to_string())
            .collect()
    }

    // ── Display surface ─────────────────────────────────────────────────

    pub fn compile_status(&self) -> CompileStatus {
        self.state.status()
    }

    pub fn compiler_message(&self) -> &str {
        self.state.record().map(|r| r.message.as_str()).unwrap_or("")
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.state.diagnostics()
    }

    /// The unit text the current fragments assemble to.
    pub fn generated_source_text(&self) -> String {
        assemble_source(&self.fragments, &self.shape, &self.artifact_name())
    }

    // ── Editing ─────────────────────────────────────────────────────────

    /// Replace the fragments from the editor. Returns a job to run when the
    /// previous compile no longer matches.
    pub fn request_recompile(&mut self, fragments: SourceFragments) -> Option<CompileJob> {
        self.fragments = fragments;
        let staleness = self.staleness();
        tracing::debug!(block = %self.id, %staleness, "recompile requested");
        staleness.recompile_required().then(|| self.compile_job())
    }

    /// Replace one fragment, keeping the other three.
    pub fn set_fragment(&mut self, kind: FragmentKind, text: impl Into<String>) {
        self.fragments = self.fragments.with_fragment(kind, text);
    }

    /// Previously generated code has the wrong output arity; start over.
    pub fn set_output_ports(&mut self, ports: usize) {
        if self.shape.output_ports != ports {
            self.shape.output_ports = ports;
            self.reset_compile_state();
        }
    }

    /// Input arity only shows up at run time; the compile stays valid.
    pub fn set_input_ports(&mut self, ports: usize) {
        self.shape.input_ports = ports;
    }

    pub fn set_bus_width(&mut self, bus: BusWidth) {
        self.shape.bus = bus;
    }

    pub fn set_port_width(&mut self, port: usize, width: usize) {
        self.shape.set_port_width(port, width);
    }

    /// Forget every artifact and diagnostic.
    pub fn reset_compile_state(&mut self) {
        self.run = None;
        self.state = CompileState::Uncompiled;
    }

    // ── Auxiliary files ─────────────────────────────────────────────────

    pub fn attach_file(
        &mut self,
        registry: &mut FileRegistry,
        hash: &FileHash,
    ) -> Result<(), RegistryError> {
        if self.aux_files.iter().any(|f| &f.hash == hash) {
            return Ok(());
        }
        let file = registry.get(hash)?.clone();
        registry.add_user(hash, &self.id)?;
        self.aux_files.push(file);
        Ok(())
    }

    pub fn detach_file(
        &mut self,
        registry: &mut FileRegistry,
        hash: &FileHash,
    ) -> Result<(), RegistryError> {
        self.aux_files.retain(|f| &f.hash != hash);
        registry.remove_user(hash, &self.id)
    }

    /// Re-link persisted references against the registry. Files the registry
    /// no longer has are dropped and counted; the rest stay attached.
    pub fn relink_files(
        &mut self,
        registry: &mut FileRegistry,
        hashes: &[FileHash],
    ) -> Result<(), RegistryError> {
        let mut missing = 0;
        for hash in hashes {
            match self.attach_file(registry, hash) {
                Ok(()) => {}
                Err(RegistryError::UnknownFile(_)) => missing += 1,
                Err(e) => return Err(e),
            }
        }
        if missing > 0 {
            tracing::warn!(block = %self.id, missing, "auxiliary source files missing");
            return Err(RegistryError::MissingFiles {
                block: self.id.to_string(),
                missing,
            });
        }
        Ok(())
    }

    // ── Compile ─────────────────────────────────────────────────────────

    pub fn staleness(&self) -> Staleness {
        cache::check(&self.fragments, &self.shape, &self.aux_names(), &self.state)
    }

    /// Snapshot of everything a compile of the current inputs needs.
    pub fn compile_job(&self) -> CompileJob {
        let artifact_name = self.artifact_name();
        CompileJob {
            block_id: self.id.clone(),
            fragments: self.fragments.clone(),
            shape: self.shape.clone(),
            aux_hashes: self.aux_hashes(),
            request: CompileRequest {
                primary_source: assemble_source(&self.fragments, &self.shape, &artifact_name),
                primary_name: artifact_name,
                auxiliaries: self.aux_files.clone(),
            },
        }
    }

    /// Whether `job` still describes this block's current inputs.
    pub fn matches_job(&self, job: &CompileJob) -> bool {
        job.block_id == self.id
            && job.fragments == self.fragments
            && job.shape == self.shape
            && job.aux_hashes == self.aux_hashes()
    }

    /// Accept a compile result. Returns `false` (and changes nothing) when
    /// the block was edited after the job was taken.
    pub fn apply_compile_result(&mut self, job: &CompileJob, outcome: CompileOutcome) -> bool {
        if !self.matches_job(job) {
            tracing::debug!(block = %self.id, "discarding result of superseded compile");
            return false;
        }
        let mut record = CompileRecord {
            artifact_name: job.request.primary_name.clone(),
            source_text: job.request.primary_source.clone(),
            aux_names: job
                .request
                .auxiliaries
                .iter()
                .map(|f| f.crate_name().to_string())
                .collect(),
            message: String::new(),
        };
        let state = std::mem::take(&mut self.state);
        self.state = match outcome {
            CompileOutcome::Success { store, message, .. } => {
                record.message = message;
                CompileState::Compiled { record, store }
            }
            CompileOutcome::Failed {
                diagnostics,
                message,
            } => {
                record.message = message;
                state.into_failed(record, diagnostics)
            }
        };
        tracing::info!(block = %self.id, status = %self.compile_status(), "compile result applied");
        true
    }

    /// Compile synchronously if the cache says so. A missing toolchain is a
    /// configuration error and leaves the state untouched.
    pub fn compile_if_required(&mut self, toolchain: &Toolchain) -> Result<Staleness, ToolchainError> {
        let staleness = self.staleness();
        if !staleness.recompile_required() {
            tracing::debug!(block = %self.id, "compile cache is fresh");
            return Ok(staleness);
        }
        tracing::info!(block = %self.id, %staleness, "recompiling");
        let job = self.compile_job();
        let outcome = job.run(toolchain)?;
        self.apply_compile_result(&job, outcome);
        Ok(staleness)
    }

    /// Force a compile regardless of the cache.
    pub fn compile(&mut self, toolchain: &Toolchain) -> Result<CompileStatus, ToolchainError> {
        let job = self.compile_job();
        let outcome = job.run(toolchain)?;
        self.apply_compile_result(&job, outcome);
        Ok(self.compile_status())
    }

    /// Install a state restored from persistence.
    pub(crate) fn restore_state(&mut self, state: CompileState) {
        self.run = None;
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactKind, ArtifactStore};

    fn block() -> Block {
        Block::new(BlockId::new("b1"), SignalShape::single(2, 1)).with_fragments(
            SourceFragments::builder()
                .body("outputs[0] = inputs[0] + inputs[1];\nreturn outputs;")
                .build(),
        )
    }

    fn success(job: &CompileJob) -> CompileOutcome {
        let mut store = ArtifactStore::new();
        store.put(
            job.request.primary_name.clone(),
            ArtifactKind::Primary,
            vec![1, 2, 3],
            job.request.primary_source.clone(),
        );
        CompileOutcome::Success {
            store,
            diagnostics: Vec::new(),
            message: "compilation finished successfully\n".into(),
        }
    }

    #[test]
    fn artifact_name_is_sanitized_identity() {
        assert_eq!(BlockId::new("JAVA.1-a").artifact_name(), "unit_JAVA_1_a");
        assert_eq!(block().artifact_name(), "unit_b1");
    }

    #[test]
    fn apply_success_then_cache_is_fresh() {
        let mut b = block();
        let job = b.compile_job();
        assert!(b.apply_compile_result(&job, success(&job)));
        assert_eq!(b.compile_status(), CompileStatus::Success);
        assert_eq!(b.staleness(), Staleness::Fresh);
        assert!(b.compiler_message().contains("successfully"));
        assert!(b.request_recompile(b.fragments().clone()).is_none());
    }

    #[test]
    fn superseded_result_is_discarded() {
        let mut b = block();
        let job = b.compile_job();
        b.set_fragment(FragmentKind::InitCode, "self.gain = 2.0;");
        assert!(!b.apply_compile_result(&job, success(&job)));
        assert_eq!(b.compile_status(), CompileStatus::NotCompiled);
    }

    #[test]
    fn edit_after_compile_requests_a_job() {
        let mut b = block();
        let job = b.compile_job();
        b.apply_compile_result(&job, success(&job));
        let edited = b.fragments().with_fragment(FragmentKind::Body, "return outputs;");
        let job = b.request_recompile(edited).expect("stale after edit");
        assert!(job.request.primary_source.contains("return outputs;"));
    }

    #[test]
    fn output_port_change_resets_input_change_does_not() {
        let mut b = block();
        let job = b.compile_job();
        b.apply_compile_result(&job, success(&job));
        b.set_input_ports(4);
        assert_eq!(b.compile_status(), CompileStatus::Success);
        b.set_output_ports(3);
        assert_eq!(b.compile_status(), CompileStatus::NotCompiled);
    }

    #[test]
    fn failed_compile_keeps_previous_artifacts() {
        let mut b = block();
        let job = b.compile_job();
        b.apply_compile_result(&job, success(&job));
        b.set_fragment(FragmentKind::Body, "outputs[0] = ;");
        let job = b.compile_job();
        let applied = b.apply_compile_result(
            &job,
            CompileOutcome::Failed {
                diagnostics: Vec::new(),
                message: "compile status: ERROR\n".into(),
            },
        );
        assert!(applied);
        assert_eq!(b.compile_status(), CompileStatus::Error);
        assert!(b.state().store().is_some());
        b.reset_compile_state();
        assert!(b.state().store().is_none());
    }

    #[test]
    fn attach_detach_and_relink() {
        let mut reg = FileRegistry::new();
        let hash = reg
            .insert(AuxiliarySourceFile::new("util.rs", "pub fn two() -> f64 { 2.0 }"))
            .unwrap();
        let mut b = block();
        b.attach_file(&mut reg, &hash).unwrap();
        b.attach_file(&mut reg, &hash).unwrap();
        assert_eq!(b.aux_files().len(), 1);
        assert_eq!(reg.user_count(&hash), 1);
        assert_eq!(b.aux_names(), ["util".to_string()].into());

        b.detach_file(&mut reg, &hash).unwrap();
        assert!(b.aux_files().is_empty());
        assert_eq!(reg.user_count(&hash), 0);

        let gone = FileHash::of("deleted");
        let err = b.relink_files(&mut reg, &[hash.clone(), gone]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::MissingFiles {
                block: "b1".into(),
                missing: 1
            }
        );
        assert_eq!(b.aux_hashes(), vec![hash]);
    }
}
