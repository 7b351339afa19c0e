// compile.rs — Toolchain compiler adapter
//
// Compiles one assembled unit plus its auxiliary files with the external
// compiler. Source text is piped on stdin; produced binaries are written to
// a private scratch directory, read back into memory and the directory is
// removed before returning, so nothing survives on disk.
//
// Preconditions: a probed `Toolchain`.
// Postconditions: `Success` carries the complete artifact set (primary plus
//   one per auxiliary file); `Failed` carries diagnostics and no artifacts.
// Failure modes: source errors → `CompileOutcome::Failed`; a compiler that
//   cannot be spawned → `ToolchainError`.
// Side effects: spawns compiler processes; scratch directory lifetime is
//   confined to the call.

use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use crate::artifact::{library_file_name, ArtifactKind, ArtifactStore};
use crate::block::BlockId;
use crate::diag::{self, DiagLevel, Diagnostic};
use crate::fragments::SourceFragments;
use crate::registry::{is_valid_crate_name, AuxiliarySourceFile, FileHash};
use crate::shape::SignalShape;
use crate::toolchain::{Toolchain, ToolchainError};

pub const SUCCESS_TRAILER: &str = "compilation finished successfully";
pub const ERROR_TRAILER: &str = "compile status: ERROR";

// ── Public types ────────────────────────────────────────────────────────────

/// Everything needed for one self-contained compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub primary_name: String,
    pub primary_source: String,
    pub auxiliaries: Vec<AuxiliarySourceFile>,
}

/// A compile request tagged with the block inputs it was taken from, so the
/// result can be checked against the block before it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub block_id: BlockId,
    pub fragments: SourceFragments,
    pub shape: SignalShape,
    pub aux_hashes: Vec<FileHash>,
    pub request: CompileRequest,
}

impl CompileJob {
    pub fn run(&self, toolchain: &Toolchain) -> Result<CompileOutcome, ToolchainError> {
        compile(toolchain, &self.request)
    }
}

#[derive(Debug)]
pub enum CompileOutcome {
    Success {
        store: ArtifactStore,
        diagnostics: Vec<Diagnostic>,
        message: String,
    },
    Failed {
        diagnostics: Vec<Diagnostic>,
        message: String,
    },
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            CompileOutcome::Success { message, .. } | CompileOutcome::Failed { message, .. } => {
                message
            }
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileOutcome::Success { diagnostics, .. }
            | CompileOutcome::Failed { diagnostics, .. } => diagnostics,
        }
    }
}

/// A binary produced by the toolchain, before attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedOutput {
    pub name: String,
    pub payload: Vec<u8>,
}

// ── Entry point ─────────────────────────────────────────────────────────────

pub fn compile(
    toolchain: &Toolchain,
    request: &CompileRequest,
) -> Result<CompileOutcome, ToolchainError> {
    let span = tracing::info_span!("compile", unit = %request.primary_name);
    let _guard = span.enter();
    let started = Instant::now();

    let scratch = tempfile::Builder::new().prefix("codeblock-").tempdir()?;
    let mut diagnostics = Vec::new();

    // Auxiliary crates first; each may use the ones before it.
    let mut linked: Vec<&AuxiliarySourceFile> = Vec::new();
    for aux in &request.auxiliaries {
        let crate_name = aux.crate_name();
        if !is_valid_crate_name(crate_name) {
            diagnostics.push(Diagnostic::new(
                crate_name,
                DiagLevel::Error,
                format!("auxiliary file '{}' does not map to a valid crate name", aux.name),
            ));
            return Ok(failed(diagnostics));
        }
        let out = scratch.path().join(format!("lib{crate_name}.rlib"));
        let ok = invoke(
            toolchain,
            crate_name,
            "rlib",
            &aux.contents,
            &out,
            scratch.path(),
            &linked,
            &mut diagnostics,
        )?;
        if !ok {
            tracing::info!(file = %aux.name, "auxiliary file failed to compile");
            return Ok(failed(diagnostics));
        }
        linked.push(aux);
    }

    let primary_out = scratch.path().join(library_file_name(&request.primary_name));
    let ok = invoke(
        toolchain,
        &request.primary_name,
        "cdylib",
        &request.primary_source,
        &primary_out,
        scratch.path(),
        &linked,
        &mut diagnostics,
    )?;
    if !ok {
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compile failed"
        );
        return Ok(failed(diagnostics));
    }

    let produced = collect_outputs(scratch.path())?;
    let store = attribute_outputs(request, produced, Some(toolchain.fingerprint()));
    if store.get(&request.primary_name).is_none() {
        diagnostics.push(Diagnostic::new(
            &request.primary_name,
            DiagLevel::Error,
            "compiler reported success but produced no loadable library",
        ));
        return Ok(failed(diagnostics));
    }
    tracing::info!(
        artifacts = store.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "compile succeeded"
    );
    let mut message = diag::render_all(&diagnostics);
    message.push_str(SUCCESS_TRAILER);
    message.push('\n');
    Ok(CompileOutcome::Success {
        store,
        diagnostics,
        message,
    })
}

fn failed(diagnostics: Vec<Diagnostic>) -> CompileOutcome {
    let mut message = diag::render_all(&diagnostics);
    message.push_str(ERROR_TRAILER);
    message.push('\n');
    CompileOutcome::Failed {
        diagnostics,
        message,
    }
}

// ── Process invocation ──────────────────────────────────────────────────────

/// Run the compiler once with `source` on stdin. Returns whether it
/// succeeded; diagnostics are appended either way.
#[allow(clippy::too_many_arguments)]
fn invoke(
    toolchain: &Toolchain,
    crate_name: &str,
    crate_type: &str,
    source: &str,
    out: &Path,
    scratch: &Path,
    externs: &[&AuxiliarySourceFile],
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<bool, ToolchainError> {
    let config = toolchain.config();
    let mut cmd = toolchain.command();
    cmd.args(config.common_args())
        .arg("--crate-name")
        .arg(crate_name)
        .arg("--crate-type")
        .arg(crate_type)
        .arg("-o")
        .arg(out)
        .arg("-L")
        .arg(format!("dependency={}", scratch.display()));
    for aux in externs {
        let name = aux.crate_name();
        cmd.arg("--extern").arg(format!(
            "{}={}",
            name,
            scratch.join(format!("lib{name}.rlib")).display()
        ));
    }
    cmd.args(&config.extra_args)
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::debug!(crate_name, crate_type, "invoking compiler");
    let mut child = cmd.spawn().map_err(|source| ToolchainError::NotFound {
        compiler: config.compiler.clone(),
        source,
    })?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(source.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    diagnostics.extend(diag::parse_messages(crate_name, &stderr));
    Ok(output.status.success())
}

/// Read every library the compiler left in the scratch directory.
fn collect_outputs(dir: &Path) -> Result<Vec<ProducedOutput>, ToolchainError> {
    let mut produced = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(name) = artifact_name_from_file(file_name) else {
            continue;
        };
        produced.push(ProducedOutput {
            name,
            payload: std::fs::read(&path)?,
        });
    }
    produced.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(produced)
}

/// `libfoo.rlib` → `foo`; platform library name → bare name; anything else
/// (debug info, import libraries) is not an artifact.
fn artifact_name_from_file(file_name: &str) -> Option<String> {
    if let Some(stem) = file_name.strip_suffix(".rlib") {
        return Some(stem.strip_prefix("lib").unwrap_or(stem).to_string());
    }
    let stem = file_name.strip_suffix(std::env::consts::DLL_SUFFIX)?;
    Some(
        stem.strip_prefix(std::env::consts::DLL_PREFIX)
            .unwrap_or(stem)
            .to_string(),
    )
}

/// Partition produced binaries by originating source: names starting with
/// the primary name belong to the primary unit, names equal to an auxiliary
/// crate name belong to that file. Unattributable outputs are dropped.
pub fn attribute_outputs(
    request: &CompileRequest,
    produced: Vec<ProducedOutput>,
    toolchain: Option<&str>,
) -> ArtifactStore {
    let mut store = match toolchain {
        Some(fingerprint) => ArtifactStore::with_toolchain(fingerprint),
        None => ArtifactStore::new(),
    };
    for output in produced {
        // Exact auxiliary names win over the primary prefix: `unit_b1_x.rs`
        // attached to block `b1` is still an auxiliary crate.
        if let Some(aux) = request
            .auxiliaries
            .iter()
            .find(|a| a.crate_name() == output.name)
        {
            store.put(
                output.name,
                ArtifactKind::Auxiliary,
                output.payload,
                aux.contents.clone(),
            );
        } else if output.name.starts_with(&request.primary_name) {
            store.put(
                output.name,
                ArtifactKind::Primary,
                output.payload,
                request.primary_source.clone(),
            );
        } else {
            tracing::warn!(name = %output.name, "dropping unattributed compiler output");
        }
    }
    store
}
