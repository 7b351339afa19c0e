// loader.rs — Isolated loader for compiled procedures
//
// Resolves an artifact name to an executable unit through a chain of
// resolvers: the block's in-memory artifact store first, then libraries
// left in the project directory by an earlier session. Each unit is opened
// as its own library with local symbol scope, so the host only ever sees
// user code through the exported procedure table.
//
// Preconditions: artifacts were produced by `compile` against the current
//   `abi::ABI_VERSION`.
// Postconditions: a `LoadedProcedure` owns one procedure instance and keeps
//   its library mapped until dropped.
// Failure modes: `LoadError`; `is_incompatible()` marks errors that mean the
//   artifact set is stale rather than broken.
// Side effects: in-memory payloads are written to a private temporary file
//   for the lifetime of the unit, since the platform loader maps files.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::abi::{self, status, ProcedureTable};
use crate::artifact::{library_file_name, ArtifactKind, ArtifactStore};
use crate::shape::ProcedureShape;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no artifact named '{0}' in memory or in the project directory")]
    Missing(String),
    #[error("artifact '{0}' is not a loadable library")]
    NotLoadable(String),
    #[error("failed to open library '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: libloading::Error,
    },
    #[error("library '{name}' does not export the procedure table: {source}")]
    Symbol {
        name: String,
        #[source]
        source: libloading::Error,
    },
    #[error("library '{name}' has procedure ABI v{found}, host expects v{expected}")]
    AbiMismatch {
        name: String,
        found: u32,
        expected: u32,
    },
    #[error("library '{name}' implements the {found} procedure shape, block expects {expected}")]
    ShapeMismatch {
        name: String,
        found: String,
        expected: ProcedureShape,
    },
    #[error("procedure in '{0}' could not be instantiated")]
    CreateFailed(String),
    #[error("failed to stage library '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// The artifact was built for a different contract; discard and rebuild.
    pub fn is_incompatible(&self) -> bool {
        matches!(
            self,
            LoadError::AbiMismatch { .. } | LoadError::ShapeMismatch { .. } | LoadError::Symbol { .. }
        )
    }
}

// ── Executable units ────────────────────────────────────────────────────────

/// An opened library plus a copy of its procedure table.
pub struct ExecutableUnit {
    name: String,
    table: ProcedureTable,
    // Field order matters: the library must be unmapped before its backing
    // file is deleted.
    _library: Library,
    _staged: Option<NamedTempFile>,
}

impl std::fmt::Debug for ExecutableUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableUnit")
            .field("name", &self.name)
            .field("abi_version", &self.table.abi_version)
            .field("shape", &self.table.shape)
            .finish()
    }
}

impl ExecutableUnit {
    fn open(name: &str, path: &Path, staged: Option<NamedTempFile>) -> Result<Self, LoadError> {
        // SAFETY: the library was produced by our own compile path; its
        // initialisers are the Rust std runtime only.
        let library = unsafe { Library::new(path) }.map_err(|source| LoadError::Open {
            name: name.to_string(),
            source,
        })?;
        // SAFETY: the symbol is a `#[no_mangle] static` of type
        // `ProcedureTable` in every unit the assembler emits.
        let table = unsafe {
            let symbol = library
                .get::<*const ProcedureTable>(abi::PROCEDURE_SYMBOL)
                .map_err(|source| LoadError::Symbol {
                    name: name.to_string(),
                    source,
                })?;
            **symbol
        };
        if table.abi_version != abi::ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                name: name.to_string(),
                found: table.abi_version,
                expected: abi::ABI_VERSION,
            });
        }
        Ok(ExecutableUnit {
            name: name.to_string(),
            table,
            _library: library,
            _staged: staged,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Option<ProcedureShape> {
        ProcedureShape::from_abi_tag(self.table.shape)
    }

    /// Create a fresh procedure instance with default private state.
    pub fn instantiate(self: &Arc<Self>) -> Result<LoadedProcedure, LoadError> {
        let handle = (self.table.create)();
        if handle.is_null() {
            return Err(LoadError::CreateFailed(self.name.clone()));
        }
        Ok(LoadedProcedure {
            unit: Arc::clone(self),
            handle,
        })
    }
}

// ── Resolvers ───────────────────────────────────────────────────────────────

/// One tier of name resolution.
pub trait ArtifactResolver {
    /// `None` means "not mine, ask the next tier"; `Some(Err)` is a real
    /// failure for an artifact this tier does hold.
    fn resolve(&self, name: &str) -> Option<Result<ExecutableUnit, LoadError>>;
}

/// Resolves from an in-memory artifact store.
pub struct StoreResolver<'a> {
    store: &'a ArtifactStore,
}

impl<'a> StoreResolver<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        StoreResolver { store }
    }
}

impl ArtifactResolver for StoreResolver<'_> {
    fn resolve(&self, name: &str) -> Option<Result<ExecutableUnit, LoadError>> {
        let artifact = self.store.get(name)?;
        if artifact.kind != ArtifactKind::Primary {
            return Some(Err(LoadError::NotLoadable(name.to_string())));
        }
        Some(stage_and_open(name, &artifact.payload))
    }
}

fn stage_and_open(name: &str, payload: &[u8]) -> Result<ExecutableUnit, LoadError> {
    use std::io::Write as _;
    let io_err = |source| LoadError::Io {
        name: name.to_string(),
        source,
    };
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{}{name}-", std::env::consts::DLL_PREFIX))
        .suffix(std::env::consts::DLL_SUFFIX)
        .tempfile()
        .map_err(io_err)?;
    file.write_all(payload).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    let path = file.path().to_path_buf();
    ExecutableUnit::open(name, &path, Some(file))
}

/// Resolves from libraries exported into a project directory.
pub struct DirectoryResolver {
    dir: PathBuf,
}

impl DirectoryResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectoryResolver { dir: dir.into() }
    }

    fn candidates(&self, name: &str) -> [PathBuf; 2] {
        [
            self.dir.join(library_file_name(name)),
            self.dir
                .join(format!("{name}{}", std::env::consts::DLL_SUFFIX)),
        ]
    }
}

impl ArtifactResolver for DirectoryResolver {
    fn resolve(&self, name: &str) -> Option<Result<ExecutableUnit, LoadError>> {
        let path = self.candidates(name).into_iter().find(|p| p.is_file())?;
        tracing::debug!(name, path = %path.display(), "resolving artifact from project directory");
        Some(ExecutableUnit::open(name, &path, None))
    }
}

/// Resolvers consulted in order; the first one that knows the name wins.
#[derive(Default)]
pub struct ResolverChain<'a> {
    tiers: Vec<Box<dyn ArtifactResolver + 'a>>,
}

impl<'a> ResolverChain<'a> {
    pub fn new() -> Self {
        ResolverChain { tiers: Vec::new() }
    }

    pub fn then(mut self, resolver: impl ArtifactResolver + 'a) -> Self {
        self.tiers.push(Box::new(resolver));
        self
    }

    /// Standard chain: the block's store, then the project directory if any.
    pub fn for_block(store: Option<&'a ArtifactStore>, project_dir: Option<&Path>) -> Self {
        let mut chain = ResolverChain::new();
        if let Some(store) = store {
            chain = chain.then(StoreResolver::new(store));
        }
        if let Some(dir) = project_dir {
            chain = chain.then(DirectoryResolver::new(dir));
        }
        chain
    }

    pub fn resolve(&self, name: &str) -> Result<ExecutableUnit, LoadError> {
        let span = tracing::debug_span!("load", artifact = name);
        let _guard = span.enter();
        for tier in &self.tiers {
            if let Some(result) = tier.resolve(name) {
                return result;
            }
        }
        Err(LoadError::Missing(name.to_string()))
    }
}

/// Resolve `name` and check it implements `expected`.
pub fn load_unit(
    chain: &ResolverChain<'_>,
    name: &str,
    expected: ProcedureShape,
) -> Result<Arc<ExecutableUnit>, LoadError> {
    let unit = chain.resolve(name)?;
    if unit.shape() != Some(expected) {
        let found = unit
            .shape()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("unknown ({})", unit.table.shape));
        return Err(LoadError::ShapeMismatch {
            name: name.to_string(),
            found,
            expected,
        });
    }
    tracing::info!(artifact = name, shape = %expected, "procedure library loaded");
    Ok(Arc::new(unit))
}

// ── Live procedure ──────────────────────────────────────────────────────────

/// Outcome of one call into user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    BadInput,
    Panicked,
    Unknown(i32),
}

impl CallStatus {
    fn from_code(code: i32) -> Self {
        match code {
            status::OK => CallStatus::Ok,
            status::BAD_INPUT => CallStatus::BadInput,
            status::PANICKED => CallStatus::Panicked,
            other => CallStatus::Unknown(other),
        }
    }
}

/// One live procedure instance. Dropping it destroys the instance.
pub struct LoadedProcedure {
    unit: Arc<ExecutableUnit>,
    handle: *mut c_void,
}

impl std::fmt::Debug for LoadedProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedProcedure")
            .field("unit", &self.unit.name)
            .finish_non_exhaustive()
    }
}

impl LoadedProcedure {
    pub fn unit(&self) -> &Arc<ExecutableUnit> {
        &self.unit
    }

    pub fn init(&mut self) -> CallStatus {
        CallStatus::from_code((self.unit.table.init)(self.handle))
    }

    /// Run one step. Port data is flattened per `in_widths` / `out_widths`;
    /// `out` must hold `out_widths.iter().sum()` values.
    pub fn compute(
        &mut self,
        inputs: &[f64],
        in_widths: &[usize],
        time: f64,
        dt: f64,
        out: &mut [f64],
        out_widths: &[usize],
    ) -> CallStatus {
        debug_assert_eq!(inputs.len(), in_widths.iter().sum::<usize>());
        debug_assert_eq!(out.len(), out_widths.iter().sum::<usize>());
        let code = (self.unit.table.compute)(
            self.handle,
            inputs.as_ptr(),
            in_widths.as_ptr(),
            in_widths.len(),
            time,
            dt,
            out.as_mut_ptr(),
            out_widths.as_ptr(),
            out_widths.len(),
        );
        CallStatus::from_code(code)
    }
}

impl Drop for LoadedProcedure {
    fn drop(&mut self) {
        (self.unit.table.destroy)(self.handle);
    }
}

// The handle is only touched through `&mut self`.
unsafe impl Send for LoadedProcedure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_reports_missing() {
        let err = ResolverChain::new().resolve("unit_b1").unwrap_err();
        assert!(matches!(err, LoadError::Missing(ref n) if n == "unit_b1"));
        assert!(!err.is_incompatible());
    }

    #[test]
    fn store_tier_skips_unknown_names() {
        let store = ArtifactStore::new();
        assert!(StoreResolver::new(&store).resolve("unit_b1").is_none());
    }

    #[test]
    fn auxiliary_artifacts_are_not_loadable() {
        let mut store = ArtifactStore::new();
        store.put("filters", ArtifactKind::Auxiliary, vec![0; 8], "pub fn f() {}");
        let err = StoreResolver::new(&store).resolve("filters").unwrap().unwrap_err();
        assert!(matches!(err, LoadError::NotLoadable(_)));
    }

    #[test]
    fn garbage_payload_fails_to_open() {
        let mut store = ArtifactStore::new();
        store.put("unit_b1", ArtifactKind::Primary, b"not a library".to_vec(), "");
        let err = ResolverChain::for_block(Some(&store), None)
            .resolve("unit_b1")
            .unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }), "{err}");
    }

    #[test]
    fn directory_tier_falls_through_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new();
        let err = ResolverChain::for_block(Some(&store), Some(dir.path()))
            .resolve("unit_b1")
            .unwrap_err();
        assert!(matches!(err, LoadError::Missing(_)));
    }

    #[test]
    fn directory_tier_finds_platform_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(library_file_name("unit_b1")), b"junk").unwrap();
        let result = DirectoryResolver::new(dir.path()).resolve("unit_b1");
        assert!(matches!(result, Some(Err(LoadError::Open { .. }))));
    }

    #[test]
    fn status_codes_map() {
        assert_eq!(CallStatus::from_code(status::OK), CallStatus::Ok);
        assert_eq!(CallStatus::from_code(status::PANICKED), CallStatus::Panicked);
        assert_eq!(CallStatus::from_code(42), CallStatus::Unknown(42));
    }
}
