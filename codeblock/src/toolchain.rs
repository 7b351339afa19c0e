// toolchain.rs — External compiler configuration and discovery
//
// All compiler settings travel in an explicit `ToolchainConfig`; nothing is
// looked up from process globals after construction. `Toolchain::probe`
// verifies the compiler can be executed and records its version line, which
// doubles as the fingerprint stored alongside compiled artifacts.
//
// Failure modes: a compiler that cannot be spawned or does not report a
//   version is a configuration error, never a source error.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COMPILER: &str = "rustc";
pub const DEFAULT_EDITION: &str = "2021";
pub const DEFAULT_OPT_LEVEL: &str = "2";

/// A host crate user code may reference (`--extern name=path`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternCrate {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Compiler executable (name on PATH or absolute path).
    pub compiler: PathBuf,
    pub edition: String,
    pub opt_level: String,
    /// Library search paths passed as `-L`, in order.
    pub library_paths: Vec<PathBuf>,
    /// Host crates exposed to user code.
    pub externs: Vec<ExternCrate>,
    /// Directory the compiler runs in; also the project directory consulted
    /// by the on-disk loader fallback.
    pub working_directory: Option<PathBuf>,
    /// Extra raw compiler arguments, appended last.
    pub extra_args: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        ToolchainConfig {
            compiler: PathBuf::from(DEFAULT_COMPILER),
            edition: DEFAULT_EDITION.to_string(),
            opt_level: DEFAULT_OPT_LEVEL.to_string(),
            library_paths: Vec::new(),
            externs: Vec::new(),
            working_directory: None,
            extra_args: Vec::new(),
        }
    }
}

impl ToolchainConfig {
    /// Default config plus the host's bundled library directory
    /// (`<exe dir>/lib`) when it exists.
    pub fn with_host_defaults() -> Self {
        let mut config = ToolchainConfig::default();
        if let Some(dir) = bundled_library_dir() {
            config.library_paths.push(dir);
        }
        config
    }

    pub fn with_compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Arguments shared by every invocation: edition, optimisation, JSON
    /// diagnostics and library search paths.
    pub(crate) fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "--edition".to_string(),
            self.edition.clone(),
            "--error-format=json".to_string(),
            "-C".to_string(),
            format!("opt-level={}", self.opt_level),
        ];
        for path in &self.library_paths {
            args.push("-L".to_string());
            args.push(path.display().to_string());
        }
        for ext in &self.externs {
            args.push("--extern".to_string());
            args.push(format!("{}={}", ext.name, ext.path.display()));
        }
        args
    }
}

fn bundled_library_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?.join("lib");
    dir.is_dir().then_some(dir)
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("compiler '{}' not found: {source}", .compiler.display())]
    NotFound {
        compiler: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("compiler '{}' did not report a version: {detail}", .compiler.display())]
    Unusable { compiler: PathBuf, detail: String },
    #[error("compiler I/O failed: {0}")]
    Io(#[from] io::Error),
}

// ── Probed toolchain ────────────────────────────────────────────────────────

/// A compiler known to run, plus its version fingerprint.
#[derive(Debug, Clone)]
pub struct Toolchain {
    config: ToolchainConfig,
    version: String,
}

impl Toolchain {
    /// Run `<compiler> -vV` and capture the version line.
    pub fn probe(config: ToolchainConfig) -> Result<Toolchain, ToolchainError> {
        let output = Command::new(&config.compiler)
            .arg("-vV")
            .output()
            .map_err(|source| ToolchainError::NotFound {
                compiler: config.compiler.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ToolchainError::Unusable {
                compiler: config.compiler.clone(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_version(&stdout).ok_or_else(|| ToolchainError::Unusable {
            compiler: config.compiler.clone(),
            detail: stdout.trim().to_string(),
        })?;
        tracing::debug!(compiler = %config.compiler.display(), %version, "toolchain probed");
        Ok(Toolchain { config, version })
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    /// Fingerprint stored with artifacts built by this toolchain.
    pub fn fingerprint(&self) -> &str {
        &self.version
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.config.working_directory.as_deref()
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.compiler);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Build the fingerprint from `-vV` output: first line plus the host triple.
fn parse_version(verbose: &str) -> Option<String> {
    let first = verbose.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    let host = verbose
        .lines()
        .find_map(|l| l.strip_prefix("host: "))
        .map(str::trim);
    Some(match host {
        Some(host) => format!("{first} [{host}]"),
        None => first.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_with_host() {
        let out = "rustc 1.80.0 (051478957 2024-07-21)\nbinary: rustc\nhost: x86_64-unknown-linux-gnu\nrelease: 1.80.0\n";
        assert_eq!(
            parse_version(out).as_deref(),
            Some("rustc 1.80.0 (051478957 2024-07-21) [x86_64-unknown-linux-gnu]")
        );
    }

    #[test]
    fn parse_version_rejects_empty() {
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("\n"), None);
    }

    #[test]
    fn missing_compiler_is_configuration_error() {
        let config = ToolchainConfig::default().with_compiler("/nonexistent/codeblock-rustc");
        let err = Toolchain::probe(config).unwrap_err();
        assert!(matches!(err, ToolchainError::NotFound { .. }), "{err}");
    }

    #[test]
    fn common_args_include_paths_and_externs() {
        let mut config = ToolchainConfig::default().with_library_path("/opt/host/lib");
        config.externs.push(ExternCrate {
            name: "hostmath".into(),
            path: PathBuf::from("/opt/host/lib/libhostmath.rlib"),
        });
        let args = config.common_args();
        assert_eq!(&args[..2], &["--edition".to_string(), "2021".to_string()]);
        assert!(args.contains(&"--error-format=json".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-L" && w[1] == "/opt/host/lib"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--extern" && w[1] == "hostmath=/opt/host/lib/libhostmath.rlib"));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ToolchainConfig =
            serde_json::from_str(r#"{"compiler": "/usr/local/bin/rustc"}"#).unwrap();
        assert_eq!(config.compiler, PathBuf::from("/usr/local/bin/rustc"));
        assert_eq!(config.edition, "2021");
        assert!(config.library_paths.is_empty());
    }
}
