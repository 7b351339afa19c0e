use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;

use codeblock::block::{Block, BlockId};
use codeblock::exec::ExecContext;
use codeblock::persist::Project;
use codeblock::shape::ProcedureShape;
use codeblock::state::CompileStatus;
use codeblock::toolchain::{Toolchain, ToolchainConfig};
use codeblock::variant::Signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    /// Print the generated unit text
    Source,
    /// Print compile status and cache decision
    Status,
    /// Compile stale blocks and write the project back
    Compile,
    /// Run the block for a number of steps
    Run,
    /// Write the compiled library into --out-dir
    Export,
}

#[derive(Parser, Debug)]
#[command(
    name = "codeblock",
    version,
    about = "Code block engine — compiles, caches and runs user procedures of a circuit project"
)]
struct Cli {
    /// Project file (JSON)
    project: PathBuf,

    /// Block to operate on (default: every block; `run` needs exactly one)
    #[arg(short, long)]
    block: Option<String>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Status)]
    emit: EmitStage,

    /// Input values per step: `2,3` for single blocks, `1,2;3` for matrix blocks
    #[arg(long, default_value = "")]
    inputs: String,

    /// Number of steps for `run`
    #[arg(long, default_value_t = 1)]
    steps: usize,

    /// Step size for `run`
    #[arg(long, default_value_t = 1e-6)]
    dt: f64,

    /// Recompile even when the cache is fresh
    #[arg(long)]
    force: bool,

    /// Compiler command [default: rustc, or the --toolchain file's compiler]
    #[arg(long, env = "RUSTC")]
    cc: Option<PathBuf>,

    /// Library search directory for user code (repeatable)
    #[arg(short = 'L', long = "lib-dir", env = "CODEBLOCK_LIB_DIR")]
    lib_dirs: Vec<PathBuf>,

    /// Toolchain configuration file (JSON); command-line flags override it
    #[arg(long)]
    toolchain: Option<PathBuf>,

    /// Directory for `export` and for loading previously exported libraries
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Print phases and debug logging
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("codeblock: error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "codeblock=debug" } else { "codeblock=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let config = toolchain_config(cli)?;
    // Probing is deferred to the stages that need a compiler.
    let probe = || {
        Toolchain::probe(config.clone())
            .with_context(|| format!("toolchain '{}' is not usable", config.compiler.display()))
    };
    let fingerprint = match cli.emit {
        EmitStage::Source | EmitStage::Export => None,
        _ => probe().ok().map(|t| t.fingerprint().to_string()),
    };

    let (mut project, warnings) = Project::load(&cli.project, fingerprint.as_deref())
        .with_context(|| format!("loading {}", cli.project.display()))?;
    for warning in &warnings {
        eprintln!("codeblock: warning: {warning}");
    }
    if cli.verbose {
        eprintln!(
            "codeblock: {} block(s), {} auxiliary file(s)",
            project.blocks.len(),
            project.registry.len()
        );
    }

    let selected: Vec<usize> = match &cli.block {
        Some(id) => {
            let id = BlockId::new(id.as_str());
            let index = project
                .blocks
                .iter()
                .position(|b| b.id() == &id)
                .with_context(|| format!("no block '{id}' in project"))?;
            vec![index]
        }
        None => (0..project.blocks.len()).collect(),
    };

    match cli.emit {
        EmitStage::Source => {
            for &i in &selected {
                print!("{}", project.blocks[i].generated_source_text());
            }
            Ok(0)
        }
        EmitStage::Status => {
            for &i in &selected {
                let block = &project.blocks[i];
                println!(
                    "{}: {} ({})",
                    block.id(),
                    block.compile_status(),
                    block.staleness()
                );
                if !block.compiler_message().is_empty() {
                    print!("{}", block.compiler_message());
                }
            }
            Ok(0)
        }
        EmitStage::Compile => {
            let toolchain = probe()?;
            let mut failed = false;
            for &i in &selected {
                let block = &mut project.blocks[i];
                if cli.force {
                    block.compile(&toolchain)?;
                } else {
                    block.compile_if_required(&toolchain)?;
                }
                eprint!("{}: {}", block.id(), block.compiler_message());
                failed |= block.compile_status() == CompileStatus::Error;
            }
            project
                .save(&cli.project)
                .with_context(|| format!("saving {}", cli.project.display()))?;
            Ok(if failed { 1 } else { 0 })
        }
        EmitStage::Export => {
            let dir = cli.out_dir.as_ref().context("--emit export needs --out-dir")?;
            for &i in &selected {
                let block = &project.blocks[i];
                let Some(store) = block.state().store() else {
                    bail!("block {} has no compiled artifacts", block.id());
                };
                let path = store
                    .export_primary(&block.artifact_name(), dir)
                    .with_context(|| format!("exporting block {}", block.id()))?;
                println!("{}", path.display());
            }
            Ok(0)
        }
        EmitStage::Run => {
            let [index] = selected.as_slice() else {
                bail!("--emit run needs --block when the project has several blocks");
            };
            let toolchain = probe().ok();
            let mut ctx = match &toolchain {
                Some(t) => ExecContext::with_toolchain(t),
                None => ExecContext::default(),
            };
            if let Some(dir) = &cli.out_dir {
                ctx.project_dir = Some(dir.as_path());
            }
            let block = &mut project.blocks[*index];
            let inputs = parse_inputs(&cli.inputs, block)?;
            run_steps(block, &ctx, &inputs, cli.steps, cli.dt)
        }
    }
}

fn toolchain_config(cli: &Cli) -> anyhow::Result<ToolchainConfig> {
    let mut config = match &cli.toolchain {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ToolchainConfig::with_host_defaults(),
    };
    if let Some(cc) = &cli.cc {
        config.compiler = cc.clone();
    }
    config.library_paths.extend(cli.lib_dirs.iter().cloned());
    if config.working_directory.is_none() {
        config.working_directory = cli.project.parent().map(PathBuf::from);
    }
    Ok(config)
}

fn parse_inputs(text: &str, block: &Block) -> anyhow::Result<Signals> {
    let parse_list = |s: &str| -> anyhow::Result<Vec<f64>> {
        s.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.parse::<f64>().with_context(|| format!("bad input value '{v}'")))
            .collect()
    };
    Ok(match block.shape().shape {
        ProcedureShape::Single => Signals::Single(parse_list(text)?),
        ProcedureShape::Matrix => Signals::Matrix(
            text.split(';')
                .map(parse_list)
                .collect::<anyhow::Result<_>>()?,
        ),
    })
}

fn run_steps(
    block: &mut Block,
    ctx: &ExecContext<'_>,
    inputs: &Signals,
    steps: usize,
    dt: f64,
) -> anyhow::Result<i32> {
    if let Err(e) = block.initialize_at_start(ctx, dt) {
        eprintln!("codeblock: {e}");
        if !block.compiler_message().is_empty() {
            eprint!("{}", block.compiler_message());
        }
        return Ok(1);
    }
    for k in 0..steps {
        let time = k as f64 * dt;
        match block.step(time, dt, inputs) {
            Ok(Signals::Single(values)) => println!("{time:e}\t{values:?}"),
            Ok(Signals::Matrix(ports)) => println!("{time:e}\t{ports:?}"),
            Err(e) => {
                eprintln!("codeblock: {e}");
                return Ok(1);
            }
        }
    }
    block.end_run();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::io::Write as _;

    fn toolchain_file(compiler: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"compiler": "{compiler}", "opt_level": "0"}}"#).unwrap();
        file
    }

    fn args(file: &tempfile::NamedTempFile, extra: &[&str]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "codeblock".into(),
            "project.json".into(),
            "--toolchain".into(),
            file.path().into(),
        ];
        args.extend(extra.iter().map(OsString::from));
        args
    }

    #[test]
    fn toolchain_file_compiler_is_kept_without_cc() {
        if std::env::var_os("RUSTC").is_some() {
            eprintln!("SKIP: RUSTC is set in the environment");
            return;
        }
        let file = toolchain_file("/opt/rust/bin/rustc");
        let cli = Cli::parse_from(args(&file, &[]));
        let config = toolchain_config(&cli).unwrap();
        assert_eq!(config.compiler, PathBuf::from("/opt/rust/bin/rustc"));
        assert_eq!(config.opt_level, "0");
    }

    #[test]
    fn cc_flag_overrides_toolchain_file() {
        let file = toolchain_file("/opt/rust/bin/rustc");
        let cli = Cli::parse_from(args(&file, &["--cc", "rustc-nightly"]));
        let config = toolchain_config(&cli).unwrap();
        assert_eq!(config.compiler, PathBuf::from("rustc-nightly"));
        assert_eq!(config.opt_level, "0");
    }
}
