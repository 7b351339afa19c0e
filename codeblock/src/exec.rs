// exec.rs — Execution façade called by the solver
//
// `initialize_at_start` once per simulation run, then `step` once per time
// step. Each run gets a fresh procedure instance, so private state and the
// user's init code start over.
//
// Preconditions: the block is not `Error`; a toolchain is available when
//   the block still needs compiling.
// Postconditions: after a successful `step` every output is a number.
// Failure modes: `ExecError`. Numeric faults and panics abort the run but
//   leave compiled artifacts alone; load failures update the compile state.
// Side effects: may compile synchronously; loads a library per run.

use std::path::Path;

use thiserror::Error;

use crate::block::Block;
use crate::diag::{DiagLevel, Diagnostic};
use crate::loader::{load_unit, CallStatus, LoadError, LoadedProcedure, ResolverChain};
use crate::state::{CompileState, CompileStatus};
use crate::toolchain::{Toolchain, ToolchainError};
use crate::variant::Signals;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("block {block} is not compiled")]
    NotCompiled { block: String },
    #[error("block {block} needs compiling but no toolchain is configured")]
    NoToolchain { block: String },
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("block {block} was not initialized for this run")]
    NotInitialized { block: String },
    #[error("block {block}: inputs do not match the procedure shape ({detail})")]
    BadInput { block: String, detail: String },
    #[error("block {block}: NaN at output port {port}, channel {channel}, t = {time}")]
    NumericFault {
        block: String,
        port: usize,
        channel: usize,
        time: f64,
    },
    #[error("block {block}: user code panicked during {phase}")]
    ProcedurePanicked { block: String, phase: &'static str },
    #[error("block {block}: procedure returned unknown status {code}")]
    UnknownStatus { block: String, code: i32 },
}

/// What a simulation start may use besides the block itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecContext<'a> {
    pub toolchain: Option<&'a Toolchain>,
    /// Directory searched for libraries when the block holds none in memory.
    pub project_dir: Option<&'a Path>,
}

impl<'a> ExecContext<'a> {
    pub fn with_toolchain(toolchain: &'a Toolchain) -> Self {
        ExecContext {
            toolchain: Some(toolchain),
            project_dir: toolchain.working_directory(),
        }
    }
}

/// Per-run state: the live instance and the output layout.
#[derive(Debug)]
pub(crate) struct ActiveRun {
    procedure: LoadedProcedure,
    out_widths: Vec<usize>,
    dt: f64,
}

impl Block {
    pub fn initialize_at_start(&mut self, ctx: &ExecContext<'_>, dt: f64) -> Result<(), ExecError> {
        self.run = None;
        let block = self.id.to_string();

        match ctx.toolchain {
            Some(toolchain) => {
                self.compile_if_required(toolchain)?;
            }
            // Stored artifacts only run when they still match the fragments.
            None => {
                let staleness = self.staleness();
                if staleness.recompile_required() {
                    tracing::warn!(block = %self.id, %staleness, "cannot rebuild without a toolchain");
                    return Err(ExecError::NoToolchain { block });
                }
            }
        }
        if self.compile_status() == CompileStatus::Error {
            return Err(ExecError::NotCompiled { block });
        }

        let name = self.artifact_name();
        let loaded = {
            let chain = ResolverChain::for_block(self.state.store(), ctx.project_dir);
            load_unit(&chain, &name, self.shape.shape)
        };
        let unit = match loaded {
            Ok(unit) => unit,
            Err(err) => {
                self.record_load_failure(&err);
                return Err(err.into());
            }
        };
        let mut procedure = match unit.instantiate() {
            Ok(p) => p,
            Err(err) => {
                self.record_load_failure(&err);
                return Err(err.into());
            }
        };
        match procedure.init() {
            CallStatus::Ok => {}
            CallStatus::Panicked | CallStatus::BadInput => {
                return Err(ExecError::ProcedurePanicked {
                    block,
                    phase: "init",
                });
            }
            CallStatus::Unknown(code) => return Err(ExecError::UnknownStatus { block, code }),
        }

        tracing::info!(block = %self.id, dt, "simulation run initialized");
        self.run = Some(ActiveRun {
            procedure,
            out_widths: self.shape.output_widths(),
            dt,
        });
        Ok(())
    }

    /// Incompatible artifacts are thrown away so the next start rebuilds;
    /// anything else marks the block as failed.
    fn record_load_failure(&mut self, err: &LoadError) {
        tracing::warn!(block = %self.id, error = %err, "procedure failed to load");
        if err.is_incompatible() {
            self.reset_compile_state();
            return;
        }
        let Some(mut record) = self.state.record().cloned() else {
            return;
        };
        record.message = format!("{err}\ncompile status: ERROR\n");
        let diagnostic = Diagnostic::new(&record.artifact_name, DiagLevel::Error, err.to_string());
        let state = std::mem::take(&mut self.state);
        self.state = state.into_failed(record, vec![diagnostic]);
    }

    pub fn step(&mut self, time: f64, dt: f64, inputs: &Signals) -> Result<Signals, ExecError> {
        let block = self.id.to_string();
        if !inputs.fits_inputs(&self.shape) {
            return Err(ExecError::BadInput {
                block,
                detail: format!(
                    "expected {} {} input port(s), got {} {}",
                    self.shape.input_ports,
                    self.shape.shape,
                    inputs.port_count(),
                    inputs.shape()
                ),
            });
        }
        let Some(run) = self.run.as_mut() else {
            return Err(ExecError::NotInitialized { block });
        };

        let in_widths = inputs.widths();
        let flat_in = inputs.flatten();
        let mut flat_out = vec![0.0; run.out_widths.iter().sum()];
        let status = run.procedure.compute(
            &flat_in,
            &in_widths,
            time,
            dt,
            &mut flat_out,
            &run.out_widths,
        );
        match status {
            CallStatus::Ok => {}
            CallStatus::BadInput => {
                return Err(ExecError::BadInput {
                    block,
                    detail: "rejected by procedure".into(),
                })
            }
            CallStatus::Panicked => {
                self.abort_run("panic");
                return Err(ExecError::ProcedurePanicked {
                    block,
                    phase: "compute",
                });
            }
            CallStatus::Unknown(code) => {
                self.abort_run("unknown status");
                return Err(ExecError::UnknownStatus { block, code });
            }
        }

        if let Some((port, channel)) = find_nan(&flat_out, &run.out_widths) {
            self.abort_run("numeric fault");
            return Err(ExecError::NumericFault {
                block,
                port,
                channel,
                time,
            });
        }
        Ok(Signals::from_flat(self.shape.shape, &flat_out, &run.out_widths))
    }

    /// End the current run and destroy the procedure instance.
    pub fn end_run(&mut self) {
        self.run = None;
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Step size the current run was started with.
    pub fn run_dt(&self) -> Option<f64> {
        self.run.as_ref().map(|r| r.dt)
    }

    fn abort_run(&mut self, reason: &str) {
        tracing::warn!(block = %self.id, reason, "simulation run aborted");
        self.run = None;
    }

    /// Whether the block could start a run without compiling.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, CompileState::Compiled { .. }) && !self.staleness().recompile_required()
    }
}

/// First NaN in port-major order, as (port, channel).
fn find_nan(flat: &[f64], widths: &[usize]) -> Option<(usize, usize)> {
    let index = flat.iter().position(|v| v.is_nan())?;
    let mut offset = 0;
    for (port, &w) in widths.iter().enumerate() {
        if index < offset + w {
            return Some((port, index - offset));
        }
        offset += w;
    }
    None
}
