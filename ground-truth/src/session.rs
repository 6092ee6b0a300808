//! State of one instrumented run of a traced binary.

use std::path::PathBuf;
use std::sync::Arc;

use crate::accumulator::{Accumulator, WorkerSet};
use crate::maps::{self, MapsSource, ProcSelfMaps, Resolver};
use crate::{store, CaptureError, Hex, InstructionOffset, RichCapture};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required argument 'binary=<path>'")]
    MissingBinary,

    #[error("unable to locate traced binary {path:?}")]
    Binary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Canonical path of the traced binary.
    pub binary: PathBuf,
    /// Rich capture merged with the result of this run.
    pub output: PathBuf,
    /// Optional legacy copy of the merged capture, with the base address applied.
    pub legacy: Option<PathBuf>,
}

impl CaptureConfig {
    /// Parses `key=value` arguments.
    ///
    /// - `binary` (required): the traced binary
    /// - `output`: capture file, defaults to `<binary name>.capture` in the working directory
    /// - `legacy`: compatibility output in the legacy format
    pub fn from_args<'a>(args: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
        let mut binary = None;
        let mut output = None;
        let mut legacy = None;

        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                tracing::warn!(arg = arg, "skipping argument with no value (missing '=')");
                continue;
            };

            match key {
                "binary" => binary = Some(PathBuf::from(value)),
                "output" => output = Some(PathBuf::from(value)),
                "legacy" => legacy = Some(PathBuf::from(value)),
                _ => {
                    tracing::warn!(arg = key, "skipping unknown argument");
                }
            }
        }

        let binary = binary.ok_or(ConfigError::MissingBinary)?;
        let binary = std::fs::canonicalize(&binary).map_err(|source| ConfigError::Binary {
            path: binary.clone(),
            source,
        })?;

        let output = output.unwrap_or_else(|| {
            let mut name = binary.file_name().unwrap_or_default().to_os_string();
            name.push(".capture");
            PathBuf::from(name)
        });

        Ok(Self {
            binary,
            output,
            legacy,
        })
    }
}

/// Owns the resolver and the accumulator for the duration of a run.
pub struct CaptureSession<S = ProcSelfMaps> {
    config: CaptureConfig,
    resolver: Resolver<S>,
    accumulator: Accumulator,
}

impl CaptureSession<ProcSelfMaps> {
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_source(config, ProcSelfMaps)
    }
}

impl<S: MapsSource> CaptureSession<S> {
    pub fn with_source(config: CaptureConfig, source: S) -> Self {
        let resolver = Resolver::new(config.binary.clone(), source);
        Self {
            config,
            resolver,
            accumulator: Accumulator::new(),
        }
    }

    /// Maps an instruction about to be translated to its location in the traced binary.
    ///
    /// Instructions outside of the traced binary yield `Ok(None)`.
    pub fn translate(&self, vaddr: u64, length: usize) -> Result<Option<InstructionOffset>, maps::Error> {
        let Some(offset) = self.resolver.resolve(vaddr)? else {
            return Ok(None);
        };

        let Ok(length) = u8::try_from(length) else {
            tracing::warn!(vaddr = %Hex(vaddr), length = length, "instruction is too long to record");
            return Ok(None);
        };

        Ok(Some(InstructionOffset {
            offset: offset as i64,
            length,
        }))
    }

    /// Set that `worker` records into. Callers on the hot path should keep the returned set.
    pub fn worker(&self, worker: usize) -> Arc<WorkerSet> {
        self.accumulator.register(worker)
    }

    pub fn record(&self, worker: usize, insn: InstructionOffset) {
        self.accumulator.record(worker, insn);
    }

    /// Merges every worker's instructions into the capture file.
    ///
    /// Must run after all workers have stopped.
    pub fn finish(&self) -> Result<RichCapture, CaptureError> {
        let instructions = self.accumulator.merge();
        let capture = store::merge_on_exit(&self.config.output, &self.config.binary, instructions)?;

        if let Some(legacy) = &self.config.legacy {
            store::write_legacy(legacy, capture.instructions.keys().copied(), capture.base_address)?;
            tracing::info!(path = %legacy.display(), "wrote legacy capture");
        }

        Ok(capture)
    }
}
