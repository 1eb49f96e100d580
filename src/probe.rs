//! Device-binding evidence from an external enumeration tool.
//!
//! The tool's output is republished line by line through the logger with a
//! stable `{tag} | ` prefix, so log scrapers can pull out each task's view of
//! its devices. Every task probes between two barriers, so no task captures
//! its state while a sibling is still in earlier collective work.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::group::ProcessGroup;

/// Default enumeration tool.
pub const NVIDIA_SMI: &str = "/usr/bin/nvidia-smi";

/// Captured output of one tool invocation.
#[derive(Debug, Clone)]
pub struct ProbeOutput {
    /// Exit status of the tool
    pub status: ExitStatus,
    /// stdout lines followed by stderr lines
    pub lines: Vec<String>,
}

/// What one bracketed probe produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Lines logged
    pub lines: Vec<String>,
    /// Tool ran and exited zero
    pub success: bool,
}

/// Runs the enumeration tool and logs its output.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    program: PathBuf,
    args: Vec<String>,
    tag: String,
}

impl Default for DeviceProbe {
    fn default() -> Self {
        DeviceProbe::new(NVIDIA_SMI)
    }
}

impl DeviceProbe {
    /// Probe with `program`; the tag is the program's file name.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let tag = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        DeviceProbe {
            program,
            args: Vec::new(),
            tag,
        }
    }

    /// Extra arguments passed to the tool.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Override the log prefix.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Program being invoked.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Log prefix.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Run the tool once and collect its output.
    pub fn capture(&self) -> Result<ProbeOutput> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| self.failure(format!("could not start: {e}")))?;

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| self.failure("stdout is not valid UTF-8".into()))?;
        let stderr = String::from_utf8(output.stderr)
            .map_err(|_| self.failure("stderr is not valid UTF-8".into()))?;

        let lines = [stdout.trim_end(), stderr.trim_end()]
            .into_iter()
            .filter(|block| !block.is_empty())
            .flat_map(str::lines)
            .map(str::to_string)
            .collect();

        Ok(ProbeOutput {
            status: output.status,
            lines,
        })
    }

    /// Barrier, capture and log, barrier.
    ///
    /// Tool failures are logged as warnings and reported in the result;
    /// only barrier failures are returned as errors.
    pub fn run<G: ProcessGroup + ?Sized>(&self, group: &G) -> Result<ProbeReport> {
        group.barrier()?;
        let report = match self.capture() {
            Ok(output) => {
                for line in &output.lines {
                    info!("{} | {line}", self.tag);
                }
                if !output.status.success() {
                    warn!(
                        "{} exited with {}",
                        self.program.display(),
                        output.status
                    );
                }
                ProbeReport {
                    success: output.status.success(),
                    lines: output.lines,
                }
            }
            Err(e) => {
                let location = e.location().map(ToString::to_string);
                warn!(kind = e.kind(), location = location.as_deref(), "{e}");
                ProbeReport::default()
            }
        };
        group.barrier()?;
        Ok(report)
    }

    #[track_caller]
    fn failure(&self, reason: String) -> Error {
        Error::tool(self.program.display().to_string(), reason)
    }
}
