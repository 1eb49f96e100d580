//! Error types for ferrodiag

use std::panic::Location;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for diagnostic operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for diagnostic operations.
///
/// `MissingEnvironment`, `InvalidTopology` and `UnevenDeviceSplit` are
/// pre-flight errors: they are raised before any group-visible action.
/// `CollectiveFailure` is raised mid-run and is never retried.
///
/// Every variant that can reach the fault boundary records where it was
/// raised; build them through the `#[track_caller]` constructors.
#[derive(Error, Debug)]
pub enum Error {
    /// A required launcher variable is not set
    #[error("missing environment variable {0}")]
    MissingEnvironment(String),

    /// Launcher variables (or the transport) describe an impossible topology
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// What is inconsistent
        reason: String,
        /// Where the check failed
        location: &'static Location<'static>,
    },

    /// Visible devices cannot be shared evenly between local tasks
    #[error("cannot split {devices} visible devices evenly across {local_size} local tasks")]
    UnevenDeviceSplit {
        /// Number of visible devices
        devices: usize,
        /// Number of tasks on this node
        local_size: usize,
        /// Where the split was attempted
        location: &'static Location<'static>,
    },

    /// The device enumeration tool could not be run or read
    #[error("external tool {tool} failed: {reason}")]
    ExternalToolFailure {
        /// Program that was invoked
        tool: String,
        /// What went wrong
        reason: String,
        /// Where the tool was invoked
        location: &'static Location<'static>,
    },

    /// A collective call failed on this rank
    #[error("{operation} failed at {location}: {message}")]
    CollectiveFailure {
        /// Collective being executed
        operation: &'static str,
        /// Transport-provided detail
        message: String,
        /// Where the failure was raised
        location: &'static Location<'static>,
    },

    /// The per-rank log shard could not be opened, read or flushed
    #[error("log sink {} unavailable", path.display())]
    LogSink {
        /// Shard path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
        /// Where the I/O was attempted
        location: &'static Location<'static>,
    },

    /// The MPI transport has already been initialized
    #[error("MPI has already been initialized")]
    AlreadyInitialized,

    /// MPI error with code
    #[error("MPI error (code {0})")]
    MpiError(i32),
}

impl Error {
    /// Build a [`Error::CollectiveFailure`] tagged with the caller's location.
    #[track_caller]
    pub fn collective(operation: &'static str, message: impl Into<String>) -> Self {
        Error::CollectiveFailure {
            operation,
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Build a [`Error::InvalidTopology`] tagged with the caller's location.
    #[track_caller]
    pub fn topology(reason: impl Into<String>) -> Self {
        Error::InvalidTopology {
            reason: reason.into(),
            location: Location::caller(),
        }
    }

    /// Build a [`Error::UnevenDeviceSplit`] tagged with the caller's location.
    #[track_caller]
    pub fn uneven_split(devices: usize, local_size: usize) -> Self {
        Error::UnevenDeviceSplit {
            devices,
            local_size,
            location: Location::caller(),
        }
    }

    /// Build a [`Error::ExternalToolFailure`] tagged with the caller's location.
    #[track_caller]
    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ExternalToolFailure {
            tool: tool.into(),
            reason: reason.into(),
            location: Location::caller(),
        }
    }

    /// Build a [`Error::LogSink`] tagged with the caller's location.
    #[track_caller]
    pub fn log_sink(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::LogSink {
            path: path.into(),
            source,
            location: Location::caller(),
        }
    }

    /// Name of the taxonomy entry, as written to the log.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MissingEnvironment(_) => "MissingEnvironment",
            Error::InvalidTopology { .. } => "InvalidTopology",
            Error::UnevenDeviceSplit { .. } => "UnevenDeviceSplit",
            Error::ExternalToolFailure { .. } => "ExternalToolFailure",
            Error::CollectiveFailure { .. } => "CollectiveFailure",
            Error::LogSink { .. } => "LogSink",
            Error::AlreadyInitialized => "AlreadyInitialized",
            Error::MpiError(_) => "MpiError",
        }
    }

    /// Originating source location, when the error carries one.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            Error::InvalidTopology { location, .. }
            | Error::UnevenDeviceSplit { location, .. }
            | Error::ExternalToolFailure { location, .. }
            | Error::CollectiveFailure { location, .. }
            | Error::LogSink { location, .. } => Some(*location),
            Error::MissingEnvironment(_) | Error::AlreadyInitialized | Error::MpiError(_) => None,
        }
    }

    /// True for errors raised before any collective call.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Error::MissingEnvironment(_)
                | Error::InvalidTopology { .. }
                | Error::UnevenDeviceSplit { .. }
                | Error::LogSink { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collective_records_call_site() {
        let err = Error::collective("broadcast", "peer vanished");
        let location = err.location().expect("collective errors carry a location");
        assert!(location.file().ends_with("error.rs"));
        assert_eq!(err.kind(), "CollectiveFailure");
        assert!(err.to_string().starts_with("broadcast failed at "));
        assert!(!err.is_preflight());
    }

    #[test]
    fn every_boundary_error_records_call_site() {
        let line = line!() + 2;
        let errors = [
            Error::topology("rank 3 of 2"),
            Error::uneven_split(3, 2),
            Error::tool("/usr/bin/nvidia-smi", "could not start"),
            Error::log_sink("logs/x.log", std::io::Error::other("disk full")),
        ];
        for err in &errors {
            let location = err.location().unwrap();
            assert!(location.file().ends_with("error.rs"), "{err}");
            assert!(location.line() >= line && location.line() <= line + 4, "{err}");
        }
    }

    #[test]
    fn display_keeps_location_out_of_plain_errors() {
        assert_eq!(
            Error::uneven_split(3, 2).to_string(),
            "cannot split 3 visible devices evenly across 2 local tasks"
        );
        assert_eq!(Error::topology("bad").to_string(), "invalid topology: bad");
    }

    #[test]
    fn missing_environment_names_variable() {
        let err = Error::MissingEnvironment("SLURM_JOB_ID".into());
        assert_eq!(err.to_string(), "missing environment variable SLURM_JOB_ID");
        assert!(err.is_preflight());
        assert!(err.location().is_none());
    }
}
