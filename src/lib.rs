//! # ferrodiag
//!
//! Rank-aware device binding and collective communication diagnostics for
//! multi-node MPI jobs.
//!
//! Every task of a job runs the same [`Harness`]:
//! - works out who it is from launcher variables ([`RankContext`])
//! - opens its own log shard, every record tagged with the rank identity
//!   ([`CorrelatedLogger`])
//! - takes an even, disjoint slice of the node's visible GPUs
//!   ([`DevicePartitioner`]) *before* the transport starts
//! - runs the device enumeration tool on every task ([`DeviceProbe`])
//! - exercises broadcast from every root and an all-reduce with a known
//!   answer ([`CollectiveDiagnostic`])
//! - catches any failure at one place so the shard always ends with it
//!   ([`FaultBoundary`])
//!
//! Shards from all tasks can be merged into a single ordered timeline with
//! [`timeline::merge`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use ferrodiag::{Harness, HarnessConfig, LaunchEnv, SoloGroup};
//!
//! fn main() -> Result<(), ferrodiag::Error> {
//!     let harness = Harness::new(HarnessConfig::default());
//!     let report = harness.run(&LaunchEnv::capture(), |_ctx, _devices| Ok(SoloGroup))?;
//!     println!("{}: passed = {}", report.context, report.passed());
//!     Ok(())
//! }
//! ```
//!
//! ## Transports
//!
//! Collectives go through the [`ProcessGroup`] trait:
//!
//! | Transport | Use | Feature |
//! |-----------|-----|---------|
//! | [`SoloGroup`] | single task, no communication | — |
//! | [`ThreadGroup`] | N ranks as threads of one process (tests) | — |
//! | `mpi::MpiGroup` | real MPI job through the C shim in `csrc/` | `mpi` |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

mod boundary;
mod diagnostic;
mod error;
mod group;
mod harness;
mod kernel;
mod launch;
mod logger;
mod partition;
mod probe;
mod rank;
mod thread_group;

pub mod timeline;

#[cfg(feature = "mpi")]
mod ffi;
#[cfg(feature = "mpi")]
pub mod mpi;

pub use boundary::{Fault, FaultBoundary};
pub use diagnostic::{
    BROADCAST_SENTINEL, CollectiveDiagnostic, CollectiveOutcome, Operation, expected_all_reduce,
};
pub use error::{Error, Result};
pub use group::{ProcessGroup, ReduceOp, SoloGroup};
pub use harness::{DEFAULT_GRACE, Harness, HarnessConfig, RunReport};
pub use kernel::{ReducePlan, ReductionKernel};
pub use launch::{JOB_ID_VAR, JOB_NAME_VAR, LaunchEnv, Launcher, TopologyVars};
pub use logger::{ConsoleSink, CorrelatedLogger, RankFormat, TIMESTAMP_FORMAT};
pub use partition::{CUDA_VISIBLE_DEVICES, DeviceAssignment, DevicePartitioner};
pub use probe::{DeviceProbe, NVIDIA_SMI, ProbeOutput, ProbeReport};
pub use rank::RankContext;
pub use thread_group::{ThreadGroup, ThreadMember};
