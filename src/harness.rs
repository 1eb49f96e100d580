//! End-to-end diagnostic run for one task.
//!
//! 1. resolve the [`RankContext`] (pre-flight, returned as an error)
//! 2. open the [`CorrelatedLogger`] (fatal if the shard cannot be opened)
//! 3. inside the [`FaultBoundary`]: partition and publish devices, connect the
//!    transport, probe, run the collectives, probe again
//! 4. hold for the grace period, then flush
//!
//! The transport is only constructed after device visibility has been
//! published, and is dropped only after the grace period.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::boundary::{Fault, FaultBoundary};
use crate::diagnostic::{CollectiveDiagnostic, CollectiveOutcome, Operation};
use crate::error::{Error, Result};
use crate::group::ProcessGroup;
use crate::launch::{LaunchEnv, Launcher};
use crate::logger::{ConsoleSink, CorrelatedLogger};
use crate::partition::{CUDA_VISIBLE_DEVICES, DeviceAssignment, DevicePartitioner};
use crate::probe::{DeviceProbe, ProbeReport};
use crate::rank::RankContext;

/// Default time a task stays alive after the diagnostic.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Everything a run needs, resolved once at startup.
///
/// Must be identical on every task of the job; in particular `operations`
/// decides the sequence of collectives each task issues.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Which launcher variables carry topology
    pub launcher: Launcher,
    /// Existing directory receiving per-task shards
    pub logs_dir: PathBuf,
    /// Visible-device variable to partition
    pub device_var: String,
    /// Enumeration tool run before and after the collectives
    pub probe: DeviceProbe,
    /// Collectives to run, in order
    pub operations: Vec<Operation>,
    /// How long to stay alive after the diagnostic
    pub grace: Duration,
    /// Console sink
    pub console: ConsoleSink,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            launcher: Launcher::default(),
            logs_dir: PathBuf::from("logs"),
            device_var: CUDA_VISIBLE_DEVICES.to_string(),
            probe: DeviceProbe::default(),
            operations: Operation::ALL.to_vec(),
            grace: DEFAULT_GRACE,
            console: ConsoleSink::default(),
        }
    }
}

/// What one task observed.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// This task's identity
    pub context: RankContext,
    /// Path of this task's log shard
    pub shard: PathBuf,
    /// Devices granted, once partitioning succeeded
    pub assignment: Option<DeviceAssignment>,
    /// Device probes, in order
    pub probes: Vec<ProbeReport>,
    /// Collective outcomes, in order
    pub outcomes: Vec<CollectiveOutcome>,
    /// Failure caught by the boundary
    pub fault: Option<Fault>,
}

impl RunReport {
    /// No fault and every collective produced the expected values.
    pub fn passed(&self) -> bool {
        self.fault.is_none() && self.outcomes.iter().all(CollectiveOutcome::passed)
    }
}

/// Drives one task through the diagnostic.
#[derive(Debug, Clone, Default)]
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    /// Harness with `config`.
    pub fn new(config: HarnessConfig) -> Self {
        Harness { config }
    }

    /// Active configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run the diagnostic for the task described by `env`.
    ///
    /// `connect` builds the transport from the published device assignment.
    /// Failures after the logger is open are captured in
    /// [`RunReport::fault`]; only pre-flight failures are returned as errors.
    pub fn run<G, C>(&self, env: &LaunchEnv, connect: C) -> Result<RunReport>
    where
        G: ProcessGroup,
        C: FnOnce(&RankContext, &DeviceAssignment) -> Result<G>,
    {
        let ctx = RankContext::resolve(env, self.config.launcher)?;
        let logger = CorrelatedLogger::open(&ctx, &self.config.logs_dir, self.config.console)?;
        let _scope = logger.enter();

        let boundary = FaultBoundary::new();
        let mut transport: Option<G> = None;
        let mut report = RunReport {
            context: ctx.clone(),
            shard: logger.shard_path().to_path_buf(),
            assignment: None,
            probes: Vec::new(),
            outcomes: Vec::new(),
            fault: None,
        };

        let guarded = boundary.guard(|| {
            debug!("Starting...");

            let partitioner = DevicePartitioner::new(&self.config.device_var);
            let visible = partitioner.visible(env);
            info!("{} {visible:?}", partitioner.var());
            let assignment = partitioner.partition(&visible, &ctx)?;
            partitioner.publish(&assignment);
            report.assignment = Some(assignment.clone());

            debug!("PATH {}", env.search_path());
            debug!("LD_LIBRARY_PATH {}", env.library_path());

            let group: &G = transport.insert(connect(&ctx, &assignment)?);
            check_transport(&ctx, group)?;
            debug!(
                "collectives: {}",
                self.config
                    .operations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            );

            report.probes.push(self.config.probe.run(group)?);
            let mut diagnostic =
                CollectiveDiagnostic::new(self.config.operations.clone(), assignment.placement());
            report.outcomes = diagnostic.run(group)?;
            report.probes.push(self.config.probe.run(group)?);
            Ok(())
        });
        report.fault = guarded.err();

        boundary.hold(self.config.grace);
        debug!("Halting...");
        drop(transport);
        logger.flush()?;
        Ok(report)
    }
}

/// The transport must agree with the launcher about who we are.
fn check_transport<G: ProcessGroup + ?Sized>(ctx: &RankContext, group: &G) -> Result<()> {
    if group.rank() != ctx.world_rank || group.size() != ctx.world_size {
        return Err(Error::topology(format!(
            "transport reports rank {} of {}, launcher reports {} of {}",
            group.rank(),
            group.size(),
            ctx.world_rank,
            ctx.world_size
        )));
    }
    Ok(())
}
