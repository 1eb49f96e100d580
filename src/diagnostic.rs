//! Collective communication diagnostic.
//!
//! Runs an explicit, ordered list of [`Operation`]s over a process group and
//! records what every rank held before and after each collective. The list
//! must be identical on every rank: a collective is a synchronization point,
//! and diverging call sequences deadlock the job.
//!
//! A wrong result is logged at ERROR but never changes control flow, so all
//! ranks keep issuing the same collectives. Transport errors are returned
//! unretried; a partially completed collective cannot be safely repeated.

use std::fmt;

use tracing::{error, info};

use crate::error::Result;
use crate::group::ProcessGroup;
use crate::kernel::ReductionKernel;

/// Value held by non-root ranks before a broadcast.
pub const BROADCAST_SENTINEL: f64 = -1.0;

/// One collective test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Operation {
    /// Broadcast from every rank in turn
    #[value(alias = "bcast")]
    Broadcast,
    /// Sum-reduce a rank-shifted range to every rank
    #[value(alias = "allreduce")]
    AllReduce,
}

impl Operation {
    /// Every operation, in the default run order.
    pub const ALL: [Operation; 2] = [Operation::Broadcast, Operation::AllReduce];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Broadcast => "broadcast",
            Operation::AllReduce => "all-reduce",
        })
    }
}

/// Before/after capture of one collective call on this rank.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectiveOutcome {
    /// Which collective ran
    pub operation: Operation,
    /// Root rank, for rooted collectives
    pub root: Option<usize>,
    /// Local buffer before the call
    pub before: Vec<f64>,
    /// Local buffer after the call
    pub after: Vec<f64>,
    /// What every rank should hold afterwards
    pub expected: Vec<f64>,
}

impl CollectiveOutcome {
    /// True when the result matches the expectation.
    pub fn passed(&self) -> bool {
        self.after == self.expected
    }
}

impl fmt::Display for CollectiveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        if let Some(root) = self.root {
            write!(f, " root {root}")?;
        }
        write!(f, ": {:?} -> {:?}", self.before, self.after)
    }
}

/// Runs the configured collectives over a group.
#[derive(Debug)]
pub struct CollectiveDiagnostic {
    operations: Vec<Operation>,
    placement: String,
    kernel: ReductionKernel,
}

impl CollectiveDiagnostic {
    /// Diagnostic running `operations` in order.
    ///
    /// `placement` labels where buffers live (`gpu:0` or `cpu:0`).
    pub fn new(operations: Vec<Operation>, placement: impl Into<String>) -> Self {
        CollectiveDiagnostic {
            operations,
            placement: placement.into(),
            kernel: ReductionKernel::default(),
        }
    }

    /// Operations this diagnostic runs.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of all-reduce specialisations performed.
    pub fn kernel_compilations(&self) -> usize {
        self.kernel.compilations()
    }

    /// Run every configured operation, in order.
    pub fn run<G: ProcessGroup + ?Sized>(&mut self, group: &G) -> Result<Vec<CollectiveOutcome>> {
        let mut outcomes = Vec::new();
        for op in self.operations.clone() {
            match op {
                Operation::Broadcast => outcomes.extend(self.broadcast_all_roots(group)?),
                Operation::AllReduce => outcomes.push(self.all_reduce_sum(group)?),
            }
        }
        let failed = outcomes.iter().filter(|o| !o.passed()).count();
        if failed == 0 {
            info!("{} collective checks passed", outcomes.len());
        } else {
            error!("{failed} of {} collective checks failed", outcomes.len());
        }
        Ok(outcomes)
    }

    /// Broadcast from every root in ascending order.
    pub fn broadcast_all_roots<G: ProcessGroup + ?Sized>(
        &self,
        group: &G,
    ) -> Result<Vec<CollectiveOutcome>> {
        let (rank, size) = (group.rank(), group.size());
        group.barrier()?;
        let mut outcomes = Vec::with_capacity(size);
        for root in 0..size {
            let mut xs = vec![BROADCAST_SENTINEL; size];
            if root == rank {
                xs.fill(root as f64);
                info!("BCAST ROOT {xs:?}");
            }

            group.barrier()?;
            info!("BEFORE BCAST {xs:?}");
            let before = xs.clone();

            group.broadcast(&mut xs, root)?;
            info!(" AFTER BCAST {xs:?}");

            let outcome = CollectiveOutcome {
                operation: Operation::Broadcast,
                root: Some(root),
                before,
                after: xs,
                expected: vec![root as f64; size],
            };
            report_mismatch(&outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Sum-reduce `[0, 1, .., size-1] + rank` across the group.
    pub fn all_reduce_sum<G: ProcessGroup + ?Sized>(
        &mut self,
        group: &G,
    ) -> Result<CollectiveOutcome> {
        let (rank, size) = (group.rank(), group.size());
        let xs: Vec<f64> = (0..size).map(|i| (i + rank) as f64).collect();
        info!(
            "BEFORE ALL-REDUCE-SUM | xs {} ({size},) {xs:?}",
            self.placement
        );

        let summed = self.kernel.all_reduce(group, &xs)?;
        info!(
            " AFTER ALL-REDUCE-SUM | xs {} ({},) {summed:?}",
            self.placement,
            summed.len()
        );

        let outcome = CollectiveOutcome {
            operation: Operation::AllReduce,
            root: None,
            before: xs,
            after: summed,
            expected: expected_all_reduce(size),
        };
        report_mismatch(&outcome);
        Ok(outcome)
    }
}

/// `[0, 1, .., n-1] * n + n(n-1)/2`: the sum over ranks of each rank's input.
pub fn expected_all_reduce(n: usize) -> Vec<f64> {
    let offset = (n * n.saturating_sub(1) / 2) as f64;
    (0..n).map(|i| (i * n) as f64 + offset).collect()
}

fn report_mismatch(outcome: &CollectiveOutcome) {
    if !outcome.passed() {
        error!(
            "MISMATCH {outcome} (expected {:?})",
            outcome.expected
        );
    }
}
