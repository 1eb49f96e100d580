//! Position of this process in the job topology.

use std::fmt;

use crate::error::{Error, Result};
use crate::launch::{JOB_ID_VAR, JOB_NAME_VAR, LaunchEnv, Launcher, parse_index};

/// Identity and coordinates of one task, resolved once at startup.
///
/// Every other component borrows this record; it is never mutated.
///
/// # Example
///
/// ```
/// use ferrodiag::{LaunchEnv, Launcher, RankContext};
///
/// let env = LaunchEnv::from_pairs([
///     ("SLURM_JOB_ID", "8812"),
///     ("SLURM_JOB_NAME", "probe"),
///     ("OMPI_COMM_WORLD_LOCAL_RANK", "1"),
///     ("OMPI_COMM_WORLD_LOCAL_SIZE", "2"),
///     ("OMPI_COMM_WORLD_RANK", "3"),
///     ("OMPI_COMM_WORLD_SIZE", "4"),
/// ]);
/// let ctx = RankContext::resolve(&env, Launcher::OpenMpi).unwrap();
/// assert_eq!(ctx.channel(), "8812-probe-0003");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RankContext {
    /// Scheduler job id
    pub job_id: String,
    /// Scheduler job name
    pub job_name: String,
    /// Task index on this node
    pub local_rank: usize,
    /// Number of tasks on this node
    pub local_size: usize,
    /// Task index in the job
    pub world_rank: usize,
    /// Number of tasks in the job
    pub world_size: usize,
}

impl RankContext {
    /// Resolve the context from a launcher environment.
    ///
    /// Variables are checked in the order job id, job name, local rank,
    /// local size, world rank, world size; the first absent one is reported.
    pub fn resolve(env: &LaunchEnv, launcher: Launcher) -> Result<Self> {
        let vars = launcher.vars();

        let job_id = env.require(JOB_ID_VAR)?.to_string();
        let job_name = env.require(JOB_NAME_VAR)?.to_string();

        let local_rank = parse_index(vars.local_rank, env.require(vars.local_rank)?)?;
        let local_size = launcher.local_size(env)?;
        let world_rank = parse_index(vars.world_rank, env.require(vars.world_rank)?)?;
        let world_size = parse_index(vars.world_size, env.require(vars.world_size)?)?;

        let ctx = RankContext {
            job_id,
            job_name,
            local_rank,
            local_size,
            world_rank,
            world_size,
        };
        ctx.validate()?;
        Ok(ctx)
    }

    /// Check the rank/size relationships.
    pub fn validate(&self) -> Result<()> {
        if self.local_size == 0 || self.world_size == 0 {
            return Err(Error::topology(format!(
                "group sizes must be positive (local {}, world {})",
                self.local_size, self.world_size
            )));
        }
        if self.local_rank >= self.local_size {
            return Err(Error::topology(format!(
                "local rank {} outside local size {}",
                self.local_rank, self.local_size
            )));
        }
        if self.world_rank >= self.world_size {
            return Err(Error::topology(format!(
                "world rank {} outside world size {}",
                self.world_rank, self.world_size
            )));
        }
        if self.local_size > self.world_size {
            return Err(Error::topology(format!(
                "local size {} exceeds world size {}",
                self.local_size, self.world_size
            )));
        }
        Ok(())
    }

    /// Process-unique channel name, also the log shard stem.
    pub fn channel(&self) -> String {
        format!("{}-{}-{:04}", self.job_id, self.job_name, self.world_rank)
    }
}

impl fmt::Display for RankContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}:{:03} | {:03}:{:03} | {} | {}",
            self.world_rank,
            self.world_size,
            self.local_rank,
            self.local_size,
            self.job_id,
            self.job_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OMPI: [(&str, &str); 6] = [
        ("SLURM_JOB_ID", "12345"),
        ("SLURM_JOB_NAME", "diag"),
        ("OMPI_COMM_WORLD_LOCAL_RANK", "1"),
        ("OMPI_COMM_WORLD_LOCAL_SIZE", "2"),
        ("OMPI_COMM_WORLD_RANK", "3"),
        ("OMPI_COMM_WORLD_SIZE", "4"),
    ];

    fn env_with(overrides: &[(&str, &str)], removed: &[&str]) -> LaunchEnv {
        LaunchEnv::from_pairs(
            OMPI.iter()
                .filter(|(k, _)| !removed.contains(k))
                .map(|&(k, v)| {
                    let v = overrides
                        .iter()
                        .find(|(ok, _)| *ok == k)
                        .map_or(v, |(_, ov)| *ov);
                    (k, v)
                }),
        )
    }

    #[test]
    fn resolves_openmpi_topology() {
        let ctx = RankContext::resolve(&env_with(&[], &[]), Launcher::OpenMpi).unwrap();
        assert_eq!(
            ctx,
            RankContext {
                job_id: "12345".into(),
                job_name: "diag".into(),
                local_rank: 1,
                local_size: 2,
                world_rank: 3,
                world_size: 4,
            }
        );
        assert_eq!(ctx.channel(), "12345-diag-0003");
        assert_eq!(ctx.to_string(), "003:004 | 001:002 | 12345 | diag");
    }

    #[test]
    fn resolution_is_idempotent() {
        let env = env_with(&[], &[]);
        let first = RankContext::resolve(&env, Launcher::OpenMpi).unwrap();
        let second = RankContext::resolve(&env, Launcher::OpenMpi).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn every_missing_variable_is_named() {
        for (var, _) in OMPI {
            let env = env_with(&[], &[var]);
            match RankContext::resolve(&env, Launcher::OpenMpi) {
                Err(Error::MissingEnvironment(name)) => assert_eq!(name, var),
                other => panic!("removing {var} gave {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_non_numeric_and_negative_values() {
        for bad in ["two", "-1", "", "1.5"] {
            let env = env_with(&[("OMPI_COMM_WORLD_SIZE", bad)], &[]);
            let err = RankContext::resolve(&env, Launcher::OpenMpi).unwrap_err();
            assert!(
                matches!(&err, Error::InvalidTopology { reason, .. } if reason.contains("OMPI_COMM_WORLD_SIZE")),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn rejects_ranks_outside_their_group() {
        let cases: [&[(&str, &str)]; 4] = [
            &[("OMPI_COMM_WORLD_LOCAL_RANK", "2")],
            &[("OMPI_COMM_WORLD_RANK", "4")],
            &[("OMPI_COMM_WORLD_LOCAL_SIZE", "0"), ("OMPI_COMM_WORLD_LOCAL_RANK", "0")],
            &[("OMPI_COMM_WORLD_LOCAL_SIZE", "8"), ("OMPI_COMM_WORLD_LOCAL_RANK", "0")],
        ];
        for overrides in cases {
            let err = RankContext::resolve(&env_with(overrides, &[]), Launcher::OpenMpi)
                .unwrap_err();
            assert_eq!(err.kind(), "InvalidTopology", "{overrides:?}");
        }
    }

    #[test]
    fn resolves_slurm_and_mpich_schemes() {
        let slurm = LaunchEnv::from_pairs([
            ("SLURM_JOB_ID", "7"),
            ("SLURM_JOB_NAME", "srun-job"),
            ("SLURM_LOCALID", "0"),
            ("SLURM_TASKS_PER_NODE", "2(x2)"),
            ("SLURM_PROCID", "2"),
            ("SLURM_NTASKS", "4"),
        ]);
        let ctx = RankContext::resolve(&slurm, Launcher::Slurm).unwrap();
        assert_eq!((ctx.local_size, ctx.world_rank), (2, 2));

        let mpich = LaunchEnv::from_pairs([
            ("SLURM_JOB_ID", "7"),
            ("SLURM_JOB_NAME", "hydra"),
            ("MPI_LOCALRANKID", "0"),
            ("MPI_LOCALNRANKS", "1"),
            ("PMI_RANK", "0"),
            ("PMI_SIZE", "1"),
        ]);
        let ctx = RankContext::resolve(&mpich, Launcher::Mpich).unwrap();
        assert_eq!(ctx.world_rank, 0);
        assert_eq!(ctx.channel(), "7-hydra-0000");
    }

    #[test]
    fn slurm_uneven_nodes_use_this_nodes_task_count() {
        let mut pairs = vec![
            ("SLURM_JOB_ID", "8"),
            ("SLURM_JOB_NAME", "uneven"),
            ("SLURM_LOCALID", "0"),
            ("SLURM_TASKS_PER_NODE", "3,1"),
            ("SLURM_PROCID", "3"),
            ("SLURM_NTASKS", "4"),
        ];
        let err = RankContext::resolve(&LaunchEnv::from_pairs(pairs.clone()), Launcher::Slurm)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTopology { .. }), "{err}");

        pairs.push(("SLURM_NODEID", "1"));
        let ctx = RankContext::resolve(&LaunchEnv::from_pairs(pairs), Launcher::Slurm).unwrap();
        assert_eq!((ctx.local_rank, ctx.local_size), (0, 1));
        assert_eq!((ctx.world_rank, ctx.world_size), (3, 4));
    }
}
