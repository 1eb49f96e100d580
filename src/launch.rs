//! Launcher environment snapshot.
//!
//! The scheduler and MPI launcher describe job topology through environment
//! variables. [`LaunchEnv`] captures them once at startup so every later
//! component works from the same immutable view.
//!
//! # Environment Variables
//!
//! | Field        | `OpenMpi`                     | `Slurm`                   | `Mpich`           |
//! |--------------|-------------------------------|---------------------------|-------------------|
//! | job id       | `SLURM_JOB_ID`                | `SLURM_JOB_ID`            | `SLURM_JOB_ID`    |
//! | job name     | `SLURM_JOB_NAME`              | `SLURM_JOB_NAME`          | `SLURM_JOB_NAME`  |
//! | local rank   | `OMPI_COMM_WORLD_LOCAL_RANK`  | `SLURM_LOCALID`           | `MPI_LOCALRANKID` |
//! | local size   | `OMPI_COMM_WORLD_LOCAL_SIZE`  | `SLURM_NTASKS_PER_NODE`   | `MPI_LOCALNRANKS` |
//! | world rank   | `OMPI_COMM_WORLD_RANK`        | `SLURM_PROCID`            | `PMI_RANK`        |
//! | world size   | `OMPI_COMM_WORLD_SIZE`        | `SLURM_NTASKS`            | `PMI_SIZE`        |

use std::collections::BTreeMap;
use std::env;
use std::fmt;

use crate::error::{Error, Result};

/// Variable holding the scheduler job id.
pub const JOB_ID_VAR: &str = "SLURM_JOB_ID";
/// Variable holding the scheduler job name.
pub const JOB_NAME_VAR: &str = "SLURM_JOB_NAME";

/// Immutable copy of the process environment taken at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    vars: BTreeMap<String, String>,
}

impl LaunchEnv {
    /// Snapshot the current process environment.
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn capture() -> Self {
        let vars = env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        LaunchEnv { vars }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        LaunchEnv {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Look up a variable that must be present.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::MissingEnvironment(name.to_string()))
    }

    /// `PATH`, empty when unset.
    pub fn search_path(&self) -> &str {
        self.get("PATH").unwrap_or_default()
    }

    /// `LD_LIBRARY_PATH`, empty when unset.
    pub fn library_path(&self) -> &str {
        self.get("LD_LIBRARY_PATH").unwrap_or_default()
    }
}

/// Variable names one launcher uses for the four topology fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyVars {
    /// Task index on this node
    pub local_rank: &'static str,
    /// Number of tasks on this node
    pub local_size: &'static str,
    /// Task index in the job
    pub world_rank: &'static str,
    /// Number of tasks in the job
    pub world_size: &'static str,
}

/// The program that started this process and injected its rank variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Launcher {
    /// Open MPI `mpirun` under SLURM
    #[default]
    #[value(name = "openmpi")]
    OpenMpi,
    /// SLURM `srun`
    Slurm,
    /// MPICH / Hydra `mpiexec`
    Mpich,
}

impl Launcher {
    /// Topology variable names for this launcher.
    pub fn vars(self) -> TopologyVars {
        match self {
            Launcher::OpenMpi => TopologyVars {
                local_rank: "OMPI_COMM_WORLD_LOCAL_RANK",
                local_size: "OMPI_COMM_WORLD_LOCAL_SIZE",
                world_rank: "OMPI_COMM_WORLD_RANK",
                world_size: "OMPI_COMM_WORLD_SIZE",
            },
            Launcher::Slurm => TopologyVars {
                local_rank: "SLURM_LOCALID",
                local_size: "SLURM_NTASKS_PER_NODE",
                world_rank: "SLURM_PROCID",
                world_size: "SLURM_NTASKS",
            },
            Launcher::Mpich => TopologyVars {
                local_rank: "MPI_LOCALRANKID",
                local_size: "MPI_LOCALNRANKS",
                world_rank: "PMI_RANK",
                world_size: "PMI_SIZE",
            },
        }
    }

    /// Read the local size, applying launcher-specific fallbacks.
    ///
    /// `srun` does not always export `SLURM_NTASKS_PER_NODE`. The per-node
    /// list in `SLURM_TASKS_PER_NODE` (e.g. `"2(x3),1"`) is used instead,
    /// indexed by `SLURM_NODEID`. Without a node id the list must be uniform.
    pub(crate) fn local_size(self, env: &LaunchEnv) -> Result<usize> {
        let var = self.vars().local_size;
        if let Some(value) = env.get(var) {
            return parse_index(var, value);
        }
        if self == Launcher::Slurm {
            if let Some(value) = env.get(SLURM_TASKS_PER_NODE) {
                let counts = expand_tasks_per_node(value)?;
                if let Some(node) = env.get(SLURM_NODEID) {
                    let node = parse_index(SLURM_NODEID, node)?;
                    return counts.get(node).copied().ok_or_else(|| {
                        Error::topology(format!(
                            "{SLURM_NODEID}={node} but {SLURM_TASKS_PER_NODE}={value:?} lists {} nodes",
                            counts.len()
                        ))
                    });
                }
                return match counts.split_first() {
                    Some((&first, rest)) if rest.iter().all(|&n| n == first) => Ok(first),
                    _ => Err(Error::topology(format!(
                        "{SLURM_TASKS_PER_NODE}={value:?} differs between nodes and {SLURM_NODEID} is unset"
                    ))),
                };
            }
        }
        Err(Error::MissingEnvironment(var.to_string()))
    }
}

const SLURM_TASKS_PER_NODE: &str = "SLURM_TASKS_PER_NODE";
const SLURM_NODEID: &str = "SLURM_NODEID";

/// Expand Slurm's compressed per-node task counts: `"2(x3),1"` is `[2, 2, 2, 1]`.
fn expand_tasks_per_node(value: &str) -> Result<Vec<usize>> {
    let malformed = || Error::topology(format!("{SLURM_TASKS_PER_NODE}={value:?} is malformed"));
    let mut counts = Vec::new();
    for entry in value.split(',').map(str::trim) {
        let (count, repeat) = match entry.split_once("(x") {
            Some((count, rest)) => {
                let repeat = rest.strip_suffix(')').ok_or_else(malformed)?;
                (count, repeat.parse::<usize>().map_err(|_| malformed())?)
            }
            None => (entry, 1),
        };
        let count = count.parse::<usize>().map_err(|_| malformed())?;
        counts.extend(std::iter::repeat_n(count, repeat));
    }
    Ok(counts)
}

/// Parse a rank or size variable.
pub(crate) fn parse_index(var: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|_| {
        Error::topology(format!("{var}={value:?} is not a non-negative integer"))
    })
}

impl fmt::Display for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Launcher::OpenMpi => "openmpi",
            Launcher::Slurm => "slurm",
            Launcher::Mpich => "mpich",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_names_missing_variable() {
        let env = LaunchEnv::from_pairs([("SLURM_JOB_ID", "42")]);
        assert_eq!(env.require("SLURM_JOB_ID").unwrap(), "42");
        match env.require("SLURM_JOB_NAME") {
            Err(Error::MissingEnvironment(name)) => assert_eq!(name, "SLURM_JOB_NAME"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn search_paths_default_to_empty() {
        let env = LaunchEnv::from_pairs([("PATH", "/usr/bin")]);
        assert_eq!(env.search_path(), "/usr/bin");
        assert_eq!(env.library_path(), "");
    }

    #[test]
    fn slurm_local_size_falls_back_to_tasks_per_node() {
        let env = LaunchEnv::from_pairs([("SLURM_TASKS_PER_NODE", "4(x2)")]);
        assert_eq!(Launcher::Slurm.local_size(&env).unwrap(), 4);

        let env = LaunchEnv::from_pairs([
            ("SLURM_NTASKS_PER_NODE", "8"),
            ("SLURM_TASKS_PER_NODE", "4(x2)"),
        ]);
        assert_eq!(Launcher::Slurm.local_size(&env).unwrap(), 8);
    }

    #[test]
    fn uneven_allocation_picks_this_nodes_entry() {
        for (node, expected) in [("0", 2), ("2", 2), ("3", 1)] {
            let env = LaunchEnv::from_pairs([
                ("SLURM_TASKS_PER_NODE", "2(x3),1"),
                ("SLURM_NODEID", node),
            ]);
            assert_eq!(Launcher::Slurm.local_size(&env).unwrap(), expected, "node {node}");
        }

        let env = LaunchEnv::from_pairs([("SLURM_TASKS_PER_NODE", "3,1"), ("SLURM_NODEID", "1")]);
        assert_eq!(Launcher::Slurm.local_size(&env).unwrap(), 1);

        let env = LaunchEnv::from_pairs([("SLURM_TASKS_PER_NODE", "3,1"), ("SLURM_NODEID", "2")]);
        assert_eq!(Launcher::Slurm.local_size(&env).unwrap_err().kind(), "InvalidTopology");
    }

    #[test]
    fn uneven_allocation_without_node_id_is_rejected() {
        let env = LaunchEnv::from_pairs([("SLURM_TASKS_PER_NODE", "3,1")]);
        let err = Launcher::Slurm.local_size(&env).unwrap_err();
        assert!(err.to_string().contains("SLURM_NODEID is unset"), "{err}");

        let env = LaunchEnv::from_pairs([("SLURM_TASKS_PER_NODE", "2,2(x2)")]);
        assert_eq!(Launcher::Slurm.local_size(&env).unwrap(), 2);
    }

    #[test]
    fn malformed_tasks_per_node_is_rejected() {
        for bad in ["", "4(x2", "x,1", "2(y3)"] {
            let env = LaunchEnv::from_pairs([("SLURM_TASKS_PER_NODE", bad)]);
            assert_eq!(
                Launcher::Slurm.local_size(&env).unwrap_err().kind(),
                "InvalidTopology",
                "{bad:?}"
            );
        }
    }

    #[test]
    fn openmpi_has_no_local_size_fallback() {
        let env = LaunchEnv::from_pairs([("SLURM_TASKS_PER_NODE", "4(x2)")]);
        assert!(matches!(
            Launcher::OpenMpi.local_size(&env),
            Err(Error::MissingEnvironment(name)) if name == "OMPI_COMM_WORLD_LOCAL_SIZE"
        ));
    }

    #[test]
    fn launcher_names_match_cli_values() {
        use clap::ValueEnum;
        for launcher in Launcher::value_variants() {
            let value = launcher.to_possible_value().unwrap();
            assert_eq!(value.get_name(), launcher.to_string());
        }
        assert_eq!(Launcher::from_str("openmpi", false).unwrap(), Launcher::OpenMpi);
        assert!(Launcher::from_str("pbs", false).is_err());
    }
}
