//! `ferrodiag` command line.
//!
//! Launch one copy per task, e.g.
//! `mpiexec -n 8 ferrodiag run --transport mpi --logs-dir logs`, then
//! `ferrodiag merge logs/*.log` to read the whole job in order.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};

use ferrodiag::{
    ConsoleSink, CUDA_VISIBLE_DEVICES, DeviceProbe, Harness, HarnessConfig, LaunchEnv, Launcher,
    NVIDIA_SMI, Operation, RunReport, SoloGroup, timeline,
};

#[derive(Debug, Parser)]
#[command(name = "ferrodiag", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the diagnostic for this task
    Run(RunArgs),
    /// Merge log shards into one timeline on stdout
    Merge {
        /// Shard files written by `run`
        #[arg(required = true)]
        shards: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Single task, no communication
    Solo,
    /// MPI through the C shim (needs the `mpi` feature)
    Mpi,
}

#[cfg(feature = "mpi")]
const DEFAULT_TRANSPORT: Transport = Transport::Mpi;
#[cfg(not(feature = "mpi"))]
const DEFAULT_TRANSPORT: Transport = Transport::Solo;

#[derive(Debug, Args)]
struct RunArgs {
    /// Launcher whose variables describe the topology
    #[arg(long, env = "FERRODIAG_LAUNCHER", value_enum, default_value_t = Launcher::OpenMpi)]
    launcher: Launcher,

    /// Existing directory for per-task log shards
    #[arg(long, env = "FERRODIAG_LOGS_DIR", default_value = "logs")]
    logs_dir: PathBuf,

    /// Variable listing the node's visible devices
    #[arg(long, env = "FERRODIAG_DEVICE_VAR", default_value = CUDA_VISIBLE_DEVICES)]
    device_var: String,

    /// Device enumeration tool
    #[arg(long, env = "FERRODIAG_PROBE", default_value = NVIDIA_SMI)]
    probe: PathBuf,

    /// Argument passed to the probe (repeatable)
    #[arg(long = "probe-arg", allow_hyphen_values = true)]
    probe_args: Vec<String>,

    /// Collectives to run, in order
    #[arg(
        long,
        env = "FERRODIAG_OPS",
        value_enum,
        value_delimiter = ',',
        default_value = "broadcast,all-reduce"
    )]
    ops: Vec<Operation>,

    /// Seconds to stay alive after the diagnostic
    #[arg(long, env = "FERRODIAG_GRACE_SECS", default_value_t = 10)]
    grace_secs: u64,

    /// Transport used for the collectives
    #[arg(long, env = "FERRODIAG_TRANSPORT", value_enum, default_value_t = DEFAULT_TRANSPORT)]
    transport: Transport,

    /// Exit with status 1 if any check failed
    #[arg(long, env = "FERRODIAG_STRICT")]
    strict: bool,
}

impl RunArgs {
    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            launcher: self.launcher,
            logs_dir: self.logs_dir.clone(),
            device_var: self.device_var.clone(),
            probe: DeviceProbe::new(&self.probe).with_args(&self.probe_args),
            operations: self.ops.clone(),
            grace: Duration::from_secs(self.grace_secs),
            console: ConsoleSink::Stdout,
        }
    }
}

fn run(args: &RunArgs, env: &LaunchEnv) -> anyhow::Result<RunReport> {
    let harness = Harness::new(args.config());
    let report = match args.transport {
        Transport::Solo => harness.run(env, |_, _| Ok(SoloGroup)),
        #[cfg(feature = "mpi")]
        Transport::Mpi => harness.run(env, |_, _| {
            use ferrodiag::mpi::{Mpi, MpiGroup};
            let group = MpiGroup::connect()?;
            tracing::debug!(
                built_with = option_env!("FERRODIAG_MPI_SOURCE"),
                pkg_version = option_env!("FERRODIAG_MPI_PKG_VERSION"),
                "MPI {}",
                Mpi::version()?.trim_end()
            );
            tracing::debug!("node {}", Mpi::processor_name()?);
            Ok(group)
        }),
        #[cfg(not(feature = "mpi"))]
        Transport::Mpi => {
            anyhow::bail!("this build has no MPI transport; rebuild with `--features mpi`")
        }
    };
    report.with_context(|| format!("pre-flight failed (logs in {})", args.logs_dir.display()))
}

/// Without `--strict` a completed run always succeeds.
fn succeeded(args: &RunArgs, report: &RunReport) -> bool {
    !args.strict || report.passed()
}

fn merge(shards: &[PathBuf]) -> anyhow::Result<()> {
    let records = timeline::merge(shards).context("cannot merge shards")?;
    for record in records {
        println!("{record}");
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let outcome = match &cli.command {
        Command::Run(args) => run(args, &LaunchEnv::capture()).map(|r| succeeded(args, &r)),
        Command::Merge { shards } => merge(shards).map(|()| true),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("ferrodiag: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrodiag::Fault;

    fn run_args(logs_dir: &std::path::Path, extra: &[&str]) -> RunArgs {
        let mut argv = vec![
            "ferrodiag".to_string(),
            "run".into(),
            "--transport".into(),
            "solo".into(),
            "--launcher".into(),
            "slurm".into(),
            "--logs-dir".into(),
            logs_dir.display().to_string(),
            "--device-var".into(),
            "FERRODIAG_CLI_UNSET_DEVICES".into(),
            "--probe".into(),
            "/bin/echo".into(),
            "--grace-secs".into(),
            "0".into(),
        ];
        argv.extend(extra.iter().map(ToString::to_string));
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            Command::Merge { .. } => unreachable!(),
        }
    }

    fn solo_env() -> LaunchEnv {
        LaunchEnv::from_pairs([
            ("SLURM_JOB_ID", "31"),
            ("SLURM_JOB_NAME", "cli"),
            ("SLURM_LOCALID", "0"),
            ("SLURM_NTASKS_PER_NODE", "1"),
            ("SLURM_PROCID", "0"),
            ("SLURM_NTASKS", "1"),
        ])
    }

    #[test]
    fn ops_and_strict_reach_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(dir.path(), &["--ops", "all-reduce,bcast", "--strict"]);
        assert!(args.strict);
        let config = args.config();
        assert_eq!(config.operations, [Operation::AllReduce, Operation::Broadcast]);
        assert_eq!(config.grace, Duration::ZERO);
        assert_eq!(config.launcher, Launcher::Slurm);

        let args = run_args(dir.path(), &[]);
        assert!(!args.strict);
        assert_eq!(args.config().operations, Operation::ALL);
    }

    #[test]
    fn build_records_mpi_discovery_only_with_the_feature() {
        assert_eq!(option_env!("FERRODIAG_MPI_SOURCE").is_some(), cfg!(feature = "mpi"));
        if option_env!("FERRODIAG_MPI_PKG_VERSION").is_some() {
            assert!(option_env!("FERRODIAG_MPI_SOURCE").unwrap().starts_with("pkg-config "));
        }
    }

    #[test]
    fn unknown_operation_is_a_usage_error() {
        let err = Cli::try_parse_from(["ferrodiag", "run", "--ops", "scatter"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn strict_fails_only_when_a_check_failed() {
        let dir = tempfile::tempdir().unwrap();
        let lenient = run_args(dir.path(), &["--ops", "all-reduce"]);
        let strict = run_args(dir.path(), &["--ops", "all-reduce", "--strict"]);

        let mut report = run(&strict, &solo_env()).unwrap();
        assert!(report.passed());
        assert_eq!(report.outcomes.len(), 1);
        assert!(succeeded(&strict, &report));
        assert!(succeeded(&lenient, &report));

        report.fault = Some(Fault {
            kind: "CollectiveFailure",
            message: "all-reduce failed".into(),
            location: None,
        });
        assert!(!succeeded(&strict, &report));
        assert!(succeeded(&lenient, &report));
    }

    #[test]
    fn preflight_failure_is_an_error_not_a_report() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(dir.path(), &["--strict"]);
        let err = run(&args, &LaunchEnv::from_pairs([("SLURM_JOB_ID", "31")])).unwrap_err();
        assert!(format!("{err:#}").contains("pre-flight failed"), "{err:#}");
    }
}
