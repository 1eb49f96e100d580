//! Prints the device slice every task on one node would get.
//!
//! No MPI needed: each task's launcher environment is simulated, resolved
//! into a [`RankContext`] and partitioned exactly as `ferrodiag run` does,
//! minus publishing.
//!
//! Run with:
//! cargo run --example device_partition -- 4 0,1,2,3,4,5,6,7

use ferrodiag::{DevicePartitioner, LaunchEnv, Launcher, RankContext};

const DEVICE_VAR: &str = "DEMO_VISIBLE_DEVICES";

fn task_env(local_rank: usize, local_size: usize, devices: &str) -> LaunchEnv {
    let (rank, size) = (local_rank.to_string(), local_size.to_string());
    LaunchEnv::from_pairs([
        ("SLURM_JOB_ID", "demo"),
        ("SLURM_JOB_NAME", "device-partition"),
        ("OMPI_COMM_WORLD_LOCAL_RANK", rank.as_str()),
        ("OMPI_COMM_WORLD_LOCAL_SIZE", size.as_str()),
        ("OMPI_COMM_WORLD_RANK", rank.as_str()),
        ("OMPI_COMM_WORLD_SIZE", size.as_str()),
        (DEVICE_VAR, devices),
    ])
}

fn main() {
    let mut args = std::env::args().skip(1);
    let tasks: usize = args
        .next()
        .map(|n| n.parse().expect("task count must be a number"))
        .unwrap_or(4);
    let devices = args.next().unwrap_or_else(|| "0,1,2,3,4,5,6,7".to_string());

    let partitioner = DevicePartitioner::new(DEVICE_VAR);
    println!("{tasks} tasks, {DEVICE_VAR}={devices:?}\n");

    for local_rank in 0..tasks {
        let env = task_env(local_rank, tasks, &devices);
        let ctx = RankContext::resolve(&env, Launcher::OpenMpi).expect("bad topology");
        let visible = partitioner.visible(&env);
        match partitioner.partition(&visible, &ctx) {
            Ok(assignment) => println!(
                "{ctx} | {} | {DEVICE_VAR}={}",
                assignment.placement(),
                assignment.assigned.join(",")
            ),
            Err(err) => println!("{ctx} | {err}"),
        }
    }
}
