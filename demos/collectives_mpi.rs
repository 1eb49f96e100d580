//! Checks every collective the MPI transport offers, against a real MPI job.
//!
//! Exercises barrier, broadcast from every root, all-reduce with each
//! [`ReduceOp`], the reduction kernel cache, and the full diagnostic run.
//! A custom panic hook calls `std::process::abort()` so a failed assertion
//! on one rank does not leave the others blocked in a collective.
//!
//! Run with:
//! cargo build --features mpi --examples
//! mpiexec -n 4 ./target/debug/examples/collectives_mpi

use ferrodiag::mpi::MpiGroup;
use ferrodiag::{
    BROADCAST_SENTINEL, CollectiveDiagnostic, Operation, ProcessGroup, ReduceOp, ReductionKernel,
    expected_all_reduce,
};

fn main() {
    let group = MpiGroup::connect().expect("MPI init failed");

    // Installed after init; some MPI runtimes replace the hook during startup.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        std::process::abort();
    }));

    let rank = group.rank();
    let size = group.size();
    assert!(size >= 2, "collectives_mpi requires at least 2 processes");

    // ========================================================================
    // barrier
    // ========================================================================
    group.barrier().expect("barrier failed");
    if rank == 0 {
        println!("PASS: barrier");
    }

    // ========================================================================
    // broadcast from every root
    // ========================================================================
    for root in 0..size {
        let mut xs = vec![BROADCAST_SENTINEL; size];
        if rank == root {
            xs.fill(root as f64);
        }
        group.broadcast(&mut xs, root).expect("broadcast failed");
        assert!(
            xs.iter().all(|&x| x == root as f64),
            "rank {rank}: broadcast from {root} gave {xs:?}"
        );
    }
    if rank == 0 {
        println!("PASS: broadcast (all roots)");
    }

    // ========================================================================
    // all-reduce, every op
    // ========================================================================
    let send = vec![(rank + 1) as f64; 3];
    let cases = [
        (ReduceOp::Sum, (size * (size + 1) / 2) as f64),
        (ReduceOp::Max, size as f64),
        (ReduceOp::Min, 1.0),
        (ReduceOp::Prod, (1..=size).map(|r| r as f64).product()),
    ];
    for (op, expected) in cases {
        let mut recv = vec![0.0; 3];
        group.all_reduce(&send, &mut recv, op).expect("all-reduce failed");
        for (i, &v) in recv.iter().enumerate() {
            assert!(
                (v - expected).abs() < 1e-10,
                "rank {rank}: {op:?} recv[{i}] = {v}, expected {expected}"
            );
        }
        if rank == 0 {
            println!("PASS: all-reduce ({op:?})");
        }
    }

    // ========================================================================
    // reduction kernel: one plan per shape
    // ========================================================================
    {
        let mut kernel = ReductionKernel::new(ReduceOp::Sum);
        let xs: Vec<f64> = (0..size).map(|i| (i + rank) as f64).collect();
        for _ in 0..3 {
            let summed = kernel.all_reduce(&group, &xs).expect("kernel failed");
            assert_eq!(summed, expected_all_reduce(size), "rank {rank}");
        }
        assert_eq!(kernel.compilations(), 1);
        if rank == 0 {
            println!("PASS: reduction kernel reuse");
        }
    }

    // ========================================================================
    // full diagnostic
    // ========================================================================
    {
        let mut diagnostic = CollectiveDiagnostic::new(Operation::ALL.to_vec(), "cpu:0");
        let outcomes = diagnostic.run(&group).expect("diagnostic failed");
        assert_eq!(outcomes.len(), size + 1);
        assert!(outcomes.iter().all(|o| o.passed()), "rank {rank}: {outcomes:?}");
        if rank == 0 {
            println!("PASS: diagnostic ({} checks)", outcomes.len());
        }
    }

    group.barrier().expect("final barrier failed");
    if rank == 0 {
        println!("\n========================================");
        println!("All collective checks passed! ({size} processes)");
        println!("========================================");
    }
}
