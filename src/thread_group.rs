//! In-process process group: one thread per rank.
//!
//! Lets the whole diagnostic run inside a single test binary. Each member
//! owns one slot in a shared table and only ever writes its own slot;
//! collectives are two-phase (publish, barrier, read, barrier) so a slot is
//! never overwritten while a peer is still reading it.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::group::{ProcessGroup, ReduceOp};

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// Factory for a group of [`ThreadMember`]s.
#[derive(Debug, Clone, Copy)]
pub struct ThreadGroup;

impl ThreadGroup {
    /// Create `size` members, ordered by rank.
    ///
    /// Each member must be moved to its own thread; calling a collective
    /// on two members from the same thread blocks forever.
    pub fn new(size: usize) -> Vec<ThreadMember> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadMember {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank of a [`ThreadGroup`].
pub struct ThreadMember {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ThreadMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadMember")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ThreadMember {
    fn publish(&self, data: &[f64]) {
        let mut slots = self.shared.slots.lock();
        slots[self.rank].clear();
        slots[self.rank].extend_from_slice(data);
    }
}

impl ProcessGroup for ThreadMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn broadcast(&self, data: &mut [f64], root: usize) -> Result<()> {
        if root >= self.size {
            return Err(Error::collective(
                "broadcast",
                format!("root {root} outside group of {}", self.size),
            ));
        }
        if self.rank == root {
            self.publish(data);
        }
        self.shared.barrier.wait();
        let outcome = {
            let slots = self.shared.slots.lock();
            let source = &slots[root];
            if source.len() == data.len() {
                data.copy_from_slice(source);
                Ok(())
            } else {
                Err(Error::collective(
                    "broadcast",
                    format!(
                        "rank {} expects {} elements, root {root} sent {}",
                        self.rank,
                        data.len(),
                        source.len()
                    ),
                ))
            }
        };
        self.shared.barrier.wait();
        outcome
    }

    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<()> {
        self.publish(send);
        self.shared.barrier.wait();
        let outcome = {
            let slots = self.shared.slots.lock();
            if let Some((rank, bad)) = slots
                .iter()
                .enumerate()
                .find(|(_, contribution)| contribution.len() != recv.len())
            {
                Err(Error::collective(
                    "all-reduce",
                    format!(
                        "rank {rank} contributed {} elements, expected {}",
                        bad.len(),
                        recv.len()
                    ),
                ))
            } else {
                recv.copy_from_slice(&slots[0]);
                for contribution in &slots[1..] {
                    for (acc, &value) in recv.iter_mut().zip(contribution) {
                        *acc = op.apply(*acc, value);
                    }
                }
                Ok(())
            }
        };
        self.shared.barrier.wait();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(ThreadMember) -> T + Sync,
    {
        thread::scope(|s| {
            let handles: Vec<_> = ThreadGroup::new(size)
                .into_iter()
                .map(|member| s.spawn(|| f(member)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn broadcast_from_middle_root() {
        let results = run_ranks(3, |member| {
            let mut xs = if member.rank() == 1 {
                vec![1.0; 3]
            } else {
                vec![-1.0; 3]
            };
            member.broadcast(&mut xs, 1).unwrap();
            xs
        });
        assert!(results.iter().all(|xs| xs == &[1.0, 1.0, 1.0]));
    }

    #[test]
    fn all_reduce_sum_of_shifted_ranges() {
        let results = run_ranks(2, |member| {
            let send: Vec<f64> = (0..2).map(|i| (i + member.rank()) as f64).collect();
            let mut recv = vec![0.0; 2];
            member.all_reduce(&send, &mut recv, ReduceOp::Sum).unwrap();
            recv
        });
        assert_eq!(results, vec![vec![1.0, 3.0], vec![1.0, 3.0]]);
    }

    #[test]
    fn all_reduce_max_and_prod() {
        let results = run_ranks(4, |member| {
            let x = [member.rank() as f64 + 1.0];
            let mut max = [0.0];
            let mut prod = [0.0];
            member.all_reduce(&x, &mut max, ReduceOp::Max).unwrap();
            member.all_reduce(&x, &mut prod, ReduceOp::Prod).unwrap();
            (max[0], prod[0])
        });
        assert!(results.iter().all(|&r| r == (4.0, 24.0)));
    }

    #[test]
    fn mismatched_shapes_fail_on_every_rank() {
        let results = run_ranks(3, |member| {
            let len = if member.rank() == 2 { 4 } else { 3 };
            let send = vec![1.0; len];
            let mut recv = vec![0.0; len];
            member.all_reduce(&send, &mut recv, ReduceOp::Sum)
        });
        for result in results {
            assert_eq!(result.unwrap_err().kind(), "CollectiveFailure");
        }
    }

    #[test]
    fn group_stays_usable_after_a_failed_collective() {
        let results = run_ranks(2, |member| {
            let mut short = vec![0.0; 1 + member.rank()];
            let first = member.broadcast(&mut short, 0);
            member.barrier().unwrap();
            let mut xs = vec![member.rank() as f64; 2];
            member.broadcast(&mut xs, 1).unwrap();
            (first.is_ok(), xs)
        });
        assert_eq!(results[0], (true, vec![1.0, 1.0]));
        assert_eq!(results[1], (false, vec![1.0, 1.0]));
    }

    #[test]
    fn rejects_root_outside_group() {
        let member = ThreadGroup::new(1).pop().unwrap();
        assert!(member.broadcast(&mut [0.0], 1).is_err());
    }
}
