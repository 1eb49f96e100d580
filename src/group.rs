//! The process-group seam.
//!
//! Collective calls are blocking and group-ordered: every member must issue
//! the same calls, in the same order, with the same shapes, or the group
//! deadlocks. None of them can be wrapped in a timeout without risking
//! permanent desynchronization, so there is no cancellation here; a stuck
//! collective is left to the scheduler's wall-clock limit.

use crate::error::{Error, Result};

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
}

impl ReduceOp {
    /// Fold `value` into `acc`.
    pub fn apply(self, acc: f64, value: f64) -> f64 {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Max => acc.max(value),
            ReduceOp::Min => acc.min(value),
            ReduceOp::Prod => acc * value,
        }
    }
}

/// A set of cooperating processes that take part in collectives together.
pub trait ProcessGroup {
    /// Rank of the calling member.
    fn rank(&self) -> usize;

    /// Number of members.
    fn size(&self) -> usize;

    /// Block until every member has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Copy `data` from `root` to every member.
    ///
    /// `data` is input on the root and output elsewhere.
    fn broadcast(&self, data: &mut [f64], root: usize) -> Result<()>;

    /// Combine `send` from every member with `op` and deliver the result to
    /// every member in `recv`.
    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<()>;
}

/// A group containing only the calling process.
///
/// Used when the job runs as a single task without an MPI launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloGroup;

impl ProcessGroup for SoloGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _data: &mut [f64], root: usize) -> Result<()> {
        if root != 0 {
            return Err(Error::collective("broadcast", format!("root {root} outside group of 1")));
        }
        Ok(())
    }

    fn all_reduce(&self, send: &[f64], recv: &mut [f64], _op: ReduceOp) -> Result<()> {
        if send.len() != recv.len() {
            return Err(Error::collective(
                "all-reduce",
                format!("send has {} elements, recv has {}", send.len(), recv.len()),
            ));
        }
        recv.copy_from_slice(send);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_ops_fold() {
        let values = [3.0, -1.0, 2.0];
        let fold = |op: ReduceOp, init: f64| values.iter().fold(init, |acc, &v| op.apply(acc, v));
        assert_eq!(fold(ReduceOp::Sum, 0.0), 4.0);
        assert_eq!(fold(ReduceOp::Max, f64::NEG_INFINITY), 3.0);
        assert_eq!(fold(ReduceOp::Min, f64::INFINITY), -1.0);
        assert_eq!(fold(ReduceOp::Prod, 1.0), -6.0);
    }

    #[test]
    fn solo_group_is_identity() {
        let group = SoloGroup;
        assert_eq!((group.rank(), group.size()), (0, 1));
        group.barrier().unwrap();

        let mut data = [4.0, 5.0];
        group.broadcast(&mut data, 0).unwrap();
        assert_eq!(data, [4.0, 5.0]);
        assert!(group.broadcast(&mut data, 1).is_err());

        let mut recv = [0.0; 2];
        group.all_reduce(&data, &mut recv, ReduceOp::Sum).unwrap();
        assert_eq!(recv, data);
        assert!(group.all_reduce(&data, &mut [0.0], ReduceOp::Sum).is_err());
    }
}
