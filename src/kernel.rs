//! Shape-specialised all-reduce kernel.
//!
//! Preparing a reduction for a new input shape is the expensive step, so a
//! [`ReducePlan`] is built once per distinct shape and reused for every later
//! call with that shape.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::group::{ProcessGroup, ReduceOp};

/// A reduction specialised for one input length.
#[derive(Debug, PartialEq, Eq)]
pub struct ReducePlan {
    len: usize,
    op: ReduceOp,
}

impl ReducePlan {
    /// Input length this plan accepts.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for the zero-length plan.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run the collective reduction of `input` across `group`.
    pub fn execute<G: ProcessGroup + ?Sized>(&self, group: &G, input: &[f64]) -> Result<Vec<f64>> {
        let mut output = vec![0.0; self.len];
        group.all_reduce(input, &mut output, self.op)?;
        Ok(output)
    }
}

/// Cache of [`ReducePlan`]s keyed by input length.
#[derive(Debug)]
pub struct ReductionKernel {
    op: ReduceOp,
    plans: HashMap<usize, Arc<ReducePlan>>,
    compilations: usize,
}

impl ReductionKernel {
    /// Kernel reducing with `op`.
    pub fn new(op: ReduceOp) -> Self {
        ReductionKernel {
            op,
            plans: HashMap::new(),
            compilations: 0,
        }
    }

    /// Plan for inputs of length `len`, built on first use.
    pub fn plan(&mut self, len: usize) -> Arc<ReducePlan> {
        let op = self.op;
        let compilations = &mut self.compilations;
        let plan = self.plans.entry(len).or_insert_with(|| {
            *compilations += 1;
            debug!("specialising {op:?} all-reduce for shape ({len},)");
            Arc::new(ReducePlan { len, op })
        });
        Arc::clone(plan)
    }

    /// Reduce `input` across `group`, specialising on its length if needed.
    pub fn all_reduce<G: ProcessGroup + ?Sized>(
        &mut self,
        group: &G,
        input: &[f64],
    ) -> Result<Vec<f64>> {
        self.plan(input.len()).execute(group, input)
    }

    /// Number of distinct shapes specialised so far.
    pub fn compilations(&self) -> usize {
        self.compilations
    }
}

impl Default for ReductionKernel {
    fn default() -> Self {
        ReductionKernel::new(ReduceOp::Sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::SoloGroup;

    #[test]
    fn specialises_once_per_shape() {
        let mut kernel = ReductionKernel::default();
        let first = kernel.plan(4);
        let again = kernel.plan(4);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(kernel.compilations(), 1);

        kernel.plan(8);
        kernel.plan(4);
        assert_eq!(kernel.compilations(), 2);
    }

    #[test]
    fn reduces_through_the_group() {
        let mut kernel = ReductionKernel::default();
        let out = kernel.all_reduce(&SoloGroup, &[1.0, 2.0]).unwrap();
        assert_eq!(out, [1.0, 2.0]);
        kernel.all_reduce(&SoloGroup, &[3.0, 4.0]).unwrap();
        assert_eq!(kernel.compilations(), 1);
        assert_eq!(kernel.plan(2).len(), 2);
    }
}
