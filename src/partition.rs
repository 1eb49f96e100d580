//! Static partitioning of node-local accelerators between co-located tasks.
//!
//! Every task on a node sees the same visible-device list. Each one keeps the
//! contiguous block `[local_rank * k, (local_rank + 1) * k)` where
//! `k = devices / local_size`, and publishes it back to the environment so the
//! accelerator runtime only ever sees its own block.
//!
//! Accelerator runtimes latch visibility the first time they are touched, so
//! [`DevicePartitioner::publish`] must run before any transport or numerical
//! runtime is initialized. [`crate::Harness`] enforces this by constructing
//! the transport from the published assignment.

use std::env;

use tracing::info;

use crate::error::{Error, Result};
use crate::launch::LaunchEnv;
use crate::rank::RankContext;

/// Default variable carrying the visible device list.
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Devices granted to this task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAssignment {
    /// Everything visible to the node before partitioning
    pub visible: Vec<String>,
    /// Contiguous block owned by this task
    pub assigned: Vec<String>,
}

impl DeviceAssignment {
    /// True when no accelerators are visible at all.
    pub fn is_cpu_only(&self) -> bool {
        self.assigned.is_empty()
    }

    /// Placement label used when logging collective buffers.
    ///
    /// After publishing, the runtime renumbers the assigned block from zero,
    /// so the first local accelerator is always `gpu:0`.
    pub fn placement(&self) -> &'static str {
        if self.is_cpu_only() { "cpu:0" } else { "gpu:0" }
    }
}

/// Splits the visible device list between the tasks of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePartitioner {
    var: String,
}

impl Default for DevicePartitioner {
    fn default() -> Self {
        DevicePartitioner::new(CUDA_VISIBLE_DEVICES)
    }
}

impl DevicePartitioner {
    /// Partition the list carried by `var`.
    pub fn new(var: impl Into<String>) -> Self {
        DevicePartitioner { var: var.into() }
    }

    /// Name of the visibility variable.
    pub fn var(&self) -> &str {
        &self.var
    }

    /// Devices visible before partitioning; unset or blank means none.
    pub fn visible(&self, env: &LaunchEnv) -> Vec<String> {
        env.get(&self.var)
            .map(parse_device_list)
            .unwrap_or_default()
    }

    /// Compute this task's block of `devices`.
    ///
    /// An empty list yields an empty assignment (CPU-only and
    /// single-device environments are valid).
    pub fn partition(&self, devices: &[String], ctx: &RankContext) -> Result<DeviceAssignment> {
        if devices.is_empty() {
            return Ok(DeviceAssignment::default());
        }
        let devices_per_task = split_width(devices.len(), ctx.local_size)?;
        let start = ctx.local_rank * devices_per_task;
        Ok(DeviceAssignment {
            visible: devices.to_vec(),
            assigned: devices[start..start + devices_per_task].to_vec(),
        })
    }

    /// Write the assigned block back to the visibility variable.
    ///
    /// Does nothing when nothing was visible. Must run while the process is
    /// still single-threaded and before the accelerator runtime initializes.
    pub fn publish(&self, assignment: &DeviceAssignment) {
        if assignment.visible.is_empty() {
            return;
        }
        let value = assignment.assigned.join(",");
        // SAFETY: called during startup before the transport or any runtime
        // threads exist; nothing else reads or writes the environment here.
        unsafe { env::set_var(&self.var, &value) };
        info!("Setting {} to {:?}", self.var, assignment.assigned);
    }
}

#[track_caller]
fn split_width(devices: usize, local_size: usize) -> Result<usize> {
    if local_size == 0 || devices % local_size != 0 {
        return Err(Error::uneven_split(devices, local_size));
    }
    Ok(devices / local_size)
}

fn parse_device_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
