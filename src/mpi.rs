//! MPI transport (`mpi` feature).
//!
//! Thin safe layer over the C shim in `csrc/`. Control traffic (barriers,
//! broadcasts) uses `MPI_COMM_WORLD`; reductions run on a duplicated
//! communicator so they can never match against a control collective that
//! is still in flight.
//!
//! Needs a real job to exercise:
//! `cargo build --features mpi --examples && mpiexec -n 4 ./target/debug/examples/collectives_mpi`

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::{Error, Result};
use crate::ffi;
use crate::group::{ProcessGroup, ReduceOp};

/// Global flag tracking whether MPI has been initialized
static MPI_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// MPI thread support levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ThreadLevel {
    /// Only single-threaded execution
    Single = 0,
    /// Multi-threaded, but MPI calls only from main thread
    Funneled = 1,
    /// Multi-threaded, but MPI calls serialized by user
    Serialized = 2,
    /// Full multi-threaded support
    Multiple = 3,
}

/// Map a nonzero return code to a [`Error::CollectiveFailure`] carrying the
/// MPI library's own description.
#[track_caller]
fn check(operation: &'static str, code: i32) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    let mut buf = [0u8; 512];
    let mut len: i32 = 0;
    let ret = unsafe { ffi::ferrodiag_error_string(code, buf.as_mut_ptr().cast(), &mut len) };
    let message = if ret == 0 {
        let len = (len.max(0) as usize).min(buf.len());
        String::from_utf8_lossy(&buf[..len]).into_owned()
    } else {
        format!("MPI error (code {code})")
    };
    Err(Error::collective(operation, message))
}

/// MPI environment handle.
///
/// There can only be one instance at a time. When dropped, it finalizes MPI.
pub struct Mpi {
    /// Marker to make Mpi !Send and !Sync
    _marker: PhantomData<*const ()>,
}

impl Mpi {
    /// Initialize MPI with the specified thread support level.
    ///
    /// Must only be called after device visibility has been published.
    pub fn init_thread(required: ThreadLevel) -> Result<Self> {
        if MPI_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let mut provided: i32 = 0;
        let ret = unsafe { ffi::ferrodiag_init_thread(required as i32, &mut provided) };
        if ret != 0 {
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::MpiError(ret));
        }

        let provided = match provided {
            0 => ThreadLevel::Single,
            1 => ThreadLevel::Funneled,
            2 => ThreadLevel::Serialized,
            _ => ThreadLevel::Multiple,
        };
        if provided < required {
            warn!(?required, ?provided, "MPI provides less thread support than requested");
        }
        Ok(Mpi {
            _marker: PhantomData,
        })
    }

    /// MPI library version string.
    pub fn version() -> Result<String> {
        let mut buf = [0u8; 256];
        let mut len: i32 = 0;
        let ret = unsafe { ffi::ferrodiag_get_version(buf.as_mut_ptr().cast(), &mut len) };
        if ret != 0 {
            return Err(Error::MpiError(ret));
        }
        let len = (len.max(0) as usize).min(buf.len());
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    /// Name of the node this process runs on.
    pub fn processor_name() -> Result<String> {
        let mut buf = [0u8; 256];
        let mut len: i32 = 0;
        let ret = unsafe { ffi::ferrodiag_get_processor_name(buf.as_mut_ptr().cast(), &mut len) };
        if ret != 0 {
            return Err(Error::MpiError(ret));
        }
        let len = (len.max(0) as usize).min(buf.len());
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }
}

impl Drop for Mpi {
    fn drop(&mut self) {
        if MPI_INITIALIZED.load(Ordering::SeqCst) {
            unsafe {
                ffi::ferrodiag_finalize();
            }
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
        }
    }
}

/// An MPI communicator.
pub struct Communicator {
    handle: i32,
    /// Marker to prevent Send/Sync (MPI communicators are not thread-safe)
    _marker: PhantomData<*mut ()>,
}

impl Communicator {
    fn world() -> Self {
        Communicator {
            handle: unsafe { ffi::ferrodiag_comm_world() },
            _marker: PhantomData,
        }
    }

    /// Rank of the calling process in this communicator.
    pub fn rank(&self) -> i32 {
        let mut rank: i32 = 0;
        unsafe { ffi::ferrodiag_comm_rank(self.handle, &mut rank) };
        rank
    }

    /// Number of processes in this communicator.
    pub fn size(&self) -> i32 {
        let mut size: i32 = 0;
        unsafe { ffi::ferrodiag_comm_size(self.handle, &mut size) };
        size
    }

    /// Duplicate this communicator.
    pub fn duplicate(&self) -> Result<Self> {
        let mut new_handle: i32 = 0;
        let ret = unsafe { ffi::ferrodiag_comm_dup(self.handle, &mut new_handle) };
        check("comm-dup", ret)?;
        Ok(Communicator {
            handle: new_handle,
            _marker: PhantomData,
        })
    }

    /// Barrier synchronization.
    pub fn barrier(&self) -> Result<()> {
        let ret = unsafe { ffi::ferrodiag_barrier(self.handle) };
        check("barrier", ret)
    }

    /// Broadcast a slice of f64 values from root to all processes.
    pub fn broadcast_f64(&self, data: &mut [f64], root: i32) -> Result<()> {
        let ret = unsafe {
            ffi::ferrodiag_bcast_f64(data.as_mut_ptr(), data.len() as i64, root, self.handle)
        };
        check("broadcast", ret)
    }

    /// All-reduce f64 values (reduce and broadcast result to all).
    pub fn allreduce_f64(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<()> {
        if send.len() != recv.len() {
            return Err(Error::collective(
                "all-reduce",
                format!("send has {} elements, recv has {}", send.len(), recv.len()),
            ));
        }
        let ret = unsafe {
            ffi::ferrodiag_allreduce_f64(
                send.as_ptr(),
                recv.as_mut_ptr(),
                send.len() as i64,
                op as i32,
                self.handle,
            )
        };
        check("all-reduce", ret)
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        // Don't free COMM_WORLD (handle 0)
        if self.handle != 0 {
            unsafe { ffi::ferrodiag_comm_free(self.handle) };
        }
    }
}

/// [`ProcessGroup`] over `MPI_COMM_WORLD`.
pub struct MpiGroup {
    // Field order is drop order: communicators are freed before finalize.
    world: Communicator,
    reduce: Communicator,
    rank: usize,
    size: usize,
    _mpi: Mpi,
}

impl MpiGroup {
    /// Initialize MPI and set up the control and reduction communicators.
    pub fn connect() -> Result<Self> {
        let mpi = Mpi::init_thread(ThreadLevel::Funneled)?;
        let world = Communicator::world();
        let reduce = world.duplicate()?;
        let (rank, size) = (world.rank() as usize, world.size() as usize);
        Ok(MpiGroup {
            world,
            reduce,
            rank,
            size,
            _mpi: mpi,
        })
    }
}

impl ProcessGroup for MpiGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        self.world.barrier()
    }

    fn broadcast(&self, data: &mut [f64], root: usize) -> Result<()> {
        self.world.broadcast_f64(data, root as i32)
    }

    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<()> {
        self.reduce.allreduce_f64(send, recv, op)
    }
}
