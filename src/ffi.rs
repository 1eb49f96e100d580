//! Raw FFI bindings to the C wrapper layer.
//!
//! These are low-level unsafe functions. Use the safe wrappers in [`crate::mpi`].

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_double, c_int};

// Type aliases matching the C header
pub type int32_t = i32;
pub type int64_t = i64;

unsafe extern "C" {
    // ============================================================
    // Initialization and Finalization
    // ============================================================

    pub fn ferrodiag_init_thread(required: c_int, provided: *mut c_int) -> c_int;
    pub fn ferrodiag_finalize() -> c_int;
    pub fn ferrodiag_get_version(version: *mut c_char, len: *mut int32_t) -> c_int;
    pub fn ferrodiag_get_processor_name(name: *mut c_char, len: *mut int32_t) -> c_int;

    // ============================================================
    // Communicator Operations
    // ============================================================

    pub fn ferrodiag_comm_world() -> int32_t;
    pub fn ferrodiag_comm_rank(comm: int32_t, rank: *mut int32_t) -> c_int;
    pub fn ferrodiag_comm_size(comm: int32_t, size: *mut int32_t) -> c_int;
    pub fn ferrodiag_comm_dup(comm: int32_t, newcomm: *mut int32_t) -> c_int;
    pub fn ferrodiag_comm_free(comm: int32_t) -> c_int;

    // ============================================================
    // Synchronization
    // ============================================================

    pub fn ferrodiag_barrier(comm: int32_t) -> c_int;

    // ============================================================
    // Blocking Collectives (f64)
    // ============================================================

    pub fn ferrodiag_bcast_f64(
        buf: *mut c_double,
        count: int64_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn ferrodiag_allreduce_f64(
        sendbuf: *const c_double,
        recvbuf: *mut c_double,
        count: int64_t,
        op: int32_t,
        comm: int32_t,
    ) -> c_int;

    // ============================================================
    // Error Reporting
    // ============================================================

    pub fn ferrodiag_error_string(code: c_int, buf: *mut c_char, len: *mut int32_t) -> c_int;
}
