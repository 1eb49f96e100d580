//! Top-level fault capture.
//!
//! Whatever goes wrong inside the guarded region, an errored collective or a
//! panic, is written to the task's logger with its kind, message and origin
//! before the task moves on to its grace period and exit. The process never
//! dies with the failure unrecorded.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::Error;

thread_local! {
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Record where panics happen so the boundary can report it.
fn install_location_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info.location().map(ToString::to_string);
            PANIC_LOCATION.with(|slot| *slot.borrow_mut() = location);
            previous(info);
        }));
    });
}

/// A failure caught by the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Taxonomy entry, or `Panic`
    pub kind: &'static str,
    /// Human readable description including any source chain
    pub message: String,
    /// Originating source location, when known
    pub location: Option<String>,
}

impl Fault {
    fn from_error(err: &Error) -> Self {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Fault {
            kind: err.kind(),
            message,
            location: err.location().map(ToString::to_string),
        }
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Fault {
            kind: "Panic",
            message,
            location: PANIC_LOCATION.with(|slot| slot.borrow_mut().take()),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {location})")?;
        }
        Ok(())
    }
}

/// Runs a closure and turns any failure into a logged [`Fault`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultBoundary;

impl FaultBoundary {
    /// Boundary with the panic-location hook installed.
    pub fn new() -> Self {
        install_location_hook();
        FaultBoundary
    }

    /// Run `f`, logging any error or panic at ERROR level.
    pub fn guard<T, F>(&self, f: F) -> Result<T, Fault>
    where
        F: FnOnce() -> crate::Result<T>,
    {
        let fault = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => Fault::from_error(&err),
            Err(payload) => Fault::from_panic(payload.as_ref()),
        };
        error!(
            kind = fault.kind,
            location = fault.location.as_deref().unwrap_or("unknown"),
            "{}",
            fault.message
        );
        Err(fault)
    }

    /// Keep the process alive for `grace`, so external device queries still
    /// see this process bound to its devices.
    pub fn hold(&self, grace: Duration) {
        if !grace.is_zero() {
            debug!("holding for {grace:?} before exit");
            thread::sleep(grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_values_through() {
        assert_eq!(FaultBoundary::new().guard(|| Ok(7)), Ok(7));
    }

    #[test]
    fn captures_errors_with_location() {
        let fault = FaultBoundary::new()
            .guard::<(), _>(|| Err(Error::collective("barrier", "ring broken")))
            .unwrap_err();
        assert_eq!(fault.kind, "CollectiveFailure");
        assert!(fault.message.contains("ring broken"));
        assert!(fault.location.as_deref().unwrap().contains("boundary.rs"));
    }

    #[test]
    fn includes_source_chain() {
        let fault = FaultBoundary::new()
            .guard::<(), _>(|| {
                Err(Error::log_sink(
                    "logs/x.log",
                    std::io::Error::other("disk full"),
                ))
            })
            .unwrap_err();
        assert_eq!(fault.kind, "LogSink");
        assert!(fault.message.ends_with(": disk full"));
        assert!(fault.location.as_deref().unwrap().contains("boundary.rs"));
    }

    #[test]
    fn captures_panics() {
        let fault = FaultBoundary::new()
            .guard::<(), _>(|| panic!("rank {} lost", 3))
            .unwrap_err();
        assert_eq!(fault.kind, "Panic");
        assert_eq!(fault.message, "rank 3 lost");
        assert!(fault.location.as_deref().unwrap().contains("boundary.rs"));
        assert!(fault.to_string().starts_with("Panic: rank 3 lost (at "));
    }

    #[test]
    fn zero_grace_returns_immediately() {
        FaultBoundary::new().hold(Duration::ZERO);
    }
}
