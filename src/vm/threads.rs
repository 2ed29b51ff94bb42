//! Thread support for the kestrel VM.
//!
//! This module provides:
//! - The process-wide exit signal observed by every running VM
//! - The per-thread "leaving" flag set while a context is being left
//! - Thread spawning for async closures, with join handles

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::value::{ErrorCode, Value};

/// Set-once request for all VMs sharing it to unwind and stop.
///
/// VMs use [`ExitSignal::global`] unless given their own signal.
#[derive(Debug, Clone, Default)]
pub struct ExitSignal(Arc<OnceLock<Value>>);

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide signal.
    pub fn global() -> ExitSignal {
        static GLOBAL: OnceLock<ExitSignal> = OnceLock::new();
        GLOBAL.get_or_init(ExitSignal::new).clone()
    }

    /// Request an exit with the given exit code. Only the first request counts.
    pub fn request(&self, code: Value) -> bool {
        let first = self.0.set(code).is_ok();
        if first {
            debug!("exit requested");
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.0.get().is_some()
    }

    pub fn code(&self) -> Option<Value> {
        self.0.get().cloned()
    }
}

thread_local! {
    static LEAVING: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is running a context's leave handler.
pub fn is_leaving() -> bool {
    LEAVING.with(Cell::get)
}

/// Sets the leaving flag for as long as it lives.
#[must_use]
pub struct LeavingGuard {
    previous: bool,
}

impl LeavingGuard {
    pub fn set() -> Self {
        let previous = LEAVING.with(|l| l.replace(true));
        Self { previous }
    }
}

impl Drop for LeavingGuard {
    fn drop(&mut self) {
        LEAVING.with(|l| l.set(self.previous));
    }
}

/// Thread ID counter for generating unique IDs.
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

fn next_thread_id() -> usize {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

/// A handle to a spawned thread.
#[derive(Debug)]
pub struct ThreadHandle {
    pub id: usize,
    pub name: String,
    handle: Option<JoinHandle<Value>>,
    /// Result of the first join, returned by every later join.
    result: Option<Value>,
}

impl ThreadHandle {
    /// Wait for the thread to complete and return its result.
    ///
    /// A panicking thread yields an `ErrorInternalError` exception.
    pub fn join(&mut self) -> Value {
        if let Some(result) = &self.result {
            return result.clone();
        }
        let result = match self.handle.take() {
            Some(h) => h.join().unwrap_or_else(|e| {
                warn!(thread = %self.name, "thread panicked");
                Value::exception(
                    ErrorCode::InternalError,
                    format!("Thread '{}' panicked: {:?}", self.name, e),
                )
            }),
            None => Value::null(),
        };
        self.result = Some(result.clone());
        result
    }

    pub fn is_joined(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Spawns OS threads that each run their own VM.
pub struct ThreadSpawner;

impl ThreadSpawner {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> std::io::Result<ThreadHandle>
    where
        F: FnOnce() -> Value + Send + 'static,
    {
        let id = next_thread_id();
        let name = name.into();
        let handle = thread::Builder::new()
            .name(format!("kestrel-{}-{}", name, id))
            .spawn(f)?;
        debug!(id, thread = %name, "spawned thread");
        Ok(ThreadHandle {
            id,
            name,
            handle: Some(handle),
            result: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_signal_is_set_once() {
        let signal = ExitSignal::new();
        assert!(!signal.is_requested());
        assert!(signal.request(Value::int(3)));
        assert!(!signal.request(Value::int(4)));
        assert_eq!(signal.code().unwrap().as_int(), Some(3));
        assert!(signal.clone().is_requested());
    }

    #[test]
    fn test_leaving_guard_nests() {
        assert!(!is_leaving());
        {
            let _outer = LeavingGuard::set();
            assert!(is_leaving());
            {
                let _inner = LeavingGuard::set();
                assert!(is_leaving());
            }
            assert!(is_leaving());
        }
        assert!(!is_leaving());
    }

    #[test]
    fn test_spawn_and_join() {
        let mut handle = ThreadSpawner::spawn("adder", || Value::int(40 + 2)).unwrap();
        assert_eq!(handle.join().as_int(), Some(42));
        assert!(handle.is_joined());
        assert_eq!(handle.join().as_int(), Some(42));
    }

    #[test]
    fn test_panicking_thread() {
        let mut handle = ThreadSpawner::spawn("boom", || panic!("boom")).unwrap();
        assert_eq!(handle.join().error_code(), Some(ErrorCode::InternalError));
    }
}
