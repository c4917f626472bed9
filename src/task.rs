//! Worker-thread spawning with bounded joins and completion delivery.
//!
//! Measurements and device pollers each own at most one OS thread. Rather
//! than subclassing threads per component, the framework uses a small
//! task abstraction: [`spawn_worker`] produces a named [`WorkerHandle`], and
//! [`spawn_with_completion`] additionally posts a completion callback back
//! onto the owning [`MainContext`](crate::context::MainContext) when the work
//! finishes.
//!
//! Joins are bounded: [`WorkerHandle::join_timeout`] polls for completion up
//! to a deadline and then gives up, logging the potential thread leak instead
//! of hanging the caller. Cancellation is cooperative throughout the
//! framework, so a well-behaved worker observes its stop flag long before the
//! deadline.

use std::time::{Duration, Instant};

use crate::context::ContextHandle;

/// Handle to a named worker thread.
pub struct WorkerHandle {
    name: String,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Spawn a named worker thread.
pub fn spawn_worker(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> std::io::Result<WorkerHandle> {
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)?;
    Ok(WorkerHandle {
        name: name.to_string(),
        thread: Some(thread),
    })
}

/// Spawn a worker and deliver its result back onto the owning context.
///
/// `work` runs on the new thread; `on_complete` is posted through `handle`
/// and therefore executes on the context's thread. This keeps UI-side
/// bookkeeping (state transitions, teardown) off the worker.
pub fn spawn_with_completion<T: Send + 'static>(
    name: &str,
    handle: &ContextHandle,
    work: impl FnOnce() -> T + Send + 'static,
    on_complete: impl FnOnce(T) + Send + 'static,
) -> std::io::Result<WorkerHandle> {
    let ctx = handle.clone();
    spawn_worker(name, move || {
        let out = work();
        ctx.post(move || on_complete(out));
    })
}

impl WorkerHandle {
    /// The thread name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has finished executing.
    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true)
    }

    /// Block until the worker finishes. A panicking worker is logged, not
    /// re-thrown; panic recovery happens inside the worker body.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Join with a deadline.
    ///
    /// Polls for completion and joins if the worker finishes in time.
    /// Otherwise the handle is dropped and the thread left running; this is a
    /// resource leak and is logged as such. Returns whether the join happened.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not stop in time; leaking thread"
                );
                self.thread = None;
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.join();
        true
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
