//! The cooperative UI/event loop.
//!
//! The framework assumes one single-threaded event loop (the GUI thread in a
//! desktop deployment) plus one worker thread per running measurement and per
//! polling device. [`MainContext`] is that loop as an explicit object: a queue
//! of closures posted from any thread, plus registered periodic timers, both
//! drained by [`MainContext::tick`].
//!
//! Worker threads never touch UI state directly; they post a closure through a
//! [`ContextHandle`] and the loop executes it on the owning thread. Measurement
//! completion (the `post_run` phase) and the periodic display-refresh timer are
//! both delivered this way.
//!
//! Timer callbacks must return quickly: the loop is cooperative and a slow
//! callback stalls every other consumer of the context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

type Callback = Box<dyn FnOnce() + Send>;
type TimerCallback = Box<dyn FnMut() + Send>;

/// Identifies a periodic timer registered on a [`MainContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

enum ContextMsg {
    Run(Callback),
    AddTimer {
        id: TimerId,
        interval: Duration,
        callback: TimerCallback,
    },
    RemoveTimer(TimerId),
}

struct Timer {
    id: TimerId,
    interval: Duration,
    next_due: Instant,
    callback: TimerCallback,
}

// =============================================================================
// ContextHandle
// =============================================================================

/// Cheap, cloneable handle for posting work onto a [`MainContext`] from any
/// thread.
#[derive(Clone)]
pub struct ContextHandle {
    tx: mpsc::UnboundedSender<ContextMsg>,
    next_timer_id: Arc<AtomicU64>,
}

impl ContextHandle {
    /// Queue a closure for execution on the owning context.
    ///
    /// Posting to a dropped context is a silent no-op; the work is obsolete
    /// once the loop is gone.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(ContextMsg::Run(Box::new(f)));
    }

    /// Register a periodic timer; `callback` fires on the owning context
    /// every `interval` once the loop ticks past the due time.
    pub fn add_timer(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        let id = TimerId(self.next_timer_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(ContextMsg::AddTimer {
            id,
            interval,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a previously registered timer. Unknown ids are ignored.
    pub fn remove_timer(&self, id: TimerId) {
        let _ = self.tx.send(ContextMsg::RemoveTimer(id));
    }
}

// =============================================================================
// MainContext
// =============================================================================

/// The owning side of the event loop. Lives on exactly one thread; that
/// thread calls [`tick`](Self::tick) (a real GUI embeds this into its native
/// event loop, tests call [`pump_until`](Self::pump_until)).
pub struct MainContext {
    rx: mpsc::UnboundedReceiver<ContextMsg>,
    handle: ContextHandle,
    timers: Vec<Timer>,
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            handle: ContextHandle {
                tx,
                next_timer_id: Arc::new(AtomicU64::new(1)),
            },
            timers: Vec::new(),
        }
    }

    /// A handle for posting work from other threads.
    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Drain all queued closures and fire every due timer once.
    ///
    /// Returns the number of callbacks executed. Never blocks.
    pub fn tick(&mut self) -> usize {
        let mut ran = 0;

        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                ContextMsg::Run(cb) => {
                    cb();
                    ran += 1;
                }
                ContextMsg::AddTimer {
                    id,
                    interval,
                    callback,
                } => self.timers.push(Timer {
                    id,
                    interval,
                    next_due: Instant::now() + interval,
                    callback,
                }),
                ContextMsg::RemoveTimer(id) => self.timers.retain(|t| t.id != id),
            }
        }

        let now = Instant::now();
        for timer in &mut self.timers {
            if now >= timer.next_due {
                (timer.callback)();
                ran += 1;
                timer.next_due = now + timer.interval;
            }
        }

        ran
    }

    /// Tick repeatedly until `done` returns true or `timeout` elapses.
    ///
    /// Returns whether the predicate was satisfied. This is the test-harness
    /// stand-in for a real GUI event loop.
    pub fn pump_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick();
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Tick repeatedly for the given duration.
    pub fn pump_for(&mut self, duration: Duration) {
        self.pump_until(duration, || false);
    }
}

// =============================================================================
// Tests
// =============================================================================
