//! Process-wide error reporting.
//!
//! Background threads (acquisition workers, device pollers) cannot propagate
//! errors to a caller, so every thread boundary in the framework routes its
//! failures through a single injected [`ErrorReporter`] instead. The owning
//! component still settles into a well-defined terminal state; the reporter
//! only makes sure the error is never silently lost.
//!
//! The default [`LogReporter`] forwards to `tracing`. Host applications that
//! want a crash dialog or an error panel inject their own implementation via
//! [`App::with_reporter`](crate::app::App::with_reporter).

use parking_lot::Mutex;

/// Sink for errors crossing a thread boundary.
pub trait ErrorReporter: Send + Sync {
    /// Report an error together with a short context string such as
    /// `"measurement:power_sweep/run"` or `"hardware:laser/poll"`.
    fn report(&self, context: &str, error: &anyhow::Error);
}

/// Default reporter: error-level `tracing` event.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, context: &str, error: &anyhow::Error) {
        tracing::error!(context, error = %error, "unhandled background error");
    }
}

/// Reporter that stores every report, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    entries: Mutex<Vec<(String, String)>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(context, message)` pairs reported so far.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries.lock().clone()
    }

    /// Whether any report's context contains the given substring.
    pub fn has_context(&self, fragment: &str) -> bool {
        self.entries.lock().iter().any(|(c, _)| c.contains(fragment))
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, context: &str, error: &anyhow::Error) {
        self.entries
            .lock()
            .push((context.to_string(), error.to_string()));
    }
}
