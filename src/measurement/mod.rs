//! Measurements: acquisition routines with a run-state machine.
//!
//! A [`Measurement`] is user-supplied acquisition code split into phases:
//! `pre_run` (called synchronously on the thread requesting the start),
//! `run` (executed on a dedicated worker thread) and `post_run` (delivered
//! back onto the owning [`MainContext`](crate::context::MainContext)); a
//! display-refresh callback supplied by `update_display` is driven by a
//! periodic timer on the same context while the run is live.
//!
//! The framework wraps each measurement in a [`MeasurementRunner`] owning the
//! setting registry (path prefix `mm/<name>`), the `activation`/`run_state`/
//! `progress` status settings, the cooperative interrupt flag and the worker
//! thread.
//!
//! # Run states
//!
//! ```text
//! stop_first → run_starting → run_prerun → run_thread_starting
//!            → run_thread_run → run_thread_end → run_post_run
//!            → stop_success | stop_interrupted | stop_failure
//! ```
//!
//! Interruption is cooperative: `interrupt()` raises a flag that `run()`
//! must poll at safe points via
//! [`RunContext::interrupt_requested`]; there is no preemptive cancellation.
//! Errors raised in any phase are classified into the terminal state and
//! routed through the injected
//! [`ErrorReporter`](crate::report::ErrorReporter); they never crash the
//! host process, and a panicking `run()` is caught and treated as a failure.
//!
//! Measurements may orchestrate other measurements:
//! [`MeasurementRunner::start_nested_and_wait`] starts a sub-measurement and
//! blocks the *calling worker thread* until it finishes, propagating
//! interrupts downward (and upward when requested).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::context::{ContextHandle, TimerId};
use crate::error::{AppResult, LabError};
use crate::ops::OperationMap;
use crate::registry::SettingRegistry;
use crate::report::ErrorReporter;
use crate::router::PathRouter;
use crate::setting::Setting;
use crate::task::{spawn_worker, WorkerHandle};
use crate::value::Dtype;

/// Cadence of the `update_display` timer.
pub const DEFAULT_DISPLAY_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on waiting for a nested measurement to actually start.
pub const NESTED_START_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// RunState
// =============================================================================

/// State of a measurement's run-state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Initial state, before the first run.
    StopFirst,
    RunStarting,
    RunPrerun,
    RunThreadStarting,
    RunThreadRun,
    RunThreadEnd,
    RunPostRun,
    StopSuccess,
    StopInterrupted,
    StopFailure,
}

impl RunState {
    /// Every state, in machine order.
    pub const ALL: [RunState; 10] = [
        RunState::StopFirst,
        RunState::RunStarting,
        RunState::RunPrerun,
        RunState::RunThreadStarting,
        RunState::RunThreadRun,
        RunState::RunThreadEnd,
        RunState::RunPostRun,
        RunState::StopSuccess,
        RunState::StopInterrupted,
        RunState::StopFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::StopFirst => "stop_first",
            RunState::RunStarting => "run_starting",
            RunState::RunPrerun => "run_prerun",
            RunState::RunThreadStarting => "run_thread_starting",
            RunState::RunThreadRun => "run_thread_run",
            RunState::RunThreadEnd => "run_thread_end",
            RunState::RunPostRun => "run_post_run",
            RunState::StopSuccess => "stop_success",
            RunState::StopInterrupted => "stop_interrupted",
            RunState::StopFailure => "stop_failure",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == name)
    }

    /// Whether the machine is somewhere between start and completion.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            RunState::RunStarting
                | RunState::RunPrerun
                | RunState::RunThreadStarting
                | RunState::RunThreadRun
                | RunState::RunThreadEnd
                | RunState::RunPostRun
        )
    }

    /// Whether this is one of the three terminal outcomes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::StopSuccess | RunState::StopInterrupted | RunState::StopFailure
        )
    }
}

// =============================================================================
// Measurement trait + RunContext
// =============================================================================

/// User-supplied acquisition code.
pub trait Measurement: Send {
    /// Measurement name; becomes the `mm/<name>` path segment.
    fn name(&self) -> &str;

    /// Create the measurement's settings. Called once when added to the app.
    fn setup(&mut self, settings: &SettingRegistry) -> AppResult<()> {
        let _ = settings;
        Ok(())
    }

    /// Runs synchronously on the thread requesting the start. A failure here
    /// aborts the run before the worker thread exists.
    fn pre_run(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// The acquisition body, executed on the worker thread. Must poll
    /// [`RunContext::interrupt_requested`] at safe points and return promptly
    /// when it is set.
    fn run(&mut self, ctx: &RunContext) -> anyhow::Result<()>;

    /// Runs on the owning context after the worker finishes, regardless of
    /// outcome. A failure here is reported but does not change the run's
    /// classification.
    fn post_run(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Build the periodic display-refresh callback for one run.
    ///
    /// Called once at start; the returned closure runs on the owning context
    /// at the display interval (100 ms by default) while the acquisition
    /// thread is live, and must return quickly. The worker owns the
    /// measurement for the whole of `run()`, so state shared with the
    /// refresher (ring buffers, the latest processed point) lives behind
    /// the implementer's own lock or channel.
    fn update_display(&mut self) -> Option<Box<dyn FnMut() + Send>> {
        None
    }
}

/// Capabilities handed to the measurement phases.
#[derive(Clone)]
pub struct RunContext {
    interrupt: Arc<AtomicBool>,
    progress: Arc<Setting>,
    runner: Weak<MeasurementRunner>,
}

impl RunContext {
    /// Whether cooperative interruption has been requested.
    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Update the `progress` setting (percent, clamped to `[0, 100]`).
    pub fn set_progress(&self, percent: f64) {
        if let Err(err) = self.progress.force(percent.clamp(0.0, 100.0)) {
            tracing::warn!(error = %err, "progress update rejected");
        }
    }

    /// The runner executing this measurement.
    pub fn runner(&self) -> Option<Arc<MeasurementRunner>> {
        self.runner.upgrade()
    }

    /// Start `other` and block until it finishes; see
    /// [`MeasurementRunner::start_nested_and_wait`].
    pub fn run_nested(&self, other: &Arc<MeasurementRunner>, propagate_interrupt: bool) -> bool {
        match self.runner() {
            Some(runner) => runner.start_nested_and_wait(other, propagate_interrupt),
            None => false,
        }
    }
}

// =============================================================================
// MeasurementRunner
// =============================================================================

type FinishedListener = Box<dyn Fn(RunState) + Send + Sync>;

/// Run-state machine plus acquisition thread for one measurement.
pub struct MeasurementRunner {
    name: String,
    settings: Arc<SettingRegistry>,
    activation: Arc<Setting>,
    run_state: Arc<Setting>,
    progress: Arc<Setting>,
    measurement: Arc<Mutex<Box<dyn Measurement>>>,
    interrupt: Arc<AtomicBool>,
    /// True from a successful start until finalize completes; gates
    /// `AlreadyRunning`.
    running: Arc<AtomicBool>,
    worker: Mutex<Option<WorkerHandle>>,
    ctx_handle: ContextHandle,
    display_interval: Mutex<Duration>,
    display_timer: Mutex<Option<TimerId>>,
    operations: OperationMap,
    finished: Mutex<Vec<FinishedListener>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl MeasurementRunner {
    /// Wrap a measurement: build its registry (`mm/<name>`), run `setup` and
    /// create the `activation`/`run_state`/`progress` status settings.
    pub fn new(
        mut measurement: Box<dyn Measurement>,
        router: Option<Arc<PathRouter>>,
        ctx_handle: ContextHandle,
        reporter: Arc<dyn ErrorReporter>,
    ) -> AppResult<Arc<Self>> {
        let name = measurement.name().to_string();
        let prefix = format!("mm/{name}");
        let settings = Arc::new(match router {
            Some(router) => SettingRegistry::with_router(prefix, router),
            None => SettingRegistry::new(prefix),
        });

        measurement.setup(&settings)?;

        let activation = settings.add(
            Setting::builder("activation", Dtype::Bool)
                .description("Start (true) or interrupt (false) the measurement"),
        )?;
        let run_state = settings.add(
            Setting::builder("run_state", Dtype::Str)
                .initial(RunState::StopFirst.as_str())
                .choices(RunState::ALL.map(|s| (s.as_str(), s.as_str())))
                .read_only(),
        )?;
        let progress = settings.add(
            Setting::builder("progress", Dtype::Float)
                .initial(0.0)
                .range(0.0, 100.0)
                .unit("%")
                .read_only(),
        )?;

        let runner = Arc::new(Self {
            name: name.clone(),
            settings,
            activation: activation.clone(),
            run_state,
            progress,
            measurement: Arc::new(Mutex::new(measurement)),
            interrupt: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            ctx_handle,
            display_interval: Mutex::new(DEFAULT_DISPLAY_INTERVAL),
            display_timer: Mutex::new(None),
            operations: OperationMap::new(format!("mm/{name}")),
            finished: Mutex::new(Vec::new()),
            reporter,
        });

        // Writes to `activation` (UI checkbox, settings file, another
        // measurement) drive the same machine as start()/interrupt().
        let weak = Arc::downgrade(&runner);
        activation.add_listener(move |value| {
            if let Some(runner) = weak.upgrade() {
                runner.on_activation_written(value.as_bool().unwrap_or(false));
            }
        });

        Ok(runner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The measurement's setting registry.
    pub fn settings(&self) -> Arc<SettingRegistry> {
        self.settings.clone()
    }

    pub fn activation_setting(&self) -> Arc<Setting> {
        self.activation.clone()
    }

    pub fn progress(&self) -> f64 {
        self.progress.value().as_f64().unwrap_or(0.0)
    }

    /// Current run state, parsed from the `run_state` setting.
    pub fn run_state(&self) -> RunState {
        self.run_state
            .value()
            .as_str()
            .and_then(RunState::from_name)
            .unwrap_or(RunState::StopFirst)
    }

    /// Whether a run is in flight (from start until post-run bookkeeping
    /// completes).
    pub fn is_measuring(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether cooperative interruption has been requested.
    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// The measurement's operation map.
    pub fn operations(&self) -> &OperationMap {
        &self.operations
    }

    /// Register a completion listener, invoked on the owning context with the
    /// terminal state after every run.
    pub fn on_finished(&self, listener: impl Fn(RunState) + Send + Sync + 'static) {
        self.finished.lock().push(Box::new(listener));
    }

    /// Change the `update_display` cadence for subsequent runs.
    pub fn set_display_interval(&self, interval: Duration) {
        *self.display_interval.lock() = interval;
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    fn set_run_state(&self, state: RunState) {
        tracing::debug!(measurement = %self.name, state = state.as_str(), "run state");
        if let Err(err) = self.run_state.force(state.as_str()) {
            tracing::warn!(measurement = %self.name, error = %err, "run_state out of sync");
        }
    }

    fn on_activation_written(self: &Arc<Self>, want: bool) {
        if want {
            if self.is_measuring() {
                return;
            }
            if let Err(err) = self.start() {
                let context = format!("measurement:{}/start", self.name);
                self.reporter.report(&context, &anyhow::Error::new(err));
            }
        } else if self.is_measuring() && self.run_state().is_running() {
            self.interrupt.store(true, Ordering::SeqCst);
        }
    }

    /// Start the measurement.
    ///
    /// Fails fast with [`LabError::AlreadyRunning`] while a run is in flight.
    /// Resets the interrupt flag, executes `pre_run` on the calling thread
    /// (a failure jumps the machine to `stop_failure` and propagates), then
    /// spawns the acquisition worker and the display-refresh timer.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LabError::AlreadyRunning {
                measurement: self.name.clone(),
            });
        }

        tracing::info!(measurement = %self.name, "starting");
        self.interrupt.store(false, Ordering::SeqCst);
        self.set_run_state(RunState::RunStarting);
        self.sync_activation(true);

        let ctx = self.run_context();

        self.set_run_state(RunState::RunPrerun);
        if let Err(cause) = self.measurement.lock().pre_run(&ctx) {
            self.set_run_state(RunState::StopFailure);
            self.sync_activation(false);
            self.running.store(false, Ordering::SeqCst);
            return Err(LabError::MeasurementFailure {
                measurement: self.name.clone(),
                phase: "pre_run",
                cause,
            });
        }

        self.set_run_state(RunState::RunThreadStarting);

        if let Some(mut refresh) = self.measurement.lock().update_display() {
            let interval = *self.display_interval.lock();
            let timer = self.ctx_handle.add_timer(interval, move || refresh());
            *self.display_timer.lock() = Some(timer);
        }

        let this = self.clone();
        match spawn_worker(&format!("measure-{}", self.name), move || {
            this.thread_main(ctx);
        }) {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(cause) => {
                if let Some(timer) = self.display_timer.lock().take() {
                    self.ctx_handle.remove_timer(timer);
                }
                self.set_run_state(RunState::StopFailure);
                self.sync_activation(false);
                self.running.store(false, Ordering::SeqCst);
                Err(LabError::MeasurementFailure {
                    measurement: self.name.clone(),
                    phase: "spawn",
                    cause: cause.into(),
                })
            }
        }
    }

    /// Request cooperative interruption of a running measurement.
    pub fn interrupt(&self) {
        tracing::debug!(measurement = %self.name, "interrupt requested");
        self.interrupt.store(true, Ordering::SeqCst);
        self.sync_activation(false);
    }

    fn run_context(self: &Arc<Self>) -> RunContext {
        RunContext {
            interrupt: self.interrupt.clone(),
            progress: self.progress.clone(),
            runner: Arc::downgrade(self),
        }
    }

    /// Mirror the machine into the `activation` setting without re-entering
    /// the machine (the listener recognizes the state as already in effect).
    fn sync_activation(&self, value: bool) {
        if let Err(err) = self.activation.force(value) {
            tracing::warn!(measurement = %self.name, error = %err, "activation out of sync");
        }
    }

    /// Acquisition thread body.
    fn thread_main(self: Arc<Self>, ctx: RunContext) {
        self.set_run_state(RunState::RunThreadRun);

        let measurement = self.measurement.clone();
        let result = catch_unwind(AssertUnwindSafe(|| measurement.lock().run(&ctx)));
        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => Some(anyhow!(
                "measurement panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        self.set_run_state(RunState::RunThreadEnd);
        if let Err(err) = self.progress.force(0.0) {
            tracing::warn!(measurement = %self.name, error = %err, "progress reset failed");
        }

        let this = self.clone();
        self.ctx_handle.post(move || this.finalize(error));
    }

    /// Post-run bookkeeping, delivered onto the owning context.
    fn finalize(self: &Arc<Self>, error: Option<anyhow::Error>) {
        if let Some(timer) = self.display_timer.lock().take() {
            self.ctx_handle.remove_timer(timer);
        }

        self.set_run_state(RunState::RunPostRun);
        let ctx = self.run_context();
        let post_result = self.measurement.lock().post_run(&ctx);

        // Classification reflects the acquisition itself; a post_run failure
        // is reported but never masks it.
        let terminal = if self.interrupt.load(Ordering::SeqCst) {
            RunState::StopInterrupted
        } else if error.is_some() {
            RunState::StopFailure
        } else {
            RunState::StopSuccess
        };

        if let Some(cause) = error {
            let context = format!("measurement:{}/run", self.name);
            self.reporter.report(&context, &cause);
        }
        if let Err(cause) = post_result {
            let context = format!("measurement:{}/post_run", self.name);
            self.reporter.report(&context, &cause);
        }

        self.set_run_state(terminal);
        self.sync_activation(false);

        if let Some(worker) = self.worker.lock().take() {
            // The worker posted this callback as its last act; the join is
            // immediate.
            worker.join();
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(measurement = %self.name, outcome = terminal.as_str(), "finished");

        let finished = self.finished.lock();
        for listener in finished.iter() {
            listener(terminal);
        }
    }

    // -------------------------------------------------------------------------
    // Nested measurements
    // -------------------------------------------------------------------------

    /// Start `other` and block the calling worker thread until it finishes.
    ///
    /// Polls every 50 ms; see
    /// [`start_nested_and_wait_with`](Self::start_nested_and_wait_with).
    pub fn start_nested_and_wait(
        self: &Arc<Self>,
        other: &Arc<MeasurementRunner>,
        propagate_interrupt: bool,
    ) -> bool {
        self.start_nested_and_wait_with(other, propagate_interrupt, Duration::from_millis(50), || {})
    }

    /// Start `other`, wait (bounded to 1 s) for it to actually enter a
    /// running state, then poll until it leaves it, calling `poll_fn` at
    /// `poll_interval` cadence.
    ///
    /// If this measurement is interrupted while waiting, `other` is
    /// interrupted too. With `propagate_interrupt`, an independent
    /// interruption of `other` also interrupts this measurement. Returns
    /// whether `other` finished with `stop_success`.
    pub fn start_nested_and_wait_with(
        self: &Arc<Self>,
        other: &Arc<MeasurementRunner>,
        propagate_interrupt: bool,
        poll_interval: Duration,
        mut poll_fn: impl FnMut(),
    ) -> bool {
        if let Err(err) = other.start() {
            let context = format!("measurement:{}/nested", self.name);
            self.reporter.report(&context, &anyhow::Error::new(err));
            return false;
        }

        let deadline = Instant::now() + NESTED_START_TIMEOUT;
        let mut entered = false;
        while Instant::now() < deadline {
            if other.run_state().is_running() || !other.is_measuring() {
                entered = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if !entered {
            tracing::warn!(
                measurement = %self.name,
                nested = %other.name,
                "nested measurement did not enter a running state in time"
            );
            return false;
        }

        while other.is_measuring() {
            poll_fn();
            if self.interrupt_requested() && !other.interrupt_requested() {
                other.interrupt();
            }
            if propagate_interrupt && other.interrupt_requested() && !self.interrupt_requested() {
                self.interrupt();
            }
            std::thread::sleep(poll_interval);
        }

        // The nested run may have been interrupted between two polls; its
        // flag persists until the next start, so propagation cannot be lost.
        if propagate_interrupt && other.interrupt_requested() && !self.interrupt_requested() {
            self.interrupt();
        }

        other.run_state() == RunState::StopSuccess
    }
}

impl std::fmt::Debug for MeasurementRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementRunner")
            .field("name", &self.name)
            .field("run_state", &self.run_state())
            .field("measuring", &self.is_measuring())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MainContext;
    use crate::report::CollectingReporter;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted measurement for exercising the state machine.
    struct ScriptedMeasurement {
        name: String,
        phases: Arc<Mutex<Vec<String>>>,
        fail_pre_run: bool,
        fail_run: bool,
        fail_post_run: bool,
        panic_run: bool,
        /// Number of 5 ms interruption-check iterations in run().
        run_loops: usize,
        display_ticks: Option<Arc<AtomicUsize>>,
    }

    impl ScriptedMeasurement {
        fn new(name: &str) -> (Self, Arc<Mutex<Vec<String>>>) {
            let phases = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    name: name.to_string(),
                    phases: phases.clone(),
                    fail_pre_run: false,
                    fail_run: false,
                    fail_post_run: false,
                    panic_run: false,
                    run_loops: 1,
                    display_ticks: None,
                },
                phases,
            )
        }
    }

    impl Measurement for ScriptedMeasurement {
        fn name(&self) -> &str {
            &self.name
        }

        fn pre_run(&mut self, _ctx: &RunContext) -> anyhow::Result<()> {
            self.phases.lock().push("pre_run".into());
            if self.fail_pre_run {
                anyhow::bail!("pre_run failed");
            }
            Ok(())
        }

        fn run(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
            self.phases.lock().push("run".into());
            if self.panic_run {
                panic!("boom");
            }
            if self.fail_run {
                anyhow::bail!("run failed");
            }
            for i in 0..self.run_loops {
                if ctx.interrupt_requested() {
                    return Ok(());
                }
                ctx.set_progress(100.0 * (i as f64) / (self.run_loops as f64));
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }

        fn post_run(&mut self, _ctx: &RunContext) -> anyhow::Result<()> {
            self.phases.lock().push("post_run".into());
            if self.fail_post_run {
                anyhow::bail!("post_run failed");
            }
            Ok(())
        }

        fn update_display(&mut self) -> Option<Box<dyn FnMut() + Send>> {
            let ticks = self.display_ticks.clone()?;
            Some(Box::new(move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn runner_with(
        measurement: ScriptedMeasurement,
        ctx: &MainContext,
    ) -> (Arc<MeasurementRunner>, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::new());
        let runner =
            MeasurementRunner::new(Box::new(measurement), None, ctx.handle(), reporter.clone())
                .unwrap();
        (runner, reporter)
    }

    fn pump_to_terminal(ctx: &mut MainContext, runner: &Arc<MeasurementRunner>) -> RunState {
        assert!(
            ctx.pump_until(Duration::from_secs(5), || {
                !runner.is_measuring() && runner.run_state().is_terminal()
            }),
            "measurement never reached a terminal state"
        );
        runner.run_state()
    }

    #[test]
    fn successful_run_walks_all_phases() {
        let mut ctx = MainContext::new();
        let (m, phases) = ScriptedMeasurement::new("demo");
        let (runner, reporter) = runner_with(m, &ctx);

        assert_eq!(runner.run_state(), RunState::StopFirst);
        runner.start().unwrap();
        let terminal = pump_to_terminal(&mut ctx, &runner);

        assert_eq!(terminal, RunState::StopSuccess);
        assert_eq!(phases.lock().as_slice(), &["pre_run", "run", "post_run"]);
        assert_eq!(runner.activation_setting().value().as_bool(), Some(false));
        assert_eq!(runner.progress(), 0.0);
        assert!(reporter.entries().is_empty());
    }

    #[test]
    fn pre_run_failure_jumps_to_stop_failure() {
        let mut ctx = MainContext::new();
        let (mut m, phases) = ScriptedMeasurement::new("demo");
        m.fail_pre_run = true;
        let (runner, _reporter) = runner_with(m, &ctx);

        let err = runner.start().unwrap_err();
        assert!(matches!(
            err,
            LabError::MeasurementFailure {
                phase: "pre_run",
                ..
            }
        ));
        assert_eq!(runner.run_state(), RunState::StopFailure);
        assert!(!runner.is_measuring());
        assert_eq!(phases.lock().as_slice(), &["pre_run"]);
        ctx.tick();
    }

    #[test]
    fn run_failure_is_classified_and_reported() {
        let mut ctx = MainContext::new();
        let (mut m, _phases) = ScriptedMeasurement::new("demo");
        m.fail_run = true;
        let (runner, reporter) = runner_with(m, &ctx);

        runner.start().unwrap();
        assert_eq!(pump_to_terminal(&mut ctx, &runner), RunState::StopFailure);
        assert!(reporter.has_context("demo/run"));
    }

    #[test]
    fn panicking_run_is_caught() {
        let mut ctx = MainContext::new();
        let (mut m, _phases) = ScriptedMeasurement::new("demo");
        m.panic_run = true;
        let (runner, reporter) = runner_with(m, &ctx);

        runner.start().unwrap();
        assert_eq!(pump_to_terminal(&mut ctx, &runner), RunState::StopFailure);
        let entries = reporter.entries();
        assert!(entries.iter().any(|(_, msg)| msg.contains("panicked")));

        // The runner is reusable after a panic.
        runner.start().unwrap();
    }

    #[test]
    fn interrupt_classifies_as_stop_interrupted() {
        let mut ctx = MainContext::new();
        let (mut m, _phases) = ScriptedMeasurement::new("demo");
        m.run_loops = 1000; // ~5 s unless interrupted
        let (runner, _reporter) = runner_with(m, &ctx);

        runner.start().unwrap();
        ctx.pump_for(Duration::from_millis(20));
        runner.interrupt();

        assert_eq!(
            pump_to_terminal(&mut ctx, &runner),
            RunState::StopInterrupted
        );
    }

    #[test]
    fn second_start_fails_fast() {
        let mut ctx = MainContext::new();
        let (mut m, _phases) = ScriptedMeasurement::new("demo");
        m.run_loops = 200;
        let (runner, _reporter) = runner_with(m, &ctx);

        runner.start().unwrap();
        assert!(matches!(
            runner.start(),
            Err(LabError::AlreadyRunning { .. })
        ));
        runner.interrupt();
        pump_to_terminal(&mut ctx, &runner);
    }

    #[test]
    fn post_run_failure_does_not_mask_success() {
        let mut ctx = MainContext::new();
        let (mut m, _phases) = ScriptedMeasurement::new("demo");
        m.fail_post_run = true;
        let (runner, reporter) = runner_with(m, &ctx);

        runner.start().unwrap();
        assert_eq!(pump_to_terminal(&mut ctx, &runner), RunState::StopSuccess);
        assert!(reporter.has_context("demo/post_run"));
    }

    #[test]
    fn activation_setting_starts_and_interrupts() {
        let mut ctx = MainContext::new();
        let (mut m, _phases) = ScriptedMeasurement::new("demo");
        m.run_loops = 1000;
        let (runner, _reporter) = runner_with(m, &ctx);

        runner.activation_setting().set(true).unwrap();
        assert!(runner.is_measuring());

        ctx.pump_for(Duration::from_millis(20));
        runner.activation_setting().set(false).unwrap();
        assert_eq!(
            pump_to_terminal(&mut ctx, &runner),
            RunState::StopInterrupted
        );
    }

    #[test]
    fn display_refresh_ticks_while_running() {
        let mut ctx = MainContext::new();
        let (mut m, _phases) = ScriptedMeasurement::new("demo");
        m.run_loops = 40; // ~200 ms
        let ticks = Arc::new(AtomicUsize::new(0));
        m.display_ticks = Some(ticks.clone());
        let (runner, _reporter) = runner_with(m, &ctx);
        runner.set_display_interval(Duration::from_millis(10));

        runner.start().unwrap();
        assert!(ctx.pump_until(Duration::from_secs(5), || {
            ticks.load(Ordering::SeqCst) >= 3
        }));

        let terminal = pump_to_terminal(&mut ctx, &runner);
        assert_eq!(terminal, RunState::StopSuccess);

        // The timer is removed with the run.
        let after = ticks.load(Ordering::SeqCst);
        ctx.pump_for(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn completion_listener_sees_the_terminal_state() {
        let mut ctx = MainContext::new();
        let (m, _phases) = ScriptedMeasurement::new("demo");
        let (runner, _reporter) = runner_with(m, &ctx);

        let outcome: Arc<Mutex<Option<RunState>>> = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        runner.on_finished(move |state| {
            *o.lock() = Some(state);
        });

        runner.start().unwrap();
        pump_to_terminal(&mut ctx, &runner);
        assert_eq!(*outcome.lock(), Some(RunState::StopSuccess));
    }
}
