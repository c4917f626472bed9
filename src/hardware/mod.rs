//! Hardware components and their connect/disconnect lifecycle.
//!
//! A [`HardwareComponent`] is the driver-facing trait: user code implements
//! the `connect`/`disconnect` hooks and, optionally, a periodic
//! `threaded_update` poll. The framework wraps each component in a
//! [`DeviceManager`] that owns the component's setting registry (path prefix
//! `hw/<name>`), the observable `connected` setting, the operation map
//! consumed by the UI layer, and the background polling thread.
//!
//! # Lifecycle
//!
//! ```text
//! disconnected → connecting → connected → disconnecting → disconnected
//!                    ↓
//!                  failed
//! ```
//!
//! Connect and disconnect may be invoked arbitrarily many times per session.
//! A failing `connect()` hook reverts the `connected` setting to `false`,
//! emits [`ConnectionEvent::Failed`] and surfaces
//! [`LabError::ConnectionFailed`] to the caller. A failing `disconnect()`
//! hook is reported but never prevents the state from settling to
//! disconnected. A crashing poll hook is reported and retried after the next
//! sleep, never fatal to the application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{AppResult, LabError};
use crate::ops::OperationMap;
use crate::registry::SettingRegistry;
use crate::report::ErrorReporter;
use crate::router::PathRouter;
use crate::setting::Setting;
use crate::task::{spawn_worker, WorkerHandle};
use crate::value::Dtype;

pub mod mock;

/// Bound on waiting for a polling thread to stop during disconnect.
pub const DISCONNECT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity of the poll loop's interruptible sleep.
const POLL_STOP_CHECK: Duration = Duration::from_millis(50);

// =============================================================================
// HardwareComponent
// =============================================================================

/// Driver hooks for one hardware component.
///
/// All hooks run with the component locked, so a driver can keep plain
/// mutable state (serial handles, SDK sessions) in `self`.
pub trait HardwareComponent: Send {
    /// Component name; becomes the `hw/<name>` path segment.
    fn name(&self) -> &str;

    /// Create the component's settings. Called once when the component is
    /// added to the app, before any connection attempt.
    fn setup(&mut self, settings: &SettingRegistry) -> AppResult<()> {
        let _ = settings;
        Ok(())
    }

    /// Establish the hardware connection and attach setting mediation.
    fn connect(&mut self) -> anyhow::Result<()>;

    /// Release the hardware connection.
    fn disconnect(&mut self) -> anyhow::Result<()>;

    /// Whether [`threaded_update`](Self::threaded_update) should run on a
    /// background thread while connected.
    fn has_threaded_update(&self) -> bool {
        false
    }

    /// Periodic poll hook (e.g. refresh status settings from the device).
    fn threaded_update(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Sleep between poll iterations.
    fn update_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}

// =============================================================================
// Connection state machine
// =============================================================================

/// Lifecycle state of one hardware component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The `connect()` hook failed; a new attempt may be made.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

/// One-shot lifecycle notifications delivered to registered listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Succeeded,
    Failed,
    Disconnected,
}

struct Poller {
    handle: WorkerHandle,
    stop: Arc<AtomicBool>,
}

type EventListener = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

// =============================================================================
// DeviceManager
// =============================================================================

/// Connect/disconnect state machine plus optional polling thread for one
/// hardware component.
pub struct DeviceManager {
    name: String,
    settings: Arc<SettingRegistry>,
    connected: Arc<Setting>,
    component: Arc<Mutex<Box<dyn HardwareComponent>>>,
    state: Mutex<ConnectionState>,
    poller: Mutex<Option<Poller>>,
    operations: OperationMap,
    events: Mutex<Vec<EventListener>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl DeviceManager {
    /// Wrap a component: build its registry (`hw/<name>`), run `setup`, and
    /// wire the `connected` setting to the lifecycle machine.
    pub fn new(
        mut component: Box<dyn HardwareComponent>,
        router: Option<Arc<PathRouter>>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> AppResult<Arc<Self>> {
        let name = component.name().to_string();
        let prefix = format!("hw/{name}");
        let settings = Arc::new(match router {
            Some(router) => SettingRegistry::with_router(prefix, router),
            None => SettingRegistry::new(prefix),
        });

        component.setup(&settings)?;

        let connected = settings.add(
            Setting::builder("connected", Dtype::Bool)
                .description("Connect to / disconnect from the physical device"),
        )?;

        let manager = Arc::new(Self {
            name: name.clone(),
            settings,
            connected: connected.clone(),
            component: Arc::new(Mutex::new(component)),
            state: Mutex::new(ConnectionState::Disconnected),
            poller: Mutex::new(None),
            operations: OperationMap::new(format!("hw/{name}")),
            events: Mutex::new(Vec::new()),
            reporter,
        });

        // Writes to the `connected` setting (UI, path router, settings file)
        // drive the same machine as direct set_connected() calls.
        let weak = Arc::downgrade(&manager);
        connected.add_listener(move |value| {
            if let Some(manager) = weak.upgrade() {
                manager.on_connected_written(value.as_bool().unwrap_or(false));
            }
        });

        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The component's setting registry.
    pub fn settings(&self) -> Arc<SettingRegistry> {
        self.settings.clone()
    }

    /// The observable `connected` setting.
    pub fn connected_setting(&self) -> Arc<Setting> {
        self.connected.clone()
    }

    /// Current lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// The component's operation map (`add_operation` / `remove_operation`).
    pub fn operations(&self) -> &OperationMap {
        &self.operations
    }

    /// Register a lifecycle-event listener.
    pub fn on_connection_event(&self, listener: impl Fn(ConnectionEvent) + Send + Sync + 'static) {
        self.events.lock().push(Box::new(listener));
    }

    /// Run a closure with exclusive access to the component, for operations
    /// and tests that need the concrete driver.
    pub fn with_component<R>(&self, f: impl FnOnce(&mut dyn HardwareComponent) -> R) -> R {
        f(self.component.lock().as_mut())
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Drive the connect/disconnect machine.
    ///
    /// Calling with the state already in effect is a no-op. Connect failures
    /// propagate; disconnect failures are reported but the state still
    /// settles to disconnected.
    pub fn set_connected(self: &Arc<Self>, want: bool) -> AppResult<()> {
        if want {
            self.do_connect()
        } else {
            self.do_disconnect()
        }
    }

    fn on_connected_written(self: &Arc<Self>, want: bool) {
        let state = self.connection_state();
        let already = match want {
            true => matches!(
                state,
                ConnectionState::Connected | ConnectionState::Connecting
            ),
            false => matches!(
                state,
                ConnectionState::Disconnected
                    | ConnectionState::Disconnecting
                    // A failed connect never reached the device; there is
                    // nothing to disconnect.
                    | ConnectionState::Failed
            ),
        };
        if already {
            return;
        }
        if let Err(err) = self.set_connected(want) {
            let context = format!("hardware:{}/connect", self.name);
            self.reporter.report(&context, &anyhow::Error::new(err));
        }
    }

    fn do_connect(self: &Arc<Self>) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                _ => *state = ConnectionState::Connecting,
            }
        }

        let result = self.component.lock().connect();
        match result {
            Ok(()) => {
                *self.state.lock() = ConnectionState::Connected;
                self.sync_connected_setting(true);
                self.start_polling();
                tracing::info!(component = %self.name, "connected");
                self.emit(ConnectionEvent::Succeeded);
                Ok(())
            }
            Err(cause) => {
                *self.state.lock() = ConnectionState::Failed;
                self.sync_connected_setting(false);
                self.emit(ConnectionEvent::Failed);
                Err(LabError::ConnectionFailed {
                    component: self.name.clone(),
                    phase: "connect",
                    cause,
                })
            }
        }
    }

    fn do_disconnect(self: &Arc<Self>) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Disconnected
                | ConnectionState::Disconnecting
                | ConnectionState::Failed => return Ok(()),
                _ => *state = ConnectionState::Disconnecting,
            }
        }

        if let Some(poller) = self.poller.lock().take() {
            poller.stop.store(true, Ordering::SeqCst);
            // A joined=false here means the poll hook is stuck in a driver
            // call; the thread is leaked and logged, disconnection proceeds.
            poller.handle.join_timeout(DISCONNECT_JOIN_TIMEOUT);
        }

        let result = self.component.lock().disconnect();
        *self.state.lock() = ConnectionState::Disconnected;
        self.sync_connected_setting(false);
        tracing::info!(component = %self.name, "disconnected");
        self.emit(ConnectionEvent::Disconnected);

        if let Err(cause) = result {
            let err = LabError::ConnectionFailed {
                component: self.name.clone(),
                phase: "disconnect",
                cause,
            };
            let context = format!("hardware:{}/disconnect", self.name);
            self.reporter.report(&context, &anyhow::Error::new(err));
        }
        Ok(())
    }

    /// Mirror the machine's state into the observable setting. The listener
    /// recognizes the state as already in effect and does not re-enter.
    fn sync_connected_setting(&self, value: bool) {
        if let Err(err) = self.connected.force(value) {
            tracing::warn!(component = %self.name, error = %err, "connected setting out of sync");
        }
    }

    fn start_polling(self: &Arc<Self>) {
        if !self.component.lock().has_threaded_update() {
            return;
        }

        let mut slot = self.poller.lock();
        if slot.is_some() {
            // Reconnect without disconnect: the running poller stays.
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let interval = self.component.lock().update_interval();
        let component = self.component.clone();
        let reporter = self.reporter.clone();
        let name = self.name.clone();
        let stop_flag = stop.clone();

        let worker = spawn_worker(&format!("poll-{name}"), move || {
            tracing::debug!(component = %name, "poll thread started");
            while !stop_flag.load(Ordering::SeqCst) {
                if let Err(err) = component.lock().threaded_update() {
                    reporter.report(&format!("hardware:{name}/poll"), &err);
                }
                // Interruptible sleep so disconnect does not wait a full
                // interval.
                let deadline = Instant::now() + interval;
                while Instant::now() < deadline {
                    if stop_flag.load(Ordering::SeqCst) {
                        tracing::debug!(component = %name, "poll thread stopping");
                        return;
                    }
                    std::thread::sleep(POLL_STOP_CHECK);
                }
            }
            tracing::debug!(component = %name, "poll thread stopping");
        });

        match worker {
            Ok(handle) => *slot = Some(Poller { handle, stop }),
            Err(err) => {
                let context = format!("hardware:{}/poll", self.name);
                self.reporter.report(&context, &anyhow::Error::new(err));
            }
        }
    }

    /// Whether a polling thread is currently held. Exposed for tests.
    pub fn has_poller(&self) -> bool {
        self.poller.lock().is_some()
    }

    fn emit(&self, event: ConnectionEvent) {
        let events = self.events.lock();
        for listener in events.iter() {
            listener(event);
        }
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("name", &self.name)
            .field("state", &self.connection_state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockDevice;
    use super::*;
    use crate::report::CollectingReporter;
    use crate::value::Value;

    fn manager_with(
        device: MockDevice,
    ) -> (Arc<DeviceManager>, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::new());
        let manager = DeviceManager::new(Box::new(device), None, reporter.clone()).unwrap();
        (manager, reporter)
    }

    #[test]
    fn connect_disconnect_round_trip() {
        let (device, probe) = MockDevice::new("stage");
        let (manager, _reporter) = manager_with(device);

        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        manager.set_connected(true).unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.connected_setting().value(), Value::Bool(true));
        assert_eq!(probe.connects(), 1);

        manager.set_connected(false).unwrap();
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert_eq!(manager.connected_setting().value(), Value::Bool(false));
        assert_eq!(probe.disconnects(), 1);
    }

    #[test]
    fn repeated_connect_is_a_no_op() {
        let (device, probe) = MockDevice::new("stage");
        let (manager, _reporter) = manager_with(device);

        manager.set_connected(true).unwrap();
        manager.set_connected(true).unwrap();
        assert_eq!(probe.connects(), 1);

        // Disconnecting while never polled, twice, is equally idempotent.
        manager.set_connected(false).unwrap();
        manager.set_connected(false).unwrap();
        assert_eq!(probe.disconnects(), 1);
    }

    #[test]
    fn failing_connect_reverts_and_emits() {
        let (device, probe) = MockDevice::new("stage");
        probe.fail_next_connect();
        let (manager, _reporter) = manager_with(device);

        let events: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        manager.on_connection_event(move |event| e.lock().push(event));

        let err = manager.set_connected(true).unwrap_err();
        assert!(matches!(err, LabError::ConnectionFailed { .. }));
        assert_eq!(manager.connection_state(), ConnectionState::Failed);
        assert_eq!(manager.connected_setting().value(), Value::Bool(false));
        assert_eq!(events.lock().as_slice(), &[ConnectionEvent::Failed]);

        // A later attempt succeeds.
        manager.set_connected(true).unwrap();
        assert!(manager.is_connected());
    }

    #[test]
    fn connected_setting_drives_the_machine() {
        let (device, probe) = MockDevice::new("stage");
        let (manager, _reporter) = manager_with(device);

        manager.connected_setting().set(true).unwrap();
        assert!(manager.is_connected());
        assert_eq!(probe.connects(), 1);

        manager.connected_setting().set(false).unwrap();
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn polling_thread_runs_and_stops() {
        let (device, probe) = MockDevice::new("sensor");
        probe.enable_polling(Duration::from_millis(10));
        let (manager, _reporter) = manager_with(device);

        manager.set_connected(true).unwrap();
        assert!(manager.has_poller());

        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.polls() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(probe.polls() >= 3, "poll hook never ran");

        manager.set_connected(false).unwrap();
        assert!(!manager.has_poller());
    }

    #[test]
    fn double_connect_spawns_one_poller() {
        let (device, probe) = MockDevice::new("sensor");
        probe.enable_polling(Duration::from_millis(10));
        let (manager, _reporter) = manager_with(device);

        manager.set_connected(true).unwrap();
        manager.set_connected(true).unwrap();
        assert!(manager.has_poller());
        assert_eq!(probe.connects(), 1);
        manager.set_connected(false).unwrap();
    }

    #[test]
    fn poll_crash_is_reported_and_retried() {
        let (device, probe) = MockDevice::new("sensor");
        probe.enable_polling(Duration::from_millis(5));
        probe.fail_polls();
        let (manager, reporter) = manager_with(device);

        manager.set_connected(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while probe.polls() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.set_connected(false).unwrap();

        assert!(probe.polls() >= 2, "crashing poll hook was not retried");
        assert!(reporter.has_context("sensor/poll"));
    }

    #[test]
    fn failing_disconnect_still_settles() {
        let (device, probe) = MockDevice::new("stage");
        let (manager, reporter) = manager_with(device);

        manager.set_connected(true).unwrap();
        probe.fail_next_disconnect();
        manager.set_connected(false).unwrap();

        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(reporter.has_context("stage/disconnect"));
    }
}
