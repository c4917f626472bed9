//! The central application hub.
//!
//! [`App`] wires the pieces together: it owns the cooperative
//! [`MainContext`], the global [`PathRouter`], its own setting registry
//! (path prefix `app/<name>`), and the ordered collections of hardware
//! components and measurements. Components are added once per session; the
//! app then serves as the single cross-component addressing surface via
//! [`get_lq`](App::get_lq) / [`read_setting`](App::read_setting) /
//! [`write_setting`](App::write_setting).
//!
//! The persistence layer (an external collaborator) talks to the app through
//! [`settings_snapshot`](App::settings_snapshot) and
//! [`load_settings`](App::load_settings), a flat `{path: value}` dictionary.
//! Values written through that channel pass the same coercion rules as any
//! other write, and `protected` settings silently refuse it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::{ContextHandle, MainContext};
use crate::error::{AppResult, LabError};
use crate::hardware::{DeviceManager, HardwareComponent};
use crate::measurement::{Measurement, MeasurementRunner};
use crate::registry::SettingRegistry;
use crate::report::{ErrorReporter, LogReporter};
use crate::router::PathRouter;
use crate::setting::Setting;
use crate::value::Value;

/// The main application: one per process, created at startup and dropped at
/// exit.
pub struct App {
    name: String,
    context: MainContext,
    router: Arc<PathRouter>,
    settings: Arc<SettingRegistry>,
    hardware: Mutex<Vec<Arc<DeviceManager>>>,
    measurements: Mutex<Vec<Arc<MeasurementRunner>>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl App {
    /// Create an app reporting background errors through `tracing`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_reporter(name, Arc::new(LogReporter))
    }

    /// Create an app with an injected error reporter (crash dialogs, error
    /// panels, test probes).
    pub fn with_reporter(name: impl Into<String>, reporter: Arc<dyn ErrorReporter>) -> Self {
        let name = name.into();
        let router = Arc::new(PathRouter::new());
        let settings = Arc::new(SettingRegistry::with_router(
            format!("app/{name}"),
            router.clone(),
        ));
        Self {
            name,
            context: MainContext::new(),
            router,
            settings,
            hardware: Mutex::new(Vec::new()),
            measurements: Mutex::new(Vec::new()),
            reporter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The app-level setting registry (`app/<name>/...`).
    pub fn settings(&self) -> Arc<SettingRegistry> {
        self.settings.clone()
    }

    /// The global path router.
    pub fn router(&self) -> Arc<PathRouter> {
        self.router.clone()
    }

    /// Handle for posting work onto the app's event loop from any thread.
    pub fn context_handle(&self) -> ContextHandle {
        self.context.handle()
    }

    /// The injected background-error reporter.
    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        self.reporter.clone()
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Run one iteration of the event loop (a real GUI embeds this into its
    /// native loop). Returns the number of callbacks executed.
    pub fn tick(&mut self) -> usize {
        self.context.tick()
    }

    /// Tick until `done` returns true or `timeout` elapses.
    pub fn pump_until(&mut self, timeout: Duration, done: impl FnMut() -> bool) -> bool {
        self.context.pump_until(timeout, done)
    }

    /// Tick for the given duration.
    pub fn pump_for(&mut self, duration: Duration) {
        self.context.pump_for(duration)
    }

    // -------------------------------------------------------------------------
    // Components
    // -------------------------------------------------------------------------

    /// Add a hardware component; its settings appear under `hw/<name>/...`.
    pub fn add_hardware(
        &self,
        component: Box<dyn HardwareComponent>,
    ) -> AppResult<Arc<DeviceManager>> {
        let name = component.name().to_string();
        let mut hardware = self.hardware.lock();
        if hardware.iter().any(|h| h.name() == name) {
            return Err(LabError::DuplicateComponent { name });
        }
        let manager =
            DeviceManager::new(component, Some(self.router.clone()), self.reporter.clone())?;
        hardware.push(manager.clone());
        tracing::info!(component = %name, "hardware added");
        Ok(manager)
    }

    /// Add a measurement; its settings appear under `mm/<name>/...`.
    pub fn add_measurement(
        &self,
        measurement: Box<dyn Measurement>,
    ) -> AppResult<Arc<MeasurementRunner>> {
        let name = measurement.name().to_string();
        let mut measurements = self.measurements.lock();
        if measurements.iter().any(|m| m.name() == name) {
            return Err(LabError::DuplicateComponent { name });
        }
        let runner = MeasurementRunner::new(
            measurement,
            Some(self.router.clone()),
            self.context.handle(),
            self.reporter.clone(),
        )?;
        measurements.push(runner.clone());
        tracing::info!(measurement = %name, "measurement added");
        Ok(runner)
    }

    /// Look up a hardware component by name.
    pub fn hardware(&self, name: &str) -> Option<Arc<DeviceManager>> {
        self.hardware.lock().iter().find(|h| h.name() == name).cloned()
    }

    /// Look up a measurement by name.
    pub fn measurement(&self, name: &str) -> Option<Arc<MeasurementRunner>> {
        self.measurements
            .lock()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Hardware component names, in the order added.
    pub fn hardware_names(&self) -> Vec<String> {
        self.hardware
            .lock()
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Measurement names, in the order added.
    pub fn measurement_names(&self) -> Vec<String> {
        self.measurements
            .lock()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Cross-component addressing
    // -------------------------------------------------------------------------

    /// Resolve a path (`"hw/laser/power"`) to its setting.
    pub fn get_lq(&self, path: &str) -> AppResult<Arc<Setting>> {
        self.router.lookup(path)
    }

    /// Read a setting's current value by path.
    pub fn read_setting(&self, path: &str) -> AppResult<Value> {
        Ok(self.get_lq(path)?.value())
    }

    /// Write a setting by path, with the usual coercion, constraint and
    /// hardware-mediation semantics of
    /// [`Setting::update_value`](crate::setting::Setting::update_value).
    pub fn write_setting(&self, path: &str, value: impl Into<Value>) -> AppResult<()> {
        self.get_lq(path)?.update_value(value, true, true)
    }

    // -------------------------------------------------------------------------
    // Persisted settings dictionary
    // -------------------------------------------------------------------------

    /// Export every registered setting as a flat sorted `{path: value}` map.
    pub fn settings_snapshot(&self) -> BTreeMap<String, Value> {
        self.router
            .paths()
            .into_iter()
            .filter_map(|path| {
                let value = self.router.lookup(&path).ok()?.value();
                Some((path, value))
            })
            .collect()
    }

    /// Bulk-apply a flat `{path: value}` map (e.g. a loaded settings file).
    ///
    /// `protected` settings silently refuse this channel; unknown paths and
    /// per-entry write failures are logged and skipped without aborting the
    /// batch. Returns the number of settings actually applied.
    pub fn load_settings(
        &self,
        entries: impl IntoIterator<Item = (String, Value)>,
    ) -> usize {
        let mut applied = 0;
        for (path, value) in entries {
            let setting = match self.router.lookup(&path) {
                Ok(setting) => setting,
                Err(err) => {
                    tracing::warn!(%path, error = %err, "skipping unknown setting");
                    continue;
                }
            };
            if setting.is_protected() {
                tracing::debug!(%path, "skipping protected setting");
                continue;
            }
            match setting.update_value(value, true, true) {
                Ok(()) => applied += 1,
                Err(err) => {
                    tracing::warn!(%path, error = %err, "failed to apply setting");
                }
            }
        }
        applied
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Orderly teardown: interrupt running measurements, wait (bounded) for
    /// them to finish, then disconnect all hardware.
    pub fn shutdown(&mut self) {
        tracing::info!(app = %self.name, "shutting down");

        let measurements: Vec<_> = self.measurements.lock().clone();
        for runner in &measurements {
            if runner.is_measuring() {
                runner.interrupt();
            }
        }
        let all_stopped = self.pump_until(Duration::from_secs(5), || {
            measurements.iter().all(|m| !m.is_measuring())
        });
        if !all_stopped {
            tracing::warn!("some measurements did not stop during shutdown");
        }

        let hardware: Vec<_> = self.hardware.lock().clone();
        for manager in &hardware {
            if let Err(err) = manager.set_connected(false) {
                let context = format!("hardware:{}/disconnect", manager.name());
                self.reporter.report(&context, &anyhow::Error::new(err));
            }
        }
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("hardware", &self.hardware_names())
            .field("measurements", &self.measurement_names())
            .field("paths", &self.router.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
