//! Mock hardware for tests and hardware-free development.
//!
//! [`MockDevice`] is a simulated instrument with a temperature register:
//! `temperature` is a read-mediated status setting, `setpoint` a
//! write-mediated control setting. The paired [`MockProbe`] stays with the
//! test after the device is boxed into a
//! [`DeviceManager`](crate::hardware::DeviceManager) and exposes call counts
//! and failure injection.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;

use crate::error::AppResult;
use crate::hardware::HardwareComponent;
use crate::registry::SettingRegistry;
use crate::setting::Setting;
use crate::value::{Dtype, Value};

struct MockShared {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    polls: AtomicUsize,
    fail_next_connect: AtomicBool,
    fail_next_disconnect: AtomicBool,
    fail_polls: AtomicBool,
    polling: AtomicBool,
    interval_ms: AtomicU64,
    temperature: Mutex<f64>,
}

/// Simulated hardware component.
pub struct MockDevice {
    name: String,
    shared: Arc<MockShared>,
}

/// Test-side handle into a [`MockDevice`]'s internals.
#[derive(Clone)]
pub struct MockProbe {
    shared: Arc<MockShared>,
}

impl MockDevice {
    /// Create a device and its probe.
    pub fn new(name: impl Into<String>) -> (Self, MockProbe) {
        let shared = Arc::new(MockShared {
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            fail_next_connect: AtomicBool::new(false),
            fail_next_disconnect: AtomicBool::new(false),
            fail_polls: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            interval_ms: AtomicU64::new(1000),
            temperature: Mutex::new(42.0),
        });
        (
            Self {
                name: name.into(),
                shared: shared.clone(),
            },
            MockProbe { shared },
        )
    }
}

impl MockProbe {
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.shared.polls.load(Ordering::SeqCst)
    }

    /// Make the next `connect()` call fail once.
    pub fn fail_next_connect(&self) {
        self.shared.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Make the next `disconnect()` call fail once.
    pub fn fail_next_disconnect(&self) {
        self.shared
            .fail_next_disconnect
            .store(true, Ordering::SeqCst);
    }

    /// Make every poll iteration fail.
    pub fn fail_polls(&self) {
        self.shared.fail_polls.store(true, Ordering::SeqCst);
    }

    /// Enable the background poll hook at the given interval.
    pub fn enable_polling(&self, interval: Duration) {
        self.shared
            .interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
        self.shared.polling.store(true, Ordering::SeqCst);
    }

    /// Set the simulated temperature register.
    pub fn set_temperature(&self, value: f64) {
        *self.shared.temperature.lock() = value;
    }

    pub fn temperature(&self) -> f64 {
        *self.shared.temperature.lock()
    }
}

impl HardwareComponent for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, settings: &SettingRegistry) -> AppResult<()> {
        let temperature = settings.add(
            Setting::builder("temperature", Dtype::Float)
                .initial(0.0)
                .unit("C")
                .read_only(),
        )?;
        let shared = self.shared.clone();
        temperature.connect_to_hardware_read(move || Ok(Value::Float(*shared.temperature.lock())));

        let setpoint = settings.add(
            Setting::builder("setpoint", Dtype::Float)
                .initial(20.0)
                .range(0.0, 100.0)
                .unit("C"),
        )?;
        let shared = self.shared.clone();
        setpoint.connect_to_hardware_write(move |value| {
            *shared.temperature.lock() = value.as_f64().unwrap_or_default();
            Ok(())
        });

        Ok(())
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        if self.shared.fail_next_connect.swap(false, Ordering::SeqCst) {
            bail!("simulated connect failure");
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.shared.fail_next_disconnect.swap(false, Ordering::SeqCst) {
            bail!("simulated disconnect failure");
        }
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn has_threaded_update(&self) -> bool {
        self.shared.polling.load(Ordering::SeqCst)
    }

    fn threaded_update(&mut self) -> anyhow::Result<()> {
        self.shared.polls.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_polls.load(Ordering::SeqCst) {
            bail!("simulated poll fault");
        }
        Ok(())
    }

    fn update_interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::SeqCst))
    }
}
