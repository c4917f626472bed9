//! Observable, typed, constrained setting values.
//!
//! A [`Setting`] is the framework's value primitive: a named, dynamically
//! typed quantity that automatically synchronizes
//! - GUI widgets (via `tokio::sync::watch` subscriptions),
//! - hardware devices (via optional read/write mediation closures),
//! - dependent logic (via an ordered list of change listeners).
//!
//! Settings are created through a [`SettingRegistry`](crate::registry::SettingRegistry),
//! which assigns their hierarchical path and exposes them to the global
//! [`PathRouter`](crate::router::PathRouter).
//!
//! # Example
//!
//! ```rust,ignore
//! let exposure = registry.add(
//!     Setting::builder("exposure_ms", Dtype::Float)
//!         .initial(100.0)
//!         .range(1.0, 10_000.0)
//!         .unit("ms"),
//! )?;
//!
//! exposure.connect_to_hardware_write(move |val| camera.set_exposure(val));
//! exposure.set(250.0)?; // validates, writes to hardware, notifies listeners
//! ```
//!
//! # Locking
//!
//! Mutation is serialized by a per-setting `parking_lot::Mutex`, but the lock
//! is never held across a hardware-mediation call or a listener invocation:
//! the new value is copied out, the lock released, and then the side effects
//! run. A listener therefore observes the value as of notify time, and may
//! itself write the setting without deadlocking.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::{AppResult, LabError, MediationDirection};
use crate::value::{Dtype, Value};

/// Depth of the previous-values ring buffer.
const HISTORY_DEPTH: usize = 64;
/// Depth of the proposed-values ring buffer.
const PROPOSED_DEPTH: usize = 16;

type HardwareReadFn = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;
type HardwareWriteFn = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;
type ListenerFn = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies a registered change listener for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A previously stored value.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// A value suggested by an external source (e.g. a loaded settings file)
/// without being applied.
#[derive(Clone, Debug)]
pub struct ProposedValue {
    pub source: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    unit: Option<String>,
    description: Option<String>,
    vmin: Option<f64>,
    vmax: Option<f64>,
    /// Ordered `(label, value)` pairs; empty means unconstrained.
    choices: Vec<(String, Value)>,
    ro: bool,
    protected: bool,
    reader: Option<HardwareReadFn>,
    writer: Option<HardwareWriteFn>,
    history: VecDeque<HistoryEntry>,
    proposed: VecDeque<ProposedValue>,
    listeners: Vec<(ListenerId, ListenerFn)>,
    next_listener_id: u64,
}

// =============================================================================
// Setting
// =============================================================================

/// A single named, typed, constrained, observable value.
///
/// See the module docs for the synchronization model. Settings are always
/// handled as `Arc<Setting>`; every method takes `&self`.
pub struct Setting {
    name: String,
    dtype: Dtype,
    /// Current value; the watch channel doubles as the subscription fan-out.
    tx: watch::Sender<Value>,
    inner: Mutex<Inner>,
    /// Full path, assigned when the setting joins a registry.
    path: RwLock<String>,
}

impl Setting {
    /// Start building a setting of the given dtype.
    pub fn builder(name: impl Into<String>, dtype: Dtype) -> SettingBuilder {
        SettingBuilder::new(name, dtype)
    }

    /// The setting's name, unique within its registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immutable value kind.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// The registry-assigned path (`"<namespace>/<component>/<name>"`).
    /// Empty until the setting joins a registry.
    pub fn path(&self) -> String {
        self.path.read().clone()
    }

    pub(crate) fn set_path(&self, path: String) {
        *self.path.write() = path;
    }

    /// The current value.
    pub fn value(&self) -> Value {
        self.tx.borrow().clone()
    }

    /// Subscribe to value changes (for GUI widgets).
    ///
    /// Returns a watch receiver that observes every stored value. Multiple
    /// subscribers observe independently; a receiver that falls behind only
    /// ever sees the latest value.
    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Unit of measurement (e.g. `"ms"`, `"mW"`, `"nm"`).
    pub fn unit(&self) -> Option<String> {
        self.inner.lock().unit.clone()
    }

    /// Human-readable description, for GUI tooltips.
    pub fn description(&self) -> Option<String> {
        self.inner.lock().description.clone()
    }

    /// Whether external writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().ro
    }

    /// Whether bulk/file-driven writes are refused.
    pub fn is_protected(&self) -> bool {
        self.inner.lock().protected
    }

    /// The current choice constraint set (empty when unconstrained).
    pub fn choices(&self) -> Vec<(String, Value)> {
        self.inner.lock().choices.clone()
    }

    /// Numeric constraint bounds, when set.
    pub fn range(&self) -> (Option<f64>, Option<f64>) {
        let inner = self.inner.lock();
        (inner.vmin, inner.vmax)
    }

    // -------------------------------------------------------------------------
    // Value updates
    // -------------------------------------------------------------------------

    /// Set a new value: coerce, validate, store, write to hardware, notify.
    ///
    /// Shorthand for `update_value(value, true, true)`.
    pub fn set(&self, value: impl Into<Value>) -> AppResult<()> {
        self.update_value(value, true, true)
    }

    /// Set a new value with explicit control over side effects.
    ///
    /// The value is coerced to the setting's dtype and checked against the
    /// range and choice constraints. If the coerced value equals the current
    /// one (element-wise for arrays) the call returns without any side
    /// effect. Otherwise the previous value is recorded in the history ring,
    /// the new value is stored and then, outside the lock:
    ///
    /// - if `update_hardware` and a write function is attached, the function
    ///   is invoked; a failure propagates to the caller and the stored value
    ///   is **not** rolled back (the in-memory value and the device may now
    ///   diverge; this is reported, not silently repaired);
    /// - if `notify`, every listener runs synchronously on the calling
    ///   thread, in registration order.
    pub fn update_value(
        &self,
        value: impl Into<Value>,
        update_hardware: bool,
        notify: bool,
    ) -> AppResult<()> {
        self.apply(value.into(), update_hardware, notify, true)
    }

    /// Crate-internal write that bypasses the read-only check. Status
    /// settings (`run_state`, `progress`, `connected`) are read-only for
    /// external callers but updated by their owning component through here.
    pub(crate) fn force(&self, value: impl Into<Value>) -> AppResult<()> {
        self.apply(value.into(), false, true, false)
    }

    fn apply(
        &self,
        value: Value,
        update_hardware: bool,
        notify: bool,
        enforce_ro: bool,
    ) -> AppResult<()> {
        let coerced = value.coerce_to(self.dtype).ok_or_else(|| LabError::Coercion {
            name: self.name.clone(),
            value: value.clone(),
            dtype: self.dtype,
        })?;

        let mut inner = self.inner.lock();

        if enforce_ro && inner.ro {
            return Err(LabError::ReadOnly {
                name: self.name.clone(),
            });
        }

        Self::check_constraints(&self.name, &inner, &coerced)?;

        let previous = self.tx.borrow().clone();
        if previous == coerced {
            return Ok(());
        }

        push_bounded(
            &mut inner.history,
            HistoryEntry {
                value: previous,
                timestamp: Utc::now(),
            },
            HISTORY_DEPTH,
        );
        self.tx.send_replace(coerced.clone());

        let writer = if update_hardware {
            inner.writer.clone()
        } else {
            None
        };
        let listeners: Vec<ListenerFn> = if notify {
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        } else {
            Vec::new()
        };
        drop(inner);

        if let Some(writer) = writer {
            if let Err(cause) = writer(&coerced) {
                tracing::warn!(
                    setting = %self.name,
                    error = %cause,
                    "hardware write failed; in-memory value may diverge from device"
                );
                return Err(LabError::Mediation {
                    name: self.name.clone(),
                    direction: MediationDirection::Write,
                    cause,
                });
            }
        }

        for listener in listeners {
            listener(&coerced);
        }

        Ok(())
    }

    fn check_constraints(name: &str, inner: &Inner, value: &Value) -> AppResult<()> {
        if inner.vmin.is_some() || inner.vmax.is_some() {
            let min = inner.vmin.unwrap_or(f64::NEG_INFINITY);
            let max = inner.vmax.unwrap_or(f64::INFINITY);
            let out_of_range = |x: f64| x < min || x > max;
            let bad = match value {
                Value::Int(i) => out_of_range(*i as f64),
                Value::Float(f) => out_of_range(*f),
                Value::Array(v) => v.iter().any(|x| out_of_range(*x)),
                _ => false,
            };
            if bad {
                return Err(LabError::OutOfRange {
                    name: name.to_string(),
                    value: value.clone(),
                    min,
                    max,
                });
            }
        }

        if !inner.choices.is_empty() && !inner.choices.iter().any(|(_, v)| v == value) {
            return Err(LabError::InvalidChoice {
                name: name.to_string(),
                value: value.clone(),
            });
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Hardware mediation
    // -------------------------------------------------------------------------

    /// Attach a hardware read function (device → value).
    ///
    /// At most one read function is active; attaching again replaces it.
    pub fn connect_to_hardware_read(
        &self,
        reader: impl Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock();
        if inner.reader.is_some() {
            tracing::debug!(setting = %self.name, "replacing hardware read function");
        }
        inner.reader = Some(Arc::new(reader));
    }

    /// Attach a hardware write function (value → device).
    ///
    /// At most one write function is active; attaching again replaces it.
    pub fn connect_to_hardware_write(
        &self,
        writer: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock();
        if inner.writer.is_some() {
            tracing::debug!(setting = %self.name, "replacing hardware write function");
        }
        inner.writer = Some(Arc::new(writer));
    }

    /// Attach both mediation functions at once.
    pub fn connect_to_hardware(
        &self,
        reader: impl Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
        writer: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.connect_to_hardware_read(reader);
        self.connect_to_hardware_write(writer);
    }

    /// Whether a hardware read function is attached. The persistence layer
    /// uses these predicates to decide which settings to export.
    pub fn has_hardware_read(&self) -> bool {
        self.inner.lock().reader.is_some()
    }

    /// Whether a hardware write function is attached.
    pub fn has_hardware_write(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    /// Read the device and store the result (without writing back).
    ///
    /// Without a read function this is a no-op logged at warning level; the
    /// unchanged value is returned. A failing read function propagates.
    /// Hardware-sourced values bypass the read-only check: read-only settings
    /// are typically exactly the hardware-read status values.
    pub fn read_from_hardware(&self) -> AppResult<Value> {
        let reader = self.inner.lock().reader.clone();
        match reader {
            Some(reader) => {
                let raw = reader().map_err(|cause| LabError::Mediation {
                    name: self.name.clone(),
                    direction: MediationDirection::Read,
                    cause,
                })?;
                self.apply(raw, false, true, false)?;
                Ok(self.value())
            }
            None => {
                let err = LabError::NotMediated {
                    name: self.name.clone(),
                    direction: MediationDirection::Read,
                };
                tracing::warn!(setting = %self.name, "{err}");
                Ok(self.value())
            }
        }
    }

    /// Push the current value to the device again.
    ///
    /// Without a write function this is a no-op logged at warning level.
    pub fn write_to_hardware(&self) -> AppResult<()> {
        let writer = self.inner.lock().writer.clone();
        match writer {
            Some(writer) => {
                let current = self.value();
                writer(&current).map_err(|cause| LabError::Mediation {
                    name: self.name.clone(),
                    direction: MediationDirection::Write,
                    cause,
                })
            }
            None => {
                let err = LabError::NotMediated {
                    name: self.name.clone(),
                    direction: MediationDirection::Write,
                };
                tracing::warn!(setting = %self.name, "{err}");
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Choices
    // -------------------------------------------------------------------------

    /// Replace the choice constraint set.
    ///
    /// When the current value is no longer a member, it is replaced by
    /// `new_value` (which must be a member of the new set) or, if none is
    /// given, by the first new choice; listeners are notified exactly once.
    pub fn change_choice_list(
        &self,
        choices: Vec<(impl Into<String>, impl Into<Value>)>,
        new_value: Option<Value>,
    ) -> AppResult<()> {
        let mut converted = Vec::with_capacity(choices.len());
        for (label, value) in choices {
            let value = value.into();
            let coerced = value.coerce_to(self.dtype).ok_or_else(|| LabError::Coercion {
                name: self.name.clone(),
                value: value.clone(),
                dtype: self.dtype,
            })?;
            converted.push((label.into(), coerced));
        }

        let mut inner = self.inner.lock();
        inner.choices = converted;

        let current = self.tx.borrow().clone();
        let still_valid =
            inner.choices.is_empty() || inner.choices.iter().any(|(_, v)| *v == current);
        if still_valid {
            return Ok(());
        }

        let replacement = match new_value {
            Some(v) => {
                let coerced = v.coerce_to(self.dtype).ok_or_else(|| LabError::Coercion {
                    name: self.name.clone(),
                    value: v.clone(),
                    dtype: self.dtype,
                })?;
                if !inner.choices.iter().any(|(_, c)| *c == coerced) {
                    return Err(LabError::InvalidChoice {
                        name: self.name.clone(),
                        value: coerced,
                    });
                }
                coerced
            }
            None => match inner.choices.first() {
                Some((_, v)) => v.clone(),
                None => return Ok(()),
            },
        };

        push_bounded(
            &mut inner.history,
            HistoryEntry {
                value: current,
                timestamp: Utc::now(),
            },
            HISTORY_DEPTH,
        );
        self.tx.send_replace(replacement.clone());
        let listeners: Vec<ListenerFn> =
            inner.listeners.iter().map(|(_, l)| l.clone()).collect();
        drop(inner);

        for listener in listeners {
            listener(&replacement);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Proposed values
    // -------------------------------------------------------------------------

    /// Record a suggested value from an external source without applying it.
    ///
    /// Purely advisory; surfaced to operators by the UI layer.
    pub fn propose_value(&self, source: impl Into<String>, value: impl Into<Value>) {
        let mut inner = self.inner.lock();
        push_bounded(
            &mut inner.proposed,
            ProposedValue {
                source: source.into(),
                value: value.into(),
                timestamp: Utc::now(),
            },
            PROPOSED_DEPTH,
        );
    }

    /// The proposed-value ring, oldest first.
    pub fn proposed_values(&self) -> Vec<ProposedValue> {
        self.inner.lock().proposed.iter().cloned().collect()
    }

    /// The previous-values ring, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().history.iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a change listener, invoked synchronously after every stored
    /// change with the new value. Listeners run in registration order.
    pub fn add_listener(&self, listener: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Detach listeners and mediation; called when the setting leaves its
    /// registry.
    pub(crate) fn detach(&self) {
        let mut inner = self.inner.lock();
        inner.listeners.clear();
        inner.reader = None;
        inner.writer = None;
    }

    /// Metadata snapshot for collaborators (persistence, remote control).
    pub fn describe(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "name": self.name,
            "path": self.path(),
            "dtype": self.dtype.as_str(),
            "value": self.value(),
            "unit": inner.unit,
            "description": inner.description,
            "vmin": inner.vmin,
            "vmax": inner.vmax,
            "choices": inner.choices.iter().map(|(l, v)| {
                serde_json::json!({"label": l, "value": v})
            }).collect::<Vec<_>>(),
            "ro": inner.ro,
            "protected": inner.protected,
        })
    }
}

impl std::fmt::Debug for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Setting")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("path", &self.path())
            .field("value", &self.value())
            .finish()
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, entry: T, depth: usize) {
    if ring.len() == depth {
        ring.pop_front();
    }
    ring.push_back(entry);
}

// =============================================================================
// SettingBuilder
// =============================================================================

/// Fluent builder for [`Setting`], consumed by
/// [`SettingRegistry::add`](crate::registry::SettingRegistry::add).
pub struct SettingBuilder {
    name: String,
    dtype: Dtype,
    initial: Option<Value>,
    unit: Option<String>,
    description: Option<String>,
    vmin: Option<f64>,
    vmax: Option<f64>,
    choices: Vec<(String, Value)>,
    ro: bool,
    protected: bool,
}

impl SettingBuilder {
    pub fn new(name: impl Into<String>, dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            dtype,
            initial: None,
            unit: None,
            description: None,
            vmin: None,
            vmax: None,
            choices: Vec::new(),
            ro: false,
            protected: false,
        }
    }

    /// Initial value; defaults to the dtype's zero value.
    pub fn initial(mut self, value: impl Into<Value>) -> Self {
        self.initial = Some(value.into());
        self
    }

    /// Numeric range constraint, enforced as a hard constraint on writes.
    pub fn range(mut self, vmin: f64, vmax: f64) -> Self {
        self.vmin = Some(vmin);
        self.vmax = Some(vmax);
        self
    }

    /// Ordered `(label, value)` choice constraint.
    pub fn choices(
        mut self,
        choices: impl IntoIterator<Item = (impl Into<String>, impl Into<Value>)>,
    ) -> Self {
        self.choices = choices
            .into_iter()
            .map(|(l, v)| (l.into(), v.into()))
            .collect();
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Reject external writes.
    pub fn read_only(mut self) -> Self {
        self.ro = true;
        self
    }

    /// Refuse bulk/file-driven writes (the setting stays directly writable).
    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Validate and build. Registries call this; building directly is useful
    /// in tests for free-standing settings.
    pub fn build(self) -> AppResult<Setting> {
        let default_initial = match self.dtype {
            Dtype::Bool => Value::Bool(false),
            Dtype::Int => Value::Int(0),
            Dtype::Float => Value::Float(0.0),
            Dtype::Str => Value::Str(String::new()),
            Dtype::Array => Value::Array(Vec::new()),
        };
        let raw_initial = self.initial.unwrap_or(default_initial);
        let initial = raw_initial
            .coerce_to(self.dtype)
            .ok_or_else(|| LabError::Coercion {
                name: self.name.clone(),
                value: raw_initial,
                dtype: self.dtype,
            })?;

        let mut choices = Vec::with_capacity(self.choices.len());
        for (label, value) in self.choices {
            let coerced = value.coerce_to(self.dtype).ok_or_else(|| LabError::Coercion {
                name: self.name.clone(),
                value,
                dtype: self.dtype,
            })?;
            choices.push((label, coerced));
        }

        let inner = Inner {
            unit: self.unit,
            description: self.description,
            vmin: self.vmin,
            vmax: self.vmax,
            choices,
            ro: self.ro,
            protected: self.protected,
            reader: None,
            writer: None,
            history: VecDeque::new(),
            proposed: VecDeque::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
        };

        let setting = Setting {
            name: self.name,
            dtype: self.dtype,
            tx: watch::channel(initial.clone()).0,
            inner: Mutex::new(inner),
            path: RwLock::new(String::new()),
        };

        // The initial value must itself satisfy the constraints.
        {
            let inner = setting.inner.lock();
            Setting::check_constraints(&setting.name, &inner, &initial)?;
        }

        Ok(setting)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn float_setting(name: &str, initial: f64) -> Setting {
        Setting::builder(name, Dtype::Float)
            .initial(initial)
            .build()
            .unwrap()
    }

    #[test]
    fn update_stores_and_coerces() {
        let s = float_setting("exposure", 100.0);
        s.set(250).unwrap(); // int coerces to float
        assert_eq!(s.value(), Value::Float(250.0));

        s.set("300.5").unwrap();
        assert_eq!(s.value(), Value::Float(300.5));

        assert!(matches!(
            s.set("not a number"),
            Err(LabError::Coercion { .. })
        ));
        assert_eq!(s.value(), Value::Float(300.5)); // unchanged on failure
    }

    #[test]
    fn idempotent_update_has_no_side_effects() {
        let s = float_setting("exposure", 100.0);
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        s.add_listener(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        s.set(42.0).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(s.history().len(), 1);

        s.set(42.0).unwrap(); // same value: no notify, no history
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(s.history().len(), 1);
    }

    #[test]
    fn range_is_a_hard_constraint() {
        let s = Setting::builder("power", Dtype::Float)
            .initial(10.0)
            .range(0.0, 500.0)
            .build()
            .unwrap();

        assert!(matches!(s.set(-5.0), Err(LabError::OutOfRange { .. })));
        assert_eq!(s.value(), Value::Float(10.0));
        s.set(500.0).unwrap();
    }

    #[test]
    fn choices_constrain_membership() {
        let s = Setting::builder("mode", Dtype::Str)
            .initial("auto")
            .choices([("Automatic", "auto"), ("Manual", "manual")])
            .build()
            .unwrap();

        s.set("manual").unwrap();
        assert!(matches!(
            s.set("turbo"),
            Err(LabError::InvalidChoice { .. })
        ));
    }

    #[test]
    fn change_choice_list_coerces_invalid_current_and_notifies_once() {
        let s = Setting::builder("mode", Dtype::Str)
            .initial("auto")
            .choices([("Automatic", "auto"), ("Manual", "manual")])
            .build()
            .unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        s.add_listener(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        // Current value survives: no notification.
        s.change_choice_list(vec![("Automatic", "auto"), ("Fast", "fast")], None)
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        // Current value invalidated: falls to first choice, one notification.
        s.change_choice_list(vec![("Slow", "slow"), ("Fast", "fast")], None)
            .unwrap();
        assert_eq!(s.value(), Value::Str("slow".into()));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hardware_write_runs_outside_lock_and_propagates_failure() {
        let s = float_setting("position", 0.0);
        let device = Arc::new(Mutex::new(0.0f64));

        let d = device.clone();
        s.connect_to_hardware_write(move |v| {
            *d.lock() = v.as_f64().unwrap_or_default();
            Ok(())
        });

        s.set(5.0).unwrap();
        assert_eq!(*device.lock(), 5.0);

        s.connect_to_hardware_write(|_| anyhow::bail!("stage fault"));
        let err = s.set(7.0).unwrap_err();
        assert!(matches!(err, LabError::Mediation { .. }));
        // Not rolled back: memory and device now diverge, by design.
        assert_eq!(s.value(), Value::Float(7.0));
        assert_eq!(*device.lock(), 5.0);
    }

    #[test]
    fn read_from_hardware_updates_without_write_back() {
        let s = float_setting("temperature", 0.0);
        let writes = Arc::new(AtomicUsize::new(0));

        let w = writes.clone();
        s.connect_to_hardware(
            || Ok(Value::Float(42.0)),
            move |_| {
                w.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let value = s.read_from_hardware().unwrap();
        assert_eq!(value, Value::Float(42.0));
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn read_without_mediation_is_a_warned_no_op() {
        let s = float_setting("temperature", 21.5);
        let value = s.read_from_hardware().unwrap();
        assert_eq!(value, Value::Float(21.5));
    }

    #[test]
    fn listeners_can_be_removed() {
        let s = float_setting("x", 0.0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = s.add_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        s.set(1.0).unwrap();
        assert!(s.remove_listener(id));
        s.set(2.0).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!s.remove_listener(id));
    }

    #[test]
    fn listener_may_write_the_same_setting() {
        // The lock is released before notification, so re-entrant writes
        // from a listener must not deadlock.
        let s = Arc::new(
            Setting::builder("n", Dtype::Int)
                .initial(0)
                .build()
                .unwrap(),
        );
        let s2 = s.clone();
        s.add_listener(move |v| {
            if v.as_i64() == Some(1) {
                s2.set(2).unwrap();
            }
        });
        s.set(1).unwrap();
        assert_eq!(s.value(), Value::Int(2));
    }

    #[test]
    fn read_only_rejects_external_writes_but_not_internal() {
        let s = Setting::builder("progress", Dtype::Float)
            .initial(0.0)
            .read_only()
            .build()
            .unwrap();

        assert!(matches!(s.set(10.0), Err(LabError::ReadOnly { .. })));
        s.force(10.0).unwrap();
        assert_eq!(s.value(), Value::Float(10.0));
    }

    #[test]
    fn proposals_are_advisory_and_bounded() {
        let s = float_setting("x", 0.0);
        for i in 0..20 {
            s.propose_value("loaded_file", i as f64);
        }
        assert_eq!(s.value(), Value::Float(0.0));
        let proposed = s.proposed_values();
        assert_eq!(proposed.len(), 16);
        assert_eq!(proposed[0].value, Value::Float(4.0));
        assert_eq!(proposed[0].source, "loaded_file");
    }

    #[test]
    fn subscription_sees_updates() {
        let s = float_setting("x", 0.0);
        let mut rx = s.subscribe();
        assert_eq!(*rx.borrow(), Value::Float(0.0));

        s.set(3.5).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Value::Float(3.5));
    }

    #[test]
    fn history_records_previous_values() {
        let s = float_setting("x", 0.0);
        s.set(1.0).unwrap();
        s.set(2.0).unwrap();
        let history = s.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, Value::Float(0.0));
        assert_eq!(history[1].value, Value::Float(1.0));
    }
}
