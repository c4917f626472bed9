//! Linked sweep ranges: min/max/step/num kept mutually consistent.
//!
//! Acquisition loops describe a sweep with four coupled settings (`min`,
//! `max`, `step`, `num`, optionally `center` and `span`). Changing any one of
//! them recomputes the others through a fixed equation set:
//!
//! - `step = (max - min) / (num - 1)`, with `num == 1` treated as 2;
//! - `num  = round(|max - min| / step) + 1`, with `step` re-derived so the
//!   grid is exact; `step == 0` defaults `num` to 10;
//! - `span = max - min`, `center = min + span / 2`, and inversely `min`/`max`
//!   from `center`/`span`.
//!
//! A naive listener graph would loop forever (`min` triggers `center`, which
//! triggers `min`, ...). Instead a single incoming change computes the whole
//! batch of dependent updates and applies it while a guard suppresses the
//! re-entrant notifications. The guard is a `ReentrantMutex<Cell<bool>>`
//! rather than a plain boolean: the mutex serializes concurrent writers (a
//! polling thread and the UI touching the same range), while the flag
//! short-circuits the same-thread re-entry from our own batch.

use std::cell::Cell;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;

use crate::error::AppResult;
use crate::registry::SettingRegistry;
use crate::setting::Setting;
use crate::value::{Dtype, Value};

// =============================================================================
// Sweep orderings
// =============================================================================

/// Orderings for traversing a range's array in an acquisition loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepOrder {
    /// min → max.
    Up,
    /// max → min.
    Down,
    /// min → max → min, repeating the endpoints.
    UpDown,
    /// max → min → max, repeating the endpoints.
    DownUp,
    /// min → max → min without repeating the turning point.
    ZigZag,
    /// max → min → max without repeating the turning point.
    ZagZig,
}

impl SweepOrder {
    /// Every ordering, in the order offered to choice widgets.
    pub const ALL: [SweepOrder; 6] = [
        SweepOrder::Up,
        SweepOrder::Down,
        SweepOrder::UpDown,
        SweepOrder::DownUp,
        SweepOrder::ZigZag,
        SweepOrder::ZagZig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SweepOrder::Up => "up",
            SweepOrder::Down => "down",
            SweepOrder::UpDown => "up_down",
            SweepOrder::DownUp => "down_up",
            SweepOrder::ZigZag => "zig_zag",
            SweepOrder::ZagZig => "zag_zig",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|o| o.as_str() == name)
    }

    /// Build the ordered traversal from an ascending array.
    pub fn apply(&self, array: &[f64]) -> Vec<f64> {
        let rev = || array.iter().rev().copied();
        match self {
            SweepOrder::Up => array.to_vec(),
            SweepOrder::Down => rev().collect(),
            SweepOrder::UpDown => array.iter().copied().chain(rev()).collect(),
            SweepOrder::DownUp => rev().chain(array.iter().copied()).collect(),
            SweepOrder::ZigZag => {
                let back = array[..array.len().saturating_sub(1)].iter().rev();
                array.iter().chain(back).copied().collect()
            }
            SweepOrder::ZagZig => {
                let forward = array.iter().skip(1);
                array.iter().rev().chain(forward).copied().collect()
            }
        }
    }
}

// =============================================================================
// LinkedRange
// =============================================================================

/// Initial geometry for a [`LinkedRange`].
#[derive(Clone, Debug)]
pub struct RangeConfig {
    pub min: f64,
    pub max: f64,
    pub num: i64,
    /// Also create the derived `center`/`span` settings.
    pub center_span: bool,
    /// Unit applied to the min/max/step/center/span settings.
    pub unit: Option<String>,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 10.0,
            num: 11,
            center_span: false,
            unit: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RangeField {
    Min,
    Max,
    Step,
    Num,
    Center,
    Span,
}

struct RangeInner {
    min: Arc<Setting>,
    max: Arc<Setting>,
    step: Arc<Setting>,
    num: Arc<Setting>,
    center: Option<Arc<Setting>>,
    span: Option<Arc<Setting>>,
    /// Serializes batches across threads; the flag suppresses same-thread
    /// re-entry while a batch is being applied.
    guard: ReentrantMutex<Cell<bool>>,
}

/// Handle to a linked range hosted by a registry. Cloning is cheap.
#[derive(Clone)]
pub struct LinkedRange {
    inner: Arc<RangeInner>,
}

impl LinkedRange {
    pub(crate) fn new(
        registry: &SettingRegistry,
        base: &str,
        config: RangeConfig,
    ) -> AppResult<Self> {
        let num0 = config.num.max(2);
        let step0 = (config.max - config.min) / ((num0 - 1) as f64);

        let float = |name: String, initial: f64| {
            let mut builder = Setting::builder(name, Dtype::Float).initial(initial);
            if let Some(unit) = &config.unit {
                builder = builder.unit(unit.clone());
            }
            builder
        };

        let min = registry.add(float(format!("{base}_min"), config.min))?;
        let max = registry.add(float(format!("{base}_max"), config.max))?;
        let step = registry.add(float(format!("{base}_step"), step0))?;
        let num = registry.add(Setting::builder(format!("{base}_num"), Dtype::Int).initial(num0))?;

        let (center, span) = if config.center_span {
            let span0 = config.max - config.min;
            let center0 = config.min + span0 / 2.0;
            (
                Some(registry.add(float(format!("{base}_center"), center0))?),
                Some(registry.add(float(format!("{base}_span"), span0))?),
            )
        } else {
            (None, None)
        };

        let inner = Arc::new(RangeInner {
            min,
            max,
            step,
            num,
            center,
            span,
            guard: ReentrantMutex::new(Cell::new(false)),
        });

        let fields = [
            (RangeField::Min, Some(inner.min.clone())),
            (RangeField::Max, Some(inner.max.clone())),
            (RangeField::Step, Some(inner.step.clone())),
            (RangeField::Num, Some(inner.num.clone())),
            (RangeField::Center, inner.center.clone()),
            (RangeField::Span, inner.span.clone()),
        ];
        for (field, setting) in fields {
            let Some(setting) = setting else { continue };
            let weak: Weak<RangeInner> = Arc::downgrade(&inner);
            setting.add_listener(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_changed(field);
                }
            });
        }

        Ok(Self { inner })
    }

    pub fn min(&self) -> Arc<Setting> {
        self.inner.min.clone()
    }

    pub fn max(&self) -> Arc<Setting> {
        self.inner.max.clone()
    }

    pub fn step(&self) -> Arc<Setting> {
        self.inner.step.clone()
    }

    pub fn num(&self) -> Arc<Setting> {
        self.inner.num.clone()
    }

    pub fn center(&self) -> Option<Arc<Setting>> {
        self.inner.center.clone()
    }

    pub fn span(&self) -> Option<Arc<Setting>> {
        self.inner.span.clone()
    }

    /// The evenly spaced sequence from `min` to `max` with `num` points.
    pub fn array(&self) -> Vec<f64> {
        self.inner.array()
    }

    /// [`array`](Self::array) traversed in the given order.
    pub fn sweep_array(&self, order: SweepOrder) -> Vec<f64> {
        order.apply(&self.inner.array())
    }
}

impl std::fmt::Debug for LinkedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedRange")
            .field("min", &self.inner.min_val())
            .field("max", &self.inner.max_val())
            .field("step", &self.inner.step_val())
            .field("num", &self.inner.num_val())
            .finish()
    }
}

impl RangeInner {
    fn min_val(&self) -> f64 {
        self.min.value().as_f64().unwrap_or(0.0)
    }

    fn max_val(&self) -> f64 {
        self.max.value().as_f64().unwrap_or(0.0)
    }

    fn step_val(&self) -> f64 {
        self.step.value().as_f64().unwrap_or(0.0)
    }

    fn num_val(&self) -> i64 {
        self.num.value().as_i64().unwrap_or(0)
    }

    fn on_changed(&self, field: RangeField) {
        let guard = self.guard.lock();
        if guard.get() {
            // Re-entrant notification from the batch below.
            return;
        }
        guard.set(true);

        for (setting, value) in self.compute_updates(field) {
            if let Err(err) = setting.update_value(value, true, true) {
                tracing::warn!(
                    setting = %setting.name(),
                    error = %err,
                    "linked range update rejected"
                );
            }
        }

        guard.set(false);
    }

    /// The batch of dependent-field updates implied by a change to `field`.
    fn compute_updates(&self, field: RangeField) -> Vec<(Arc<Setting>, Value)> {
        let min = self.min_val();
        let max = self.max_val();
        let step = self.step_val();
        let num = self.num_val();

        let mut updates: Vec<(Arc<Setting>, Value)> = Vec::new();
        let push_step = |updates: &mut Vec<(Arc<Setting>, Value)>, lo: f64, hi: f64, n: i64| {
            updates.push((
                self.step.clone(),
                Value::Float((hi - lo) / ((n - 1) as f64)),
            ));
        };

        match field {
            RangeField::Min | RangeField::Max => {
                push_step(&mut updates, min, max, num.max(2));
                if let (Some(center), Some(span)) = (&self.center, &self.span) {
                    let new_span = max - min;
                    updates.push((span.clone(), Value::Float(new_span)));
                    updates.push((center.clone(), Value::Float(min + new_span / 2.0)));
                }
            }
            RangeField::Num => {
                let n = num.max(2);
                if n != num {
                    updates.push((self.num.clone(), Value::Int(n)));
                }
                push_step(&mut updates, min, max, n);
            }
            RangeField::Step => {
                let n = if step == 0.0 {
                    10
                } else {
                    (((max - min).abs() / step).round() as i64 + 1).max(2)
                };
                updates.push((self.num.clone(), Value::Int(n)));
                push_step(&mut updates, min, max, n);
            }
            RangeField::Center | RangeField::Span => {
                let (Some(center), Some(span)) = (&self.center, &self.span) else {
                    return updates;
                };
                let c = center.value().as_f64().unwrap_or(0.0);
                let s = span.value().as_f64().unwrap_or(0.0);
                let new_min = c - s / 2.0;
                let new_max = c + s / 2.0;
                updates.push((self.min.clone(), Value::Float(new_min)));
                updates.push((self.max.clone(), Value::Float(new_max)));
                push_step(&mut updates, new_min, new_max, num.max(2));
            }
        }

        updates
    }

    fn array(&self) -> Vec<f64> {
        let min = self.min_val();
        let num = self.num_val().max(1);
        if num == 1 {
            return vec![min];
        }
        let step = (self.max_val() - min) / ((num - 1) as f64);
        (0..num).map(|i| min + i as f64 * step).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
