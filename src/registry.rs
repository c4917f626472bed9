//! Ordered, path-assigning collections of settings.
//!
//! Every component (the app itself, each hardware component, each
//! measurement) owns one [`SettingRegistry`]. The registry enforces name
//! uniqueness, assigns each child its hierarchical path
//! (`"<prefix>/<name>"`) at creation time, and keeps the global
//! [`PathRouter`](crate::router::PathRouter) in sync as settings come and go.
//!
//! Registries are shared as `Arc`s between the UI thread and worker threads,
//! so the collection itself is interior-mutable behind a `parking_lot`
//! read-write lock. Insertion order is preserved; the UI builds its widget
//! tree in the order settings were declared.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{AppResult, LabError};
use crate::range::{LinkedRange, RangeConfig};
use crate::router::PathRouter;
use crate::setting::{Setting, SettingBuilder};

struct RegistryInner {
    order: Vec<String>,
    map: HashMap<String, Arc<Setting>>,
}

/// Ordered mapping `name -> Setting` with a common path prefix.
pub struct SettingRegistry {
    prefix: String,
    inner: RwLock<RegistryInner>,
    router: Option<Arc<PathRouter>>,
}

impl SettingRegistry {
    /// A free-standing registry (no router), mostly useful in tests.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: RwLock::new(RegistryInner {
                order: Vec::new(),
                map: HashMap::new(),
            }),
            router: None,
        }
    }

    /// A registry whose settings are published to `router` as they are added.
    pub fn with_router(prefix: impl Into<String>, router: Arc<PathRouter>) -> Self {
        Self {
            router: Some(router),
            ..Self::new(prefix)
        }
    }

    /// The path prefix applied to every child (`"hw/laser"`, `"mm/sweep"`, ...).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the setting and add it to the registry.
    ///
    /// Assigns the path, publishes to the router (when present) and returns
    /// the shared handle. Fails on duplicate names within this registry or
    /// duplicate paths across the app.
    pub fn add(&self, builder: SettingBuilder) -> AppResult<Arc<Setting>> {
        let setting = Arc::new(builder.build()?);
        let name = setting.name().to_string();

        let mut inner = self.inner.write();
        if inner.map.contains_key(&name) {
            return Err(LabError::DuplicateSetting {
                prefix: self.prefix.clone(),
                name,
            });
        }

        setting.set_path(format!("{}/{}", self.prefix, name));
        if let Some(router) = &self.router {
            router.register(setting.clone())?;
        }

        inner.order.push(name.clone());
        inner.map.insert(name, setting.clone());
        Ok(setting)
    }

    /// Look up a setting by name.
    pub fn get(&self, name: &str) -> Option<Arc<Setting>> {
        self.inner.read().map.get(name).cloned()
    }

    /// Remove a setting: unpublish from the router, detach its listeners and
    /// clear its hardware mediation. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(setting) = inner.map.remove(name) else {
            return false;
        };
        inner.order.retain(|n| n != name);
        drop(inner);

        if let Some(router) = &self.router {
            router.unregister(&setting.path());
        }
        setting.detach();
        true
    }

    /// Child names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    /// Child settings in insertion order.
    pub fn settings(&self) -> Vec<Arc<Setting>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|n| inner.map.get(n).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// Create a linked min/max/step/num range hosted by this registry.
    ///
    /// The range's settings are named `<base>_min`, `<base>_max`,
    /// `<base>_step`, `<base>_num` (plus `<base>_center`/`<base>_span` when
    /// configured) and stay mutually consistent from then on.
    pub fn new_range(&self, base: &str, config: RangeConfig) -> AppResult<LinkedRange> {
        LinkedRange::new(self, base, config)
    }
}

impl std::fmt::Debug for SettingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingRegistry")
            .field("prefix", &self.prefix)
            .field("names", &self.names())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Dtype, Value};

    #[test]
    fn add_assigns_paths_in_order() {
        let reg = SettingRegistry::new("hw/laser");
        let power = reg
            .add(Setting::builder("power", Dtype::Float).initial(1.0))
            .unwrap();
        reg.add(Setting::builder("wavelength", Dtype::Float).initial(800.0))
            .unwrap();

        assert_eq!(power.path(), "hw/laser/power");
        assert_eq!(reg.names(), vec!["power", "wavelength"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let reg = SettingRegistry::new("app/main");
        reg.add(Setting::builder("x", Dtype::Int)).unwrap();
        let err = reg.add(Setting::builder("x", Dtype::Float)).unwrap_err();
        assert!(matches!(err, LabError::DuplicateSetting { .. }));
    }

    #[test]
    fn remove_detaches_listeners() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let reg = SettingRegistry::new("app/main");
        let s = reg
            .add(Setting::builder("x", Dtype::Int).initial(0))
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        s.add_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(reg.remove("x"));
        assert!(reg.get("x").is_none());
        assert!(!reg.remove("x"));

        // The handle still works but nobody is listening any more.
        s.set(5).unwrap();
        assert_eq!(s.value(), Value::Int(5));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn router_sees_added_and_removed_settings() {
        let router = Arc::new(PathRouter::new());
        let reg = SettingRegistry::with_router("hw/stage", router.clone());
        reg.add(Setting::builder("position", Dtype::Float)).unwrap();

        assert!(router.lookup("hw/stage/position").is_ok());
        reg.remove("position");
        assert!(router.lookup("hw/stage/position").is_err());
    }
}
