//! Global path-string lookup across all registries.
//!
//! Persistence files, remote-control surfaces and cross-component measurement
//! code all address settings by a flat path string
//! `"<namespace>/<component>/<name>"` with `namespace` one of `app`, `hw`
//! (hardware) or `mm` (measurements). The [`PathRouter`] is the single index
//! behind that addressing: every registry publishes its settings here as they
//! are created and withdraws them on removal.
//!
//! The path grammar is load-bearing: external settings files store values
//! keyed by exactly these strings, so it is preserved bit-for-bit.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{AppResult, LabError};
use crate::setting::Setting;

/// The three path namespaces.
pub const NAMESPACES: [&str; 3] = ["app", "hw", "mm"];

/// Flat `path -> Setting` map spanning the whole application graph.
///
/// At most one setting owns a given path at any time.
#[derive(Default)]
pub struct PathRouter {
    routes: RwLock<HashMap<String, Arc<Setting>>>,
}

impl PathRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a path against the grammar without resolving it.
    pub fn parse_path(path: &str) -> AppResult<(&str, &str, &str)> {
        let mut parts = path.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(component), Some(name), None)
                if NAMESPACES.contains(&ns) && !component.is_empty() && !name.is_empty() =>
            {
                Ok((ns, component, name))
            }
            _ => Err(LabError::InvalidPath {
                path: path.to_string(),
            }),
        }
    }

    /// Publish a setting under its assigned path.
    pub(crate) fn register(&self, setting: Arc<Setting>) -> AppResult<()> {
        let path = setting.path();
        Self::parse_path(&path)?;

        let mut routes = self.routes.write();
        if routes.contains_key(&path) {
            return Err(LabError::DuplicatePath { path });
        }
        tracing::debug!(%path, "registered setting");
        routes.insert(path, setting);
        Ok(())
    }

    /// Withdraw a path. Unknown paths are ignored.
    pub(crate) fn unregister(&self, path: &str) {
        if self.routes.write().remove(path).is_some() {
            tracing::debug!(%path, "unregistered setting");
        }
    }

    /// Resolve a path to its setting.
    pub fn lookup(&self, path: &str) -> AppResult<Arc<Setting>> {
        Self::parse_path(path)?;
        self.routes
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LabError::UnknownPath {
                path: path.to_string(),
            })
    }

    /// All registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl std::fmt::Debug for PathRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathRouter")
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Dtype;

    fn registered(router: &PathRouter, path: &str) -> Arc<Setting> {
        let setting = Arc::new(
            Setting::builder(path.rsplit('/').next().unwrap_or(path), Dtype::Float)
                .build()
                .unwrap(),
        );
        setting.set_path(path.to_string());
        router.register(setting.clone()).unwrap();
        setting
    }

    #[test]
    fn grammar_is_enforced() {
        assert!(PathRouter::parse_path("hw/laser/power").is_ok());
        assert!(PathRouter::parse_path("app/main/save_dir").is_ok());
        assert!(PathRouter::parse_path("mm/sweep/progress").is_ok());

        for bad in [
            "laser/power",
            "gui/laser/power",
            "hw/laser",
            "hw/laser/power/extra",
            "hw//power",
            "",
        ] {
            assert!(
                matches!(
                    PathRouter::parse_path(bad),
                    Err(LabError::InvalidPath { .. })
                ),
                "expected rejection: {bad:?}"
            );
        }
    }

    #[test]
    fn one_owner_per_path() {
        let router = PathRouter::new();
        registered(&router, "hw/laser/power");

        let dup = Arc::new(Setting::builder("power", Dtype::Float).build().unwrap());
        dup.set_path("hw/laser/power".to_string());
        assert!(matches!(
            router.register(dup),
            Err(LabError::DuplicatePath { .. })
        ));
    }

    #[test]
    fn lookup_and_unregister() {
        let router = PathRouter::new();
        registered(&router, "mm/sweep/progress");

        assert!(router.lookup("mm/sweep/progress").is_ok());
        assert!(matches!(
            router.lookup("mm/sweep/missing"),
            Err(LabError::UnknownPath { .. })
        ));

        router.unregister("mm/sweep/progress");
        assert!(router.lookup("mm/sweep/progress").is_err());
        assert!(router.is_empty());
    }
}
