//! Named zero-argument operations exposed by devices and measurements.
//!
//! The UI layer builds its buttons and menus from these maps; the core only
//! guarantees name uniqueness and ordered listing.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AppResult, LabError};

type OperationFn = Arc<dyn Fn() + Send + Sync>;

/// Ordered `name -> callable` map owned by one component.
pub struct OperationMap {
    owner: String,
    ops: Mutex<Vec<(String, OperationFn)>>,
}

impl OperationMap {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Register an operation. Names are unique per component.
    pub fn add_operation(
        &self,
        name: impl Into<String>,
        f: impl Fn() + Send + Sync + 'static,
    ) -> AppResult<()> {
        let name = name.into();
        let mut ops = self.ops.lock();
        if ops.iter().any(|(n, _)| *n == name) {
            return Err(LabError::DuplicateOperation {
                owner: self.owner.clone(),
                name,
            });
        }
        ops.push((name, Arc::new(f)));
        Ok(())
    }

    /// Remove an operation by name.
    pub fn remove_operation(&self, name: &str) -> AppResult<()> {
        let mut ops = self.ops.lock();
        let before = ops.len();
        ops.retain(|(n, _)| n != name);
        if ops.len() == before {
            return Err(LabError::UnknownOperation {
                owner: self.owner.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Operation names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.ops.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Invoke an operation by name.
    pub fn run(&self, name: &str) -> AppResult<()> {
        let f = self
            .ops
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f.clone())
            .ok_or_else(|| LabError::UnknownOperation {
                owner: self.owner.clone(),
                name: name.to_string(),
            })?;
        f();
        Ok(())
    }
}

impl std::fmt::Debug for OperationMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationMap")
            .field("owner", &self.owner)
            .field("names", &self.names())
            .finish()
    }
}
