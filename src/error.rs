//! Custom error types for the framework.
//!
//! This module defines the primary error type, `LabError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the failure modes of the instrument-control core, from bad setting
//! values to hardware connection problems.
//!
//! ## Error Hierarchy
//!
//! `LabError` is an enum that consolidates the framework's failure taxonomy:
//!
//! - **`Coercion` / `OutOfRange` / `InvalidChoice`**: a value offered to a
//!   setting cannot be stored. These are raised synchronously from
//!   [`Setting::update_value`](crate::setting::Setting::update_value) and the
//!   stored value is left unchanged.
//! - **`ReadOnly`**: an external write was attempted on a read-only setting.
//! - **`NotMediated`**: a hardware read or write was requested on a setting
//!   that has no mediation function attached. Reported at warning level by the
//!   setting itself; see `Setting::read_from_hardware`.
//! - **`ConnectionFailed`**: a hardware component's `connect()` or
//!   `disconnect()` hook failed. The lifecycle manager reverts the `connected`
//!   setting and emits a failure event before this surfaces to the caller.
//! - **`MeasurementFailure`** / **`AlreadyRunning`**: measurement state-machine
//!   failures. An error inside `run()` is classified into the terminal run
//!   state and routed through the injected [`ErrorReporter`](crate::report::ErrorReporter),
//!   never silently lost.
//! - **`Duplicate*` / `Unknown*` / `InvalidPath`**: registry and path-router
//!   bookkeeping errors.
//!
//! User-supplied hook code (hardware hooks, measurement phases, mediation
//! closures) returns `anyhow::Result`, which the framework wraps into the
//! variants above at the component boundary. Framework APIs return
//! [`AppResult`] so callers can use the `?` operator throughout.

use thiserror::Error;

use crate::value::{Dtype, Value};

/// Convenience alias for results using the framework error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

/// Which direction of hardware mediation was requested on a setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediationDirection {
    /// Device-to-value read function.
    Read,
    /// Value-to-device write function.
    Write,
}

impl std::fmt::Display for MediationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediationDirection::Read => write!(f, "read"),
            MediationDirection::Write => write!(f, "write"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LabError {
    #[error("cannot coerce {value} to {dtype} for setting '{name}'")]
    Coercion {
        name: String,
        value: Value,
        dtype: Dtype,
    },

    #[error("value {value} for setting '{name}' is outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: Value,
        min: f64,
        max: f64,
    },

    #[error("value {value} is not a valid choice for setting '{name}'")]
    InvalidChoice { name: String, value: Value },

    #[error("setting '{name}' is read-only")]
    ReadOnly { name: String },

    #[error("setting '{name}' has no hardware {direction} function")]
    NotMediated {
        name: String,
        direction: MediationDirection,
    },

    #[error("hardware {direction} failed for setting '{name}': {cause}")]
    Mediation {
        name: String,
        direction: MediationDirection,
        cause: anyhow::Error,
    },

    #[error("hardware component '{component}' failed to {phase}: {cause}")]
    ConnectionFailed {
        component: String,
        /// `"connect"` or `"disconnect"`.
        phase: &'static str,
        cause: anyhow::Error,
    },

    #[error("measurement '{measurement}' failed in {phase}: {cause}")]
    MeasurementFailure {
        measurement: String,
        /// `"pre_run"`, `"run"` or `"post_run"`.
        phase: &'static str,
        cause: anyhow::Error,
    },

    #[error("measurement '{measurement}' is already running")]
    AlreadyRunning { measurement: String },

    #[error("a setting named '{name}' already exists in registry '{prefix}'")]
    DuplicateSetting { prefix: String, name: String },

    #[error("path '{path}' is already registered")]
    DuplicatePath { path: String },

    #[error("a component named '{name}' already exists")]
    DuplicateComponent { name: String },

    #[error("an operation named '{name}' already exists on '{owner}'")]
    DuplicateOperation { owner: String, name: String },

    #[error("no operation named '{name}' on '{owner}'")]
    UnknownOperation { owner: String, name: String },

    #[error("no setting registered at path '{path}'")]
    UnknownPath { path: String },

    #[error("malformed setting path '{path}' (expected '<namespace>/<component>/<name>' with namespace app, hw or mm)")]
    InvalidPath { path: String },
}
