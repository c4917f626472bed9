//! # Labkit Core Library
//!
//! This crate is the core of `labkit`, a desktop application framework for
//! operating laboratory instruments. It coordinates typed configuration
//! values ("settings"), background data-acquisition routines
//! ("measurements") and device drivers ("hardware components") while keeping
//! a graphical interface synchronized with live state. The GUI itself, file
//! dialogs, on-disk serialization formats and scan-geometry generators are
//! external collaborators built on top of this crate.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`value`**: the dynamic [`Value`](value::Value)/[`Dtype`](value::Dtype)
//!   representation settings are built on, with the coercion rules shared by
//!   every write path.
//! - **`setting`**: the observable, constrained, hardware-mediated
//!   [`Setting`](setting::Setting) primitive and its builder.
//! - **`registry`**: ordered per-component collections of settings with
//!   hierarchical path assignment.
//! - **`range`**: linked min/max/step/num sweep descriptors kept mutually
//!   consistent, with the sweep-array orderings used by acquisition loops.
//! - **`router`**: the global `"<namespace>/<component>/<name>"` path lookup
//!   spanning app, hardware and measurement registries.
//! - **`hardware`**: the [`HardwareComponent`](hardware::HardwareComponent)
//!   driver trait and the per-device connect/disconnect lifecycle manager
//!   with its optional polling thread.
//! - **`measurement`**: the [`Measurement`](measurement::Measurement) trait
//!   and the per-measurement run-state machine, acquisition worker thread,
//!   cooperative interrupt and nested-measurement orchestration.
//! - **`app`**: the [`App`](app::App) hub tying registries, router, event
//!   loop and components together.
//! - **`context`** / **`task`**: the cooperative UI/event loop and the
//!   worker-thread abstraction with bounded joins and completion delivery.
//! - **`ops`**: the name → zero-argument-callable operation maps the UI
//!   layer renders as buttons and menus.
//! - **`report`**: the injected error-reporting collaborator that makes
//!   background-thread failures impossible to lose silently.
//! - **`error`**: the crate-wide [`LabError`](error::LabError) taxonomy.

pub mod app;
pub mod context;
pub mod error;
pub mod hardware;
pub mod measurement;
pub mod ops;
pub mod range;
pub mod registry;
pub mod report;
pub mod router;
pub mod setting;
pub mod task;
pub mod value;
