//! # Rust Autofocus Library
//!
//! Autofocus orchestration for optical and electron microscopes: focus
//! searches driving a focus actuator while scoring detector images, a
//! multi-axis search over the gratings and detectors of a spectrometer, and
//! the composite alignment procedure around it (light, optical path, search,
//! confirmation image, teardown).
//!
//! Every procedure runs as a cancellable, progress-reporting
//! [`task::ProgressiveTask`].
//!
//! ## Crate Structure
//!
//! - **`task`**: `ProgressiveTask` / `TaskContext`, the async task model with
//!   cooperative cancellation, sub-tasks and progress estimates.
//! - **`autofocus`**: focus metrics, the binary and exhaustive searches, and
//!   the spectrometer autofocus.
//! - **`procedures`**: the spectrograph alignment procedure, manual focus, light
//!   warm-up and the cleanup registry.
//! - **`hardware`**: capability traits consumed by the procedures, the device
//!   inventory resolving components per alignment mode, and mock devices.
//! - **`config`**: figment-based configuration (TOML + environment).
//! - **`error`**: the `AutofocusError` enum shared by all procedures.
//! - **`tracing_setup`**: tracing subscriber initialisation.

pub mod autofocus;
pub mod config;
pub mod error;
pub mod hardware;
pub mod procedures;
pub mod task;
pub mod tracing_setup;

pub use error::{AfResult, AutofocusError};
pub use task::{ProgressiveTask, TaskContext};
