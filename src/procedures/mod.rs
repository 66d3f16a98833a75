//! Composite alignment procedures.
//!
//! A procedure drives several components in sequence around a focus search:
//!
//! ```text
//! ┌───────────────┐   ┌──────────────┐   ┌──────────────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Light on      │ → │ Optical path │ → │ Spectrometer focus   │ → │ Final image │ → │ Light off │
//! │ (warm-up wait)│   │ (close slit) │   │ (gratings × dets)    │   │             │   │           │
//! └───────────────┘   └──────────────┘   └──────────────────────┘   └─────────────┘   └───────────┘
//! ```
//!
//! Each stage has an estimated duration; the procedure's progress end is the
//! sum of the stages left. Teardown actions are kept in a
//! [`CleanupRegistry`] so they run on every exit path.
//!
//! # Example
//!
//! ```rust,ignore
//! use rust_autofocus::procedures::{spectrograph_alignment, AlignmentRequest, AlignMode};
//!
//! let request = AlignmentRequest::from_inventory(&inventory, AlignMode::SpecFocus, path, &config)?;
//! let focus_map = spectrograph_alignment(request).result(None).await?;
//! ```

pub mod alignment;
pub mod cleanup;
pub mod light;

pub use alignment::{manual_focus, spectrograph_alignment, AlignmentRequest};
pub use cleanup::CleanupRegistry;
pub use light::turn_on_light;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Optical path mode for which the spectrograph focus is optimized.
///
/// The mode selects the focuser, and through it the spectrograph, detectors,
/// selector and light source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlignMode {
    /// Spectrograph on the main path
    #[serde(rename = "spec-focus")]
    SpecFocus,
    /// Dedicated (external) spectrograph
    #[serde(rename = "spec-focus-ext")]
    SpecFocusExt,
    /// Streak camera behind the main spectrograph
    #[serde(rename = "streak-focus")]
    StreakFocus,
    /// Streak camera behind the dedicated spectrograph
    #[serde(rename = "streak-focus-ext")]
    StreakFocusExt,
    /// Spectrograph fed by the optical fiber
    #[serde(rename = "spec-fiber-focus")]
    SpecFiberFocus,
}

impl AlignMode {
    /// All modes
    pub const ALL: [AlignMode; 5] = [
        AlignMode::SpecFocus,
        AlignMode::SpecFocusExt,
        AlignMode::StreakFocus,
        AlignMode::StreakFocusExt,
        AlignMode::SpecFiberFocus,
    ];

    /// Mode name as known by the optical path manager
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignMode::SpecFocus => "spec-focus",
            AlignMode::SpecFocusExt => "spec-focus-ext",
            AlignMode::StreakFocus => "streak-focus",
            AlignMode::StreakFocusExt => "streak-focus-ext",
            AlignMode::SpecFiberFocus => "spec-fiber-focus",
        }
    }
}

impl fmt::Display for AlignMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlignMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlignMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| format!("Unknown align mode {s}"))
    }
}

/// One stage of a procedure, with its estimated duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcedureStage {
    /// Stage name, for logs
    pub name: &'static str,
    /// Estimated duration
    pub estimate: Duration,
}

impl ProcedureStage {
    /// Create a stage
    pub fn new(name: &'static str, estimate: Duration) -> Self {
        Self { name, estimate }
    }
}

/// Stages not yet completed, in order.
#[derive(Debug, Clone, Default)]
pub struct StageQueue {
    stages: VecDeque<ProcedureStage>,
}

impl StageQueue {
    /// Queue of `stages`, in execution order
    pub fn new(stages: impl IntoIterator<Item = ProcedureStage>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }

    /// Sum of the estimates left
    pub fn remaining(&self) -> Duration {
        self.stages.iter().map(|s| s.estimate).sum()
    }

    /// Mark the current stage as done
    pub fn pop(&mut self) -> Option<ProcedureStage> {
        let stage = self.stages.pop_front();
        if let Some(stage) = &stage {
            tracing::debug!(stage = stage.name, "stage completed");
        }
        stage
    }

    /// Number of stages left
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether every stage is done
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
