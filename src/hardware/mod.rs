//! Hardware abstractions consumed by the autofocus procedures.
//!
//! - [`capabilities`]: async traits for every collaborator (detectors,
//!   focusers, spectrographs, selectors, light sources, optical path)
//! - [`inventory`]: explicit collection of components, resolved per alignment mode
//! - [`mock`]: simulated devices for tests and the demo binary

pub mod capabilities;
pub mod inventory;
pub mod mock;

pub use capabilities::{
    BackgroundControl, Component, Detector, DetectorKind, Focuser, GratingId, LightSource,
    OpticalPathManager, Scanner, Selector, Spectrograph, SpectrographMove, SpectrographPosition,
};
pub use inventory::{DeviceInventory, FocusComponents};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single 2D image (row-major), or a 1x1 / 1xN reading for point and line
/// detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel intensities, `width * height` values
    pub data: Vec<f64>,
    /// When the frame was produced
    pub acquired_at: DateTime<Utc>,
}

impl Frame {
    /// Build a frame, checking that `data` matches the dimensions.
    pub fn new(width: u32, height: u32, data: Vec<f64>) -> anyhow::Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            anyhow::bail!(
                "frame data has {} values, expected {}x{} = {}",
                data.len(),
                width,
                height,
                expected
            );
        }
        Ok(Self {
            width,
            height,
            data,
            acquired_at: Utc::now(),
        })
    }

    /// Whether `data` holds exactly `width * height` values
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize
    }

    /// Single-value frame (point detector reading).
    pub fn scalar(value: f64) -> Self {
        Self {
            width: 1,
            height: 1,
            data: vec![value],
            acquired_at: Utc::now(),
        }
    }

    /// Pixel at column `x`, row `y`.
    pub fn get(&self, x: u32, y: u32) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Mean intensity, 0 for an empty frame.
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            0.0
        } else {
            self.data.iter().sum::<f64>() / self.data.len() as f64
        }
    }

    /// `self - background`, clipped at 0.
    pub fn subtract(&self, background: &Frame) -> anyhow::Result<Frame> {
        if (self.width, self.height) != (background.width, background.height) {
            anyhow::bail!(
                "background is {}x{}, image is {}x{}",
                background.width,
                background.height,
                self.width,
                self.height
            );
        }
        let data = self
            .data
            .iter()
            .zip(&background.data)
            .map(|(signal, bg)| (signal - bg).max(0.0))
            .collect();
        Ok(Frame {
            width: self.width,
            height: self.height,
            data,
            acquired_at: self.acquired_at,
        })
    }
}
