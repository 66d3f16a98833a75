//! Hardware Capabilities
//!
//! Fine-grained capability traits for the components an autofocus procedure
//! drives. Procedures only see these traits; device drivers, transports and
//! routing tables live elsewhere.
//!
//! Each capability trait:
//! - Is async (uses #[async_trait]) for calls that touch the hardware
//! - Is thread-safe (requires Send + Sync, through [`Component`])
//! - Uses anyhow::Result for errors
//! - Exposes cheap metadata (ranges, binning, depth of field) as sync getters
//!
//! # Example
//!
//! ```rust,ignore
//! async fn refocus(focuser: &dyn Focuser, target: f64) -> anyhow::Result<f64> {
//!     let (lo, hi) = focuser.range();
//!     focuser.move_abs(target.clamp(lo, hi)).await
//! }
//! ```

use crate::hardware::Frame;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity and topology shared by every component.
///
/// `affects` lists the names of the components downstream of this one (a
/// focuser affects the detectors it focuses, a spectrograph the detectors
/// behind it).
pub trait Component: Send + Sync {
    /// Unique component name
    fn name(&self) -> &str;

    /// Role in the microscope (e.g. "focus", "ccd0", "spectrograph")
    fn role(&self) -> &str;

    /// Names of the components affected by this one
    fn affects(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Kind of detector, selecting the default focus metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorKind {
    /// 2D camera
    Camera,
    /// Camera with a single useful line (e.g. spectrum on a CCD with 1 row)
    LineCamera,
    /// Camera looking at CL spots for alignment
    DiagnosticCamera,
    /// Single-value detector, scanned by an e-beam
    PointDetector,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectorKind::Camera => "camera",
            DetectorKind::LineCamera => "line-camera",
            DetectorKind::DiagnosticCamera => "diagnostic-camera",
            DetectorKind::PointDetector => "point-detector",
        };
        f.write_str(s)
    }
}

/// Capability: Image Acquisition
///
/// # Contract
/// - `acquire` returns the next complete frame; the caller applies its own timeout
/// - Binning and exposure are optional; `set_*` return the value actually applied
#[async_trait]
pub trait Detector: Component {
    /// Acquire the next frame
    async fn acquire(&self) -> Result<Frame>;

    /// Detector kind
    fn kind(&self) -> DetectorKind;

    /// Sensor resolution in pixels (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Current exposure time, `None` if not applicable
    fn exposure_time(&self) -> Option<Duration> {
        None
    }

    /// Current binning
    fn binning(&self) -> (u32, u32) {
        (1, 1)
    }

    /// Largest supported binning, `None` if binning is not configurable
    fn max_binning(&self) -> Option<(u32, u32)> {
        None
    }

    /// Depth of field of the optics in front of the detector (m)
    fn depth_of_field(&self) -> Option<f64> {
        None
    }

    /// Set binning, returns the applied value
    async fn set_binning(&self, _binning: (u32, u32)) -> Result<(u32, u32)> {
        anyhow::bail!("Binning not supported by detector '{}'", self.name())
    }

    /// Set exposure time, returns the applied value
    async fn set_exposure_time(&self, _exposure: Duration) -> Result<Duration> {
        anyhow::bail!("Exposure control not supported by detector '{}'", self.name())
    }
}

/// Capability: Background Source Control
///
/// Turns on/off the source of the signal (e.g. e-beam emission), so that a
/// background image can be subtracted.
#[async_trait]
pub trait BackgroundControl: Send + Sync {
    /// Start emitting the signal
    async fn enable(&self) -> Result<()>;

    /// Stop emitting the signal
    async fn disable(&self) -> Result<()>;
}

/// Capability: Focus Axis
///
/// # Contract
/// - Positions are in meters
/// - `move_abs` completes when the move is done and returns the reached position
#[async_trait]
pub trait Focuser: Component {
    /// Native axis range (min, max)
    fn range(&self) -> (f64, f64);

    /// Speed in m/s, if known (used for time estimates)
    fn speed(&self) -> Option<f64> {
        None
    }

    /// Current position
    async fn position(&self) -> Result<f64>;

    /// Move to absolute position, returns the reached position
    async fn move_abs(&self, position: f64) -> Result<f64>;
}

/// Capability: Scanning Emitter (e-beam)
///
/// Only used for timing and depth of field; the search never moves it.
pub trait Scanner: Component {
    /// Time spent per pixel
    fn dwell_time(&self) -> Duration;

    /// Scan resolution (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Depth of field at the current settings (m)
    fn depth_of_field(&self) -> Option<f64> {
        None
    }
}

/// Grating identifier, as reported by the spectrograph.
pub type GratingId = u32;

/// Position of the spectrograph axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrographPosition {
    /// Current grating
    pub grating: GratingId,
    /// Center wavelength (m), 0 is the 0th order (mirror)
    pub wavelength: f64,
}

/// Requested spectrograph move; `None` axes are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrographMove {
    /// Target grating
    pub grating: Option<GratingId>,
    /// Target center wavelength (m)
    pub wavelength: Option<f64>,
}

impl SpectrographMove {
    /// Move only the wavelength
    pub fn wavelength(wavelength: f64) -> Self {
        Self {
            grating: None,
            wavelength: Some(wavelength),
        }
    }

    /// Move both axes
    pub fn to(position: SpectrographPosition) -> Self {
        Self {
            grating: Some(position.grating),
            wavelength: Some(position.wavelength),
        }
    }
}

/// Capability: Spectrograph (grating + center wavelength)
#[async_trait]
pub trait Spectrograph: Component {
    /// Available gratings
    fn gratings(&self) -> Vec<GratingId>;

    /// Current position
    async fn position(&self) -> Result<SpectrographPosition>;

    /// Move the axes given in `target`
    async fn move_abs(&self, target: SpectrographMove) -> Result<()>;
}

/// Capability: Detector Selector
///
/// A discrete actuator routing the light to one detector. Each choice is a
/// position and a description listing the names of the detectors reached.
#[async_trait]
pub trait Selector: Component {
    /// Available positions with their description
    fn choices(&self) -> Vec<(f64, String)>;

    /// Current position
    async fn position(&self) -> Result<f64>;

    /// Move to a position
    async fn move_abs(&self, position: f64) -> Result<()>;
}

/// Capability: Light Source Power
#[async_trait]
pub trait LightSource: Component {
    /// Allowed power range (min, max), in W
    fn power_range(&self) -> (f64, f64);

    /// Current power
    async fn power(&self) -> Result<f64>;

    /// Set the power, clipped to the range by the driver
    async fn set_power(&self, power: f64) -> Result<()>;
}

/// Capability: Optical Path Configuration
///
/// Moves the mirrors, lenses and filters for the given mode, towards
/// `detector` when several detectors share the mode. Routing tables are
/// internal to the implementation.
#[async_trait]
pub trait OpticalPathManager: Send + Sync {
    /// Reconfigure the path
    async fn set_path(&self, mode: &str, detector: Option<&str>) -> Result<()>;
}
