//! Focus searches.
//!
//! Two single-axis strategies move a focus actuator while scoring the
//! detector's images with a [`FocusMetric`]:
//!
//! - [`FocusMethod::Binary`]: dichotomic three-point search, fast, assumes a
//!   single maximum reachable from the start position
//! - [`FocusMethod::Exhaustive`]: coarse sweep of the whole range, finishing
//!   with a binary refinement around the best position
//!
//! Both run as a [`ProgressiveTask`] returning a [`FocusOutcome`].
//! [`spectrometer`] chains binary searches over every grating and detector of
//! a spectrometer.
//!
//! ```rust,ignore
//! let request = FocusRequest::new(camera, focuser)
//!     .with_range(SearchRange::new(0.0, 100e-6))
//!     .with_method(FocusMethod::Exhaustive);
//! let outcome = autofocus(request).result(None).await?;
//! println!("best focus at {} m (confidence {})", outcome.position, outcome.confidence);
//! ```

pub mod binary;
pub mod exhaustive;
pub mod metric;
pub mod spectrometer;

pub use metric::{assess_deviation, default_deviation, DeviationFn, FocusMetric};
pub use spectrometer::{
    autofocus_spectrometer, total_spectrometer_focus_time, AxisCombination, FocusMap,
    SpectrometerFocusRequest,
};

use crate::config::SearchSettings;
use crate::error::{AfResult, AutofocusError};
use crate::hardware::{BackgroundControl, Detector, Focuser, Frame, Scanner};
use crate::task::{ProgressiveTask, TaskContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Exposure time used for CL spot focusing
pub const CL_SPOTS_EXPOSURE: Duration = Duration::from_millis(10);

/// Search strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusMethod {
    /// Dichotomic search from the current position
    #[default]
    Binary,
    /// Sweep of the whole range, then binary refinement
    Exhaustive,
}

impl fmt::Display for FocusMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FocusMethod::Binary => f.write_str("binary"),
            FocusMethod::Exhaustive => f.write_str("exhaustive"),
        }
    }
}

impl FromStr for FocusMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary" => Ok(FocusMethod::Binary),
            "exhaustive" => Ok(FocusMethod::Exhaustive),
            other => Err(format!("Unknown focus method '{other}' (binary, exhaustive)")),
        }
    }
}

/// Allowed focus positions, bounds included
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchRange {
    /// Lowest position (m)
    pub lower: f64,
    /// Highest position (m)
    pub upper: f64,
}

impl SearchRange {
    /// Create a range (not validated until used)
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// `upper - lower`
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Clip a position into the range
    pub fn clip(&self, position: f64) -> f64 {
        position.max(self.lower).min(self.upper)
    }

    /// Intersection with `other`, which must have a positive width
    pub fn intersect(&self, other: (f64, f64)) -> AfResult<SearchRange> {
        let range = SearchRange::new(self.lower.max(other.0), self.upper.min(other.1));
        range.validated()
    }

    fn validated(self) -> AfResult<SearchRange> {
        // Negated so that NaN bounds are rejected too
        if !(self.upper > self.lower) {
            return Err(AutofocusError::InvalidConfiguration(format!(
                "Unexpected focus range ({}, {})",
                self.lower, self.upper
            )));
        }
        Ok(self)
    }
}

/// Focus level measured at one position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusSample {
    /// Focus position (m)
    pub position: f64,
    /// Focus level
    pub score: f64,
}

/// Result of a single-axis focus search
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusOutcome {
    /// Best focus position (m)
    pub position: f64,
    /// Focus level at that position
    pub score: f64,
    /// 0.1 iteration budget exhausted, 0.2 indecisive, 0.8 clear maximum
    pub confidence: f64,
}

/// Everything a single-axis focus search needs, moved into its task.
#[derive(Clone)]
pub struct FocusRequest {
    /// Detector on which to improve the focus
    pub detector: Arc<dyn Detector>,
    /// Focus actuator
    pub focuser: Arc<dyn Focuser>,
    /// Scanning emitter (SEM), only for timing and depth of field
    pub scanner: Option<Arc<dyn Scanner>>,
    /// Signal source switched for background subtraction
    pub background: Option<Arc<dyn BackgroundControl>>,
    /// Already known good position
    pub good_focus: Option<f64>,
    /// Restriction of the actuator range
    pub range: Option<SearchRange>,
    /// Strategy
    pub method: FocusMethod,
    /// Focus metric; defaults to the built-in one for the detector kind
    pub metric: Option<FocusMetric>,
    /// Deviation assessment of the exhaustive sweep; defaults to [`assess_deviation`]
    pub deviation: Option<DeviationFn>,
    /// Search constants
    pub settings: SearchSettings,
}

impl fmt::Debug for FocusRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusRequest")
            .field("detector", &self.detector.name())
            .field("focuser", &self.focuser.name())
            .field("scanner", &self.scanner.as_ref().map(|s| s.name()))
            .field("background", &self.background.is_some())
            .field("good_focus", &self.good_focus)
            .field("range", &self.range)
            .field("method", &self.method)
            .field("metric", &self.metric)
            .finish()
    }
}

impl FocusRequest {
    /// Binary search on the full actuator range, with default settings
    pub fn new(detector: Arc<dyn Detector>, focuser: Arc<dyn Focuser>) -> Self {
        Self {
            detector,
            focuser,
            scanner: None,
            background: None,
            good_focus: None,
            range: None,
            method: FocusMethod::default(),
            metric: None,
            deviation: None,
            settings: SearchSettings::default(),
        }
    }

    /// Use a scanner for timing and depth of field
    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Subtract a background acquired with the source disabled
    pub fn with_background(mut self, background: Arc<dyn BackgroundControl>) -> Self {
        self.background = Some(background);
        self
    }

    /// Start from a known good position
    pub fn with_good_focus(mut self, position: f64) -> Self {
        self.good_focus = Some(position);
        self
    }

    /// Restrict the search range
    pub fn with_range(mut self, range: SearchRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Choose the strategy
    pub fn with_method(mut self, method: FocusMethod) -> Self {
        self.method = method;
        self
    }

    /// Inject the focus metric
    pub fn with_metric(mut self, metric: FocusMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Inject the deviation assessment
    pub fn with_deviation(mut self, deviation: DeviationFn) -> Self {
        self.deviation = Some(deviation);
        self
    }

    /// Override the search constants
    pub fn with_settings(mut self, settings: SearchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Metric used for this search
    pub fn resolved_metric(&self) -> FocusMetric {
        self.metric
            .clone()
            .unwrap_or_else(|| FocusMetric::for_kind(self.detector.kind()))
    }

    /// Depth of field: scanner first when there is one, then detector, then default.
    pub fn depth_of_field(&self) -> f64 {
        let from_scanner = self.scanner.as_ref().and_then(|s| s.depth_of_field());
        let dof = match &self.scanner {
            Some(_) => from_scanner.or_else(|| self.detector.depth_of_field()),
            None => self.detector.depth_of_field(),
        };
        match dof {
            Some(dof) if dof > 0.0 => dof,
            _ => {
                debug!("No depth of field info found");
                self.settings.default_depth_of_field
            }
        }
    }

    /// Effective range: actuator range, intersected with `restriction` if any
    pub fn effective_range(&self, restriction: Option<SearchRange>) -> AfResult<SearchRange> {
        let native = self.focuser.range();
        match restriction {
            Some(r) => r.intersect(native),
            None => SearchRange::new(native.0, native.1).validated(),
        }
    }

    /// Timeout of one acquisition: base + 2x the estimated acquisition time
    pub fn acquisition_timeout(&self) -> Duration {
        self.settings.acquisition_timeout_base
            + 2 * estimate_acquisition_time(self.detector.as_ref(), self.scanner.as_deref())
    }
}

/// Estimated duration of one acquisition.
///
/// Scanner dwell time x resolution when there is a scanner, detector exposure
/// time otherwise, 1 s if neither is known.
pub fn estimate_acquisition_time(detector: &dyn Detector, scanner: Option<&dyn Scanner>) -> Duration {
    if let Some(scanner) = scanner {
        let (w, h) = scanner.resolution();
        return scanner.dwell_time().saturating_mul(w.saturating_mul(h));
    }
    detector.exposure_time().unwrap_or(Duration::from_secs(1))
}

/// Estimated duration of a focus move over `distance`
pub fn estimate_move_time(focuser: &dyn Focuser, distance: f64, settings: &SearchSettings) -> Duration {
    match focuser.speed() {
        Some(speed) if speed > 0.0 => {
            Duration::try_from_secs_f64(distance.abs() / speed).unwrap_or(settings.default_move_time)
        }
        _ => settings.default_move_time,
    }
}

/// Pessimistic duration of a focus search: one move over the range, two
/// moves over half of it, and the maximum number of acquisitions.
pub fn estimate_autofocus_time(request: &FocusRequest) -> Duration {
    let native = request.focuser.range();
    let (lo, hi) = match request.range {
        Some(r) => (r.lower.max(native.0), r.upper.min(native.1)),
        None => native,
    };
    let distance = (hi - lo).max(0.0);
    let focuser = request.focuser.as_ref();
    let moves = estimate_move_time(focuser, distance, &request.settings)
        + 2 * estimate_move_time(focuser, distance / 2.0, &request.settings);
    let acquisitions = estimate_acquisition_time(request.detector.as_ref(), request.scanner.as_deref())
        .saturating_mul(request.settings.max_steps);
    moves + acquisitions
}

async fn acquire_once(detector: &dyn Detector, timeout: Duration) -> AfResult<Frame> {
    match tokio::time::timeout(timeout, detector.acquire()).await {
        Ok(frame) => Ok(frame?),
        Err(_) => Err(AutofocusError::Timeout(format!(
            "No data received from {} after {:?}",
            detector.name(),
            timeout
        ))),
    }
}

/// Acquire one frame, subtracting the background when a control is given.
///
/// The background is acquired first, then the source is enabled for the
/// signal frame and disabled again, even if that acquisition fails.
pub async fn acquire_no_background(
    detector: &dyn Detector,
    background: Option<&dyn BackgroundControl>,
    timeout: Duration,
) -> AfResult<Frame> {
    let Some(control) = background else {
        return acquire_once(detector, timeout).await;
    };

    let dark = acquire_once(detector, timeout).await?;
    control.enable().await?;
    let signal = acquire_once(detector, timeout).await;
    control.disable().await?;
    Ok(signal?.subtract(&dark)?)
}

/// Scores frames of one request
pub(crate) struct FocusProbe<'a> {
    detector: &'a dyn Detector,
    background: Option<&'a dyn BackgroundControl>,
    metric: FocusMetric,
    timeout: Duration,
}

impl<'a> FocusProbe<'a> {
    pub(crate) fn new(request: &'a FocusRequest) -> Self {
        Self {
            detector: request.detector.as_ref(),
            background: request.background.as_deref(),
            metric: request.resolved_metric(),
            timeout: request.acquisition_timeout(),
        }
    }

    /// Acquire at the current position and return the focus level
    pub(crate) async fn score(&self) -> AfResult<f64> {
        let frame = acquire_no_background(self.detector, self.background, self.timeout).await?;
        Ok(self.metric.measure(&frame))
    }

    pub(crate) fn metric_name(&self) -> &str {
        self.metric.name()
    }
}

async fn run_search(ctx: &TaskContext, request: &FocusRequest) -> AfResult<FocusOutcome> {
    match request.method {
        FocusMethod::Binary => {
            binary::binary_focus(ctx, request, request.good_focus, request.range).await
        }
        FocusMethod::Exhaustive => exhaustive::exhaustive_focus(ctx, request).await,
    }
}

/// Start a single-axis focus search.
///
/// The task's result is the best position, its focus level and a confidence.
/// On cancellation the focuser is left at the best position measured.
#[instrument(skip_all, fields(detector = request.detector.name(), method = %request.method))]
pub fn autofocus(request: FocusRequest) -> ProgressiveTask<FocusOutcome> {
    let estimate = estimate_autofocus_time(&request);
    debug!(?estimate, "starting autofocus");
    ProgressiveTask::spawn("autofocus", estimate, move |ctx| async move {
        run_search(&ctx, &request).await
    })
}

/// Focus on CL spots seen by a diagnostic camera.
///
/// Sets a short exposure time, then runs `request` (exhaustive by default,
/// see [`cl_spots_request`]).
pub fn cl_spots_autofocus(request: FocusRequest) -> ProgressiveTask<FocusOutcome> {
    let estimate = estimate_autofocus_time(&request);
    ProgressiveTask::spawn("cl-spots-autofocus", estimate, move |ctx| async move {
        let applied = request.detector.set_exposure_time(CL_SPOTS_EXPOSURE).await?;
        debug!(?applied, "exposure set for CL spots");
        run_search(&ctx, &request).await
    })
}

/// Request preset for [`cl_spots_autofocus`]: exhaustive search with the spots metric
pub fn cl_spots_request(detector: Arc<dyn Detector>, focuser: Arc<dyn Focuser>) -> FocusRequest {
    FocusRequest::new(detector, focuser)
        .with_method(FocusMethod::Exhaustive)
        .with_metric(FocusMetric::spots())
}
