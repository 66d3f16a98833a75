//! Mock Hardware Implementations
//!
//! Simulated components for testing the procedures without physical hardware.
//! All mock devices use async-safe waits (tokio::time::sleep, not
//! std::thread::sleep) and record what was asked of them, so tests can check
//! move sequences and light switching.
//!
//! # Available Mocks
//!
//! - `MockFocuser` - focus axis with range clipping and move history
//! - `MockCamera` - detector whose signal depends on the focus position
//! - `MockScanner` - e-beam timing and depth of field
//! - `MockSpectrograph` - gratings and center wavelength
//! - `MockSelector` - detector selector
//! - `MockLight` - light source with optional warm-up delay
//! - `MockBackground` - background source switch
//! - `MockOpticalPath` - records path changes
//!
//! Delays default to zero; tests opt in with the `with_*_delay` builders.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use crate::hardware::capabilities::{
    BackgroundControl, Component, Detector, DetectorKind, Focuser, GratingId, LightSource,
    OpticalPathManager, Scanner, Selector, Spectrograph, SpectrographMove, SpectrographPosition,
};
use crate::hardware::Frame;

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay).await;
    }
}

// =============================================================================
// MockFocuser - Simulated Focus Axis
// =============================================================================

/// Mock focus actuator
///
/// Targets outside the range are clipped; `move_abs` returns the reached
/// position.
///
/// # Example
///
/// ```rust,ignore
/// let focuser = MockFocuser::new("focus", "focus", (0.0, 100.0)).at(50.0);
/// assert_eq!(focuser.move_abs(120.0).await?, 100.0);
/// ```
pub struct MockFocuser {
    name: String,
    role: String,
    affects: Vec<String>,
    range: (f64, f64),
    speed: Option<f64>,
    position: Mutex<f64>,
    moves: Mutex<Vec<f64>>,
    move_delay: Duration,
    fail_moves: AtomicBool,
}

impl MockFocuser {
    /// Create a focuser at the middle of `range`
    pub fn new(name: &str, role: &str, range: (f64, f64)) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            affects: Vec::new(),
            range,
            speed: None,
            position: Mutex::new((range.0 + range.1) / 2.0),
            moves: Mutex::new(Vec::new()),
            move_delay: Duration::ZERO,
            fail_moves: AtomicBool::new(false),
        }
    }

    /// Start at a given position
    pub fn at(self, position: f64) -> Self {
        *self.position.lock() = position;
        self
    }

    /// Names of the affected components
    pub fn with_affects(mut self, affects: &[&str]) -> Self {
        self.affects = affects.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Fixed duration of each move
    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    /// Reported speed (m/s)
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Current position, without going through the async API
    pub fn current(&self) -> f64 {
        *self.position.lock()
    }

    /// All reached positions, in order
    pub fn moves(&self) -> Vec<f64> {
        self.moves.lock().clone()
    }

    /// Make every following move fail
    pub fn set_fail_moves(&self, fail: bool) {
        self.fail_moves.store(fail, Ordering::SeqCst);
    }
}

impl Component for MockFocuser {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn affects(&self) -> Vec<String> {
        self.affects.clone()
    }
}

#[async_trait]
impl Focuser for MockFocuser {
    fn range(&self) -> (f64, f64) {
        self.range
    }

    fn speed(&self) -> Option<f64> {
        self.speed
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.current())
    }

    async fn move_abs(&self, target: f64) -> Result<f64> {
        if self.fail_moves.load(Ordering::SeqCst) {
            return Err(anyhow!("{}: motor stalled moving to {}", self.name, target));
        }
        let reached = target.clamp(self.range.0, self.range.1);
        pause(self.move_delay).await;
        *self.position.lock() = reached;
        self.moves.lock().push(reached);
        tracing::trace!(focuser = %self.name, target, reached, "mock focus move");
        Ok(reached)
    }
}

// =============================================================================
// MockLight - Simulated Light Source
// =============================================================================

/// Mock light source
///
/// The emitted fraction is `(power - min) / (max - min)`, once the optional
/// warm-up delay has elapsed after the last switch on.
pub struct MockLight {
    name: String,
    role: String,
    affects: Vec<String>,
    range: (f64, f64),
    power: Mutex<f64>,
    switched_on_at: Mutex<Option<Instant>>,
    warmup: Duration,
    history: Mutex<Vec<f64>>,
}

impl MockLight {
    /// Create a light, off, with power range `(0, max_power)`
    pub fn new(name: &str, role: &str, max_power: f64) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            affects: Vec::new(),
            range: (0.0, max_power),
            power: Mutex::new(0.0),
            switched_on_at: Mutex::new(None),
            warmup: Duration::ZERO,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Names of the affected components
    pub fn with_affects(mut self, affects: &[&str]) -> Self {
        self.affects = affects.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Time between switching on and actual emission
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// Fraction of the maximum power currently emitted
    pub fn emitted_fraction(&self) -> f64 {
        let warm = match *self.switched_on_at.lock() {
            Some(since) => since.elapsed() >= self.warmup,
            None => false,
        };
        if !warm {
            return 0.0;
        }
        let (lo, hi) = self.range;
        if hi <= lo {
            return 0.0;
        }
        ((*self.power.lock() - lo) / (hi - lo)).clamp(0.0, 1.0)
    }

    /// Whether the power is above the minimum
    pub fn is_on(&self) -> bool {
        *self.power.lock() > self.range.0
    }

    /// All requested powers, in order
    pub fn power_history(&self) -> Vec<f64> {
        self.history.lock().clone()
    }

    /// Number of requests to set the power to the minimum
    pub fn off_count(&self) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|p| **p <= self.range.0)
            .count()
    }
}

impl Component for MockLight {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn affects(&self) -> Vec<String> {
        self.affects.clone()
    }
}

#[async_trait]
impl LightSource for MockLight {
    fn power_range(&self) -> (f64, f64) {
        self.range
    }

    async fn power(&self) -> Result<f64> {
        Ok(*self.power.lock())
    }

    async fn set_power(&self, power: f64) -> Result<()> {
        let power = power.clamp(self.range.0, self.range.1);
        let was_on = self.is_on();
        *self.power.lock() = power;
        self.history.lock().push(power);
        let mut switched = self.switched_on_at.lock();
        if power <= self.range.0 {
            *switched = None;
        } else if !was_on {
            *switched = Some(Instant::now());
        }
        Ok(())
    }
}

// =============================================================================
// MockBackground - Simulated Background Source Switch
// =============================================================================

/// Mock background control (e.g. e-beam blanker)
#[derive(Default)]
pub struct MockBackground {
    enabled: AtomicBool,
    enable_count: AtomicUsize,
}

impl MockBackground {
    /// Create a disabled source
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the signal source is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Number of times the source was enabled
    pub fn enable_count(&self) -> usize {
        self.enable_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundControl for MockBackground {
    async fn enable(&self) -> Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        self.enable_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockSpectrograph - Simulated Spectrograph
// =============================================================================

/// Mock spectrograph with a set of gratings and a wavelength axis
pub struct MockSpectrograph {
    name: String,
    role: String,
    affects: Vec<String>,
    gratings: Vec<GratingId>,
    position: Mutex<SpectrographPosition>,
    moves: Mutex<Vec<SpectrographMove>>,
    grating_delay: Duration,
    refuse_zero_order: bool,
}

impl MockSpectrograph {
    /// Create a spectrograph on the first grating, at 500 nm
    pub fn new(name: &str, role: &str, gratings: &[GratingId]) -> Self {
        let first = gratings.first().copied().unwrap_or(0);
        Self {
            name: name.to_string(),
            role: role.to_string(),
            affects: Vec::new(),
            gratings: gratings.to_vec(),
            position: Mutex::new(SpectrographPosition {
                grating: first,
                wavelength: 500e-9,
            }),
            moves: Mutex::new(Vec::new()),
            grating_delay: Duration::ZERO,
            refuse_zero_order: false,
        }
    }

    /// Start at a given position
    pub fn at(self, grating: GratingId, wavelength: f64) -> Self {
        *self.position.lock() = SpectrographPosition {
            grating,
            wavelength,
        };
        self
    }

    /// Names of the affected components
    pub fn with_affects(mut self, affects: &[&str]) -> Self {
        self.affects = affects.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Duration of a grating change
    pub fn with_grating_delay(mut self, delay: Duration) -> Self {
        self.grating_delay = delay;
        self
    }

    /// Reject moves to wavelength 0 (grating without a mirror order)
    pub fn refusing_zero_order(mut self) -> Self {
        self.refuse_zero_order = true;
        self
    }

    /// Current position, without going through the async API
    pub fn current(&self) -> SpectrographPosition {
        *self.position.lock()
    }

    /// All accepted moves, in order
    pub fn moves(&self) -> Vec<SpectrographMove> {
        self.moves.lock().clone()
    }
}

impl Component for MockSpectrograph {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn affects(&self) -> Vec<String> {
        self.affects.clone()
    }
}

#[async_trait]
impl Spectrograph for MockSpectrograph {
    fn gratings(&self) -> Vec<GratingId> {
        self.gratings.clone()
    }

    async fn position(&self) -> Result<SpectrographPosition> {
        Ok(self.current())
    }

    async fn move_abs(&self, target: SpectrographMove) -> Result<()> {
        if let Some(grating) = target.grating {
            if !self.gratings.contains(&grating) {
                return Err(anyhow!("{}: unknown grating {}", self.name, grating));
            }
        }
        if self.refuse_zero_order && target.wavelength == Some(0.0) {
            return Err(anyhow!("{}: 0th order not available", self.name));
        }

        let changes_grating = target
            .grating
            .is_some_and(|g| g != self.position.lock().grating);
        if changes_grating {
            pause(self.grating_delay).await;
        }

        {
            let mut position = self.position.lock();
            if let Some(grating) = target.grating {
                position.grating = grating;
            }
            if let Some(wavelength) = target.wavelength {
                position.wavelength = wavelength;
            }
        }
        self.moves.lock().push(target);
        Ok(())
    }
}

// =============================================================================
// MockSelector - Simulated Detector Selector
// =============================================================================

/// Mock detector selector
pub struct MockSelector {
    name: String,
    role: String,
    affects: Vec<String>,
    choices: Vec<(f64, String)>,
    position: Mutex<f64>,
    moves: Mutex<Vec<f64>>,
}

impl MockSelector {
    /// Create a selector; it starts on the first choice
    pub fn new(name: &str, role: &str, choices: &[(f64, &str)]) -> Self {
        let first = choices.first().map(|(p, _)| *p).unwrap_or(0.0);
        Self {
            name: name.to_string(),
            role: role.to_string(),
            affects: Vec::new(),
            choices: choices.iter().map(|(p, d)| (*p, d.to_string())).collect(),
            position: Mutex::new(first),
            moves: Mutex::new(Vec::new()),
        }
    }

    /// Start at a given position
    pub fn at(self, position: f64) -> Self {
        *self.position.lock() = position;
        self
    }

    /// Names of the affected components
    pub fn with_affects(mut self, affects: &[&str]) -> Self {
        self.affects = affects.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Current position, without going through the async API
    pub fn current(&self) -> f64 {
        *self.position.lock()
    }

    /// All moves, in order
    pub fn moves(&self) -> Vec<f64> {
        self.moves.lock().clone()
    }
}

impl Component for MockSelector {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn affects(&self) -> Vec<String> {
        self.affects.clone()
    }
}

#[async_trait]
impl Selector for MockSelector {
    fn choices(&self) -> Vec<(f64, String)> {
        self.choices.clone()
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.current())
    }

    async fn move_abs(&self, position: f64) -> Result<()> {
        if !self.choices.iter().any(|(p, _)| *p == position) {
            return Err(anyhow!("{}: invalid position {}", self.name, position));
        }
        *self.position.lock() = position;
        self.moves.lock().push(position);
        Ok(())
    }
}

// =============================================================================
// MockScanner - Simulated E-beam Scanner
// =============================================================================

/// Mock scanner, only providing timing and depth of field
pub struct MockScanner {
    name: String,
    dwell_time: Duration,
    resolution: (u32, u32),
    depth_of_field: Option<f64>,
}

impl MockScanner {
    /// Create a scanner
    pub fn new(name: &str, dwell_time: Duration, resolution: (u32, u32)) -> Self {
        Self {
            name: name.to_string(),
            dwell_time,
            resolution,
            depth_of_field: None,
        }
    }

    /// Reported depth of field
    pub fn with_depth_of_field(mut self, dof: f64) -> Self {
        self.depth_of_field = Some(dof);
        self
    }
}

impl Component for MockScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        "e-beam"
    }
}

impl Scanner for MockScanner {
    fn dwell_time(&self) -> Duration {
        self.dwell_time
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn depth_of_field(&self) -> Option<f64> {
        self.depth_of_field
    }
}

// =============================================================================
// MockOpticalPath - Simulated Optical Path Manager
// =============================================================================

/// Mock optical path manager, recording `(mode, detector)` requests
#[derive(Default)]
pub struct MockOpticalPath {
    requests: Mutex<Vec<(String, Option<String>)>>,
    delay: Duration,
    fail: AtomicBool,
}

impl MockOpticalPath {
    /// Create a path manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration of each path change
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every following path change fail
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// All requests, in order
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl OpticalPathManager for MockOpticalPath {
    async fn set_path(&self, mode: &str, detector: Option<&str>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("failed to set path {} for {:?}", mode, detector));
        }
        pause(self.delay).await;
        self.requests
            .lock()
            .push((mode.to_string(), detector.map(str::to_string)));
        Ok(())
    }
}

// =============================================================================
// MockCamera - Simulated Detector
// =============================================================================

/// Signal model: focus position and current grating to a value.
pub type ResponseFn = Arc<dyn Fn(f64, Option<GratingId>) -> f64 + Send + Sync>;

enum ImageModel {
    /// Uniform 1x1 frame with the given response as value
    Response(ResponseFn),
    /// Energy-conserving gaussian spot, blurred away from `best`
    Spot {
        best: f64,
        sigma: f64,
        blur_per_m: f64,
        energy: f64,
    },
}

/// Mock camera whose signal depends on a [`MockFocuser`] position.
///
/// The signal is scaled by the emitted fraction of the linked light and set
/// to zero while the linked background source is disabled, on top of a
/// constant dark level.
///
/// # Example
///
/// ```rust,ignore
/// let focuser = Arc::new(MockFocuser::new("focus", "focus", (0.0, 100.0)));
/// let camera = MockCamera::new("ccd", "ccd", DetectorKind::Camera, (1, 1))
///     .focused_by(focuser.clone())
///     .with_response(|z| -(z - 37.0).powi(2));
/// ```
pub struct MockCamera {
    name: String,
    role: String,
    kind: DetectorKind,
    resolution: (u32, u32),
    model: ImageModel,
    dark_level: f64,
    noise: f64,
    focuser: Option<Arc<MockFocuser>>,
    spectrograph: Option<Arc<MockSpectrograph>>,
    light: Option<Arc<MockLight>>,
    background: Option<Arc<MockBackground>>,
    exposure: Mutex<Option<Duration>>,
    binning: Mutex<(u32, u32)>,
    max_binning: Option<(u32, u32)>,
    depth_of_field: Option<f64>,
    acquire_delay: Duration,
    acquisitions: AtomicUsize,
    fail_acquire: AtomicBool,
}

impl MockCamera {
    /// Create a camera with a flat (zero) response
    pub fn new(name: &str, role: &str, kind: DetectorKind, resolution: (u32, u32)) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            kind,
            resolution,
            model: ImageModel::Response(Arc::new(|_, _| 0.0)),
            dark_level: 0.0,
            noise: 0.0,
            focuser: None,
            spectrograph: None,
            light: None,
            background: None,
            exposure: Mutex::new(Some(Duration::from_millis(100))),
            binning: Mutex::new((1, 1)),
            max_binning: None,
            depth_of_field: None,
            acquire_delay: Duration::ZERO,
            acquisitions: AtomicUsize::new(0),
            fail_acquire: AtomicBool::new(false),
        }
    }

    /// Focus axis the signal depends on
    pub fn focused_by(mut self, focuser: Arc<MockFocuser>) -> Self {
        self.focuser = Some(focuser);
        self
    }

    /// Spectrograph whose grating is passed to the response
    pub fn behind(mut self, spectrograph: Arc<MockSpectrograph>) -> Self {
        self.spectrograph = Some(spectrograph);
        self
    }

    /// Light source scaling the signal
    pub fn lit_by(mut self, light: Arc<MockLight>) -> Self {
        self.light = Some(light);
        self
    }

    /// Background source gating the signal
    pub fn with_background(mut self, background: Arc<MockBackground>) -> Self {
        self.background = Some(background);
        self
    }

    /// 1x1 frames with `response(z)` as signal
    pub fn with_response(mut self, response: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.model = ImageModel::Response(Arc::new(move |z, _| response(z)));
        self
    }

    /// 1x1 frames with `response(z, grating)` as signal (grating 0 without spectrograph)
    pub fn with_grating_response(
        mut self,
        response: impl Fn(f64, GratingId) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.model = ImageModel::Response(Arc::new(move |z, g| response(z, g.unwrap_or(0))));
        self
    }

    /// Gaussian spot of width `sigma` pixels at `best`, widening by
    /// `blur_per_m` pixels per meter of defocus
    pub fn with_spot(mut self, best: f64, sigma: f64, blur_per_m: f64, energy: f64) -> Self {
        self.model = ImageModel::Spot {
            best,
            sigma,
            blur_per_m,
            energy,
        };
        self
    }

    /// Constant offset added to every pixel
    pub fn with_dark_level(mut self, level: f64) -> Self {
        self.dark_level = level;
        self
    }

    /// Uniform noise amplitude added to every pixel
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Initial exposure time (`None` for no exposure control)
    pub fn with_exposure(self, exposure: Option<Duration>) -> Self {
        *self.exposure.lock() = exposure;
        self
    }

    /// Largest binning accepted
    pub fn with_max_binning(mut self, max: (u32, u32)) -> Self {
        self.max_binning = Some(max);
        self
    }

    /// Reported depth of field
    pub fn with_depth_of_field(mut self, dof: f64) -> Self {
        self.depth_of_field = Some(dof);
        self
    }

    /// Duration of each acquisition
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Number of frames acquired so far
    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Make every following acquisition fail
    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    fn signal_gain(&self) -> f64 {
        let light = self.light.as_ref().map_or(1.0, |l| l.emitted_fraction());
        let source = match &self.background {
            Some(bg) if !bg.is_enabled() => 0.0,
            _ => 1.0,
        };
        light * source
    }

    fn render(&self) -> Result<Frame> {
        let z = self.focuser.as_ref().map_or(0.0, |f| f.current());
        let grating = self.spectrograph.as_ref().map(|s| s.current().grating);
        let gain = self.signal_gain();
        let mut rng = rand::thread_rng();
        let mut jitter = || {
            if self.noise > 0.0 {
                rng.gen_range(-self.noise..=self.noise)
            } else {
                0.0
            }
        };

        match &self.model {
            ImageModel::Response(response) => {
                let value = self.dark_level + gain * response(z, grating) + jitter();
                Ok(Frame::scalar(value))
            }
            ImageModel::Spot {
                best,
                sigma,
                blur_per_m,
                energy,
            } => {
                let (width, height) = self.resolution;
                let width_px = sigma + blur_per_m * (z - best).abs();
                let peak = energy / (2.0 * std::f64::consts::PI * width_px * width_px);
                let (cx, cy) = (f64::from(width) / 2.0, f64::from(height) / 2.0);
                let mut data = Vec::with_capacity(width as usize * height as usize);
                for y in 0..height {
                    for x in 0..width {
                        let dx = f64::from(x) + 0.5 - cx;
                        let dy = f64::from(y) + 0.5 - cy;
                        let r2 = dx * dx + dy * dy;
                        let spot = peak * (-r2 / (2.0 * width_px * width_px)).exp();
                        data.push(self.dark_level + gain * spot + jitter());
                    }
                }
                Frame::new(width, height, data)
            }
        }
    }
}

impl Component for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }
}

#[async_trait]
impl Detector for MockCamera {
    async fn acquire(&self) -> Result<Frame> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(anyhow!("{}: readout error", self.name));
        }
        pause(self.acquire_delay).await;
        let frame = self.render()?;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn kind(&self) -> DetectorKind {
        self.kind
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn exposure_time(&self) -> Option<Duration> {
        *self.exposure.lock()
    }

    fn binning(&self) -> (u32, u32) {
        *self.binning.lock()
    }

    fn max_binning(&self) -> Option<(u32, u32)> {
        self.max_binning
    }

    fn depth_of_field(&self) -> Option<f64> {
        self.depth_of_field
    }

    async fn set_binning(&self, binning: (u32, u32)) -> Result<(u32, u32)> {
        let max = self
            .max_binning
            .ok_or_else(|| anyhow!("{}: binning not supported", self.name))?;
        let applied = (binning.0.clamp(1, max.0), binning.1.clamp(1, max.1));
        *self.binning.lock() = applied;
        Ok(applied)
    }

    async fn set_exposure_time(&self, exposure: Duration) -> Result<Duration> {
        let mut current = self.exposure.lock();
        if current.is_none() {
            return Err(anyhow!("{}: exposure control not supported", self.name));
        }
        let applied = exposure.clamp(Duration::from_micros(10), Duration::from_secs(60));
        *current = Some(applied);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_focuser_clips_to_range() {
        let focuser = MockFocuser::new("focus", "focus", (0.0, 10.0));
        assert_eq!(focuser.current(), 5.0);
        assert_eq!(focuser.move_abs(12.0).await.unwrap(), 10.0);
        assert_eq!(focuser.move_abs(-1.0).await.unwrap(), 0.0);
        assert_eq!(focuser.moves(), vec![10.0, 0.0]);
    }

    #[tokio::test]
    async fn test_focuser_failure() {
        let focuser = MockFocuser::new("focus", "focus", (0.0, 10.0));
        focuser.set_fail_moves(true);
        assert!(focuser.move_abs(1.0).await.is_err());
        assert!(focuser.moves().is_empty());
    }

    #[tokio::test]
    async fn test_camera_follows_focus() {
        let focuser = Arc::new(MockFocuser::new("focus", "focus", (0.0, 100.0)));
        let camera = MockCamera::new("ccd", "ccd", DetectorKind::Camera, (1, 1))
            .focused_by(focuser.clone())
            .with_response(|z| -(z - 30.0).abs());

        focuser.move_abs(30.0).await.unwrap();
        let sharp = camera.acquire().await.unwrap().mean();
        focuser.move_abs(60.0).await.unwrap();
        let blurred = camera.acquire().await.unwrap().mean();
        assert!(sharp > blurred);
        assert_eq!(camera.acquisition_count(), 2);
    }

    #[tokio::test]
    async fn test_spot_energy_is_conserved() {
        let focuser = Arc::new(MockFocuser::new("focus", "focus", (0.0, 1e-3)).at(0.0));
        let camera = MockCamera::new("ccd", "ccd", DetectorKind::Camera, (64, 64))
            .focused_by(focuser.clone())
            .with_spot(0.0, 2.0, 5e3, 1000.0);

        let sharp = camera.acquire().await.unwrap();
        focuser.move_abs(1e-3).await.unwrap();
        let blurred = camera.acquire().await.unwrap();

        let total = |f: &Frame| f.data.iter().sum::<f64>();
        assert!((total(&sharp) - 1000.0).abs() < 10.0);
        assert!((total(&blurred) - 1000.0).abs() < 10.0);
        let peak = |f: &Frame| f.data.iter().cloned().fold(f64::MIN, f64::max);
        assert!(peak(&sharp) > peak(&blurred));
    }

    #[tokio::test]
    async fn test_light_scales_signal() {
        let light = Arc::new(MockLight::new("light", "brightlight", 2.0));
        let camera = MockCamera::new("ccd", "ccd", DetectorKind::Camera, (1, 1))
            .lit_by(light.clone())
            .with_dark_level(1.0)
            .with_response(|_| 10.0);

        assert_eq!(camera.acquire().await.unwrap().mean(), 1.0);
        light.set_power(2.0).await.unwrap();
        assert_eq!(camera.acquire().await.unwrap().mean(), 11.0);
        light.set_power(0.0).await.unwrap();
        assert_eq!(light.off_count(), 1);
        assert!(!light.is_on());
    }

    #[tokio::test]
    async fn test_light_warmup() {
        let light = MockLight::new("light", "brightlight", 1.0).with_warmup(Duration::from_secs(3600));
        light.set_power(1.0).await.unwrap();
        assert!(light.is_on());
        assert_eq!(light.emitted_fraction(), 0.0);
    }

    #[tokio::test]
    async fn test_camera_binning_and_exposure() {
        let camera = MockCamera::new("ccd", "ccd", DetectorKind::Camera, (256, 256))
            .with_max_binning((4, 1));
        assert_eq!(camera.set_binning((2, 2)).await.unwrap(), (2, 1));
        let exp = camera.set_exposure_time(Duration::from_millis(400)).await.unwrap();
        assert_eq!(exp, Duration::from_millis(400));

        let no_control = MockCamera::new("pmt", "cl-detector", DetectorKind::PointDetector, (1, 1))
            .with_exposure(None);
        assert!(no_control.set_binning((2, 2)).await.is_err());
        assert!(no_control.set_exposure_time(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_spectrograph_moves() {
        let spgr = MockSpectrograph::new("sp", "spectrograph", &[1, 2]).refusing_zero_order();
        assert!(spgr.move_abs(SpectrographMove::wavelength(0.0)).await.is_err());
        spgr.move_abs(SpectrographMove {
            grating: Some(2),
            wavelength: Some(600e-9),
        })
        .await
        .unwrap();
        assert_eq!(spgr.current().grating, 2);
        assert!(spgr
            .move_abs(SpectrographMove {
                grating: Some(9),
                wavelength: None
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_selector_rejects_unknown_position() {
        let sel = MockSelector::new("sel", "spec-det-selector", &[(0.0, "ccd0"), (1.57, "ccd1")]);
        assert!(sel.move_abs(3.0).await.is_err());
        sel.move_abs(1.57).await.unwrap();
        assert_eq!(sel.current(), 1.57);
    }
}
