//! Focus metrics and deviation assessment.
//!
//! A [`FocusMetric`] turns a frame into a focus level, higher meaning better
//! focus. Callers inject the metric matching their sample, or take the
//! built-in one for the detector kind with [`FocusMetric::for_kind`].

use crate::hardware::{DetectorKind, Frame};
use std::fmt;
use std::sync::Arc;

/// Minimum ratio between the peak excess and the spread of the other levels
/// for [`assess_deviation`] to report a significant deviation.
pub const DEVIATION_RATIO: f64 = 15.0;

/// Deviation assessment over the focus levels measured so far.
pub type DeviationFn = Arc<dyn Fn(&[f64]) -> bool + Send + Sync>;

type MeasureFn = Arc<dyn Fn(&Frame) -> f64 + Send + Sync>;

/// Named focus measure
#[derive(Clone)]
pub struct FocusMetric {
    name: String,
    measure: MeasureFn,
}

impl fmt::Debug for FocusMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusMetric").field("name", &self.name).finish()
    }
}

impl FocusMetric {
    /// Wrap a measure function
    pub fn new(name: impl Into<String>, measure: impl Fn(&Frame) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            measure: Arc::new(measure),
        }
    }

    /// Metric name, for logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Focus level of `frame`
    pub fn measure(&self, frame: &Frame) -> f64 {
        (self.measure)(frame)
    }

    /// Mean intensity. Suited to signals that peak at focus (e.g. light
    /// through a closed slit on a point detector).
    pub fn mean_intensity() -> Self {
        Self::new("mean", Frame::mean)
    }

    /// Intensity variance: a focused spot concentrates its energy in few pixels.
    pub fn spots() -> Self {
        Self::new("spots", intensity_variance)
    }

    /// Gradient energy along the line profile (column means).
    pub fn line() -> Self {
        Self::new("line", line_gradient_energy)
    }

    /// 2D gradient energy, for scanned (SEM) images.
    pub fn sem() -> Self {
        Self::new("sem", gradient_energy)
    }

    /// Built-in metric for a detector kind
    pub fn for_kind(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::Camera | DetectorKind::DiagnosticCamera => Self::spots(),
            DetectorKind::LineCamera => Self::line(),
            DetectorKind::PointDetector => Self::sem(),
        }
    }
}

fn intensity_variance(frame: &Frame) -> f64 {
    let n = frame.data.len();
    if n == 0 {
        return 0.0;
    }
    let mean = frame.mean();
    frame.data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}

/// Frames whose data doesn't match their dimensions score zero
fn indexable(frame: &Frame) -> bool {
    if frame.is_consistent() {
        return true;
    }
    tracing::warn!(
        width = frame.width,
        height = frame.height,
        values = frame.data.len(),
        "inconsistent frame, scoring 0"
    );
    false
}

fn line_gradient_energy(frame: &Frame) -> f64 {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w < 2 || h == 0 || !indexable(frame) {
        return 0.0;
    }
    let profile: Vec<f64> = (0..w)
        .map(|x| (0..h).map(|y| frame.data[y * w + x]).sum::<f64>() / h as f64)
        .collect();
    let energy: f64 = profile.windows(2).map(|p| (p[1] - p[0]).powi(2)).sum();
    energy / (w - 1) as f64
}

fn gradient_energy(frame: &Frame) -> f64 {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w * h < 2 || !indexable(frame) {
        return 0.0;
    }
    let mut energy = 0.0;
    let mut count = 0usize;
    for y in 0..h {
        for x in 0..w {
            let v = frame.data[y * w + x];
            if x + 1 < w {
                energy += (frame.data[y * w + x + 1] - v).powi(2);
                count += 1;
            }
            if y + 1 < h {
                energy += (frame.data[(y + 1) * w + x] - v).powi(2);
                count += 1;
            }
        }
    }
    energy / count as f64
}

/// Whether the levels contain a significant peak rather than only noise.
///
/// The peak excess is the distance between the maximum and the mean of the
/// other levels; it is significant when larger than [`DEVIATION_RATIO`] times
/// their standard deviation.
pub fn assess_deviation(levels: &[f64]) -> bool {
    if levels.len() < 2 {
        return false;
    }
    let Some((i_max, max)) = levels
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
    else {
        return false;
    };

    let others: Vec<f64> = levels
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != i_max)
        .map(|(_, v)| *v)
        .collect();
    let n = others.len() as f64;
    let mean = others.iter().sum::<f64>() / n;
    let std = (others.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let excess = (max - mean).abs();

    tracing::trace!(std, mean, excess, "focus level deviation");
    excess > 0.0 && excess > DEVIATION_RATIO * std
}

/// [`assess_deviation`] as an injectable function
pub fn default_deviation() -> DeviationFn {
    Arc::new(assess_deviation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot(width_px: f64) -> Frame {
        let size = 32u32;
        let c = size as f64 / 2.0;
        let peak = 1000.0 / (2.0 * std::f64::consts::PI * width_px * width_px);
        let data = (0..size * size)
            .map(|i| {
                let (x, y) = ((i % size) as f64 + 0.5 - c, (i / size) as f64 + 0.5 - c);
                peak * (-(x * x + y * y) / (2.0 * width_px * width_px)).exp()
            })
            .collect();
        Frame::new(size, size, data).unwrap()
    }

    #[test]
    fn sharper_spot_scores_higher() {
        for metric in [FocusMetric::spots(), FocusMetric::sem(), FocusMetric::line()] {
            let sharp = metric.measure(&spot(1.5));
            let blurred = metric.measure(&spot(4.0));
            assert!(sharp > blurred, "{} failed: {} <= {}", metric.name(), sharp, blurred);
        }
    }

    #[test]
    fn flat_frame_scores_zero() {
        let flat = Frame::new(4, 4, vec![3.0; 16]).unwrap();
        assert_eq!(FocusMetric::spots().measure(&flat), 0.0);
        assert_eq!(FocusMetric::sem().measure(&flat), 0.0);
        assert_eq!(FocusMetric::line().measure(&flat), 0.0);
        assert_eq!(FocusMetric::sem().measure(&Frame::scalar(2.0)), 0.0);
    }

    #[test]
    fn inconsistent_frame_scores_zero() {
        let mut frame = spot(1.5);
        frame.data.truncate(100);
        assert!(!frame.is_consistent());
        assert_eq!(FocusMetric::line().measure(&frame), 0.0);
        assert_eq!(FocusMetric::sem().measure(&frame), 0.0);

        frame.width = 4;
        frame.height = 25;
        frame.data = (0..100).map(f64::from).collect();
        assert!(FocusMetric::sem().measure(&frame) > 0.0);
    }

    #[test]
    fn kind_selects_metric() {
        assert_eq!(FocusMetric::for_kind(DetectorKind::Camera).name(), "spots");
        assert_eq!(FocusMetric::for_kind(DetectorKind::DiagnosticCamera).name(), "spots");
        assert_eq!(FocusMetric::for_kind(DetectorKind::LineCamera).name(), "line");
        assert_eq!(FocusMetric::for_kind(DetectorKind::PointDetector).name(), "sem");
    }

    #[test]
    fn deviation_detects_peak_only() {
        let noise = [1.0, 1.1, 0.9, 1.05, 0.95, 1.0, 1.02, 0.98, 1.0, 1.1];
        assert!(!assess_deviation(&noise));

        let mut peaked = noise.to_vec();
        peaked.push(50.0);
        assert!(assess_deviation(&peaked));

        assert!(!assess_deviation(&[2.0; 12]));
        assert!(!assess_deviation(&[1.0]));
    }
}
