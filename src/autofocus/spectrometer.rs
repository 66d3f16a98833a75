//! Spectrometer autofocus over every grating and detector.
//!
//! The focus of a spectrometer depends on both the grating and the output
//! detector, so a binary search is run for every combination, at the 0th
//! order (where the slit image is sharpest). Gratings are the slow axis: the
//! current grating is done first, and within a grating the detector currently
//! selected comes first, to save moves. The original spectrograph position
//! and selector position are restored whatever the outcome.

use super::{autofocus, estimate_autofocus_time, FocusMetric, FocusRequest};
use crate::config::{SearchSettings, SpectrometerSettings};
use crate::error::{AfResult, AutofocusError};
use crate::hardware::{
    Detector, Focuser, GratingId, Selector, Spectrograph, SpectrographMove, SpectrographPosition,
};
use crate::task::{ProgressiveTask, TaskContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One (grating, detector) combination
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AxisCombination {
    /// Grating identifier
    pub grating: GratingId,
    /// Detector name
    pub detector: String,
}

impl AxisCombination {
    /// Build a combination
    pub fn new(grating: GratingId, detector: impl Into<String>) -> Self {
        Self {
            grating,
            detector: detector.into(),
        }
    }
}

/// Best focus position for every combination
pub type FocusMap = BTreeMap<AxisCombination, f64>;

/// Components and settings of a spectrometer autofocus
#[derive(Clone)]
pub struct SpectrometerFocusRequest {
    /// Spectrograph (grating + wavelength)
    pub spectrograph: Arc<dyn Spectrograph>,
    /// Focus actuator of the spectrograph
    pub focuser: Arc<dyn Focuser>,
    /// Detectors at the spectrograph outputs
    pub detectors: Vec<Arc<dyn Detector>>,
    /// Detector selector, required with more than one detector
    pub selector: Option<Arc<dyn Selector>>,
    /// Focus metric for all detectors; built-in per kind if `None`
    pub metric: Option<FocusMetric>,
    /// Constants of each binary search
    pub search: SearchSettings,
    /// Move costs used for progress estimates
    pub costs: SpectrometerSettings,
}

impl std::fmt::Debug for SpectrometerFocusRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrometerFocusRequest")
            .field("spectrograph", &self.spectrograph.name())
            .field("focuser", &self.focuser.name())
            .field(
                "detectors",
                &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("selector", &self.selector.as_ref().map(|s| s.name()))
            .finish()
    }
}

impl SpectrometerFocusRequest {
    /// Request with default settings
    pub fn new(
        spectrograph: Arc<dyn Spectrograph>,
        focuser: Arc<dyn Focuser>,
        detectors: Vec<Arc<dyn Detector>>,
        selector: Option<Arc<dyn Selector>>,
    ) -> Self {
        Self {
            spectrograph,
            focuser,
            detectors,
            selector,
            metric: None,
            search: SearchSettings::default(),
            costs: SpectrometerSettings::default(),
        }
    }

    /// Inject the focus metric
    pub fn with_metric(mut self, metric: FocusMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Override the search constants
    pub fn with_search(mut self, search: SearchSettings) -> Self {
        self.search = search;
        self
    }

    /// Override the move costs
    pub fn with_costs(mut self, costs: SpectrometerSettings) -> Self {
        self.costs = costs;
        self
    }

    fn focus_request(&self, detector: &Arc<dyn Detector>) -> FocusRequest {
        let request = FocusRequest::new(Arc::clone(detector), Arc::clone(&self.focuser))
            .with_settings(self.search.clone());
        match &self.metric {
            Some(metric) => request.with_metric(metric.clone()),
            None => request,
        }
    }
}

fn remaining_moves(ngs: usize, nds: usize) -> (usize, usize) {
    let grating_moves = if ngs > 1 { ngs } else { 0 };
    let selector_moves = ngs * nds.saturating_sub(1) + usize::from(nds > 1);
    (grating_moves, selector_moves)
}

fn moves_cost(grating_moves: usize, selector_moves: usize, costs: &SpectrometerSettings) -> Duration {
    costs.grating_move_time.saturating_mul(grating_moves as u32)
        + costs.selector_move_time.saturating_mul(selector_moves as u32)
}

/// Estimated duration of [`autofocus_spectrometer`].
///
/// One binary search per combination (estimated on the first detector), one
/// grating move per grating when there are several, and the selector moves.
pub fn total_spectrometer_focus_time(request: &SpectrometerFocusRequest) -> Duration {
    let Some(first) = request.detectors.first() else {
        return Duration::ZERO;
    };
    let ngs = request.spectrograph.gratings().len();
    let nds = request.detectors.len();
    let per_search = estimate_autofocus_time(&request.focus_request(first));
    let (grating_moves, selector_moves) = remaining_moves(ngs, nds);
    per_search.saturating_mul((ngs * nds) as u32)
        + moves_cost(grating_moves, selector_moves, &request.costs)
}

/// Whether `description` names `detector` as one of its tokens
fn names_detector(description: &str, detector: &str) -> bool {
    description
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .any(|token| token == detector)
}

/// Detector name to selector position
fn map_detectors_to_selector(
    selector: &dyn Selector,
    detectors: &[Arc<dyn Detector>],
) -> AfResult<HashMap<String, f64>> {
    let mut mapping = HashMap::new();
    for (position, description) in selector.choices() {
        for detector in detectors {
            if names_detector(&description, detector.name()) {
                mapping.insert(detector.name().to_string(), position);
            }
        }
    }

    if mapping.len() < detectors.len() {
        let names: Vec<&str> = detectors.iter().map(|d| d.name()).collect();
        return Err(AutofocusError::InvalidConfiguration(format!(
            "Failed to find all detectors ({}) in positions of selector {}",
            names.join(", "),
            selector.name()
        )));
    }
    Ok(mapping)
}

/// Start a spectrometer autofocus.
///
/// The input slit should already be almost closed and a light source on. The
/// task's result maps every (grating, detector) to its best focus position.
/// Invalid requests (no detector, several detectors without a selector, a
/// detector missing from the selector positions) are rejected before the task
/// starts.
pub fn autofocus_spectrometer(
    request: SpectrometerFocusRequest,
) -> AfResult<ProgressiveTask<FocusMap>> {
    if request.detectors.is_empty() {
        return Err(AutofocusError::InvalidConfiguration(
            "At least one detector must be provided".to_string(),
        ));
    }
    let selection = match &request.selector {
        Some(selector) => Some((
            Arc::clone(selector),
            map_detectors_to_selector(selector.as_ref(), &request.detectors)?,
        )),
        None if request.detectors.len() > 1 => {
            return Err(AutofocusError::InvalidConfiguration(
                "No selector provided, but multiple detectors".to_string(),
            ));
        }
        None => None,
    };

    let estimate = total_spectrometer_focus_time(&request);
    info!(
        detectors = request.detectors.len(),
        gratings = request.spectrograph.gratings().len(),
        ?estimate,
        "starting spectrometer autofocus"
    );
    Ok(ProgressiveTask::spawn(
        "spectrometer-autofocus",
        estimate,
        move |ctx| async move { run(&ctx, &request, selection).await },
    ))
}

type Selection = Option<(Arc<dyn Selector>, HashMap<String, f64>)>;

async fn run(
    ctx: &TaskContext,
    request: &SpectrometerFocusRequest,
    selection: Selection,
) -> AfResult<FocusMap> {
    let orig = request.spectrograph.position().await?;
    let sel_orig = match &selection {
        Some((selector, _)) => Some(selector.position().await?),
        None => None,
    };

    let result = focus_all(ctx, request, &selection, orig).await;
    if let Err(err) = &result {
        debug!("Spectrometer autofocus ended early: {err}");
    }

    let restored = restore(request, &selection, orig, sel_orig).await;
    match (result, restored) {
        (Ok(map), Ok(())) => Ok(map),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), _) => Err(err),
    }
}

async fn restore(
    request: &SpectrometerFocusRequest,
    selection: &Selection,
    orig: SpectrographPosition,
    sel_orig: Option<f64>,
) -> AfResult<()> {
    let mut outcome = Ok(());
    if let Err(err) = request.spectrograph.move_abs(SpectrographMove::to(orig)).await {
        error!("Failed to restore spectrograph position: {err:#}");
        outcome = Err(AutofocusError::from(err));
    }
    if let (Some((selector, _)), Some(position)) = (selection, sel_orig) {
        if let Err(err) = selector.move_abs(position).await {
            error!("Failed to restore selector position: {err:#}");
            if outcome.is_ok() {
                outcome = Err(AutofocusError::from(err));
            }
        }
    }
    outcome
}

async fn focus_all(
    ctx: &TaskContext,
    request: &SpectrometerFocusRequest,
    selection: &Selection,
    orig: SpectrographPosition,
) -> AfResult<FocusMap> {
    ctx.check_cancelled()?;

    let mut gratings = request.spectrograph.gratings();
    // Stable sort: current grating first, the others in their order
    gratings.sort_by_key(|g| *g != orig.grating);

    let ngs = gratings.len();
    let nds = request.detectors.len();
    let mut pairs_left = ngs * nds;
    let (mut grating_moves, mut selector_moves) = remaining_moves(ngs, nds);
    let mut focus_map = FocusMap::new();

    for grating in gratings {
        let detectors = match selection {
            Some((selector, mapping)) => {
                let current = selector.position().await?;
                let mut detectors = request.detectors.clone();
                detectors.sort_by_key(|d| mapping.get(d.name()) != Some(&current));
                detectors
            }
            None => request.detectors.clone(),
        };

        for detector in detectors {
            debug!("Autofocusing on grating {}, detector {}", grating, detector.name());

            if let Some((selector, mapping)) = selection {
                if let Some(&target) = mapping.get(detector.name()) {
                    if selector.position().await? != target {
                        selector_moves = selector_moves.saturating_sub(1);
                    }
                    selector.move_abs(target).await?;
                }
            }

            let zero_order = SpectrographMove {
                grating: Some(grating),
                wavelength: Some(0.0),
            };
            let moved = async {
                if request.spectrograph.position().await?.grating != grating {
                    grating_moves = grating_moves.saturating_sub(1);
                }
                request.spectrograph.move_abs(zero_order).await
            };
            if let Err(err) = moved.await {
                warn!("Failed to move to 0th order for grating {grating}: {err:#}");
            }

            ctx.check_cancelled()?;

            let started = Instant::now();
            let search = autofocus(request.focus_request(&detector));
            let outcome = ctx.run_subtask(&search, None).await?;
            info!(
                grating,
                detector = detector.name(),
                position = outcome.position,
                confidence = outcome.confidence,
                "focus found"
            );
            focus_map.insert(AxisCombination::new(grating, detector.name()), outcome.position);

            pairs_left -= 1;
            let remaining = started.elapsed().saturating_mul(pairs_left as u32)
                + moves_cost(grating_moves, selector_moves, &request.costs);
            ctx.set_remaining(remaining);

            ctx.check_cancelled()?;
        }
    }

    Ok(focus_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCamera, MockFocuser, MockSelector, MockSpectrograph};
    use crate::hardware::DetectorKind;

    fn cam(name: &str) -> Arc<dyn Detector> {
        Arc::new(MockCamera::new(name, name, DetectorKind::Camera, (1, 1)))
    }

    #[test]
    fn detector_tokens_match_exactly() {
        assert!(names_detector("ccd0", "ccd0"));
        assert!(names_detector("ccd0, sp-ccd1", "sp-ccd1"));
        assert!(!names_detector("sp-ccd1", "ccd1"));
        assert!(!names_detector("ccd10", "ccd1"));
    }

    #[test]
    fn selector_must_reach_every_detector() {
        let selector = MockSelector::new("sel", "spec-det-selector", &[(0.0, "ccd0"), (1.5, "sp-ccd1")]);
        let mapping = map_detectors_to_selector(&selector, &[cam("ccd0"), cam("sp-ccd1")]).unwrap();
        assert_eq!(mapping["sp-ccd1"], 1.5);

        let err = map_detectors_to_selector(&selector, &[cam("ccd0"), cam("ccd2")]).unwrap_err();
        assert!(matches!(err, AutofocusError::InvalidConfiguration(_)));
    }

    #[test]
    fn move_counts() {
        assert_eq!(remaining_moves(1, 1), (0, 0));
        assert_eq!(remaining_moves(2, 1), (2, 0));
        assert_eq!(remaining_moves(2, 2), (2, 3));
        assert_eq!(remaining_moves(3, 2), (3, 4));
    }

    #[tokio::test]
    async fn total_time_adds_moves() {
        let spectrograph = Arc::new(MockSpectrograph::new("sp", "spectrograph", &[1, 2]));
        let focuser = Arc::new(MockFocuser::new("focus", "focus", (0.0, 1e-3)));
        let selector = Arc::new(MockSelector::new("sel", "spec-det-selector", &[(0.0, "a"), (1.0, "b")]));
        let request = SpectrometerFocusRequest::new(
            spectrograph,
            focuser,
            vec![cam("a"), cam("b")],
            Some(selector),
        );
        let per_search = estimate_autofocus_time(&request.focus_request(&request.detectors[0]));
        let expected = per_search * 4 + Duration::from_secs(2 * 20 + 3 * 5);
        assert_eq!(total_spectrometer_focus_time(&request), expected);
    }
}
