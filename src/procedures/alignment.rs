//! Spectrograph alignment: the full focus procedure and its manual variant.

use super::cleanup::CleanupRegistry;
use super::light::{light_off, light_on, turn_on_light};
use super::{AlignMode, ProcedureStage, StageQueue};
use crate::autofocus::{
    acquire_no_background, autofocus_spectrometer, total_spectrometer_focus_time, FocusMap,
    FocusMetric, SpectrometerFocusRequest,
};
use crate::config::AutofocusConfig;
use crate::error::{AfResult, AutofocusError};
use crate::hardware::{Detector, DeviceInventory, FocusComponents, OpticalPathManager, SpectrographMove};
use crate::task::{ProgressiveTask, TaskContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const LIGHT_OFF: &str = "light-off";

/// Everything the alignment procedure needs, moved into its task.
#[derive(Clone)]
pub struct AlignmentRequest {
    /// Optical path mode to focus for
    pub mode: AlignMode,
    /// Components resolved for the mode
    pub components: FocusComponents,
    /// Optical path manager
    pub path: Arc<dyn OpticalPathManager>,
    /// Run the spectrometer autofocus; `false` only prepares the hardware for
    /// a manual focus
    pub run_autofocus: bool,
    /// Focus metric; built-in per detector kind if `None`
    pub metric: Option<FocusMetric>,
    /// Search constants, move costs and stage estimates
    pub config: AutofocusConfig,
}

impl std::fmt::Debug for AlignmentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignmentRequest")
            .field("mode", &self.mode)
            .field("components", &self.components)
            .field("run_autofocus", &self.run_autofocus)
            .finish()
    }
}

impl AlignmentRequest {
    /// Full procedure with default settings
    pub fn new(mode: AlignMode, components: FocusComponents, path: Arc<dyn OpticalPathManager>) -> Self {
        Self {
            mode,
            components,
            path,
            run_autofocus: true,
            metric: None,
            config: AutofocusConfig::default(),
        }
    }

    /// Resolve the components of `mode` from the inventory
    pub fn from_inventory(
        inventory: &DeviceInventory,
        mode: AlignMode,
        path: Arc<dyn OpticalPathManager>,
        config: &AutofocusConfig,
    ) -> AfResult<Self> {
        let components = inventory.resolve(mode)?;
        Ok(Self::new(mode, components, path).with_config(config.clone()))
    }

    /// Stop after the optical path is set, leaving the light on
    pub fn configuration_only(mut self) -> Self {
        self.run_autofocus = false;
        self
    }

    /// Override the settings
    pub fn with_config(mut self, config: AutofocusConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject the focus metric
    pub fn with_metric(mut self, metric: FocusMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    fn spectrometer_request(&self) -> SpectrometerFocusRequest {
        let c = &self.components;
        let request = SpectrometerFocusRequest::new(
            Arc::clone(&c.spectrograph),
            Arc::clone(&c.focuser),
            c.detectors.clone(),
            c.selector.clone(),
        )
        .with_search(self.config.search.clone())
        .with_costs(self.config.spectrometer.clone());
        match &self.metric {
            Some(metric) => request.with_metric(metric.clone()),
            None => request,
        }
    }

    fn first_detector(&self) -> AfResult<&Arc<dyn Detector>> {
        self.components.detectors.first().ok_or_else(|| {
            AutofocusError::InvalidConfiguration(format!("No detector to focus in mode {}", self.mode))
        })
    }

    /// Stages of this run, with their estimates
    pub fn stages(&self) -> StageQueue {
        let p = &self.config.procedure;
        let mut stages = vec![
            ProcedureStage::new("light-on", p.light_on_estimate),
            ProcedureStage::new("optical-path", p.path_estimate),
        ];
        if self.run_autofocus {
            stages.push(ProcedureStage::new(
                "spectrometer-autofocus",
                total_spectrometer_focus_time(&self.spectrometer_request()),
            ));
            stages.push(ProcedureStage::new("final-image", p.final_image_estimate));
            stages.push(ProcedureStage::new("light-off", p.light_off_estimate));
        }
        StageQueue::new(stages)
    }
}

fn stage_done(ctx: &TaskContext, stages: &mut StageQueue) -> AfResult<()> {
    ctx.check_cancelled()?;
    stages.pop();
    ctx.set_remaining(stages.remaining());
    Ok(())
}

/// Binning clipped to what the detector supports
fn clip_binning(requested: (u32, u32), max: (u32, u32)) -> (u32, u32) {
    (requested.0.clamp(1, max.0.max(1)), requested.1.clamp(1, max.1.max(1)))
}

/// Exposure compensating for a binning smaller than the reference one
fn compensated_exposure(reference: Duration, reference_binning: (u32, u32), binning: (u32, u32)) -> Duration {
    let reference_px = f64::from(reference_binning.0 * reference_binning.1);
    let px = f64::from((binning.0 * binning.1).max(1));
    reference.mul_f64(reference_px / px)
}

async fn configure_detectors(request: &AlignmentRequest) -> AfResult<()> {
    let p = &request.config.procedure;
    for detector in &request.components.detectors {
        let mut binning = (1, 1);
        if let Some(max) = detector.max_binning() {
            binning = detector.set_binning(clip_binning(p.focus_binning, max)).await?;
        }
        if detector.exposure_time().is_some() {
            let exposure = compensated_exposure(p.focus_exposure, p.focus_binning, binning);
            let applied = detector.set_exposure_time(exposure).await?;
            debug!(detector = detector.name(), ?binning, ?applied, "detector configured");
        }
    }
    Ok(())
}

async fn run_stages(
    ctx: &TaskContext,
    request: &AlignmentRequest,
    stages: &mut StageQueue,
) -> AfResult<Option<FocusMap>> {
    let components = &request.components;
    let first = Arc::clone(request.first_detector()?);
    ctx.check_cancelled()?;

    // 0th order shows the slit image as-is
    components
        .spectrograph
        .move_abs(SpectrographMove::wavelength(0.0))
        .await?;

    debug!("Turning on the light");
    let light_task = turn_on_light(
        Arc::clone(&components.light),
        Arc::clone(&first),
        request.config.procedure.clone(),
        request.config.search.acquisition_timeout_base,
    );
    let light_timeout = request.config.procedure.light_timeout;
    match ctx.run_subtask(&light_task, Some(light_timeout)).await {
        Ok(()) => {}
        Err(AutofocusError::Timeout(_)) => {
            warn!(
                "Light doesn't appear to have turned on after {:?}, will try focusing anyway",
                light_timeout
            );
        }
        Err(err) => return Err(err),
    }
    stage_done(ctx, stages)?;

    debug!("Adjusting the optical path to {}", request.mode);
    request
        .path
        .set_path(request.mode.as_str(), Some(first.name()))
        .await?;
    stage_done(ctx, stages)?;

    if !request.run_autofocus {
        return Ok(None);
    }

    configure_detectors(request).await?;

    let search = autofocus_spectrometer(request.spectrometer_request())?;
    let estimate = stages.pop().map_or(Duration::ZERO, |s| s.estimate);
    let p = &request.config.procedure;
    let timeout = estimate.mul_f64(p.search_timeout_factor) + p.search_timeout_margin;
    let focus_map = {
        let _follower = ctx.follow_subtask(&search, stages.remaining());
        match ctx.run_subtask(&search, Some(timeout)).await {
            Ok(map) => map,
            Err(AutofocusError::Timeout(_)) => {
                error!("Timeout for autofocus spectrometer after {:?}", timeout);
                return Err(AutofocusError::Timeout(format!(
                    "Spectrometer autofocus did not complete within {timeout:?}"
                )));
            }
            Err(err) => return Err(err),
        }
    };
    ctx.check_cancelled()?;
    ctx.set_remaining(stages.remaining());

    debug!("Acquiring the last image");
    let image_timeout =
        request.config.search.acquisition_timeout_base + 2 * first.exposure_time().unwrap_or(Duration::from_secs(1));
    let frame = acquire_no_background(first.as_ref(), None, image_timeout).await?;
    info!(detector = first.name(), mean = frame.mean(), "final image acquired");
    stage_done(ctx, stages)?;

    Ok(Some(focus_map))
}

/// Run the spectrograph focus procedure for `request.mode`.
///
/// Stages: move the spectrograph to the 0th order, turn the light on and wait
/// for it (a timeout is only logged), set the optical path, then when
/// `run_autofocus` is set: configure the detectors, run the spectrometer
/// autofocus (a timeout is fatal), acquire a last image and turn the light
/// off.
///
/// The light is switched off exactly once on every exit path, except after a
/// successful configuration-only run, where it stays on for manual focusing.
/// The result is the focus map, or `None` for a configuration-only run.
#[instrument(skip_all, fields(mode = %request.mode))]
pub fn spectrograph_alignment(request: AlignmentRequest) -> ProgressiveTask<Option<FocusMap>> {
    let mut stages = request.stages();
    let estimate = stages.remaining();
    info!(?estimate, components = ?request.components, "starting spectrograph alignment");

    ProgressiveTask::spawn("spectrograph-alignment", estimate, move |ctx| async move {
        let mut cleanup = CleanupRegistry::new();
        let light = Arc::clone(&request.components.light);
        cleanup.register(LIGHT_OFF, move || async move {
            light_off(light.as_ref()).await?;
            Ok(())
        });

        let outcome = run_stages(&ctx, &request, &mut stages).await;
        match &outcome {
            Ok(None) => {
                info!("Optical path ready for manual focus, leaving the light on");
                cleanup.remove(LIGHT_OFF);
            }
            Ok(Some(_)) => debug!("Turning off the light"),
            Err(err) if err.is_cancelled() => debug!("Spectrograph alignment cancelled"),
            Err(err) => warn!("Spectrograph alignment failed: {err}"),
        }

        let teardown = cleanup.run_all().await;
        match (outcome, teardown) {
            (Ok(result), Ok(())) => {
                stages.pop();
                Ok(result)
            }
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), _) => Err(err),
        }
    })
}

/// Prepare the hardware for focusing by hand, or end it.
///
/// Toggled on: set the optical path for `mode` while switching the light to
/// its maximum. Toggled off: switch the light to its minimum and leave the
/// optical path as is.
pub fn manual_focus(
    inventory: &DeviceInventory,
    mode: AlignMode,
    path: Arc<dyn OpticalPathManager>,
    toggled: bool,
    config: &AutofocusConfig,
) -> AfResult<ProgressiveTask<()>> {
    let light = inventory.manual_focus_light(mode)?;
    let estimate = config.procedure.manual_focus_estimate;

    Ok(ProgressiveTask::spawn("manual-focus", estimate, move |ctx| async move {
        ctx.check_cancelled()?;
        if toggled {
            debug!("Manual focus on in mode {}", mode);
            let (path_set, lit) = tokio::join!(
                path.set_path(mode.as_str(), None),
                light_on(light.as_ref())
            );
            lit?;
            path_set?;
        } else {
            debug!("Manual focus off in mode {}", mode);
            light_off(light.as_ref()).await?;
        }
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binning_is_clipped() {
        assert_eq!(clip_binning((2, 2), (4, 4)), (2, 2));
        assert_eq!(clip_binning((2, 2), (4, 1)), (2, 1));
        assert_eq!(clip_binning((2, 2), (0, 0)), (1, 1));
    }

    #[test]
    fn exposure_compensates_binning() {
        let reference = Duration::from_millis(200);
        assert_eq!(compensated_exposure(reference, (2, 2), (2, 2)), reference);
        assert_eq!(compensated_exposure(reference, (2, 2), (2, 1)), Duration::from_millis(400));
        assert_eq!(compensated_exposure(reference, (2, 2), (1, 1)), Duration::from_millis(800));
    }
}
