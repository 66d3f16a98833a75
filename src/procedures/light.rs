//! Light source switching and warm-up detection.

use crate::autofocus::{acquire_no_background, estimate_acquisition_time};
use crate::config::ProcedureSettings;
use crate::error::{AfResult, AutofocusError};
use crate::hardware::{Detector, LightSource};
use crate::task::{ProgressiveTask, TaskContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Set the light to its maximum power
pub async fn light_on(light: &dyn LightSource) -> AfResult<()> {
    let (_, max) = light.power_range();
    light.set_power(max).await?;
    Ok(())
}

/// Set the light to its minimum power
pub async fn light_off(light: &dyn LightSource) -> AfResult<()> {
    let (min, _) = light.power_range();
    debug!("Turning off light {}", light.name());
    light.set_power(min).await?;
    Ok(())
}

/// Whether `level` shows the light compared to the `baseline` taken before
/// switching on
fn is_lit(level: f64, baseline: f64, threshold: f64) -> bool {
    level > baseline && level > baseline * (1.0 + threshold)
}

/// Mean level of one frame, given up on cancellation or after `timeout`
async fn mean_level(ctx: &TaskContext, detector: &dyn Detector, timeout: Duration) -> AfResult<f64> {
    tokio::select! {
        _ = ctx.cancelled() => Err(AutofocusError::Cancelled),
        frame = acquire_no_background(detector, None, timeout) => Ok(frame?.mean()),
    }
}

/// Turn `light` on and wait until `detector` sees it.
///
/// A baseline is measured before switching on, then frames are acquired until
/// the mean level rises above `baseline * (1 + light_threshold)`. Each frame
/// is bounded by `acquisition_timeout_base` plus twice the exposure time. The
/// overall wait has no timeout of its own: the caller bounds it and cancels
/// the task, which also interrupts a pending acquisition.
pub fn turn_on_light(
    light: Arc<dyn LightSource>,
    detector: Arc<dyn Detector>,
    settings: ProcedureSettings,
    acquisition_timeout_base: Duration,
) -> ProgressiveTask<()> {
    ProgressiveTask::spawn("light-on", settings.light_on_estimate, move |ctx| async move {
        let timeout = acquisition_timeout_base + 2 * estimate_acquisition_time(detector.as_ref(), None);
        let baseline = mean_level(&ctx, detector.as_ref(), timeout).await?;
        debug!(baseline, "light baseline on {}", detector.name());
        ctx.check_cancelled()?;

        light_on(light.as_ref()).await?;
        loop {
            ctx.check_cancelled()?;
            let level = mean_level(&ctx, detector.as_ref(), timeout).await?;
            if is_lit(level, baseline, settings.light_threshold) {
                info!(level, baseline, "light {} is on", light.name());
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = sleep(settings.light_poll_interval) => {}
            }
        }
    })
}
