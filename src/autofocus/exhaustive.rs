//! Exhaustive focus search.
//!
//! Sweeps upwards from the start position to the upper bound, then downwards
//! from one step below the start to the lower bound, measuring at every
//! step. As soon as the levels show a significant peak the sweep stops and a
//! binary search refines the best position within a small window. Without
//! any peak the refinement runs around the best position of the full sweep.

use super::binary::binary_focus;
use super::{default_deviation, FocusOutcome, FocusProbe, FocusRequest, FocusSample, SearchRange};
use crate::error::{AfResult, AutofocusError};
use crate::task::TaskContext;
use tracing::{debug, warn};

/// `n` evenly spaced values from `start` to `stop`, both included.
pub(crate) fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Number of steps of `step` fitting in `distance`, 0 when negative
fn step_count(distance: f64, step: f64) -> usize {
    let n = (distance / step).trunc();
    if n.is_finite() && n > 0.0 {
        n as usize
    } else {
        0
    }
}

enum SweepEnd {
    /// The levels showed a peak; refine around the best sample
    Peak,
    /// Sweep done without finding a peak
    Exhausted,
}

struct Sweep<'a> {
    ctx: &'a TaskContext,
    request: &'a FocusRequest,
    probe: FocusProbe<'a>,
    levels: Vec<f64>,
    best: Option<FocusSample>,
}

impl Sweep<'_> {
    async fn run(&mut self, positions: Vec<f64>) -> AfResult<SweepEnd> {
        let min_steps = self.request.settings.min_sweep_steps;
        let deviation = self.request.deviation.clone().unwrap_or_else(default_deviation);

        for position in positions {
            let reached = self.request.focuser.move_abs(position).await?;
            let level = self.probe.score().await?;
            debug!("Focus level at {reached:.7e} is {level:.7e}");
            self.levels.push(level);
            if improves(self.best, level) {
                self.best = Some(FocusSample {
                    position: reached,
                    score: level,
                });
            }
            self.ctx.check_cancelled()?;

            if self.levels.len() >= min_steps && deviation(&self.levels) {
                debug!("Significant focus level deviation found at {:e}", reached);
                return Ok(SweepEnd::Peak);
            }
        }
        Ok(SweepEnd::Exhausted)
    }
}

/// Whether `level` replaces `best`; ties go to the latest sample
fn improves(best: Option<FocusSample>, level: f64) -> bool {
    match best {
        Some(best) => level >= best.score,
        None => true,
    }
}

/// Sweep phase; returns the best sample and the refinement window around it
async fn sweep_range(
    ctx: &TaskContext,
    request: &FocusRequest,
    sweep: &mut Sweep<'_>,
    range: SearchRange,
) -> AfResult<(FocusSample, SearchRange)> {
    if let Some(good) = request.good_focus {
        debug!("Moving to good focus position {good:e}");
        request.focuser.move_abs(good).await?;
    }
    let orig = request.focuser.position().await?;
    ctx.check_cancelled()?;

    let mut step = request.settings.sweep_dof_multiple * request.depth_of_field();
    let min_steps = request.settings.min_sweep_steps.max(1) as f64;
    if range.width() < min_steps * step {
        step = range.width() / min_steps;
        debug!("Focus range < {min_steps} steps, adjusting step size to {step:e} m");
    }

    let upwards = linspace(orig, range.upper, step_count(range.upper - orig, step));
    let mut end = sweep.run(upwards).await?;

    if matches!(end, SweepEnd::Exhausted) {
        ctx.check_cancelled()?;
        let downwards = linspace(orig - step, range.lower, step_count(orig - range.lower, step));
        end = sweep.run(downwards).await?;
    }
    ctx.check_cancelled()?;

    let best = match sweep.best {
        Some(best) => best,
        None => FocusSample {
            position: orig,
            score: 0.0,
        },
    };
    if matches!(end, SweepEnd::Exhausted) {
        debug!(
            "No significant focus level was found, moving to the best position found {:e}",
            best.position
        );
        request.focuser.move_abs(best.position).await?;
    }

    let half_width = request.settings.fallback_window_steps * step;
    let window = SearchRange::new(best.position - half_width, best.position + half_width)
        .intersect((range.lower, range.upper))?;
    Ok((best, window))
}

/// Run an exhaustive search inside the task of `ctx`.
///
/// On cancellation during the sweep, the focuser is moved to the best
/// position measured so far. The refinement phase handles its own
/// cancellation.
pub async fn exhaustive_focus(ctx: &TaskContext, request: &FocusRequest) -> AfResult<FocusOutcome> {
    let range = request.effective_range(request.range)?;
    let probe = FocusProbe::new(request);
    debug!(
        "Starting exhaustive autofocus on detector {} with metric {}",
        request.detector.name(),
        probe.metric_name()
    );

    let mut sweep = Sweep {
        ctx,
        request,
        probe,
        levels: Vec::new(),
        best: None,
    };
    let (best, window) = match sweep_range(ctx, request, &mut sweep, range).await {
        Ok(found) => found,
        Err(err) if err.is_cancelled() || ctx.is_cancelled() => {
            if let Some(best) = sweep.best {
                debug!("Search cancelled, going back to best position {:e}", best.position);
                if let Err(move_err) = request.focuser.move_abs(best.position).await {
                    warn!("Failed to move back to best focus: {move_err:#}");
                }
            }
            return Err(AutofocusError::Cancelled);
        }
        Err(err) => return Err(err),
    };

    debug!("Refining around {:e} within {:?}", best.position, window);
    binary_focus(ctx, request, Some(best.position), Some(window)).await
}
