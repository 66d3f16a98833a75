//! Dichotomic focus search.
//!
//! Starting from the current position, the search measures the focus level at
//! the center and at `center ± factor * min_step`, moves to the best of the
//! three and shrinks `factor` when the center wins (or when the best point
//! sits against a range bound). While the search is still "rough" (the
//! maximum has not been bracketed yet), levels already measured at a position
//! are reused instead of re-acquired.

use super::{FocusOutcome, FocusProbe, FocusRequest, FocusSample, SearchRange};
use crate::error::{AfResult, AutofocusError};
use crate::task::TaskContext;
use tracing::{debug, info, warn};

/// Confidence when the iteration budget ran out
pub const CONFIDENCE_EXHAUSTED: f64 = 0.1;
/// Confidence when the levels barely differ
pub const CONFIDENCE_INDECISIVE: f64 = 0.2;
/// Confidence when a clear maximum was found
pub const CONFIDENCE_FOUND: f64 = 0.8;

/// Whether `a` and `b` are equal within a relative tolerance
pub(crate) fn almost_equal(a: f64, b: f64, rtol: f64) -> bool {
    a == b || (a - b).abs() <= rtol * a.abs().max(b.abs())
}

/// Index of the first maximum among `levels`
fn first_argmax(levels: &[f64]) -> usize {
    let mut best = 0;
    for (i, level) in levels.iter().enumerate() {
        if *level > levels[best] {
            best = i;
        }
    }
    best
}

/// Focus levels measured during one search, keyed by exact position.
#[derive(Debug, Default)]
pub(crate) struct LevelCache {
    samples: Vec<FocusSample>,
}

impl LevelCache {
    pub(crate) fn get(&self, position: f64) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.position == position)
            .map(|s| s.score)
    }

    pub(crate) fn insert(&mut self, position: f64, score: f64) {
        match self.samples.iter_mut().find(|s| s.position == position) {
            Some(sample) => sample.score = score,
            None => self.samples.push(FocusSample { position, score }),
        }
    }

    /// Best sample so far; the earliest one on ties
    pub(crate) fn best(&self) -> Option<FocusSample> {
        let mut best: Option<FocusSample> = None;
        for sample in &self.samples {
            match best {
                Some(b) if sample.score <= b.score => {}
                _ => best = Some(*sample),
            }
        }
        best
    }

    pub(crate) fn worst(&self) -> Option<f64> {
        self.samples.iter().map(|s| s.score).reduce(f64::min)
    }
}

struct Search<'a> {
    ctx: &'a TaskContext,
    request: &'a FocusRequest,
    probe: FocusProbe<'a>,
    range: SearchRange,
    levels: LevelCache,
}

impl Search<'_> {
    async fn move_to(&self, position: f64) -> AfResult<f64> {
        Ok(self.request.focuser.move_abs(position).await?)
    }

    async fn measure(&mut self, position: f64, label: &str) -> AfResult<f64> {
        let level = self.probe.score().await?;
        debug!("Focus level ({label}) at {position:.7e} is {level:.7e}");
        self.levels.insert(position, level);
        self.ctx.check_cancelled()?;
        Ok(level)
    }

    /// Measure at `target` (clipped), reusing the cache when `reuse` is set.
    /// Returns the actual position and its level.
    async fn probe_side(
        &mut self,
        target: f64,
        reuse: bool,
        last_pos: &mut Option<f64>,
        label: &str,
    ) -> AfResult<(f64, f64)> {
        let target = self.range.clip(target);
        if reuse {
            if let Some(level) = self.levels.get(target) {
                return Ok((target, level));
            }
        }
        let reached = self.move_to(target).await?;
        *last_pos = Some(reached);
        let level = self.measure(reached, label).await?;
        Ok((reached, level))
    }

    async fn run(&mut self, good_focus: Option<f64>) -> AfResult<FocusOutcome> {
        let request = self.request;
        let settings = &request.settings;
        let mut min_step = request.depth_of_field() / 2.0;
        let max_step = self.range.width() / 2.0;
        debug!(dof = min_step * 2.0, "starting binary search in {:?}", self.range);

        let mut rough_search = true;
        let mut last_pos: Option<f64> = None;
        let mut step_factor = settings.coarse_step_factor;

        if let Some(good) = good_focus {
            let current = self.request.focuser.position().await?;
            let fm_current = self.measure(current, "current").await?;

            let good = self.move_to(good).await?;
            let fm_good = self.measure(good, "good").await?;
            last_pos = Some(good);

            if fm_good < fm_current {
                // Known good position is worse than where we were
                self.move_to(current).await?;
            }
            step_factor = settings.good_focus_step_factor;
        }

        if step_factor * min_step > max_step {
            min_step = max_step / step_factor;
            debug!("Reducing min step to {min_step:e}");
        }

        let mut best = FocusSample {
            position: self.request.focuser.position().await?,
            score: 0.0,
        };
        let mut step_cntr: u32 = 1;
        while step_factor >= 1.0 && step_cntr <= settings.max_steps {
            let center = self.request.focuser.position().await?;
            let cached = self.levels.get(center);
            let fm_center = match cached {
                Some(level) if rough_search || last_pos == Some(center) => level,
                _ => self.measure(center, "center").await?,
            };
            last_pos = Some(center);

            let offset = step_factor * min_step;
            let (right, fm_right) = self
                .probe_side(center + offset, rough_search, &mut last_pos, "right")
                .await?;
            let (left, fm_left) = self
                .probe_side(center - offset, rough_search, &mut last_pos, "left")
                .await?;

            let levels = [fm_left, fm_center, fm_right];
            let i_max = if levels[1..]
                .iter()
                .all(|fm| almost_equal(fm_left, *fm, settings.equal_rtol))
            {
                debug!("All focus levels identical, picking the middle one");
                1
            } else {
                first_argmax(&levels)
            };
            best = FocusSample {
                position: [left, center, right][i_max],
                score: levels[i_max],
            };

            self.ctx.check_cancelled()?;

            if i_max == 1 {
                step_factor /= 2.0;
                if rough_search {
                    debug!("Now zooming in on improved focus");
                }
                rough_search = false;
            } else if self.range.lower > best.position - step_factor * min_step
                || self.range.upper < best.position + step_factor * min_step
            {
                step_factor /= 1.5;
                debug!(
                    "Reducing step factor to {step_factor} because the focus ({:e}) is near the range limit",
                    best.position
                );
                if step_factor <= 8.0 {
                    rough_search = false;
                }
            }

            if last_pos != Some(best.position) {
                best.position = self.range.clip(best.position);
                self.move_to(best.position).await?;
            }

            if left == right {
                info!(
                    "Seems to have reached minimum step size (at {:e} m)",
                    2.0 * step_factor * min_step
                );
                break;
            }
            step_cntr += 1;
        }

        let worst = self.levels.worst().unwrap_or(best.score);
        let confidence = if step_cntr > settings.max_steps {
            info!("Auto focus gave up after {} steps @ {:e} m", settings.max_steps, best.position);
            CONFIDENCE_EXHAUSTED
        } else if best.score - worst <= 0.5 * best.score.abs() {
            // Inclusive so that an all-zero signal counts as indecisive
            info!(
                "Auto focus indecisive but picking level {:e} @ {:e} m (lowest = {:e})",
                best.score, best.position, worst
            );
            CONFIDENCE_INDECISIVE
        } else {
            info!("Auto focus found best level {:e} @ {:e} m", best.score, best.position);
            CONFIDENCE_FOUND
        };

        Ok(FocusOutcome {
            position: best.position,
            score: best.score,
            confidence,
        })
    }
}

/// Run a binary search inside the task of `ctx`.
///
/// `restriction` is intersected with the focuser range. On cancellation the
/// focuser is moved to the best position measured so far and
/// [`AutofocusError::Cancelled`] is returned.
pub async fn binary_focus(
    ctx: &TaskContext,
    request: &FocusRequest,
    good_focus: Option<f64>,
    restriction: Option<SearchRange>,
) -> AfResult<FocusOutcome> {
    let range = request.effective_range(restriction)?;
    let probe = FocusProbe::new(request);
    debug!(
        "Starting binary autofocus on detector {} with metric {}",
        request.detector.name(),
        probe.metric_name()
    );

    let mut search = Search {
        ctx,
        request,
        probe,
        range,
        levels: LevelCache::default(),
    };
    let result = search.run(good_focus).await;

    match result {
        Err(err) if err.is_cancelled() || ctx.is_cancelled() => {
            if let Some(best) = search.levels.best() {
                debug!("Search cancelled, going back to best position {:e}", best.position);
                if let Err(move_err) = request.focuser.move_abs(best.position).await {
                    warn!("Failed to move back to best focus: {move_err:#}");
                }
            }
            Err(AutofocusError::Cancelled)
        }
        other => other,
    }
}
