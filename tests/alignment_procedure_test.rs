//! Integration tests for the spectrograph alignment procedure and manual focus
//!
//! The light must be switched off exactly once on every exit path, except
//! after a successful configuration-only run.

use rust_autofocus::autofocus::{AxisCombination, FocusMetric};
use rust_autofocus::config::AutofocusConfig;
use rust_autofocus::hardware::mock::{
    MockCamera, MockFocuser, MockLight, MockOpticalPath, MockSelector, MockSpectrograph,
};
use rust_autofocus::hardware::{Detector, DetectorKind, DeviceInventory, SpectrographMove};
use rust_autofocus::procedures::{manual_focus, spectrograph_alignment, AlignMode, AlignmentRequest};
use rust_autofocus::AutofocusError;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn truth(grating: u32, offset: f64) -> f64 {
    45.0 + 2.0 * f64::from(grating) + offset
}

struct Instrument {
    inventory: DeviceInventory,
    spectrograph: Arc<MockSpectrograph>,
    light: Arc<MockLight>,
    path: Arc<MockOpticalPath>,
}

fn instrument(warmup: Duration, acquire_delay: Duration) -> Instrument {
    let focuser = Arc::new(
        MockFocuser::new("spec-focus", "focus", (0.0, 100.0)).with_affects(&["ccd0", "sp-ccd1"]),
    );
    let spectrograph = Arc::new(
        MockSpectrograph::new("spectrograph", "spectrograph", &[1, 2]).with_affects(&["ccd0", "sp-ccd1"]),
    );
    let selector = Arc::new(
        MockSelector::new("selector", "spec-det-selector", &[(0.0, "ccd0"), (1.0, "sp-ccd1")])
            .with_affects(&["ccd0", "sp-ccd1"]),
    );
    let light = Arc::new(
        MockLight::new("brightlight", "brightlight", 1.0)
            .with_affects(&["ccd0"])
            .with_warmup(warmup),
    );

    let mut inventory = DeviceInventory::new();
    inventory.add_focuser(focuser.clone()).unwrap();
    inventory.add_spectrograph(spectrograph.clone()).unwrap();
    inventory.add_selector(selector).unwrap();
    inventory.add_light(light.clone()).unwrap();
    for (name, role, offset) in [("ccd0", "ccd", 0.0), ("sp-ccd1", "sp-ccd", -4.0)] {
        let camera = MockCamera::new(name, role, DetectorKind::LineCamera, (1, 1))
            .focused_by(focuser.clone())
            .behind(spectrograph.clone())
            .lit_by(light.clone())
            .with_dark_level(10.0)
            .with_depth_of_field(2.0)
            .with_acquire_delay(acquire_delay)
            .with_grating_response(move |z, g| 1000.0 / (1.0 + ((z - truth(g, offset)) / 5.0).powi(2)));
        inventory.add_detector(Arc::new(camera)).unwrap();
    }

    Instrument {
        inventory,
        spectrograph,
        light,
        path: Arc::new(MockOpticalPath::new()),
    }
}

fn fast_config() -> AutofocusConfig {
    let mut config = AutofocusConfig::default();
    config.procedure.light_poll_interval = Duration::from_millis(5);
    config
}

fn alignment(inst: &Instrument, config: &AutofocusConfig) -> AlignmentRequest {
    AlignmentRequest::from_inventory(&inst.inventory, AlignMode::SpecFocus, inst.path.clone(), config)
        .unwrap()
        .with_metric(FocusMetric::mean_intensity())
}

#[tokio::test]
async fn test_full_alignment() {
    let inst = instrument(Duration::from_millis(20), Duration::ZERO);
    let map = spectrograph_alignment(alignment(&inst, &fast_config()))
        .result(Some(Duration::from_secs(30)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(map.len(), 4);
    let found = map[&AxisCombination::new(2, "sp-ccd1")];
    assert!((found - truth(2, -4.0)).abs() <= 1.0, "found {found}");

    // 0th order first, then the path is set for the light-checking detector
    assert_eq!(inst.spectrograph.moves()[0], SpectrographMove::wavelength(0.0));
    assert_eq!(
        inst.path.requests(),
        vec![("spec-focus".to_string(), Some("ccd0".to_string()))]
    );
    assert!(!inst.light.is_on());
    assert_eq!(inst.light.off_count(), 1);
}

#[tokio::test]
async fn test_configuration_only_leaves_light_on() {
    let inst = instrument(Duration::from_millis(20), Duration::ZERO);
    let task = spectrograph_alignment(alignment(&inst, &fast_config()).configuration_only());

    assert_eq!(task.result(Some(Duration::from_secs(5))).await, Ok(None));
    assert!(inst.light.is_on());
    assert_eq!(inst.light.off_count(), 0);
    assert_eq!(inst.path.requests().len(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_light_timeout_is_only_a_warning() {
    let inst = instrument(Duration::from_secs(3600), Duration::ZERO);
    let mut config = fast_config();
    config.procedure.light_timeout = Duration::from_millis(50);

    let task = spectrograph_alignment(alignment(&inst, &config).configuration_only());
    assert_eq!(task.result(Some(Duration::from_secs(5))).await, Ok(None));
    assert!(logs_contain("will try focusing anyway"));
    assert_eq!(inst.path.requests().len(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_search_timeout_is_fatal() {
    let inst = instrument(Duration::ZERO, Duration::from_millis(20));
    let mut config = fast_config();
    // Estimate of a few milliseconds per search, no move costs
    config.search.default_move_time = Duration::from_millis(1);
    config.spectrometer.grating_move_time = Duration::ZERO;
    config.spectrometer.selector_move_time = Duration::ZERO;
    config.procedure.focus_exposure = Duration::from_micros(10);
    config.procedure.search_timeout_factor = 1.0;
    config.procedure.search_timeout_margin = Duration::from_millis(50);
    for detector in ["ccd0", "sp-ccd1"] {
        let camera = inst.inventory.detector(detector).unwrap();
        camera.set_exposure_time(Duration::from_micros(10)).await.unwrap();
    }

    let err = spectrograph_alignment(alignment(&inst, &config))
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "unexpected {err:?}");
    assert!(logs_contain("Timeout for autofocus spectrometer"));
    assert_eq!(inst.light.off_count(), 1);
    // The spectrometer search restored the grating before giving up
    assert_eq!(inst.spectrograph.current().grating, 1);
}

#[tokio::test]
#[traced_test]
async fn test_stalled_detector_does_not_block_light_stage() {
    let inst = instrument(Duration::ZERO, Duration::from_secs(3600));
    let mut config = fast_config();
    config.procedure.light_timeout = Duration::from_millis(50);

    let task = spectrograph_alignment(alignment(&inst, &config).configuration_only());
    assert_eq!(task.result(Some(Duration::from_secs(2))).await, Ok(None));
    assert!(logs_contain("will try focusing anyway"));
    assert_eq!(
        inst.path.requests(),
        vec![("spec-focus".to_string(), Some("ccd0".to_string()))]
    );
}

#[tokio::test]
async fn test_cancel_with_stalled_detector() {
    let inst = instrument(Duration::ZERO, Duration::from_secs(3600));
    let task = spectrograph_alignment(alignment(&inst, &fast_config()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(task.cancel());
    assert_eq!(
        task.result(Some(Duration::from_secs(2))).await,
        Err(AutofocusError::Cancelled)
    );
    assert_eq!(inst.light.off_count(), 1);
    assert!(inst.path.requests().is_empty());
}

#[tokio::test]
async fn test_cancel_turns_light_off_once() {
    let inst = instrument(Duration::ZERO, Duration::from_millis(5));
    let task = spectrograph_alignment(alignment(&inst, &fast_config()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(task.cancel());
    assert_eq!(task.result(None).await, Err(AutofocusError::Cancelled));
    assert!(!inst.light.is_on());
    assert_eq!(inst.light.off_count(), 1);
}

#[tokio::test]
async fn test_cancel_before_light_on() {
    let inst = instrument(Duration::from_secs(3600), Duration::ZERO);
    let task = spectrograph_alignment(alignment(&inst, &fast_config()).configuration_only());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(task.cancel());
    assert_eq!(task.result(None).await, Err(AutofocusError::Cancelled));
    // Cancelled configuration runs still turn the light off
    assert_eq!(inst.light.off_count(), 1);
    assert!(inst.path.requests().is_empty());
}

#[tokio::test]
async fn test_path_failure_turns_light_off() {
    let inst = instrument(Duration::ZERO, Duration::ZERO);
    inst.path.set_fail(true);

    let err = spectrograph_alignment(alignment(&inst, &fast_config()))
        .result(Some(Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert!(matches!(err, AutofocusError::HardwareFailure(_)));
    assert_eq!(inst.light.off_count(), 1);
}

#[tokio::test]
async fn test_unknown_mode_components() {
    let inst = instrument(Duration::ZERO, Duration::ZERO);
    let err = AlignmentRequest::from_inventory(
        &inst.inventory,
        AlignMode::SpecFocusExt,
        inst.path.clone(),
        &fast_config(),
    )
    .unwrap_err();
    assert!(matches!(err, AutofocusError::InvalidConfiguration(_)));
}

#[test]
fn test_stage_estimates() {
    let inst = instrument(Duration::ZERO, Duration::ZERO);
    let config = fast_config();
    let full = alignment(&inst, &config).stages();
    let prep = alignment(&inst, &config).configuration_only().stages();

    assert_eq!(full.len(), 5);
    assert_eq!(prep.len(), 2);
    assert_eq!(
        prep.remaining(),
        config.procedure.light_on_estimate + config.procedure.path_estimate
    );
    assert!(full.remaining() > prep.remaining());
}

// =============================================================================
// Manual focus
// =============================================================================

#[tokio::test]
async fn test_manual_focus_toggle() {
    let inst = instrument(Duration::ZERO, Duration::ZERO);
    let config = fast_config();

    manual_focus(&inst.inventory, AlignMode::SpecFocus, inst.path.clone(), true, &config)
        .unwrap()
        .result(None)
        .await
        .unwrap();
    assert!(inst.light.is_on());
    assert_eq!(inst.path.requests(), vec![("spec-focus".to_string(), None)]);

    manual_focus(&inst.inventory, AlignMode::SpecFocus, inst.path.clone(), false, &config)
        .unwrap()
        .result(None)
        .await
        .unwrap();
    assert!(!inst.light.is_on());
    assert_eq!(inst.light.power_history(), vec![1.0, 0.0]);
    // Turning off leaves the optical path alone
    assert_eq!(inst.path.requests().len(), 1);
}

#[tokio::test]
async fn test_manual_focus_falls_back_to_brightlight() {
    let inst = instrument(Duration::ZERO, Duration::ZERO);
    // No dedicated spectrograph focuser: resolution fails, the brightlight is used
    manual_focus(&inst.inventory, AlignMode::StreakFocusExt, inst.path.clone(), true, &fast_config())
        .unwrap()
        .result(None)
        .await
        .unwrap();
    assert!(inst.light.is_on());
    assert_eq!(inst.path.requests(), vec![("streak-focus-ext".to_string(), None)]);
}
