//! Integration tests for the single-axis focus searches
//!
//! The mock camera returns a 1x1 frame whose value is a function of the mock
//! focuser position, scored with the mean intensity metric.

use rust_autofocus::autofocus::{
    autofocus, cl_spots_autofocus, cl_spots_request, FocusMethod, FocusMetric, FocusRequest,
    SearchRange, CL_SPOTS_EXPOSURE,
};
use rust_autofocus::config::SearchSettings;
use rust_autofocus::hardware::mock::{MockCamera, MockFocuser};
use rust_autofocus::hardware::{Detector, DetectorKind};
use rust_autofocus::AutofocusError;
use std::sync::Arc;
use std::time::Duration;

const PEAK: f64 = 42.0;

fn quadratic(z: f64) -> f64 {
    -(z - PEAK).powi(2)
}

fn setup(
    start: f64,
    response: impl Fn(f64) -> f64 + Send + Sync + 'static,
) -> (Arc<MockFocuser>, Arc<MockCamera>) {
    let focuser = Arc::new(MockFocuser::new("focus", "focus", (0.0, 100.0)).at(start));
    let camera = Arc::new(
        MockCamera::new("ccd", "ccd", DetectorKind::Camera, (1, 1))
            .focused_by(focuser.clone())
            .with_depth_of_field(2.0)
            .with_response(response),
    );
    (focuser, camera)
}

fn request(focuser: &Arc<MockFocuser>, camera: &Arc<MockCamera>) -> FocusRequest {
    FocusRequest::new(camera.clone(), focuser.clone()).with_metric(FocusMetric::mean_intensity())
}

// =============================================================================
// Binary search
// =============================================================================

#[tokio::test]
async fn test_binary_finds_single_peak() {
    let (focuser, camera) = setup(50.0, quadratic);
    let outcome = autofocus(request(&focuser, &camera))
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(
        (outcome.position - PEAK).abs() <= 1.0,
        "found {} instead of {}",
        outcome.position,
        PEAK
    );
    assert_eq!(outcome.confidence, 0.8);
    assert_eq!(focuser.current(), outcome.position);
}

#[tokio::test]
async fn test_binary_flat_signal_is_indecisive() {
    let (focuser, camera) = setup(50.0, |_| 5.0);
    let outcome = autofocus(request(&focuser, &camera)).result(None).await.unwrap();

    assert_eq!(outcome.position, 50.0);
    assert_eq!(outcome.score, 5.0);
    assert_eq!(outcome.confidence, 0.2);
}

#[tokio::test]
async fn test_binary_zero_signal_is_indecisive() {
    let (focuser, camera) = setup(50.0, |_| 0.0);
    let outcome = autofocus(request(&focuser, &camera)).result(None).await.unwrap();

    assert_eq!(outcome.position, 50.0);
    assert_eq!(outcome.confidence, 0.2);
}

#[tokio::test]
async fn test_binary_step_budget_exhausted() {
    let (focuser, camera) = setup(50.0, quadratic);
    let settings = SearchSettings {
        max_steps: 2,
        ..SearchSettings::default()
    };
    let outcome = autofocus(request(&focuser, &camera).with_settings(settings))
        .result(None)
        .await
        .unwrap();

    assert_eq!(outcome.confidence, 0.1);
}

#[tokio::test]
async fn test_binary_starts_from_good_focus() {
    let (focuser, camera) = setup(10.0, quadratic);
    let outcome = autofocus(request(&focuser, &camera).with_good_focus(40.0))
        .result(None)
        .await
        .unwrap();

    // The good position is measured right after the current one
    assert_eq!(focuser.moves()[0], 40.0);
    assert!((outcome.position - PEAK).abs() <= 1.0);
    assert_eq!(outcome.confidence, 0.8);
}

#[tokio::test]
async fn test_binary_stays_within_restriction() {
    let (focuser, camera) = setup(30.0, quadratic);
    let outcome = autofocus(request(&focuser, &camera).with_range(SearchRange::new(20.0, 35.0)))
        .result(None)
        .await
        .unwrap();

    assert!(focuser.moves().iter().all(|z| (20.0..=35.0).contains(z)));
    assert!((outcome.position - 35.0).abs() <= 1.0);
}

#[tokio::test]
async fn test_binary_rejects_disjoint_range() {
    let (focuser, camera) = setup(50.0, quadratic);
    let err = autofocus(request(&focuser, &camera).with_range(SearchRange::new(200.0, 300.0)))
        .result(None)
        .await
        .unwrap_err();

    assert!(matches!(err, AutofocusError::InvalidConfiguration(_)));
    assert!(focuser.moves().is_empty());
}

#[tokio::test]
async fn test_binary_cancel_returns_to_best_position() {
    let focuser = Arc::new(
        MockFocuser::new("focus", "focus", (0.0, 100.0))
            .at(50.0)
            .with_move_delay(Duration::from_millis(10)),
    );
    let camera = Arc::new(
        MockCamera::new("ccd", "ccd", DetectorKind::Camera, (1, 1))
            .focused_by(focuser.clone())
            .with_depth_of_field(2.0)
            .with_acquire_delay(Duration::from_millis(5))
            .with_response(quadratic),
    );
    let task = autofocus(request(&focuser, &camera));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(task.cancel());
    assert_eq!(task.result(None).await, Err(AutofocusError::Cancelled));

    // Every reached position was measured: the focuser must sit on the best one
    let final_level = quadratic(focuser.current());
    let mut visited = focuser.moves();
    visited.push(50.0);
    assert!(visited.iter().all(|z| quadratic(*z) <= final_level));
}

#[tokio::test]
async fn test_binary_acquisition_failure() {
    let (focuser, camera) = setup(50.0, quadratic);
    camera.set_fail_acquire(true);
    let err = autofocus(request(&focuser, &camera)).result(None).await.unwrap_err();
    assert!(matches!(err, AutofocusError::HardwareFailure(_)));
}

// =============================================================================
// Exhaustive search
// =============================================================================

#[tokio::test]
async fn test_exhaustive_sweeps_both_directions_without_peak() {
    let (focuser, camera) = setup(50.0, quadratic);
    let outcome = autofocus(request(&focuser, &camera).with_method(FocusMethod::Exhaustive))
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap();

    let moves = focuser.moves();
    assert!(moves.contains(&100.0), "upward sweep must reach the upper bound");
    assert!(moves.contains(&0.0), "downward sweep must reach the lower bound");
    assert!((outcome.position - PEAK).abs() <= 1.0);
    assert_eq!(outcome.confidence, 0.8);
}

#[tokio::test]
async fn test_exhaustive_stops_sweep_on_deviation() {
    let (focuser, camera) = setup(50.0, quadratic);
    let settings = SearchSettings {
        min_sweep_steps: 2,
        ..SearchSettings::default()
    };
    let outcome = autofocus(
        request(&focuser, &camera)
            .with_method(FocusMethod::Exhaustive)
            .with_settings(settings)
            .with_deviation(Arc::new(|levels: &[f64]| levels.len() >= 2)),
    )
    .result(None)
    .await
    .unwrap();

    // The sweep stopped after two samples, before going downwards
    assert!(!focuser.moves().contains(&0.0));
    assert!((outcome.position - PEAK).abs() <= 1.0);
}

#[tokio::test]
async fn test_exhaustive_finds_narrow_peak() {
    let (focuser, camera) = setup(50.0, |z| 1000.0 / (1.0 + ((z - PEAK) / 3.0).powi(2)));
    let outcome = autofocus(request(&focuser, &camera).with_method(FocusMethod::Exhaustive))
        .result(None)
        .await
        .unwrap();

    assert!((outcome.position - PEAK).abs() <= 1.0);
    assert_eq!(outcome.confidence, 0.8);
}

#[tokio::test]
async fn test_exhaustive_cancel_returns_to_best_sample() {
    let focuser = Arc::new(
        MockFocuser::new("focus", "focus", (0.0, 100.0))
            .at(50.0)
            .with_move_delay(Duration::from_millis(10)),
    );
    let camera = Arc::new(
        MockCamera::new("ccd", "ccd", DetectorKind::Camera, (1, 1))
            .focused_by(focuser.clone())
            .with_depth_of_field(2.0)
            .with_response(quadratic),
    );
    let task = autofocus(request(&focuser, &camera).with_method(FocusMethod::Exhaustive));

    tokio::time::sleep(Duration::from_millis(35)).await;
    assert!(task.cancel());
    assert_eq!(task.result(None).await, Err(AutofocusError::Cancelled));

    let final_level = quadratic(focuser.current());
    assert!(focuser.moves().iter().all(|z| quadratic(*z) <= final_level));
}

// =============================================================================
// CL spots
// =============================================================================

fn spot_camera(focuser: &Arc<MockFocuser>, exposure: Option<Duration>) -> Arc<MockCamera> {
    Arc::new(
        MockCamera::new("diag-cam", "diagnostic-ccd", DetectorKind::DiagnosticCamera, (32, 32))
            .focused_by(focuser.clone())
            .with_depth_of_field(2.0)
            .with_exposure(exposure)
            .with_spot(PEAK, 1.5, 0.5, 1000.0),
    )
}

#[tokio::test]
async fn test_cl_spots_converges_on_spot() {
    let focuser = Arc::new(MockFocuser::new("focus", "focus", (0.0, 100.0)).at(50.0));
    let camera = spot_camera(&focuser, Some(Duration::from_millis(200)));

    let outcome = cl_spots_autofocus(cl_spots_request(camera.clone(), focuser.clone()))
        .result(Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(
        (outcome.position - PEAK).abs() <= 1.0,
        "found {} instead of {}",
        outcome.position,
        PEAK
    );
    assert_eq!(outcome.confidence, 0.8);
    assert_eq!(camera.exposure_time(), Some(CL_SPOTS_EXPOSURE));
    // Exhaustive sweep: both bounds were visited
    assert!(focuser.moves().contains(&100.0));
    assert!(focuser.moves().contains(&0.0));
}

#[tokio::test]
async fn test_cl_spots_needs_exposure_control() {
    let focuser = Arc::new(MockFocuser::new("focus", "focus", (0.0, 100.0)).at(50.0));
    let camera = spot_camera(&focuser, None);

    let err = cl_spots_autofocus(cl_spots_request(camera, focuser.clone()))
        .result(None)
        .await
        .unwrap_err();
    assert!(matches!(err, AutofocusError::HardwareFailure(_)));
    assert!(focuser.moves().is_empty());
}
