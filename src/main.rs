//! CLI Entry Point for rust-autofocus
//!
//! Runs the autofocus procedures against a simulated instrument (focuser,
//! spectrograph with two gratings, two detectors behind a selector, a light
//! source and an optical path manager).
//!
//! # Usage
//!
//! ```bash
//! rust-autofocus focus --method exhaustive
//! rust-autofocus spectrometer --json
//! rust-autofocus align --mode spec-focus
//! rust-autofocus manual-focus --mode spec-focus --off
//! rust-autofocus config
//! ```
//!
//! Ctrl+C cancels the running procedure; the hardware teardown still runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_autofocus::autofocus::{
    autofocus, autofocus_spectrometer, FocusMethod, FocusMetric, FocusRequest, SearchRange,
    SpectrometerFocusRequest,
};
use rust_autofocus::config::AutofocusConfig;
use rust_autofocus::hardware::mock::{
    MockCamera, MockFocuser, MockLight, MockOpticalPath, MockSelector, MockSpectrograph,
};
use rust_autofocus::hardware::{Detector, DetectorKind, DeviceInventory, LightSource, Selector};
use rust_autofocus::procedures::{manual_focus, spectrograph_alignment, AlignMode, AlignmentRequest};
use rust_autofocus::task::ProgressiveTask;
use rust_autofocus::tracing_setup::{self, OutputFormat, TracingConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "rust-autofocus")]
#[command(about = "Autofocus procedures on a simulated spectrometer", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = rust_autofocus::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Single-axis focus search on the first spectrometer camera
    Focus {
        /// Search strategy (binary, exhaustive)
        #[arg(long, default_value = "binary")]
        method: FocusMethod,

        /// Known good focus position (m)
        #[arg(long)]
        good_focus: Option<f64>,

        /// Lower bound of the search (m)
        #[arg(long, requires = "max")]
        min: Option<f64>,

        /// Upper bound of the search (m)
        #[arg(long, requires = "min")]
        max: Option<f64>,
    },

    /// Focus every grating and detector of the spectrometer
    Spectrometer,

    /// Full spectrograph alignment procedure
    Align {
        /// Optical path mode
        #[arg(long, default_value = "spec-focus")]
        mode: AlignMode,

        /// Only prepare the hardware (light on, slit closed)
        #[arg(long)]
        no_autofocus: bool,
    },

    /// Toggle the manual focus preparation
    ManualFocus {
        /// Optical path mode
        #[arg(long, default_value = "spec-focus")]
        mode: AlignMode,

        /// Turn the manual focus off
        #[arg(long)]
        off: bool,
    },

    /// Print the effective configuration (file + environment)
    Config,
}

// =============================================================================
// Simulated instrument
// =============================================================================

// The slit image is a single line value, peaking at focus: the demo scores
// frames with the mean intensity.

/// Best focus per grating and detector of the simulated spectrometer (m)
fn true_focus(grating: u32, detector_offset: f64) -> f64 {
    let grating_offset = if grating == 1 { 0.0 } else { 35e-6 };
    420e-6 + grating_offset + detector_offset
}

struct Instrument {
    inventory: DeviceInventory,
    focuser: Arc<MockFocuser>,
    spectrograph: Arc<MockSpectrograph>,
    selector: Arc<MockSelector>,
    cameras: Vec<Arc<MockCamera>>,
    light: Arc<MockLight>,
    path: Arc<MockOpticalPath>,
}

impl Instrument {
    fn simulated() -> Result<Self> {
        let focuser = Arc::new(
            MockFocuser::new("spec-focus", "focus", (0.0, 1e-3))
                .at(300e-6)
                .with_affects(&["ccd0", "sp-ccd1"])
                .with_speed(1e-3)
                .with_move_delay(Duration::from_millis(5)),
        );
        let spectrograph = Arc::new(
            MockSpectrograph::new("spectrograph", "spectrograph", &[1, 2])
                .with_affects(&["ccd0", "sp-ccd1"])
                .with_grating_delay(Duration::from_millis(200)),
        );
        let selector = Arc::new(
            MockSelector::new("spec-det-selector", "spec-det-selector", &[(0.0, "ccd0"), (1.5707963, "sp-ccd1")])
                .with_affects(&["ccd0", "sp-ccd1"]),
        );
        let light = Arc::new(
            MockLight::new("brightlight", "brightlight", 0.5)
                .with_affects(&["ccd0"])
                .with_warmup(Duration::from_millis(300)),
        );

        let cameras: Vec<Arc<MockCamera>> = [("ccd0", 0.0), ("sp-ccd1", -12e-6)]
            .into_iter()
            .map(|(name, offset)| {
                Arc::new(
                    MockCamera::new(name, name, DetectorKind::LineCamera, (1, 1))
                        .focused_by(focuser.clone())
                        .behind(spectrograph.clone())
                        .lit_by(light.clone())
                        .with_dark_level(100.0)
                        .with_noise(0.5)
                        .with_exposure(Some(Duration::from_millis(20)))
                        .with_max_binning((4, 4))
                        .with_depth_of_field(4e-6)
                        .with_grating_response(move |z, g| {
                            let defocus = (z - true_focus(g, offset)) / 40e-6;
                            2000.0 / (1.0 + defocus * defocus)
                        }),
                )
            })
            .collect();

        let mut inventory = DeviceInventory::new();
        inventory.add_focuser(focuser.clone())?;
        inventory.add_spectrograph(spectrograph.clone())?;
        inventory.add_selector(selector.clone())?;
        inventory.add_light(light.clone())?;
        for camera in &cameras {
            inventory.add_detector(camera.clone())?;
        }

        Ok(Self {
            inventory,
            focuser,
            spectrograph,
            selector,
            cameras,
            light,
            path: Arc::new(MockOpticalPath::new().with_delay(Duration::from_millis(50))),
        })
    }
}

// =============================================================================
// Task driving
// =============================================================================

/// Wait for `task`, logging its progress and cancelling it on Ctrl+C
async fn drive<T: Clone + Send + 'static>(task: ProgressiveTask<T>) -> Result<T> {
    let mut progress = task.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let remaining = progress.borrow_and_update().remaining();
            info!("~{:.1} s left", remaining.as_secs_f64());
        }
    });

    let outcome = tokio::select! {
        outcome = task.result(None) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling {}", task.name());
            task.cancel();
            task.result(None).await
        }
    };
    reporter.abort();
    Ok(outcome?)
}

fn print_result<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct FocusEntry {
    grating: u32,
    detector: String,
    position: f64,
}

fn focus_entries(map: &rust_autofocus::autofocus::FocusMap) -> Vec<FocusEntry> {
    map.iter()
        .map(|(combination, position)| FocusEntry {
            grating: combination.grating,
            detector: combination.detector.clone(),
            position: *position,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AutofocusConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let mut tracing_config = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if cli.json {
        tracing_config = tracing_config.with_format(OutputFormat::Compact).with_ansi(false);
    }
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Commands::Config = cli.command {
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            print!("{}", config.to_toml()?);
        }
        return Ok(());
    }

    let instrument = Instrument::simulated()?;
    for component in instrument.inventory.list() {
        debug!(name = %component.name, role = %component.role, kind = ?component.kind, "component registered");
    }
    info!(components = instrument.inventory.len(), "simulated instrument ready");

    match cli.command {
        Commands::Focus {
            method,
            good_focus,
            min,
            max,
        } => {
            let camera = instrument.cameras[0].clone();
            instrument.light.set_power(instrument.light.power_range().1).await?;
            tokio::time::sleep(Duration::from_millis(350)).await;

            let mut request = FocusRequest::new(camera, instrument.focuser.clone())
                .with_method(method)
                .with_metric(FocusMetric::mean_intensity())
                .with_settings(config.search.clone());
            if let Some(good) = good_focus {
                request = request.with_good_focus(good);
            }
            if let (Some(lower), Some(upper)) = (min, max) {
                request = request.with_range(SearchRange::new(lower, upper));
            }
            let outcome = drive(autofocus(request)).await?;
            print_result(cli.json, &outcome)?;
        }
        Commands::Spectrometer => {
            instrument.light.set_power(instrument.light.power_range().1).await?;
            tokio::time::sleep(Duration::from_millis(350)).await;

            let request = SpectrometerFocusRequest::new(
                instrument.spectrograph.clone(),
                instrument.focuser.clone(),
                instrument
                    .cameras
                    .iter()
                    .map(|c| Arc::clone(c) as Arc<dyn Detector>)
                    .collect(),
                Some(instrument.selector.clone() as Arc<dyn Selector>),
            )
            .with_metric(FocusMetric::mean_intensity())
            .with_search(config.search.clone())
            .with_costs(config.spectrometer.clone());
            let map = drive(autofocus_spectrometer(request)?).await?;
            print_result(cli.json, &focus_entries(&map))?;
        }
        Commands::Align { mode, no_autofocus } => {
            let mut request =
                AlignmentRequest::from_inventory(&instrument.inventory, mode, instrument.path.clone(), &config)?
                    .with_metric(FocusMetric::mean_intensity());
            if no_autofocus {
                request = request.configuration_only();
            }
            match drive(spectrograph_alignment(request)).await? {
                Some(map) => print_result(cli.json, &focus_entries(&map))?,
                None => println!("Optical path set for {mode}, light left on"),
            }
            info!(paths = ?instrument.path.requests(), light_on = instrument.light.is_on(), "alignment done");
        }
        Commands::ManualFocus { mode, off } => {
            let task = manual_focus(&instrument.inventory, mode, instrument.path.clone(), !off, &config)?;
            drive(task).await?;
            println!(
                "Manual focus {} for {mode} (light {})",
                if off { "off" } else { "on" },
                if instrument.light.is_on() { "on" } else { "off" }
            );
        }
        Commands::Config => {}
    }

    Ok(())
}
