//! Configuration for autofocus procedures (Figment).
//!
//! Configuration is layered:
//! 1. Built-in defaults (every field has one)
//! 2. `config/autofocus.toml` (or any file passed to [`AutofocusConfig::load_from`])
//! 3. Environment variables prefixed with `RUST_AUTOFOCUS_`, sections separated
//!    by a double underscore, e.g. `RUST_AUTOFOCUS_SEARCH__MAX_STEPS=50`
//!
//! Durations are written in humantime form (`"20s"`, `"200ms"`).
//!
//! # Example
//! ```no_run
//! use rust_autofocus::config::AutofocusConfig;
//!
//! let config = AutofocusConfig::load()?;
//! config.validate()?;
//! println!("Max search steps: {}", config.search.max_steps);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/autofocus.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RUST_AUTOFOCUS_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Focus search constants
    pub search: SearchSettings,
    /// Spectrometer multi-axis search costs
    pub spectrometer: SpectrometerSettings,
    /// Composite alignment procedure estimates and timeouts
    pub procedure: ProcedureSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Rust Autofocus".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Constants of the binary and exhaustive focus searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Maximum number of binary search iterations
    pub max_steps: u32,
    /// Depth of field used when no component reports one (m)
    pub default_depth_of_field: f64,
    /// Relative tolerance under which three focus levels count as identical
    pub equal_rtol: f64,
    /// Initial step multiplier of the binary search
    pub coarse_step_factor: f64,
    /// Initial step multiplier when a good focus position is known
    pub good_focus_step_factor: f64,
    /// Exhaustive sweep step, in depths of field
    pub sweep_dof_multiple: f64,
    /// Minimum number of sweep steps over the range, and of samples before
    /// the deviation assessment is consulted
    pub min_sweep_steps: usize,
    /// Half-width of the binary refinement window, in sweep steps
    pub fallback_window_steps: f64,
    /// Fixed part of the per-image acquisition timeout
    #[serde(with = "humantime_serde")]
    pub acquisition_timeout_base: Duration,
    /// Move duration assumed for focusers that do not report a speed
    #[serde(with = "humantime_serde")]
    pub default_move_time: Duration,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_steps: 100,
            default_depth_of_field: 1e-6,
            equal_rtol: 1e-6,
            coarse_step_factor: 128.0,
            good_focus_step_factor: 16.0,
            sweep_dof_multiple: 8.0,
            min_sweep_steps: 10,
            fallback_window_steps: 2.0,
            acquisition_timeout_base: Duration::from_secs(3),
            default_move_time: Duration::from_millis(100),
        }
    }
}

/// Fixed move costs used for spectrometer progress estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrometerSettings {
    /// Time to change grating
    #[serde(with = "humantime_serde")]
    pub grating_move_time: Duration,
    /// Time to switch the detector selector
    #[serde(with = "humantime_serde")]
    pub selector_move_time: Duration,
}

impl Default for SpectrometerSettings {
    fn default() -> Self {
        Self {
            grating_move_time: Duration::from_secs(20),
            selector_move_time: Duration::from_secs(5),
        }
    }
}

/// Stage estimates and timeouts of the composite alignment procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcedureSettings {
    /// Estimated time to turn the light on
    #[serde(with = "humantime_serde")]
    pub light_on_estimate: Duration,
    /// Estimated time to reconfigure the optical path
    #[serde(with = "humantime_serde")]
    pub path_estimate: Duration,
    /// Estimated time to acquire the confirmation image
    #[serde(with = "humantime_serde")]
    pub final_image_estimate: Duration,
    /// Estimated time to turn the light off
    #[serde(with = "humantime_serde")]
    pub light_off_estimate: Duration,
    /// Estimated duration of a manual focus toggle
    #[serde(with = "humantime_serde")]
    pub manual_focus_estimate: Duration,
    /// Maximum wait for the light to be seen by the detector
    #[serde(with = "humantime_serde")]
    pub light_timeout: Duration,
    /// Delay between two detector checks while the light warms up
    #[serde(with = "humantime_serde")]
    pub light_poll_interval: Duration,
    /// Relative increase of the mean signal meaning "light is on"
    pub light_threshold: f64,
    /// Multiplier of the search estimate giving the search timeout
    pub search_timeout_factor: f64,
    /// Added to the scaled search estimate to give the search timeout
    #[serde(with = "humantime_serde")]
    pub search_timeout_margin: Duration,
    /// Exposure time at 2x2 binning used during the search
    #[serde(with = "humantime_serde")]
    pub focus_exposure: Duration,
    /// Binning requested on the detectors during the search
    pub focus_binning: (u32, u32),
}

impl Default for ProcedureSettings {
    fn default() -> Self {
        Self {
            light_on_estimate: Duration::from_secs(5),
            path_estimate: Duration::from_secs(5),
            final_image_estimate: Duration::from_millis(200),
            light_off_estimate: Duration::from_secs(5),
            manual_focus_estimate: Duration::from_secs(10),
            light_timeout: Duration::from_secs(60),
            light_poll_interval: Duration::from_millis(100),
            light_threshold: 0.1,
            search_timeout_factor: 3.0,
            search_timeout_margin: Duration::from_secs(10),
            focus_exposure: Duration::from_millis(200),
            focus_binning: (2, 2),
        }
    }
}

impl AutofocusConfig {
    /// Load configuration from `config/autofocus.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack, exposed for callers that want to merge more layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(AutofocusConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let search = &self.search;
        if search.max_steps == 0 {
            return Err("search.max_steps must be at least 1".to_string());
        }
        if search.default_depth_of_field <= 0.0 {
            return Err("search.default_depth_of_field must be positive".to_string());
        }
        if search.coarse_step_factor < 1.0 || search.good_focus_step_factor < 1.0 {
            return Err("search step factors must be >= 1".to_string());
        }
        if search.sweep_dof_multiple <= 0.0 || search.fallback_window_steps <= 0.0 {
            return Err("search sweep step and fallback window must be positive".to_string());
        }
        if search.min_sweep_steps == 0 {
            return Err("search.min_sweep_steps must be at least 1".to_string());
        }

        let procedure = &self.procedure;
        if procedure.search_timeout_factor < 1.0 {
            return Err(format!(
                "procedure.search_timeout_factor {} must be >= 1",
                procedure.search_timeout_factor
            ));
        }
        if procedure.light_threshold < 0.0 {
            return Err("procedure.light_threshold must not be negative".to_string());
        }
        if procedure.focus_binning.0 == 0 || procedure.focus_binning.1 == 0 {
            return Err("procedure.focus_binning must be non-zero".to_string());
        }

        Ok(())
    }

    /// Render the configuration as TOML, in the layout of the config file
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
