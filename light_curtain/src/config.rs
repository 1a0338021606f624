// THEORY:
// `SafetyConfig` holds every tunable a monitoring session reads, grouped into
// one TOML table per stage. Each field carries a serde default equal to the
// calibrated production value, so a partial file only overrides what it names
// and an empty file is a valid configuration.
//
// Loading always validates. A configuration that parses but describes an
// impossible pipeline (an empty cache, inverted ranges, zero-sized kernels) is
// refused before any session is built from it.

use serde::Deserialize;
use std::path::Path;

/// Tunables for a monitoring session. Every field has a default, so an empty
/// TOML document yields the calibrated production values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub skin: SkinConfig,
    #[serde(default)]
    pub contour: ContourConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HysteresisConfig {
    /// Drift threshold used on the frame that seeds the background.
    #[serde(default = "default_seed_threshold")]
    pub seed_threshold: f64,
    /// Drift threshold used on every later frame.
    #[serde(default = "default_steady_threshold")]
    pub steady_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Buckets are probed at distances `0..search_radius`.
    #[serde(default = "default_search_radius")]
    pub search_radius: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationConfig {
    #[serde(default = "default_background_match_low")]
    pub background_match_low: u8,
    #[serde(default = "default_background_match_high")]
    pub background_match_high: u8,
    /// Side of the elliptical erode/dilate kernel.
    #[serde(default = "default_kernel_size")]
    pub denoise_kernel: u32,
    /// Side of the rectangular closing kernel.
    #[serde(default = "default_kernel_size")]
    pub close_kernel: u32,
    #[serde(default = "default_close_iterations")]
    pub close_iterations: u32,
}

/// YCrCb skin range, channel order `[Y, Cr, Cb]`.
#[derive(Debug, Clone, Deserialize)]
pub struct SkinConfig {
    #[serde(default = "default_skin_min")]
    pub min: [f64; 3],
    #[serde(default = "default_skin_max")]
    pub max: [f64; 3],
    #[serde(default = "default_cr_slope")]
    pub cr_slope: f64,
    #[serde(default = "default_cr_offset")]
    pub cr_offset: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContourConfig {
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    /// Polygon approximation tolerance as a fraction of the contour perimeter.
    #[serde(default = "default_approx_epsilon")]
    pub approx_epsilon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_camera_identity")]
    pub camera_identity: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Frames discarded after start-up before the background is seeded, so
    /// auto-exposure can settle.
    #[serde(default)]
    pub settle_frames: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            seed_threshold: default_seed_threshold(),
            steady_threshold: default_steady_threshold(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            search_radius: default_search_radius(),
        }
    }
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            background_match_low: default_background_match_low(),
            background_match_high: default_background_match_high(),
            denoise_kernel: default_kernel_size(),
            close_kernel: default_kernel_size(),
            close_iterations: default_close_iterations(),
        }
    }
}

impl Default for SkinConfig {
    fn default() -> Self {
        Self {
            min: default_skin_min(),
            max: default_skin_max(),
            cr_slope: default_cr_slope(),
            cr_offset: default_cr_offset(),
        }
    }
}

impl Default for ContourConfig {
    fn default() -> Self {
        Self {
            min_area: default_min_area(),
            approx_epsilon: default_approx_epsilon(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            camera_identity: default_camera_identity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SafetyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SafetyConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be at least 1".into()));
        }
        if self.cache.search_radius < 1 {
            return Err(ConfigError::Invalid("cache.search_radius must be at least 1".into()));
        }
        if self.hysteresis.seed_threshold <= 0.0 || self.hysteresis.steady_threshold <= 0.0 {
            return Err(ConfigError::Invalid("hysteresis thresholds must be positive".into()));
        }
        if self.segmentation.background_match_low > self.segmentation.background_match_high {
            return Err(ConfigError::Invalid(
                "segmentation.background_match_low exceeds background_match_high".into(),
            ));
        }
        if self.segmentation.denoise_kernel == 0 || self.segmentation.close_kernel == 0 {
            return Err(ConfigError::Invalid("kernel sizes must be at least 1".into()));
        }
        if self.skin.min.iter().zip(self.skin.max.iter()).any(|(lo, hi)| lo > hi) {
            return Err(ConfigError::Invalid("skin.min exceeds skin.max on some channel".into()));
        }
        if self.contour.min_area < 0.0 || self.contour.approx_epsilon <= 0.0 {
            return Err(ConfigError::Invalid(
                "contour.min_area must be >= 0 and contour.approx_epsilon > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_seed_threshold() -> f64 {
    5.0
}
fn default_steady_threshold() -> f64 {
    20.0
}
fn default_cache_capacity() -> usize {
    200
}
fn default_search_radius() -> i32 {
    100
}
fn default_background_match_low() -> u8 {
    245
}
fn default_background_match_high() -> u8 {
    255
}
fn default_kernel_size() -> u32 {
    5
}
fn default_close_iterations() -> u32 {
    6
}
fn default_skin_min() -> [f64; 3] {
    [0.0, 129.0, 76.0]
}
fn default_skin_max() -> [f64; 3] {
    [255.0, 176.0, 144.0]
}
fn default_cr_slope() -> f64 {
    6.0 / 90.0
}
fn default_cr_offset() -> f64 {
    122.31
}
fn default_min_area() -> f64 {
    1000.0
}
fn default_approx_epsilon() -> f64 {
    0.0025
}
fn default_camera_identity() -> String {
    "uEye UI-164xLE Series".into()
}
fn default_log_level() -> String {
    "info".into()
}
