use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::architecture::ArchitectureProfile;
use crate::errors::{MapSegError, Result};

pub const DEFAULT_MODEL_URL: &str =
    "https://cdn.jsdelivr.net/npm/@roboflow/sam2-web@latest/weights/segment-anything-2_quant.onnx";
pub const DEFAULT_ENCODER_URL: &str =
    "https://cdn.jsdelivr.net/npm/@roboflow/sam2-web@latest/weights/encoder_quant.onnx";

/// Model family the encoder/decoder pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Standard,
    #[value(name = "hiera_tiny")]
    #[serde(alias = "hieraTiny")]
    HieraTiny,
}

/// Execution backend for ONNX Runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Backend {
    /// TensorRT, then CUDA, then CPU.
    #[serde(rename = "accelerated", alias = "webgl", alias = "gpu")]
    Accelerated,
    #[serde(rename = "cpu", alias = "wasm")]
    Cpu,
}

/// Value range of the image tensor fed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelScale {
    /// 0 to 255
    Raw,
    /// 0 to 1
    Unit,
}

/// Static configuration of one segmentation session.
///
/// Never mutated once a session is built from it; a different configuration
/// means a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Decoder / mask-head binary.
    #[serde(alias = "modelUrl")]
    pub model_url: String,
    #[serde(alias = "encoderUrl")]
    pub encoder_url: String,
    pub backend: Backend,
    #[serde(alias = "maxSize")]
    pub max_size: u32,
    pub architecture: Architecture,
    /// Falls back to the architecture default when unset.
    #[serde(alias = "confidenceThreshold")]
    pub confidence_threshold: Option<f32>,
    #[serde(alias = "maxBoundaryPoints")]
    pub max_boundary_points: usize,
    #[serde(alias = "useConvexHull")]
    pub use_convex_hull: bool,
    #[serde(alias = "simplifyPolygon")]
    pub simplify_polygon: bool,
    #[serde(alias = "simplifyTolerance")]
    pub simplify_tolerance: f64,
    #[serde(alias = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(alias = "fallbackToSimulation")]
    pub fallback_to_simulation: bool,
    #[serde(alias = "fallbackOnInvalidMask")]
    pub fallback_on_invalid_mask: bool,
    #[serde(alias = "pixelScale")]
    pub pixel_scale: Option<PixelScale>,
    /// Canvas size assumed when a click point arrives un-normalized.
    #[serde(alias = "defaultCanvasSize")]
    pub default_canvas_size: [u32; 2],
    #[serde(alias = "embeddingKeys")]
    pub embedding_keys: Option<Vec<String>>,
    #[serde(alias = "maskKeys")]
    pub mask_keys: Option<Vec<String>>,
    #[serde(alias = "simulationRadius")]
    pub simulation_radius: f64,
    #[serde(alias = "deviceId")]
    pub device_id: i32,
    #[serde(alias = "intraThreads")]
    pub intra_threads: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_url: DEFAULT_MODEL_URL.to_string(),
            encoder_url: DEFAULT_ENCODER_URL.to_string(),
            backend: Backend::Accelerated,
            max_size: 1024,
            architecture: Architecture::Standard,
            confidence_threshold: None,
            max_boundary_points: 100,
            use_convex_hull: true,
            simplify_polygon: true,
            simplify_tolerance: 0.00005,
            timeout_ms: 10_000,
            fallback_to_simulation: false,
            fallback_on_invalid_mask: false,
            pixel_scale: None,
            default_canvas_size: [1024, 1024],
            embedding_keys: None,
            mask_keys: None,
            simulation_radius: 0.05,
            device_id: 0,
            intra_threads: None,
        }
    }
}

impl ModelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| MapSegError::Configuration {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(message: String) -> Result<()> {
            Err(MapSegError::Configuration { message })
        }

        if self.model_url.is_empty() || self.encoder_url.is_empty() {
            return invalid("model_url and encoder_url must be set".to_string());
        }
        if self.max_size == 0 {
            return invalid("max_size must be positive".to_string());
        }
        if let Some(threshold) = self.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return invalid(format!("confidence_threshold {threshold} is outside [0, 1]"));
            }
        }
        if self.max_boundary_points == 0 {
            return invalid("max_boundary_points must be positive".to_string());
        }
        if !(self.simplify_tolerance >= 0.0) {
            return invalid(format!(
                "simplify_tolerance {} must be non-negative",
                self.simplify_tolerance
            ));
        }
        if self.timeout_ms == 0 {
            return invalid("timeout_ms must be positive".to_string());
        }
        if self.default_canvas_size.contains(&0) {
            return invalid("default_canvas_size must be positive".to_string());
        }
        if !(self.simulation_radius > 0.0) {
            return invalid("simulation_radius must be positive".to_string());
        }
        Ok(())
    }

    /// Architecture profile with the configured key-list overrides applied.
    pub fn profile(&self) -> ArchitectureProfile {
        let mut profile = ArchitectureProfile::for_architecture(self.architecture);
        if let Some(keys) = &self.embedding_keys {
            profile.embedding_keys = keys.clone();
        }
        if let Some(keys) = &self.mask_keys {
            profile.mask_keys = keys.clone();
        }
        profile
    }

    pub fn threshold(&self) -> f32 {
        self.confidence_threshold
            .unwrap_or_else(|| ArchitectureProfile::for_architecture(self.architecture).default_threshold)
    }

    pub fn pixel_scale(&self) -> PixelScale {
        self.pixel_scale
            .unwrap_or_else(|| ArchitectureProfile::for_architecture(self.architecture).pixel_scale)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Command-line front end: a captured view in, a polygon out.
#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Captured view: a file path, file:// or http(s):// URL.
    #[arg(short, long)]
    pub image: String,

    /// Click x, normalized to [0, 1] (pixel values fall back to the default canvas size).
    #[arg(short, long, allow_negative_numbers = true)]
    pub x: f64,

    /// Click y, normalized to [0, 1].
    #[arg(short, long, allow_negative_numbers = true)]
    pub y: f64,

    /// TOML model configuration.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub model_url: Option<String>,

    #[arg(long)]
    pub encoder_url: Option<String>,

    #[arg(long, value_enum)]
    pub architecture: Option<Architecture>,

    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Return a simulated polygon instead of failing.
    #[arg(long, default_value_t = false)]
    pub fallback: bool,

    /// Write the result JSON here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Keep the binary mask in the JSON output.
    #[arg(long, default_value_t = false)]
    pub include_mask: bool,
}

impl Cli {
    /// File configuration (or defaults) with command-line overrides on top.
    pub fn model_config(&self) -> Result<ModelConfig> {
        let mut config = match &self.config {
            Some(path) => ModelConfig::from_file(path)?,
            None => ModelConfig::default(),
        };

        if let Some(url) = &self.model_url {
            config.model_url = url.clone();
        }
        if let Some(url) = &self.encoder_url {
            config.encoder_url = url.clone();
        }
        if let Some(architecture) = self.architecture {
            config.architecture = architecture;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if self.fallback {
            config.fallback_to_simulation = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.threshold(), 0.5);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.pixel_scale(), PixelScale::Unit);
    }

    #[test]
    fn test_toml_accepts_original_option_names() -> Result<()> {
        let config = ModelConfig::from_toml_str(
            r#"
            modelUrl = "models/decoder.onnx"
            encoderUrl = "models/encoder.onnx"
            backend = "wasm"
            maxSize = 512
            architecture = "hiera_tiny"
            confidenceThreshold = 0.3
            timeoutMs = 2500
            fallbackToSimulation = true
            "#,
        )?;

        assert_eq!(config.model_url, "models/decoder.onnx");
        assert_eq!(config.backend, Backend::Cpu);
        assert_eq!(config.max_size, 512);
        assert_eq!(config.architecture, Architecture::HieraTiny);
        assert_eq!(config.threshold(), 0.3);
        assert!(config.fallback_to_simulation);
        assert_eq!(config.max_boundary_points, 100);
        Ok(())
    }

    #[test]
    fn test_webgl_maps_to_accelerated() -> Result<()> {
        let config = ModelConfig::from_toml_str(r#"backend = "webgl""#)?;
        assert_eq!(config.backend, Backend::Accelerated);
        Ok(())
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        let mut config = ModelConfig::default();
        config.confidence_threshold = Some(1.5);
        assert!(matches!(
            config.validate(),
            Err(MapSegError::Configuration { .. })
        ));

        let mut config = ModelConfig::default();
        config.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = ModelConfig::default();
        config.simplify_tolerance = -1.0;
        assert!(config.validate().is_err());

        assert!(ModelConfig::from_toml_str("timeout_ms = 0").is_err());
        assert!(ModelConfig::from_toml_str("max_size = \"big\"").is_err());
    }

    #[test]
    fn test_key_overrides_replace_profile_lists() {
        let config = ModelConfig {
            embedding_keys: Some(vec!["features".to_string()]),
            ..ModelConfig::default()
        };
        assert_eq!(config.profile().embedding_keys, vec!["features".to_string()]);
        assert_eq!(
            config.profile().mask_keys,
            ArchitectureProfile::for_architecture(Architecture::Standard).mask_keys
        );
    }

    #[test]
    fn test_cli_overrides_file_config() -> Result<()> {
        let temp_dir = tempfile::TempDir::new().map_err(MapSegError::from)?;
        let path = temp_dir.path().join("mapseg.toml");
        std::fs::write(&path, "timeout_ms = 4000\narchitecture = \"standard\"\n")
            .map_err(MapSegError::from)?;

        let cli = Cli::parse_from([
            "mapseg",
            "--image",
            "view.png",
            "-x",
            "0.25",
            "-y",
            "0.75",
            "--config",
            path.to_str().unwrap(),
            "--architecture",
            "hiera_tiny",
            "--fallback",
        ]);
        let config = cli.model_config()?;

        assert_eq!(config.timeout_ms, 4000);
        assert_eq!(config.architecture, Architecture::HieraTiny);
        assert!(config.fallback_to_simulation);
        Ok(())
    }
}
