pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::{PixelFormat, StreamRole};
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
use pipeline::PipelineOptions;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "twincam.toml";
/// Environment prefix, e.g. `TWINCAM__CAPTURE__WIDTH=1280`.
pub const ENV_PREFIX: &str = "TWINCAM";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    #[default]
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    /// `None` probes `/dev/video*` for a capture node
    pub device: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: usize,
    pub role: StreamRole,
    /// JPEG still painted by the synthetic camera
    pub pattern: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::V4l2,
            device: None,
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
            role: StreamRole::Viewfinder,
            pattern: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBackend {
    #[default]
    Kms,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub backend: DisplayBackend,
    pub card: PathBuf,
    pub connector: Option<u32>,
    // Virtual card only
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub max_scale: f32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: DisplayBackend::Kms,
            card: PathBuf::from("/dev/dri/card0"),
            connector: None,
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            max_scale: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub drain_timeout_ms: u64,
    pub commit_timeout_ms: u64,
    pub frame_limit: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 2000,
            commit_timeout_ms: 1000,
            frame_limit: None,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file, then `TWINCAM__SECTION__KEY` variables.
    ///
    /// Without an explicit path `twincam.toml` is read if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
        };
        config::Config::builder()
            .add_source(file.format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|err| Error::Configuration(format!("loading configuration: {err}")))
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            role: self.capture.role,
            buffer_count: self.capture.buffer_count,
            drain_timeout: Duration::from_millis(self.pipeline.drain_timeout_ms),
            commit_timeout: Duration::from_millis(self.pipeline.commit_timeout_ms),
            frame_limit: self.pipeline.frame_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_drive_a_four_buffer_viewfinder() {
        let options = Config::default().pipeline_options();
        assert_eq!(options.buffer_count, 4);
        assert_eq!(options.role, StreamRole::Viewfinder);
        assert_eq!(options.drain_timeout, Duration::from_secs(2));
        assert_eq!(options.frame_limit, None);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[capture]\nbackend = \"synthetic\"\nformat = \"nv12\"\n[pipeline]\nframe_limit = 9\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();

        assert_eq!(config.capture.backend, CaptureBackend::Synthetic);
        assert_eq!(config.capture.format, PixelFormat::Nv12);
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.display, DisplayConfig::default());
        assert_eq!(config.pipeline.frame_limit, Some(9));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/twincam.toml"))).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
