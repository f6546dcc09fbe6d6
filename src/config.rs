use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "SESSION_ENGINE_CONFIG";

pub const MIN_FADE_OUT_SECONDS: f32 = 5.0;
pub const MAX_FADE_OUT_SECONDS: f32 = 60.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Play through the default cpal output device.
    #[default]
    Device,
    /// Blocks are pulled by the caller (tests, WAV renders).
    Offline,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// Base URL library paths are resolved against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Local fallback for library paths when `api_base` is unset.
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_noise_loop_seconds")]
    pub noise_loop_seconds: f32,
    #[serde(default = "default_fade_in_ms")]
    pub fade_in_ms: u64,
    #[serde(default = "default_fade_out_seconds")]
    pub fade_out_seconds: f32,
    #[serde(default = "default_volume_ramp_ms")]
    pub volume_ramp_ms: u64,
    #[serde(default = "default_disable_ramp_ms")]
    pub disable_ramp_ms: u64,
    #[serde(default = "default_finalize_slack_ms")]
    pub finalize_slack_ms: u64,
    #[serde(default = "default_true")]
    pub soft_preflight: bool,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default)]
    pub output: OutputMode,
}

fn default_library_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_noise_loop_seconds() -> f32 {
    12.0
}

fn default_fade_in_ms() -> u64 {
    1500
}

fn default_fade_out_seconds() -> f32 {
    10.0
}

fn default_volume_ramp_ms() -> u64 {
    120
}

fn default_disable_ramp_ms() -> u64 {
    200
}

fn default_finalize_slack_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_http_timeout_seconds() -> u64 {
    20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            library_dir: default_library_dir(),
            output_dir: default_output_dir(),
            sample_rate: default_sample_rate(),
            noise_loop_seconds: default_noise_loop_seconds(),
            fade_in_ms: default_fade_in_ms(),
            fade_out_seconds: default_fade_out_seconds(),
            volume_ramp_ms: default_volume_ramp_ms(),
            disable_ramp_ms: default_disable_ramp_ms(),
            finalize_slack_ms: default_finalize_slack_ms(),
            soft_preflight: true,
            http_timeout_seconds: default_http_timeout_seconds(),
            output: OutputMode::Device,
        }
    }
}

/// Keep a fade-out inside the range the players offer.
pub fn clamp_fade_out(seconds: f32) -> f32 {
    if seconds.is_nan() {
        return default_fade_out_seconds();
    }
    seconds.clamp(MIN_FADE_OUT_SECONDS, MAX_FADE_OUT_SECONDS)
}

impl EngineConfig {
    pub fn from_toml(txt: &str) -> Result<Self, EngineError> {
        toml::from_str(txt).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let txt = std::fs::read_to_string(path)?;
        Self::from_toml(&txt)
    }

    /// Config for an engine rendered by the caller instead of a device.
    pub fn offline(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            output: OutputMode::Offline,
            ..Self::default()
        }
    }

    pub fn fade_out_seconds(&self) -> f32 {
        clamp_fade_out(self.fade_out_seconds)
    }

    pub fn write_to_file(&self, path: &str) -> Result<(), EngineError> {
        let txt = toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, txt)?;
        Ok(())
    }

    pub fn generate_default(path: &str) -> Result<(), EngineError> {
        EngineConfig::default().write_to_file(path)
    }
}

pub static CONFIG: Lazy<EngineConfig> = Lazy::new(|| {
    let path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    match std::fs::read_to_string(&path) {
        Ok(txt) => EngineConfig::from_toml(&txt).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config");
            EngineConfig::default()
        }),
        Err(_) => EngineConfig::default(),
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = EngineConfig::from_toml(
            "api_base = \"http://localhost:8000\"\nsample_rate = 48000\noutput = \"offline\"\n",
        )
        .unwrap();
        assert_eq!(cfg.api_base.as_deref(), Some("http://localhost:8000"));
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.output, OutputMode::Offline);
        assert_eq!(cfg.fade_in_ms, 1500);
        assert_eq!(cfg.volume_ramp_ms, 120);
        assert!(cfg.soft_preflight);
    }

    #[test]
    fn fade_out_is_clamped() {
        assert_eq!(clamp_fade_out(1.0), 5.0);
        assert_eq!(clamp_fade_out(90.0), 60.0);
        assert_eq!(clamp_fade_out(12.0), 12.0);
        let cfg = EngineConfig {
            fade_out_seconds: 0.5,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.fade_out_seconds(), 5.0);
    }

    #[test]
    fn default_round_trips_through_file() {
        let path = std::env::temp_dir().join(format!("session_engine_cfg_{}.toml", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        EngineConfig::generate_default(&path_str).unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.output, OutputMode::Device);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        assert!(matches!(
            EngineConfig::from_toml("sample_rate = \"fast\""),
            Err(EngineError::Config(_))
        ));
    }
}
