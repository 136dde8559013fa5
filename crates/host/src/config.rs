//! Host configuration management

use crate::stream::StreamOptions;
use crate::usb::integrity::{DEFAULT_GAP_RATIO, DEFAULT_INTEGRITY_WINDOW};
use crate::usb::queue::{
    DEFAULT_FAILURE_RATIO, DEFAULT_FAILURE_WINDOW, MAX_QUEUE_SZ, QueueParams,
};
use crate::usb::scanner::{DeviceIdentity, PRODUCT_BOOT, PRODUCT_STREAM, VENDOR_ID};
use anyhow::{Context, Result, anyhow};
use processor::{CHANNELS, DEFAULT_SKIP_FRAMES, ProcessorSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "HostConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub thresholds: ThresholdSettings,
    #[serde(default)]
    pub processing: ProcessingSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            usb: UsbSettings::default(),
            stream: StreamSettings::default(),
            thresholds: ThresholdSettings::default(),
            processing: ProcessingSettings::default(),
        }
    }
}

/// Device identity and re-enumeration timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "UsbSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "UsbSettings::default_product_stream")]
    pub product_stream: u16,
    #[serde(default = "UsbSettings::default_product_boot")]
    pub product_boot: u16,
    /// Rescans after a firmware load before giving up
    #[serde(default = "UsbSettings::default_rescan_attempts")]
    pub rescan_attempts: u32,
    #[serde(default = "UsbSettings::default_rescan_delay_ms")]
    pub rescan_delay_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_stream: Self::default_product_stream(),
            product_boot: Self::default_product_boot(),
            rescan_attempts: Self::default_rescan_attempts(),
            rescan_delay_ms: Self::default_rescan_delay_ms(),
        }
    }
}

impl UsbSettings {
    fn default_vendor_id() -> u16 {
        VENDOR_ID
    }

    fn default_product_stream() -> u16 {
        PRODUCT_STREAM
    }

    fn default_product_boot() -> u16 {
        PRODUCT_BOOT
    }

    fn default_rescan_attempts() -> u32 {
        10
    }

    fn default_rescan_delay_ms() -> u64 {
        500
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.vendor_id,
            product_stream: self.product_stream,
            product_boot: self.product_boot,
        }
    }
}

/// Streaming session parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Packets per transfer; speed default when unset
    #[serde(default)]
    pub ppx: Option<usize>,
    #[serde(default = "StreamSettings::default_queue_size")]
    pub queue_size: usize,
    /// Per-request timeout in milliseconds
    #[serde(default = "StreamSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Verify the incrementing test pattern
    #[serde(default)]
    pub verify_pattern: bool,
    #[serde(default)]
    pub forward_samples: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ppx: None,
            queue_size: Self::default_queue_size(),
            timeout_ms: Self::default_timeout_ms(),
            verify_pattern: false,
            forward_samples: false,
        }
    }
}

impl StreamSettings {
    fn default_queue_size() -> usize {
        16
    }

    fn default_timeout_ms() -> u64 {
        1500
    }

    pub fn options(&self) -> StreamOptions {
        StreamOptions {
            verify_pattern: self.verify_pattern,
            forward_samples: self.forward_samples,
        }
    }
}

/// Reporting period and escalation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSettings {
    #[serde(default = "ThresholdSettings::default_bandwidth_period_ms")]
    pub bandwidth_period_ms: u64,
    /// Trailing completions considered for transfer-error escalation
    #[serde(default = "ThresholdSettings::default_failure_window")]
    pub failure_window: usize,
    #[serde(default = "ThresholdSettings::default_failure_ratio")]
    pub failure_ratio: f64,
    /// Trailing buffers considered for pattern-gap escalation
    #[serde(default = "ThresholdSettings::default_integrity_window")]
    pub integrity_window: usize,
    #[serde(default = "ThresholdSettings::default_integrity_gap_ratio")]
    pub integrity_gap_ratio: f64,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            bandwidth_period_ms: Self::default_bandwidth_period_ms(),
            failure_window: Self::default_failure_window(),
            failure_ratio: Self::default_failure_ratio(),
            integrity_window: Self::default_integrity_window(),
            integrity_gap_ratio: Self::default_integrity_gap_ratio(),
        }
    }
}

impl ThresholdSettings {
    fn default_bandwidth_period_ms() -> u64 {
        1000
    }

    fn default_failure_window() -> usize {
        DEFAULT_FAILURE_WINDOW
    }

    fn default_failure_ratio() -> f64 {
        DEFAULT_FAILURE_RATIO
    }

    fn default_integrity_window() -> usize {
        DEFAULT_INTEGRITY_WINDOW
    }

    fn default_integrity_gap_ratio() -> f64 {
        DEFAULT_GAP_RATIO
    }
}

/// Pipeline sizes and the enables applied at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSettings {
    #[serde(default)]
    pub fill_enabled: bool,
    #[serde(default)]
    pub fft_enabled: bool,
    #[serde(default = "ProcessingSettings::default_fft_skip_frames")]
    pub fft_skip_frames: u32,
    #[serde(default = "ProcessingSettings::default_fft_channels")]
    pub fft_channels: [bool; CHANNELS],
    #[serde(default)]
    pub dump_path: Option<PathBuf>,
    /// Byte limit for the dump, 0 for unlimited
    #[serde(default)]
    pub dump_limit: u64,
    /// Fill window and FFT length
    #[serde(default)]
    pub pipeline: ProcessorSettings,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            fill_enabled: false,
            fft_enabled: false,
            fft_skip_frames: Self::default_fft_skip_frames(),
            fft_channels: Self::default_fft_channels(),
            dump_path: None,
            dump_limit: 0,
            pipeline: ProcessorSettings::default(),
        }
    }
}

impl ProcessingSettings {
    fn default_fft_skip_frames() -> u32 {
        DEFAULT_SKIP_FRAMES
    }

    fn default_fft_channels() -> [bool; CHANNELS] {
        [true; CHANNELS]
    }
}

impl HostConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let p = Self::default_path();
                if !p.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                p
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("fx3-stream").join("host.toml")
        } else {
            PathBuf::from(".config/fx3-stream/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if !(1..=MAX_QUEUE_SZ).contains(&self.stream.queue_size) {
            return Err(anyhow!(
                "Invalid queue_size {}, must be between 1 and {}",
                self.stream.queue_size,
                MAX_QUEUE_SZ
            ));
        }

        if self.stream.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be greater than zero"));
        }

        if self.stream.ppx == Some(0) {
            return Err(anyhow!("ppx must be greater than zero"));
        }

        let window = self.processing.pipeline.fft_window;
        if window == 0 || !window.is_power_of_two() {
            return Err(anyhow!(
                "Invalid fft_window {}, must be a non-zero power of two",
                window
            ));
        }

        if self.processing.pipeline.fill_threshold == 0 {
            return Err(anyhow!("fill_threshold must be greater than zero"));
        }

        if self.thresholds.bandwidth_period_ms == 0 {
            return Err(anyhow!("bandwidth_period_ms must be greater than zero"));
        }

        Self::validate_window("failure", self.thresholds.failure_window, self.thresholds.failure_ratio)?;
        Self::validate_window(
            "integrity",
            self.thresholds.integrity_window,
            self.thresholds.integrity_gap_ratio,
        )?;

        Ok(())
    }

    fn validate_window(name: &str, window: usize, ratio: f64) -> Result<()> {
        if window == 0 {
            return Err(anyhow!("{}_window must be greater than zero", name));
        }
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(anyhow!(
                "Invalid {} ratio {}, must be in (0, 1]",
                name,
                ratio
            ));
        }
        Ok(())
    }

    /// Queue parameters for a request length chosen by the configurator
    pub fn queue_params(&self, request_len: usize) -> QueueParams {
        QueueParams {
            bandwidth_period: Duration::from_millis(self.thresholds.bandwidth_period_ms),
            failure_window: self.thresholds.failure_window,
            failure_ratio: self.thresholds.failure_ratio,
            ..QueueParams::new(
                request_len,
                self.stream.queue_size,
                Duration::from_millis(self.stream.timeout_ms),
            )
        }
    }
}
