//! Persistent application settings (JSON file in the app data directory).
//!
//! Precedence, lowest first: built-in defaults, `settings.json`, `TAPEDECK_*`
//! environment variables, command-line options.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tapedeck_core::{BitDepth, SessionConfig};
use tracing::warn;

use crate::cli::Overrides;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub host: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub client_name: String,
    pub channels: u16,
    pub block_size: Option<u32>,
    pub queue_capacity: usize,
    pub pop_timeout_ms: u64,
    pub input_gain: f32,
    pub bit_depth: BitDepth,
    pub resample_to_device: bool,
    pub recordings_dir: Option<PathBuf>,
    pub level_interval_blocks: u64,
    pub show_levels: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        let core = SessionConfig::default();
        Self {
            host: None,
            input_device: None,
            output_device: None,
            client_name: core.client_name,
            channels: core.channels,
            block_size: None,
            queue_capacity: core.queue_capacity,
            pop_timeout_ms: core.pop_timeout.as_millis() as u64,
            input_gain: core.input_gain,
            bit_depth: core.bit_depth,
            resample_to_device: core.resample_to_device,
            recordings_dir: None,
            level_interval_blocks: core.level_interval_blocks,
            show_levels: true,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.host = normalize_name(self.host.take()).map(|h| h.to_ascii_lowercase());
        self.input_device = normalize_name(self.input_device.take());
        self.output_device = normalize_name(self.output_device.take());
        self.client_name = normalize_name(Some(std::mem::take(&mut self.client_name)))
            .unwrap_or_else(|| SessionConfig::default().client_name);
        self.channels = self.channels.clamp(1, 32);
        self.block_size = self.block_size.filter(|&b| b > 0).map(|b| b.min(8192));
        self.queue_capacity = self.queue_capacity.clamp(1, 10_000);
        self.pop_timeout_ms = self.pop_timeout_ms.clamp(1, 5_000);
        self.input_gain = if self.input_gain.is_finite() {
            self.input_gain.clamp(0.0, 16.0)
        } else {
            1.0
        };
        self.recordings_dir = self
            .recordings_dir
            .take()
            .filter(|dir| !dir.as_os_str().is_empty());
        self.level_interval_blocks = self.level_interval_blocks.clamp(1, 100_000);
    }

    /// Apply `TAPEDECK_*` overrides read through `lookup`. Unparseable values
    /// are ignored with a warning.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TAPEDECK_HOST") {
            self.host = Some(v);
        }
        if let Some(v) = lookup("TAPEDECK_INPUT_DEVICE") {
            self.input_device = Some(v);
        }
        if let Some(v) = lookup("TAPEDECK_OUTPUT_DEVICE") {
            self.output_device = Some(v);
        }
        if let Some(v) = lookup("TAPEDECK_RECORDINGS_DIR") {
            self.recordings_dir = Some(PathBuf::from(v));
        }
        parse_override(&lookup, "TAPEDECK_CHANNELS", &mut self.channels);
        parse_override(&lookup, "TAPEDECK_QUEUE_CAPACITY", &mut self.queue_capacity);
        parse_override(&lookup, "TAPEDECK_INPUT_GAIN", &mut self.input_gain);
        parse_override(&lookup, "TAPEDECK_BIT_DEPTH", &mut self.bit_depth);
        parse_override(&lookup, "TAPEDECK_RESAMPLE", &mut self.resample_to_device);
        self.normalize();
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Fold in command-line options. `device` applies to the direction the
    /// command uses.
    pub fn apply_cli(&mut self, overrides: &Overrides, playback: bool) {
        if let Some(host) = &overrides.host {
            self.host = Some(host.clone());
        }
        if let Some(device) = &overrides.device {
            if playback {
                self.output_device = Some(device.clone());
            } else {
                self.input_device = Some(device.clone());
            }
        }
        if let Some(channels) = overrides.channels {
            self.channels = channels;
        }
        if let Some(bit_depth) = overrides.bit_depth {
            self.bit_depth = bit_depth;
        }
        if let Some(gain) = overrides.gain {
            self.input_gain = gain;
        }
        if let Some(capacity) = overrides.queue_capacity {
            self.queue_capacity = capacity;
        }
        if overrides.block_size.is_some() {
            self.block_size = overrides.block_size;
        }
        self.normalize();
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            client_name: self.client_name.clone(),
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            channels: self.channels,
            block_size: self.block_size,
            queue_capacity: self.queue_capacity,
            pop_timeout: Duration::from_millis(self.pop_timeout_ms),
            input_gain: self.input_gain,
            bit_depth: self.bit_depth,
            resample_to_device: self.resample_to_device,
            level_interval_blocks: self.level_interval_blocks,
            recordings_dir: self.recordings_dir.clone(),
            ..SessionConfig::default()
        }
    }
}

fn normalize_name(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = raw.as_str(), "ignoring unparseable override"),
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Tapedeck")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("tapedeck")
            .join("settings.json")
    }
}

/// Missing or malformed files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), "ignoring malformed settings file: {e}");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
