use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::activation::DetectionMode;
use crate::processing::color::{OutputMode, ReducerOptions};
use crate::protocol::DEFAULT_PORT;
use crate::schedule::{Location, system_timezone};

pub const DEFAULT_CONTROL_SOCKET_PATH: &str = "/run/wscast/control.sock";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// IPv4 address of the LED controller. Activation fails until one is set.
    pub address: Option<Ipv4Addr>,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl DeviceConfig {
    pub fn endpoint(&self) -> Option<SocketAddrV4> {
        self.address.map(|ip| SocketAddrV4::new(ip, self.port))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SamplingConfig {
    /// Period of the capture → reduce → send tick while connected.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub saturation_factor: f32,
    /// HSV value forced on every pixel before clustering (0–255).
    pub value: u8,
    pub output_mode: OutputMode,
    /// Deterministic seed for the clustering initialisation.
    pub seed: Option<u64>,
}

impl SamplingConfig {
    pub fn reducer_options(&self) -> ReducerOptions {
        ReducerOptions {
            saturation_factor: self.saturation_factor,
            value: self.value,
            output_mode: self.output_mode,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            saturation_factor: 1.0,
            value: 128,
            output_mode: OutputMode::Static,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub mode: DetectionMode,
    /// Period of the fullscreen check while armed.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Auto,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// Pinned timezone; the host timezone is used when unset.
    pub timezone: Option<Tz>,
    /// Restrict fullscreen detection to the night window.
    pub night_only: bool,
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl ScheduleConfig {
    pub fn location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn resolved_timezone(&self) -> Tz {
        self.timezone.unwrap_or_else(system_timezone)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            latitude: Location::DEFAULT.latitude,
            longitude: Location::DEFAULT.longitude,
            timezone: None,
            night_only: true,
            check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    pub device: DeviceConfig,
    /// Strip brightness, 0–100.
    pub brightness_percent: f32,
    pub sampling: SamplingConfig,
    pub detection: DetectionConfig,
    pub schedule: ScheduleConfig,
    /// Unix domain socket accepting runtime control commands.
    pub control_socket_path: PathBuf,
    /// When set, the palette preview is written here as PNG after each tick.
    pub preview_path: Option<PathBuf>,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(self.device.port > 0, "device.port must be non-zero");
        ensure!(
            !self.device.connect_timeout.is_zero(),
            "device.connect-timeout must be positive"
        );
        ensure!(
            self.brightness_percent.is_finite()
                && (0.0..=100.0).contains(&self.brightness_percent),
            "brightness-percent must be within 0-100"
        );
        self.sampling
            .validate()
            .context("invalid sampling configuration")?;
        ensure!(
            !self.detection.poll_interval.is_zero(),
            "detection.poll-interval must be positive"
        );
        ensure!(
            self.schedule.location().is_valid(),
            "schedule.latitude must be within ±90 and schedule.longitude within ±180"
        );
        ensure!(
            !self.schedule.check_interval.is_zero(),
            "schedule.check-interval must be positive"
        );
        ensure!(
            !self.control_socket_path.as_os_str().is_empty(),
            "control-socket-path must not be empty"
        );
        ensure!(
            self.control_socket_path.file_name().is_some(),
            "control-socket-path must include a socket file name"
        );
        if let Some(path) = &self.preview_path {
            ensure!(
                path.file_name().is_some(),
                "preview-path must include a file name"
            );
        }
        Ok(self)
    }
}

impl SamplingConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            !self.interval.is_zero(),
            "sampling.interval must be positive"
        );
        ensure!(
            self.saturation_factor.is_finite() && self.saturation_factor >= 0.0,
            "sampling.saturation-factor must be non-negative"
        );
        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            brightness_percent: 50.0,
            sampling: SamplingConfig::default(),
            detection: DetectionConfig::default(),
            schedule: ScheduleConfig::default(),
            control_socket_path: PathBuf::from(DEFAULT_CONTROL_SOCKET_PATH),
            preview_path: None,
        }
    }
}
