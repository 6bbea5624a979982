use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::activation::{ActivationState, DetectionIndicator, DetectionMode};
use crate::processing::color::OutputMode;

/// Runtime control request, one JSON object per line on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlCommand {
    ToggleManual,
    SetManual {
        engaged: bool,
    },
    SetDetectionMode {
        mode: DetectionMode,
    },
    SetOutputMode {
        mode: OutputMode,
    },
    SetSamplingInterval {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    SetSaturation {
        factor: f32,
    },
    SetBrightness {
        percent: f32,
    },
    /// Four dotted-quad fields as typed by the user.
    SetEndpoint {
        octets: Vec<String>,
        #[serde(default)]
        port: Option<u16>,
    },
    SetLocation {
        latitude: f64,
        longitude: f64,
    },
    /// `None` follows the host timezone again.
    SetTimezone {
        #[serde(default)]
        timezone: Option<Tz>,
    },
    SetNightOnly {
        enabled: bool,
    },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

impl ControlReply {
    pub fn success(status: &StatusSnapshot) -> Self {
        Self {
            ok: true,
            error: None,
            status: serde_json::to_value(status).ok(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            status: None,
        }
    }
}

/// A control command plus an optional reply slot (signals carry none).
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: Option<oneshot::Sender<ControlReply>>,
}

impl ControlRequest {
    pub fn fire_and_forget(command: ControlCommand) -> Self {
        Self {
            command,
            reply: None,
        }
    }
}

/// Read-only view of the runtime published to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusSnapshot {
    pub state: ActivationState,
    pub indicator: DetectionIndicator,
    pub detection_mode: DetectionMode,
    pub output_mode: OutputMode,
    pub connected: bool,
    pub night_active: bool,
    pub night_only: bool,
    pub fullscreen_detected: bool,
    pub status: String,
    pub attached_window: Option<String>,
    pub endpoint: Option<String>,
    /// Controller address of the open session, if any.
    pub peer: Option<String>,
    pub brightness_percent: f32,
    pub sunrise: String,
    pub sunset: String,
    pub timezone: String,
}
