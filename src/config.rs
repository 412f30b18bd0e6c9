// Defaults, topics and the vehicle configuration file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actuator::{ActuatorConfig, ActuatorError, ActuatorMapper};
use crate::link::{DEFAULT_COMPONENT_ID, DEFAULT_SYSTEM_ID, SessionOptions};
use crate::messages::{ManeuverStep, MotionIntent};

// Listen-mode loop frequency (zenoh subscriber drain)
pub const LOOP_HZ: u64 = 50;

// Hold time for a triggered intent that does not carry its own
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_INTENT: &str = "rover/cmd/intent"; // motion intents
pub const TOPIC_TELEMETRY_PREFIX: &str = "rover/telemetry"; // <prefix>/<kind>

// Flight controller link (Pixhawk on the Pi's UART)
pub const DEFAULT_PORT: &str = "/dev/ttyAMA0";
pub const DEFAULT_BAUD: u32 = 57_600;

// Camera
pub const DEFAULT_CAMERA_INDEX: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid actuator configuration: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Invalid link configuration: {0}")]
    Link(String),

    #[error("Maneuver script is empty")]
    EmptyScript,
}

/// Serial link section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub port: String,
    pub baud: u32,
    pub system_id: u8,
    pub component_id: u8,
    pub heartbeat_timeout_ms: u64,
    pub liveness_max_age_ms: u64,
    /// 0 disables our own heartbeat
    pub gcs_heartbeat_interval_ms: u64,
    pub liveness_check_interval_ms: u64,
    /// Connection attempts before giving up (runtime retry policy)
    pub connect_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DEFAULT_BAUD,
            system_id: DEFAULT_SYSTEM_ID,
            component_id: DEFAULT_COMPONENT_ID,
            heartbeat_timeout_ms: 10_000,
            liveness_max_age_ms: 3_000,
            gcs_heartbeat_interval_ms: 1_000,
            liveness_check_interval_ms: 250,
            connect_attempts: 1,
        }
    }
}

impl LinkConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            system_id: self.system_id,
            component_id: self.component_id,
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            liveness_max_age: Duration::from_millis(self.liveness_max_age_ms),
            gcs_heartbeat_interval: match self.gcs_heartbeat_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            ..SessionOptions::default()
        }
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub device_index: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_index: DEFAULT_CAMERA_INDEX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub topic_prefix: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic_prefix: TOPIC_TELEMETRY_PREFIX.to_string(),
        }
    }
}

/// Everything the runtime consumes. Missing sections fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub link: LinkConfig,
    pub actuator: ActuatorConfig,
    pub script: Vec<ManeuverStep>,
    pub camera: CameraConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            actuator: ActuatorConfig::default(),
            script: default_script(),
            camera: CameraConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Bench test maneuver: forward, pause, left, pause, right
pub fn default_script() -> Vec<ManeuverStep> {
    let secs = Duration::from_secs;
    vec![
        ManeuverStep::new(MotionIntent::Forward, secs(5)),
        ManeuverStep::new(MotionIntent::Stop, secs(2)),
        ManeuverStep::new(MotionIntent::TurnLeft, secs(5)),
        ManeuverStep::new(MotionIntent::Stop, secs(2)),
        ManeuverStep::new(MotionIntent::TurnRight, secs(5)),
    ]
}

impl VehicleConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked before touching hardware
    pub fn validate(&self) -> Result<(), ConfigError> {
        ActuatorMapper::new(&self.actuator)?;
        if self.link.port.is_empty() {
            return Err(ConfigError::Link("serial port path is empty".into()));
        }
        if self.link.baud == 0 {
            return Err(ConfigError::Link("baud rate must be non-zero".into()));
        }
        if self.link.connect_attempts == 0 {
            return Err(ConfigError::Link("connect_attempts must be at least 1".into()));
        }
        if self.link.liveness_max_age_ms == 0 {
            return Err(ConfigError::Link("liveness_max_age_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Scripted runs additionally need something to execute
    pub fn script(&self) -> Result<&[ManeuverStep], ConfigError> {
        if self.script.is_empty() {
            return Err(ConfigError::EmptyScript);
        }
        Ok(&self.script)
    }
}
