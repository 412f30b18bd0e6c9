// Message types shared by the runtime, the sequencer and the telemetry publisher

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::actuator::ChannelCommand;

/// High-level motion request for the two-motor base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionIntent {
    Stop,
    Forward,
    TurnLeft,
    TurnRight,
}

impl MotionIntent {
    pub const ALL: [MotionIntent; 4] = [
        MotionIntent::Stop,
        MotionIntent::Forward,
        MotionIntent::TurnLeft,
        MotionIntent::TurnRight,
    ];
}

impl fmt::Display for MotionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotionIntent::Stop => "stop",
            MotionIntent::Forward => "forward",
            MotionIntent::TurnLeft => "turn_left",
            MotionIntent::TurnRight => "turn_right",
        };
        f.write_str(name)
    }
}

/// One entry of a maneuver script: hold `intent` for `dwell`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManeuverStep {
    pub intent: MotionIntent,
    #[serde(rename = "dwell_ms", with = "duration_ms")]
    pub dwell: Duration,
}

impl ManeuverStep {
    pub fn new(intent: MotionIntent, dwell: Duration) -> Self {
        Self { intent, dwell }
    }
}

// Durations travel as integer milliseconds in JSON
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// Command from teleop/scripts -> runtime (listen mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentCommand {
    pub intent: MotionIntent,
    /// How long to hold the intent before the watchdog stops the vehicle
    #[serde(default)]
    pub hold_ms: Option<u64>,
}

impl IntentCommand {
    pub fn into_step(self, default_hold: Duration) -> ManeuverStep {
        let dwell = self
            .hold_ms
            .map(Duration::from_millis)
            .unwrap_or(default_hold);
        ManeuverStep::new(self.intent, dwell)
    }
}

/// Sequencer state, published on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum SequencerState {
    Idle,
    Executing(usize),
    Stopping,
    Halted,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerState::Idle => f.write_str("idle"),
            SequencerState::Executing(i) => write!(f, "executing({})", i),
            SequencerState::Stopping => f.write_str("stopping"),
            SequencerState::Halted => f.write_str("halted"),
        }
    }
}

/// Operator-facing event stream; enough to rebuild the commanded motion history
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Connected {
        port: String,
        target_system: u8,
        target_component: u8,
    },
    CommandSent {
        step: Option<usize>,
        intent: MotionIntent,
        commands: Vec<ChannelCommand>,
    },
    StateChanged {
        from: SequencerState,
        to: SequencerState,
    },
    Watchdog {
        idle_ms: u64,
    },
    FeedOpened {
        device_index: u32,
        width: u32,
        height: u32,
    },
    FeedReleased {
        device_index: u32,
    },
    Shutdown {
        reason: String,
    },
}

impl TelemetryEvent {
    /// Topic suffix under the telemetry prefix
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::Connected { .. } => "link",
            TelemetryEvent::CommandSent { .. } => "command",
            TelemetryEvent::StateChanged { .. } => "state",
            TelemetryEvent::Watchdog { .. } => "watchdog",
            TelemetryEvent::FeedOpened { .. } | TelemetryEvent::FeedReleased { .. } => "feed",
            TelemetryEvent::Shutdown { .. } => "shutdown",
        }
    }
}
