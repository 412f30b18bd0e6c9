// Motion intent -> channel output mapping for the two-motor base
//
// Owns the channel-to-motor assignment and the PWM conventions, so wiring
// changes only touch the configuration consumed here.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::messages::MotionIntent;

/// Default PWM conventions (microseconds)
pub const DEFAULT_PWM_MIN: u16 = 1000;
pub const DEFAULT_PWM_NEUTRAL: u16 = 1500;
pub const DEFAULT_PWM_MAX: u16 = 2000;

/// Default wiring: left motor on servo output 1, right motor on output 2
pub const DEFAULT_LEFT_CHANNEL: u8 = 1;
pub const DEFAULT_RIGHT_CHANNEL: u8 = 2;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActuatorError {
    #[error("Output value {value} on channel {channel} outside accepted range {min}..={max}")]
    OutOfRange {
        channel: u8,
        value: u16,
        min: u16,
        max: u16,
    },

    #[error("Invalid channel index {channel} (channels start at 1)")]
    InvalidChannel { channel: u8 },

    #[error("Left and right motors share channel {channel}")]
    DuplicateChannel { channel: u8 },

    #[error("Invalid PWM range: min={min}, neutral={neutral}, max={max}")]
    InvalidRange { min: u16, neutral: u16, max: u16 },
}

/// Accepted output values for the flight controller's servo outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwmRange {
    pub min: u16,
    pub neutral: u16,
    pub max: u16,
}

impl Default for PwmRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_PWM_MIN,
            neutral: DEFAULT_PWM_NEUTRAL,
            max: DEFAULT_PWM_MAX,
        }
    }
}

impl PwmRange {
    pub fn validate(&self) -> Result<(), ActuatorError> {
        if self.min <= self.neutral && self.neutral <= self.max && self.min < self.max {
            Ok(())
        } else {
            Err(ActuatorError::InvalidRange {
                min: self.min,
                neutral: self.neutral,
                max: self.max,
            })
        }
    }

    pub fn contains(&self, value: u16) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// One servo output setting. Only constructible through [`ChannelCommand::new`],
/// so every instance carries an in-range value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelCommand {
    channel: u8,
    value: u16,
}

impl ChannelCommand {
    pub fn new(channel: u8, value: u16, range: &PwmRange) -> Result<Self, ActuatorError> {
        if channel == 0 {
            return Err(ActuatorError::InvalidChannel { channel });
        }
        if !range.contains(value) {
            return Err(ActuatorError::OutOfRange {
                channel,
                value,
                min: range.min,
                max: range.max,
            });
        }
        Ok(Self { channel, value })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn value(&self) -> u16 {
        self.value
    }
}

/// Which servo output drives which motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMap {
    pub left: u8,
    pub right: u8,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            left: DEFAULT_LEFT_CHANNEL,
            right: DEFAULT_RIGHT_CHANNEL,
        }
    }
}

/// Output values for one intent, (left, right)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPair {
    pub left: u16,
    pub right: u16,
}

impl OutputPair {
    pub const fn new(left: u16, right: u16) -> Self {
        Self { left, right }
    }
}

/// Per-intent output table. Stop is not listed: it is always neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentTable {
    pub forward: OutputPair,
    pub turn_left: OutputPair,
    pub turn_right: OutputPair,
}

impl Default for IntentTable {
    fn default() -> Self {
        Self {
            forward: OutputPair::new(1900, 1900),
            turn_left: OutputPair::new(1400, 1700),
            turn_right: OutputPair::new(1700, 1400),
        }
    }
}

/// Actuator section of the vehicle configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub channels: ChannelMap,
    pub range: PwmRange,
    pub intents: IntentTable,
}

/// Resolved command pair, (left, right)
pub type CommandPair = [ChannelCommand; 2];

/// The neutral pair, obtainable only from a validated mapper. Links may send
/// it without the liveness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopCommands(CommandPair);

impl StopCommands {
    pub fn commands(&self) -> &CommandPair {
        &self.0
    }
}

/// Validated intent -> command table
#[derive(Debug, Clone)]
pub struct ActuatorMapper {
    stop: CommandPair,
    forward: CommandPair,
    turn_left: CommandPair,
    turn_right: CommandPair,
}

impl ActuatorMapper {
    /// Validate the configuration once; `resolve` cannot fail afterwards
    pub fn new(config: &ActuatorConfig) -> Result<Self, ActuatorError> {
        let ActuatorConfig {
            channels,
            range,
            intents,
        } = config;

        range.validate()?;
        if channels.left == channels.right {
            return Err(ActuatorError::DuplicateChannel {
                channel: channels.left,
            });
        }

        let pair = |out: OutputPair| -> Result<CommandPair, ActuatorError> {
            Ok([
                ChannelCommand::new(channels.left, out.left, range)?,
                ChannelCommand::new(channels.right, out.right, range)?,
            ])
        };

        let mapper = Self {
            stop: pair(OutputPair::new(range.neutral, range.neutral))?,
            forward: pair(intents.forward)?,
            turn_left: pair(intents.turn_left)?,
            turn_right: pair(intents.turn_right)?,
        };
        debug!("Actuator mapping ready: {:?}", mapper);
        Ok(mapper)
    }

    pub fn resolve(&self, intent: MotionIntent) -> CommandPair {
        match intent {
            MotionIntent::Stop => self.stop,
            MotionIntent::Forward => self.forward,
            MotionIntent::TurnLeft => self.turn_left,
            MotionIntent::TurnRight => self.turn_right,
        }
    }

    pub fn stop_commands(&self) -> StopCommands {
        StopCommands(self.stop)
    }
}

impl Default for ActuatorMapper {
    fn default() -> Self {
        // Defaults are statically in range; an error here is a broken constant
        match Self::new(&ActuatorConfig::default()) {
            Ok(mapper) => mapper,
            Err(e) => panic!("default actuator configuration invalid: {}", e),
        }
    }
}
