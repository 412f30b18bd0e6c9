pub mod actuator;
pub mod config;
pub mod link;
pub mod messages;
pub mod perception;
pub mod runtime;
pub mod sequencer;
pub mod shutdown;
pub mod telemetry;
