// Flight-controller link
//
// - MAVLink framing (v1 out, v1/v2 in)
// - Heartbeat-gated session over the serial port

pub mod mavlink;
mod session;

pub use session::{
    CommandLink, LinkError, LinkSession, Liveness, SessionOptions, DEFAULT_COMPONENT_ID,
    DEFAULT_SYSTEM_ID,
};

#[cfg(test)]
pub(crate) use session::tests as session_tests;
