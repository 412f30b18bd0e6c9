// Flight-controller link session
//
// Owns the serial transport, performs the heartbeat handshake and gates every
// command on the liveness state. Heartbeat freshness is refreshed by
// `poll_liveness`, never by command sends.

use serialport::SerialPort;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::mavlink::{self, FrameParser, MAV_TYPE_GCS, Message};
use crate::actuator::{ChannelCommand, StopCommands};
use crate::shutdown::ShutdownSignal;

/// Our own MAVLink identity (GCS-style ids, as used by ground tools)
pub const DEFAULT_SYSTEM_ID: u8 = 255;
pub const DEFAULT_COMPONENT_ID: u8 = 190;

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LIVENESS_MAX_AGE: Duration = Duration::from_secs(3);
pub const DEFAULT_GCS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Upper bound on reads per poll so a chatty link cannot stall the caller
const MAX_READS_PER_POLL: usize = 32;
const READ_CHUNK: usize = 256;

/// Link-level failures
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("No heartbeat from flight controller within {waited:?}")]
    Timeout { waited: Duration },

    #[error("Handshake cancelled after {waited:?}")]
    Cancelled { waited: Duration },

    #[error("Serial port {port} unavailable: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Link not connected (state: {state})")]
    NotConnected { state: Liveness },

    #[error("Transmission failed: {0}")]
    TransmissionError(#[from] std::io::Error),
}

/// The session's belief about whether the link is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Disconnected,
    AwaitingHeartbeat,
    Connected,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Liveness::Disconnected => "disconnected",
            Liveness::AwaitingHeartbeat => "awaiting_heartbeat",
            Liveness::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub system_id: u8,
    pub component_id: u8,
    /// How long `connect` waits for the first heartbeat
    pub heartbeat_timeout: Duration,
    /// Oldest acceptable heartbeat before the link is declared lost
    pub liveness_max_age: Duration,
    /// Interval for our own GCS heartbeat; None disables it
    pub gcs_heartbeat_interval: Option<Duration>,
    /// Serial read timeout, also the blocking granularity of a poll
    pub read_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            system_id: DEFAULT_SYSTEM_ID,
            component_id: DEFAULT_COMPONENT_ID,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            liveness_max_age: DEFAULT_LIVENESS_MAX_AGE,
            gcs_heartbeat_interval: Some(DEFAULT_GCS_HEARTBEAT_INTERVAL),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Capability the sequencer drives: liveness check plus channel transmission
pub trait CommandLink {
    /// Refresh link health. Fails with `NotConnected` once the link is lost.
    fn poll_liveness(&mut self) -> Result<(), LinkError>;

    /// Transmit one set of channel outputs
    fn send_channel_commands(&mut self, commands: &[ChannelCommand]) -> Result<(), LinkError>;

    /// Best-effort neutral outputs, written even when the link is believed
    /// lost. A single attempt that leaves the liveness state untouched.
    fn send_stop(&mut self, stop: &StopCommands) -> Result<(), LinkError>;
}

/// Live session with a flight controller
pub struct LinkSession<T: Read + Write = Box<dyn SerialPort>> {
    transport: T,
    port: String,
    options: SessionOptions,
    target_system: u8,
    target_component: u8,
    liveness: Liveness,
    last_heartbeat: Option<Instant>,
    last_gcs_heartbeat: Option<Instant>,
    last_ack: Option<(u16, u8)>,
    seq: u8,
    parser: FrameParser,
}

impl LinkSession {
    /// Open the serial port and block until the flight controller's heartbeat
    /// arrives or `heartbeat_timeout` elapses. No retries: that is the caller's call.
    pub fn connect(port: &str, baud: u32, options: SessionOptions) -> Result<Self, LinkError> {
        Self::connect_until(port, baud, options, None)
    }

    /// As `connect`, abandoning the handshake with `Cancelled` once `shutdown` fires
    pub fn connect_until(
        port: &str,
        baud: u32,
        options: SessionOptions,
        shutdown: Option<&ShutdownSignal>,
    ) -> Result<Self, LinkError> {
        info!("Opening flight controller link on {} @ {} baud", port, baud);
        let transport = serialport::new(port, baud)
            .timeout(options.read_timeout)
            .open()
            .map_err(|source| LinkError::PortUnavailable {
                port: port.to_string(),
                source,
            })?;
        Self::establish_until(port, transport, options, shutdown)
    }
}

impl<T: Read + Write> LinkSession<T> {
    /// Run the heartbeat handshake over an already-open transport
    pub fn establish(port: &str, transport: T, options: SessionOptions) -> Result<Self, LinkError> {
        Self::establish_until(port, transport, options, None)
    }

    pub fn establish_until(
        port: &str,
        transport: T,
        options: SessionOptions,
        shutdown: Option<&ShutdownSignal>,
    ) -> Result<Self, LinkError> {
        let mut session = Self {
            transport,
            port: port.to_string(),
            options,
            target_system: 0,
            target_component: 0,
            liveness: Liveness::AwaitingHeartbeat,
            last_heartbeat: None,
            last_gcs_heartbeat: None,
            last_ack: None,
            seq: 0,
            parser: FrameParser::new(),
        };

        info!(
            "Waiting up to {:?} for flight controller heartbeat",
            session.options.heartbeat_timeout
        );
        let started = Instant::now();
        let deadline = started + session.options.heartbeat_timeout;

        while Instant::now() < deadline {
            if shutdown.is_some_and(ShutdownSignal::is_triggered) {
                session.liveness = Liveness::Disconnected;
                info!("Handshake on {} cancelled", session.port);
                return Err(LinkError::Cancelled {
                    waited: started.elapsed(),
                });
            }
            if let Err(e) = session.read_available(1) {
                session.liveness = Liveness::Disconnected;
                return Err(e);
            }
            if session.liveness == Liveness::Connected {
                info!(
                    target_system = session.target_system,
                    target_component = session.target_component,
                    "Heartbeat received, link connected on {}",
                    session.port
                );
                return Ok(session);
            }
        }

        session.liveness = Liveness::Disconnected;
        warn!("No heartbeat on {} after {:?}", session.port, started.elapsed());
        Err(LinkError::Timeout {
            waited: started.elapsed(),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn target_system(&self) -> u8 {
        self.target_system
    }

    pub fn target_component(&self) -> u8 {
        self.target_component
    }

    /// Last COMMAND_ACK seen as (command, result)
    pub fn last_ack(&self) -> Option<(u16, u8)> {
        self.last_ack
    }

    /// True iff the last heartbeat is no older than `max_age` at `now`
    pub fn is_alive(&self, now: Instant, max_age: Duration) -> bool {
        match self.last_heartbeat {
            Some(at) => now.saturating_duration_since(at) <= max_age,
            None => false,
        }
    }

    /// Drain inbound frames without waiting for more than one read timeout
    pub fn refresh(&mut self) -> Result<(), LinkError> {
        if let Err(e) = self.read_available(MAX_READS_PER_POLL) {
            self.mark_disconnected("read failed");
            return Err(e);
        }
        Ok(())
    }

    fn read_available(&mut self, max_reads: usize) -> Result<(), LinkError> {
        let mut chunk = [0u8; READ_CHUNK];
        for _ in 0..max_reads {
            match self.transport.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.parser.push(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(LinkError::TransmissionError(e)),
            }
        }

        while let Some(frame) = self.parser.next_frame() {
            match frame.message {
                Message::Heartbeat { .. } if frame.system_id == self.options.system_id => {
                    // Our own heartbeat echoed back or another GCS using our id
                }
                Message::Heartbeat { mav_type, .. } if mav_type == MAV_TYPE_GCS => {
                    // Other ground stations never become the target
                }
                Message::Heartbeat { mav_type, .. } => {
                    if self.liveness == Liveness::AwaitingHeartbeat {
                        self.target_system = frame.system_id;
                        self.target_component = frame.component_id;
                        self.liveness = Liveness::Connected;
                        debug!(
                            "Flight controller sysid={} compid={} type={}",
                            frame.system_id, frame.component_id, mav_type
                        );
                    }
                    if frame.system_id == self.target_system {
                        self.last_heartbeat = Some(Instant::now());
                    }
                }
                Message::CommandAck { command, result } => {
                    debug!("COMMAND_ACK command={} result={}", command, result);
                    self.last_ack = Some((command, result));
                }
                Message::CommandLong { .. } => {}
            }
        }
        Ok(())
    }

    fn mark_disconnected(&mut self, reason: &str) {
        if self.liveness != Liveness::Disconnected {
            warn!("Link on {} lost: {}", self.port, reason);
        }
        self.liveness = Liveness::Disconnected;
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn encode_servo_frames(&mut self, commands: &[ChannelCommand]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for cmd in commands {
            let seq = self.next_seq();
            let msg = Message::set_servo(
                self.target_system,
                self.target_component,
                cmd.channel(),
                cmd.value(),
            );
            bytes.extend(mavlink::encode_v1(
                seq,
                self.options.system_id,
                self.options.component_id,
                &msg,
            ));
            debug!("DO_SET_SERVO channel={} value={}", cmd.channel(), cmd.value());
        }
        bytes
    }

    fn write_frames(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let result = self
            .transport
            .write_all(bytes)
            .and_then(|_| self.transport.flush());
        if let Err(e) = result {
            self.mark_disconnected("write failed");
            return Err(LinkError::TransmissionError(e));
        }
        Ok(())
    }

    fn send_gcs_heartbeat_if_due(&mut self, now: Instant) -> Result<(), LinkError> {
        let Some(interval) = self.options.gcs_heartbeat_interval else {
            return Ok(());
        };
        let due = match self.last_gcs_heartbeat {
            Some(at) => now.saturating_duration_since(at) >= interval,
            None => true,
        };
        if due {
            let seq = self.next_seq();
            let frame = mavlink::encode_v1(
                seq,
                self.options.system_id,
                self.options.component_id,
                &Message::gcs_heartbeat(),
            );
            self.write_frames(&frame)?;
            self.last_gcs_heartbeat = Some(now);
        }
        Ok(())
    }
}

impl<T: Read + Write> CommandLink for LinkSession<T> {
    fn poll_liveness(&mut self) -> Result<(), LinkError> {
        if self.liveness != Liveness::Connected {
            return Err(LinkError::NotConnected {
                state: self.liveness,
            });
        }

        self.refresh()?;
        let now = Instant::now();
        self.send_gcs_heartbeat_if_due(now)?;

        if !self.is_alive(now, self.options.liveness_max_age) {
            self.mark_disconnected("heartbeat stale");
            return Err(LinkError::NotConnected {
                state: self.liveness,
            });
        }
        Ok(())
    }

    fn send_channel_commands(&mut self, commands: &[ChannelCommand]) -> Result<(), LinkError> {
        if self.liveness != Liveness::Connected {
            return Err(LinkError::NotConnected {
                state: self.liveness,
            });
        }

        let bytes = self.encode_servo_frames(commands);
        self.write_frames(&bytes)
    }

    fn send_stop(&mut self, stop: &StopCommands) -> Result<(), LinkError> {
        if self.liveness != Liveness::Connected {
            warn!("Sending stop on {} while link is {}", self.port, self.liveness);
        }
        let bytes = self.encode_servo_frames(stop.commands());
        self.transport
            .write_all(&bytes)
            .and_then(|_| self.transport.flush())?;
        Ok(())
    }
}

impl<T: Read + Write> Drop for LinkSession<T> {
    fn drop(&mut self) {
        info!("Closing flight controller link on {}", self.port);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actuator::PwmRange;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory stand-in for the serial port
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        pub inbound: Arc<Mutex<VecDeque<u8>>>,
        pub outbound: Arc<Mutex<Vec<u8>>>,
        pub fail_writes: Arc<AtomicBool>,
        /// Fails the next write only
        pub fail_next_write: Arc<AtomicBool>,
    }

    impl MockTransport {
        pub fn feed(&self, bytes: &[u8]) {
            self.inbound.lock().unwrap().extend(bytes.iter().copied());
        }

        pub fn sent_frames(&self) -> Vec<mavlink::Frame> {
            let mut parser = FrameParser::new();
            parser.push(&self.outbound.lock().unwrap());
            std::iter::from_fn(|| parser.next_frame()).collect()
        }
    }

    impl Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                drop(inbound);
                std::thread::sleep(Duration::from_millis(1));
                return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes.load(Ordering::SeqCst)
                || self.fail_next_write.swap(false, Ordering::SeqCst)
            {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "cable pulled"));
            }
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn fc_heartbeat_frame(seq: u8) -> Vec<u8> {
        let hb = Message::Heartbeat {
            custom_mode: 0,
            mav_type: 10,
            autopilot: 3,
            base_mode: 0x81,
            system_status: 4,
            mavlink_version: 3,
        };
        mavlink::encode_v1(seq, 1, 1, &hb)
    }

    pub(crate) fn test_options() -> SessionOptions {
        SessionOptions {
            heartbeat_timeout: Duration::from_millis(100),
            gcs_heartbeat_interval: None,
            ..SessionOptions::default()
        }
    }

    pub(crate) fn connected_session() -> (LinkSession<MockTransport>, MockTransport) {
        connected_session_with(test_options())
    }

    pub(crate) fn connected_session_with(
        options: SessionOptions,
    ) -> (LinkSession<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        transport.feed(&fc_heartbeat_frame(0));
        let session =
            LinkSession::establish("mock", transport.clone(), options).expect("handshake");
        (session, transport)
    }

    fn servo_values(transport: &MockTransport) -> Vec<(f32, f32)> {
        transport
            .sent_frames()
            .into_iter()
            .filter_map(|f| match f.message {
                Message::CommandLong { params, .. } => Some((params[0], params[1])),
                _ => None,
            })
            .collect()
    }

    fn commands(left: u16, right: u16) -> [ChannelCommand; 2] {
        let range = PwmRange::default();
        [
            ChannelCommand::new(1, left, &range).unwrap(),
            ChannelCommand::new(2, right, &range).unwrap(),
        ]
    }

    #[test]
    fn test_handshake_learns_target() {
        let (session, _) = connected_session();
        assert_eq!(session.liveness(), Liveness::Connected);
        assert_eq!(session.target_system(), 1);
        assert_eq!(session.target_component(), 1);
    }

    #[test]
    fn test_handshake_times_out_without_heartbeat() {
        let transport = MockTransport::default();
        // Heartbeat carrying our own system id does not count
        transport.feed(&mavlink::encode_v1(
            0,
            DEFAULT_SYSTEM_ID,
            DEFAULT_COMPONENT_ID,
            &Message::gcs_heartbeat(),
        ));
        let result = LinkSession::establish("mock", transport, test_options());
        assert!(matches!(result, Err(LinkError::Timeout { .. })));
    }

    #[test]
    fn test_handshake_skips_other_ground_stations() {
        let transport = MockTransport::default();
        transport.feed(&mavlink::encode_v1(0, 200, 190, &Message::gcs_heartbeat()));
        transport.feed(&fc_heartbeat_frame(0));

        let session = LinkSession::establish("mock", transport, test_options()).unwrap();
        assert_eq!(session.target_system(), 1);
        assert_eq!(session.target_component(), 1);

        let transport = MockTransport::default();
        transport.feed(&mavlink::encode_v1(0, 200, 190, &Message::gcs_heartbeat()));
        let result = LinkSession::establish("mock", transport, test_options());
        assert!(matches!(result, Err(LinkError::Timeout { .. })));
    }

    #[test]
    fn test_handshake_observes_shutdown() {
        let options = SessionOptions {
            heartbeat_timeout: Duration::from_secs(30),
            ..test_options()
        };
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            trigger.trigger();
        });

        let started = Instant::now();
        let result =
            LinkSession::establish_until("mock", MockTransport::default(), options, Some(&shutdown));
        canceller.join().unwrap();

        assert!(matches!(result, Err(LinkError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_connect_missing_port_is_unavailable() {
        let result = LinkSession::connect(
            "/dev/rover-link-no-such-port",
            57_600,
            SessionOptions::default(),
        );
        assert!(matches!(result, Err(LinkError::PortUnavailable { .. })));
    }

    #[test]
    fn test_send_emits_set_servo_per_channel() {
        let (mut session, transport) = connected_session();
        session.send_channel_commands(&commands(1900, 1700)).unwrap();

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 2);
        for (frame, (channel, pwm)) in frames.iter().zip([(1.0, 1900.0), (2.0, 1700.0)]) {
            assert_eq!(frame.system_id, DEFAULT_SYSTEM_ID);
            match &frame.message {
                Message::CommandLong {
                    params,
                    command,
                    target_system,
                    target_component,
                    ..
                } => {
                    assert_eq!(*command, mavlink::MAV_CMD_DO_SET_SERVO);
                    assert_eq!((*target_system, *target_component), (1, 1));
                    assert_eq!(params[0], channel);
                    assert_eq!(params[1], pwm);
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert_eq!(frames[1].seq, frames[0].seq.wrapping_add(1));
    }

    #[test]
    fn test_write_failure_disconnects_and_gates_later_sends() {
        let (mut session, transport) = connected_session();
        transport.fail_writes.store(true, Ordering::SeqCst);

        let first = session.send_channel_commands(&commands(1500, 1500));
        assert!(matches!(first, Err(LinkError::TransmissionError(_))));
        assert_eq!(session.liveness(), Liveness::Disconnected);

        transport.fail_writes.store(false, Ordering::SeqCst);
        let second = session.send_channel_commands(&commands(1500, 1500));
        assert!(matches!(
            second,
            Err(LinkError::NotConnected {
                state: Liveness::Disconnected
            })
        ));
        assert!(transport.outbound.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stop_is_written_after_link_loss() {
        let (mut session, transport) = connected_session();
        let stop = crate::actuator::ActuatorMapper::default().stop_commands();

        transport.fail_next_write.store(true, Ordering::SeqCst);
        assert!(session.send_channel_commands(&commands(1900, 1900)).is_err());
        assert_eq!(session.liveness(), Liveness::Disconnected);

        session.send_stop(&stop).unwrap();
        assert_eq!(servo_values(&transport), vec![(1.0, 1500.0), (2.0, 1500.0)]);
        // Still gated for everything else
        assert_eq!(session.liveness(), Liveness::Disconnected);
        assert!(session.send_channel_commands(&commands(1900, 1900)).is_err());

        transport.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(
            session.send_stop(&stop),
            Err(LinkError::TransmissionError(_))
        ));
    }

    #[test]
    fn test_is_alive_boundaries() {
        let (mut session, _) = connected_session();
        let t0 = Instant::now();
        session.last_heartbeat = Some(t0);
        let max_age = Duration::from_millis(500);

        assert!(session.is_alive(t0, max_age));
        assert!(session.is_alive(t0 + max_age, max_age));
        assert!(!session.is_alive(t0 + max_age + Duration::from_millis(1), max_age));

        session.last_heartbeat = None;
        assert!(!session.is_alive(t0, max_age));
    }

    #[test]
    fn test_stale_heartbeat_drops_link() {
        let (mut session, _) = connected_session();
        session.options.liveness_max_age = Duration::from_millis(5);
        std::thread::sleep(Duration::from_millis(20));

        let result = session.poll_liveness();
        assert!(matches!(result, Err(LinkError::NotConnected { .. })));
        assert_eq!(session.liveness(), Liveness::Disconnected);
    }

    #[test]
    fn test_poll_refreshes_heartbeat_and_records_ack() {
        let (mut session, transport) = connected_session();
        session.options.liveness_max_age = Duration::from_millis(200);
        std::thread::sleep(Duration::from_millis(100));

        transport.feed(&fc_heartbeat_frame(1));
        transport.feed(&mavlink::encode_v1(
            2,
            1,
            1,
            &Message::CommandAck {
                command: mavlink::MAV_CMD_DO_SET_SERVO,
                result: 0,
            },
        ));

        session.poll_liveness().unwrap();
        assert_eq!(session.liveness(), Liveness::Connected);
        assert!(session.is_alive(Instant::now(), Duration::from_millis(50)));
        assert_eq!(session.last_ack(), Some((mavlink::MAV_CMD_DO_SET_SERVO, 0)));
    }

    #[test]
    fn test_poll_sends_gcs_heartbeat_when_due() {
        let transport = MockTransport::default();
        transport.feed(&fc_heartbeat_frame(0));
        let options = SessionOptions {
            gcs_heartbeat_interval: Some(Duration::from_secs(60)),
            ..test_options()
        };
        let mut session = LinkSession::establish("mock", transport.clone(), options).unwrap();

        session.poll_liveness().unwrap();
        session.poll_liveness().unwrap();

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1, "one heartbeat per interval");
        assert_eq!(frames[0].message, Message::gcs_heartbeat());
    }
}
