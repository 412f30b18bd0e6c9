// MAVLink framing for the flight-controller link
//
// Outgoing frames are v1: [0xFE, len, seq, sysid, compid, msgid, payload..., crc_lo, crc_hi]
// Incoming frames may be v1 or v2 (0xFD, 10-byte header, optional 13-byte signature).
// The checksum is CRC-16/MCRF4XX over everything after the start marker, finished
// with the per-message CRC_EXTRA seed byte.

use tracing::debug;

/// Start markers
pub const STX_V1: u8 = 0xFE;
pub const STX_V2: u8 = 0xFD;

const V1_HEADER_LEN: usize = 6; // stx, len, seq, sysid, compid, msgid
const V2_HEADER_LEN: usize = 10; // stx, len, incompat, compat, seq, sysid, compid, msgid(3)
const CRC_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_FLAG_SIGNED: u8 = 0x01;

/// Parser buffer limit; anything beyond this without a complete frame is garbage
const MAX_BUFFERED: usize = 4096;

/// Message ids handled by this link
pub const MSG_ID_HEARTBEAT: u32 = 0;
pub const MSG_ID_COMMAND_LONG: u32 = 76;
pub const MSG_ID_COMMAND_ACK: u32 = 77;

/// MAV_CMD_DO_SET_SERVO: param1 = output channel, param2 = PWM microseconds
pub const MAV_CMD_DO_SET_SERVO: u16 = 183;

/// MAV_TYPE_GCS / MAV_AUTOPILOT_INVALID, used for our own heartbeat
pub const MAV_TYPE_GCS: u8 = 6;
pub const MAV_AUTOPILOT_INVALID: u8 = 8;
pub const MAVLINK_VERSION: u8 = 3;

const HEARTBEAT_LEN: usize = 9;
const COMMAND_LONG_LEN: usize = 33;
const COMMAND_ACK_LEN: usize = 3;

/// CRC_EXTRA seed and wire length for the messages we know how to decode
fn message_info(msg_id: u32) -> Option<(u8, usize)> {
    match msg_id {
        MSG_ID_HEARTBEAT => Some((50, HEARTBEAT_LEN)),
        MSG_ID_COMMAND_LONG => Some((152, COMMAND_LONG_LEN)),
        MSG_ID_COMMAND_ACK => Some((143, COMMAND_ACK_LEN)),
        _ => None,
    }
}

/// Errors produced while decoding a frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("Checksum mismatch for message {msg_id}: expected 0x{expected:04X}, got 0x{received:04X}")]
    ChecksumMismatch {
        msg_id: u32,
        expected: u16,
        received: u16,
    },

    #[error("Payload for message {msg_id} too short: {len} bytes")]
    PayloadTooShort { msg_id: u32, len: usize },
}

/// X.25 CRC accumulator (CRC-16/MCRF4XX)
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn new() -> Self {
        Self(0xFFFF)
    }

    pub fn accumulate(&mut self, byte: u8) {
        let mut tmp = byte ^ (self.0 & 0xFF) as u8;
        tmp ^= tmp << 4;
        let tmp = tmp as u16;
        self.0 = (self.0 >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4);
    }

    pub fn accumulate_all(&mut self, data: &[u8]) {
        for &b in data {
            self.accumulate(b);
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages exchanged with the flight controller
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat {
        custom_mode: u32,
        mav_type: u8,
        autopilot: u8,
        base_mode: u8,
        system_status: u8,
        mavlink_version: u8,
    },
    CommandLong {
        params: [f32; 7],
        command: u16,
        target_system: u8,
        target_component: u8,
        confirmation: u8,
    },
    CommandAck {
        command: u16,
        result: u8,
    },
}

impl Message {
    /// Heartbeat announcing this process as a ground station
    pub fn gcs_heartbeat() -> Self {
        Message::Heartbeat {
            custom_mode: 0,
            mav_type: MAV_TYPE_GCS,
            autopilot: MAV_AUTOPILOT_INVALID,
            base_mode: 0,
            system_status: 0,
            mavlink_version: MAVLINK_VERSION,
        }
    }

    /// DO_SET_SERVO command for one output channel
    pub fn set_servo(target_system: u8, target_component: u8, channel: u8, pwm: u16) -> Self {
        Message::CommandLong {
            params: [channel as f32, pwm as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
            command: MAV_CMD_DO_SET_SERVO,
            target_system,
            target_component,
            confirmation: 0,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Message::Heartbeat { .. } => MSG_ID_HEARTBEAT,
            Message::CommandLong { .. } => MSG_ID_COMMAND_LONG,
            Message::CommandAck { .. } => MSG_ID_COMMAND_ACK,
        }
    }

    /// Serialize the payload in wire order (fields sorted by size, little-endian)
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Message::Heartbeat {
                custom_mode,
                mav_type,
                autopilot,
                base_mode,
                system_status,
                mavlink_version,
            } => {
                let mut out = Vec::with_capacity(HEARTBEAT_LEN);
                out.extend_from_slice(&custom_mode.to_le_bytes());
                out.extend_from_slice(&[
                    *mav_type,
                    *autopilot,
                    *base_mode,
                    *system_status,
                    *mavlink_version,
                ]);
                out
            }
            Message::CommandLong {
                params,
                command,
                target_system,
                target_component,
                confirmation,
            } => {
                let mut out = Vec::with_capacity(COMMAND_LONG_LEN);
                for p in params {
                    out.extend_from_slice(&p.to_le_bytes());
                }
                out.extend_from_slice(&command.to_le_bytes());
                out.extend_from_slice(&[*target_system, *target_component, *confirmation]);
                out
            }
            Message::CommandAck { command, result } => {
                let mut out = Vec::with_capacity(COMMAND_ACK_LEN);
                out.extend_from_slice(&command.to_le_bytes());
                out.push(*result);
                out
            }
        }
    }

    /// Decode a payload. Returns Ok(None) for message ids this link does not handle.
    pub fn decode(msg_id: u32, payload: &[u8]) -> Result<Option<Self>, FrameError> {
        let Some((_, wire_len)) = message_info(msg_id) else {
            return Ok(None);
        };
        if payload.is_empty() {
            return Err(FrameError::PayloadTooShort {
                msg_id,
                len: payload.len(),
            });
        }

        // v2 senders strip trailing zero bytes
        let mut p = payload.to_vec();
        if p.len() < wire_len {
            p.resize(wire_len, 0);
        }

        let msg = match msg_id {
            MSG_ID_HEARTBEAT => Message::Heartbeat {
                custom_mode: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                mav_type: p[4],
                autopilot: p[5],
                base_mode: p[6],
                system_status: p[7],
                mavlink_version: p[8],
            },
            MSG_ID_COMMAND_LONG => {
                let mut params = [0.0f32; 7];
                for (i, param) in params.iter_mut().enumerate() {
                    let o = i * 4;
                    *param = f32::from_le_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]]);
                }
                Message::CommandLong {
                    params,
                    command: u16::from_le_bytes([p[28], p[29]]),
                    target_system: p[30],
                    target_component: p[31],
                    confirmation: p[32],
                }
            }
            MSG_ID_COMMAND_ACK => Message::CommandAck {
                command: u16::from_le_bytes([p[0], p[1]]),
                result: p[2],
            },
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// A checksum-verified frame with its routing header
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u8,
    pub system_id: u8,
    pub component_id: u8,
    pub message: Message,
}

/// Build a v1 frame for an outgoing message
pub fn encode_v1(seq: u8, system_id: u8, component_id: u8, message: &Message) -> Vec<u8> {
    let payload = message.encode_payload();
    let msg_id = message.id();
    let (crc_extra, _) = message_info(msg_id).unwrap_or((0, payload.len()));

    let mut frame = Vec::with_capacity(V1_HEADER_LEN + payload.len() + CRC_LEN);
    frame.push(STX_V1);
    frame.push(payload.len() as u8);
    frame.push(seq);
    frame.push(system_id);
    frame.push(component_id);
    frame.push(msg_id as u8);
    frame.extend_from_slice(&payload);

    let mut crc = Crc16::new();
    crc.accumulate_all(&frame[1..]); // skip start marker
    crc.accumulate(crc_extra);
    frame.extend_from_slice(&crc.value().to_le_bytes());

    frame
}

/// Incremental decoder for a byte stream carrying v1 and v2 frames
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFERED {
            let excess = self.buf.len() - MAX_BUFFERED;
            self.buf.drain(..excess);
        }
    }

    /// Bytes held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame that decodes to a known message.
    ///
    /// Frames with unknown ids are skipped, frames failing the checksum are
    /// dropped (logged) and scanning resumes at the following byte.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let start = self.buf.iter().position(|&b| b == STX_V1 || b == STX_V2);
            match start {
                Some(0) => {}
                Some(i) => {
                    self.buf.drain(..i);
                }
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            let (header_len, payload_len, signed) = match self.buf[0] {
                STX_V1 => {
                    if self.buf.len() < 2 {
                        return None;
                    }
                    (V1_HEADER_LEN, self.buf[1] as usize, false)
                }
                _ => {
                    if self.buf.len() < 3 {
                        return None;
                    }
                    let signed = self.buf[2] & INCOMPAT_FLAG_SIGNED != 0;
                    (V2_HEADER_LEN, self.buf[1] as usize, signed)
                }
            };

            let sig_len = if signed { SIGNATURE_LEN } else { 0 };
            let total = header_len + payload_len + CRC_LEN + sig_len;
            if self.buf.len() < total {
                return None;
            }

            let raw: Vec<u8> = self.buf[..total].to_vec();
            match Self::decode_raw(&raw, header_len, payload_len) {
                Ok(Some(frame)) => {
                    self.buf.drain(..total);
                    return Some(frame);
                }
                Ok(None) => {
                    // Unknown message id, consume and keep scanning
                    self.buf.drain(..total);
                }
                Err(e) => {
                    debug!("Dropping frame: {}", e);
                    self.buf.drain(..1);
                }
            }
        }
    }

    fn decode_raw(
        raw: &[u8],
        header_len: usize,
        payload_len: usize,
    ) -> Result<Option<Frame>, FrameError> {
        let (seq, system_id, component_id, msg_id) = if raw[0] == STX_V1 {
            (raw[2], raw[3], raw[4], raw[5] as u32)
        } else {
            let msg_id = u32::from_le_bytes([raw[7], raw[8], raw[9], 0]);
            (raw[4], raw[5], raw[6], msg_id)
        };

        let Some((crc_extra, _)) = message_info(msg_id) else {
            return Ok(None);
        };

        let crc_at = header_len + payload_len;
        let mut crc = Crc16::new();
        crc.accumulate_all(&raw[1..crc_at]);
        crc.accumulate(crc_extra);
        let received = u16::from_le_bytes([raw[crc_at], raw[crc_at + 1]]);
        if crc.value() != received {
            return Err(FrameError::ChecksumMismatch {
                msg_id,
                expected: crc.value(),
                received,
            });
        }

        let payload = &raw[header_len..crc_at];
        Ok(Message::decode(msg_id, payload)?.map(|message| Frame {
            seq,
            system_id,
            component_id,
            message,
        }))
    }
}
