//! Wire codec (C1): encode/decode of the five RFC 1350 packet kinds.
//!
//! TFTP option extensions (blksize/windowsize/timeout/tsize, RFC 2347/2348/2349)
//! are out of scope: `Packet` has no OACK variant and `decode` never parses
//! trailing option fields.

use thiserror::Error;

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

/// Maximum DATA payload per block (RFC 1350, no blksize negotiation).
pub const BLOCK_SIZE: usize = 512;

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ { filename: String, mode: Mode },
    WRQ { filename: String, mode: Mode },
    DATA { block_num: u16, data: Vec<u8> },
    ACK { block_num: u16 },
    ERROR { code: u16, msg: String },
}

/// Transfer mode, RFC 1350 §5. Mode strings are matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Octet,
    NetAscii,
}

impl Mode {
    fn parse(s: &str) -> Option<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Mode::Octet),
            "netascii" => Some(Mode::NetAscii),
            _ => None,
        }
    }

    fn as_wire_str(self) -> &'static str {
        match self {
            Mode::Octet => "octet",
            Mode::NetAscii => "netascii",
        }
    }

    /// Whether the served file should be opened in binary mode.
    pub fn is_binary(self) -> bool {
        matches!(self, Mode::Octet)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet shorter than a 2-byte opcode")]
    TooShort,
    #[error("request missing a null terminator for filename or mode")]
    MissingTerminator,
    #[error("unsupported transfer mode {0:?}")]
    IllegalMode(String),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("DATA payload length {0} out of range [0, {BLOCK_SIZE}]")]
    InvalidDataLength(usize),
    #[error("ACK packet shorter than 4 bytes")]
    AckTooShort,
    #[error("ERROR packet shorter than 5 bytes")]
    ErrorTooShort,
    #[error("field is not valid UTF-8")]
    NotUtf8,
}

impl Packet {
    /// Parse raw datagram bytes into a `Packet`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort);
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => decode_request(buf, true),
            OPCODE_WRQ => decode_request(buf, false),
            OPCODE_DATA => decode_data(buf),
            OPCODE_ACK => decode_ack(buf),
            OPCODE_ERROR => decode_error(buf),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::RRQ { filename, mode } => encode_request(OPCODE_RRQ, filename, *mode),
            Packet::WRQ { filename, mode } => encode_request(OPCODE_WRQ, filename, *mode),
            Packet::DATA { block_num, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::ACK { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf
            }
            Packet::ERROR { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
        }
    }
}

fn decode_request(buf: &[u8], is_rrq: bool) -> Result<Packet, DecodeError> {
    let payload = &buf[2..];

    // Both the filename and the mode must be individually null-terminated.
    let first_nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator)?;
    let rest = &payload[first_nul + 1..];
    let second_nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator)?;

    let filename_bytes = &payload[..first_nul];
    let mode_bytes = &rest[..second_nul];

    let filename =
        String::from_utf8(filename_bytes.to_vec()).map_err(|_| DecodeError::NotUtf8)?;
    let mode_str = String::from_utf8(mode_bytes.to_vec()).map_err(|_| DecodeError::NotUtf8)?;
    let mode = Mode::parse(&mode_str).ok_or(DecodeError::IllegalMode(mode_str))?;

    if is_rrq {
        Ok(Packet::RRQ { filename, mode })
    } else {
        Ok(Packet::WRQ { filename, mode })
    }
}

fn decode_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::InvalidDataLength(buf.len().saturating_sub(4)));
    }
    let payload_len = buf.len() - 4;
    if payload_len > BLOCK_SIZE {
        return Err(DecodeError::InvalidDataLength(payload_len));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::DATA {
        block_num,
        data: buf[4..].to_vec(),
    })
}

fn decode_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::AckTooShort);
    }
    // A longer-than-4-byte ACK is tolerated; the block# is always bytes 2..4.
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::ACK { block_num })
}

fn decode_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 5 {
        return Err(DecodeError::ErrorTooShort);
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(msg_bytes.len());
    let msg = String::from_utf8_lossy(&msg_bytes[..end]).to_string();
    Ok(Packet::ERROR { code, msg })
}

fn encode_request(opcode: u16, filename: &str, mode: Mode) -> Vec<u8> {
    let mode_str = mode.as_wire_str();
    let mut buf = Vec::with_capacity(4 + filename.len() + mode_str.len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode_str.as_bytes());
    buf.push(0);
    buf
}
