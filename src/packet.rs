use std::fmt;
use std::str::{self, FromStr};

use crate::error::TftpError;
use crate::BLOCK_SIZE;

pub const OP_RRQ: u16 = 1;
pub const OP_WRQ: u16 = 2;
pub const OP_DATA: u16 = 3;
pub const OP_ACK: u16 = 4;
pub const OP_ERROR: u16 = 5;

/// Transfer mode carried by RRQ/WRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    NetAscii,
    Octet,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::NetAscii => "netascii",
            Mode::Octet => "octet",
        }
    }
}

impl FromStr for Mode {
    type Err = TftpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("octet") {
            Ok(Mode::Octet)
        } else if s.eq_ignore_ascii_case("netascii") {
            Ok(Mode::NetAscii)
        } else {
            Err(TftpError::MalformedPacket(format!("unsupported mode '{s}'")))
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RFC 1350 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    RRQ { filename: String, mode: Mode },
    WRQ { filename: String, mode: Mode },
    DATA { block: u16, data: Vec<u8> },
    ACK(u16),
    ERROR { code: ErrorCode, msg: String },
}

impl Packet {
    pub fn opcode(&self) -> u16 {
        match self {
            Packet::RRQ { .. } => OP_RRQ,
            Packet::WRQ { .. } => OP_WRQ,
            Packet::DATA { .. } => OP_DATA,
            Packet::ACK(_) => OP_ACK,
            Packet::ERROR { .. } => OP_ERROR,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Packet::RRQ { .. } | Packet::WRQ { .. })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::with_capacity(crate::MAX_PACKET_SIZE);
        bytes.extend_from_slice(&self.opcode().to_be_bytes());

        match self {
            Packet::RRQ { filename, mode } | Packet::WRQ { filename, mode } => {
                bytes.extend_from_slice(filename.as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(mode.as_str().as_bytes());
                bytes.push(0);
            }
            Packet::DATA { block, data } => {
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            Packet::ACK(block) => {
                bytes.extend_from_slice(&block.to_be_bytes());
            }
            Packet::ERROR { code, msg } => {
                bytes.extend_from_slice(&u16::from(*code).to_be_bytes());
                bytes.extend_from_slice(msg.as_bytes());
                bytes.push(0);
            }
        }
        bytes
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TftpError> {
        if buf.len() < 2 {
            return Err(TftpError::MalformedPacket("missing opcode".into()));
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let body = &buf[2..];
        let pkt = match opcode {
            OP_RRQ | OP_WRQ => {
                let (filename, rest) = read_cstr(body, "filename")?;
                let (mode, _options) = read_cstr(rest, "mode")?;
                check_request_field(&filename, "filename")?;
                check_request_field(&mode, "mode")?;
                let mode = mode.parse()?;
                // Trailing RFC 2347 option pairs are accepted and ignored.
                if opcode == OP_RRQ {
                    Packet::RRQ { filename, mode }
                } else {
                    Packet::WRQ { filename, mode }
                }
            }
            OP_DATA => {
                let block = read_block(body)?;
                let data = &body[2..];
                if data.len() > BLOCK_SIZE {
                    return Err(TftpError::MalformedPacket(format!(
                        "data payload of {} bytes exceeds {BLOCK_SIZE}",
                        data.len()
                    )));
                }
                Packet::DATA {
                    block,
                    data: data.to_vec(),
                }
            }
            OP_ACK => {
                let block = read_block(body)?;
                if body.len() != 2 {
                    return Err(TftpError::MalformedPacket("trailing bytes after ack".into()));
                }
                Packet::ACK(block)
            }
            OP_ERROR => {
                let code = read_block(body)?;
                // Message text is informational; invalid bytes are replaced.
                let (msg, _) = split_cstr(&body[2..], "error message")?;
                Packet::ERROR {
                    code: ErrorCode::from(code),
                    msg: String::from_utf8_lossy(msg).into_owned(),
                }
            }
            _ => return Err(TftpError::UnknownOpcode(opcode)),
        };

        Ok(pkt)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::RRQ { filename, mode } => write!(f, "RRQ '{filename}' ({mode})"),
            Packet::WRQ { filename, mode } => write!(f, "WRQ '{filename}' ({mode})"),
            Packet::DATA { block, data } => write!(f, "DATA #{block} ({} bytes)", data.len()),
            Packet::ACK(block) => write!(f, "ACK #{block}"),
            Packet::ERROR { code, msg } => write!(f, "ERROR {code:?}: {msg}"),
        }
    }
}

// Big-endian block number (or error code) at the start of `buf`.
fn read_block(buf: &[u8]) -> Result<u16, TftpError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(TftpError::MalformedPacket("truncated block number".into())),
    }
}

// Splits at the first NUL, returning the bytes before it and the bytes after it.
fn split_cstr<'a>(buf: &'a [u8], field: &str) -> Result<(&'a [u8], &'a [u8]), TftpError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket(format!("missing {field} terminator")))?;
    Ok((&buf[..pos], &buf[pos + 1..]))
}

// Reads a NUL-terminated string, returning it and the bytes after the terminator.
fn read_cstr<'a>(buf: &'a [u8], field: &str) -> Result<(String, &'a [u8]), TftpError> {
    let (raw, rest) = split_cstr(buf, field)?;
    let s = str::from_utf8(raw)
        .map_err(|_| TftpError::MalformedPacket(format!("invalid {field} encoding")))?
        .to_string();
    Ok((s, rest))
}

fn check_request_field(value: &str, field: &str) -> Result<(), TftpError> {
    if value.is_empty() {
        return Err(TftpError::MalformedPacket(format!("empty {field}")));
    }
    if !value.is_ascii() {
        return Err(TftpError::MalformedPacket(format!("non-ascii {field}")));
    }
    Ok(())
}
