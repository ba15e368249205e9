//! Reactive node protocol: command codes, envelopes and payload packing
//!
//! Every integer on the wire is big-endian (network byte order).

use crate::error::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;

/// Commands understood by the event manager running on each node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandCode {
    Connect = 0x0,
    Call = 0x1,
    RemoteOutput = 0x2,
    Load = 0x3,
    ModuleOutput = 0x4,
    Ping = 0x5,
    RegisterEntrypoint = 0x6,
}

impl CommandCode {
    /// Whether the node answers this command with a result message
    pub fn has_response(self) -> bool {
        !matches!(self, CommandCode::RemoteOutput | CommandCode::ModuleOutput)
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandCode::Connect => "Connect",
            CommandCode::Call => "Call",
            CommandCode::RemoteOutput => "RemoteOutput",
            CommandCode::Load => "Load",
            CommandCode::ModuleOutput => "ModuleOutput",
            CommandCode::Ping => "Ping",
            CommandCode::RegisterEntrypoint => "RegisterEntrypoint",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status carried by every result message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0x0,
    IllegalCommand = 0x1,
    IllegalPayload = 0x2,
    InternalError = 0x3,
    BadRequest = 0x4,
    CryptoError = 0x5,
    GenericError = 0x6,
}

impl ResultCode {
    /// Unknown codes collapse to `GenericError`, like the node does
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x0 => ResultCode::Ok,
            0x1 => ResultCode::IllegalCommand,
            0x2 => ResultCode::IllegalPayload,
            0x3 => ResultCode::InternalError,
            0x4 => ResultCode::BadRequest,
            0x5 => ResultCode::CryptoError,
            _ => ResultCode::GenericError,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Entry points every module exposes besides its own
pub mod entry {
    pub const SET_KEY: u16 = 0x0;
    pub const ATTEST: u16 = 0x1;
    pub const HANDLE_INPUT: u16 = 0x2;
}

/// A command addressed to one node endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub code: CommandCode,
    pub payload: Vec<u8>,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl CommandMessage {
    pub fn new(code: CommandCode, payload: Vec<u8>, address: Ipv4Addr, port: u16) -> Self {
        Self {
            code,
            payload,
            address,
            port,
        }
    }

    pub fn has_response(&self) -> bool {
        self.code.has_response()
    }

    /// Frame the command: `code(2) || len || payload`, where `len` is 4
    /// bytes for Load (module images easily exceed 64 KiB) and 2 otherwise.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = PayloadWriter::with_capacity(self.payload.len() + 6);
        out.put_u16(self.code as u16);
        if self.code == CommandCode::Load {
            let len = u32::try_from(self.payload.len())
                .map_err(|_| Error::Protocol("Load payload exceeds 4 GiB".into()))?;
            out.put_u32(len);
        } else {
            let len = u16::try_from(self.payload.len()).map_err(|_| {
                Error::Protocol(format!("{} payload exceeds 64 KiB", self.code))
            })?;
            out.put_u16(len);
        }
        out.put_bytes(&self.payload);
        Ok(out.finish())
    }
}

/// A node's answer to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub code: ResultCode,
    pub payload: Vec<u8>,
}

impl ResultMessage {
    pub fn new(code: ResultCode, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    pub fn ok(payload: Vec<u8>) -> Self {
        Self::new(ResultCode::Ok, payload)
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Frame the result: `code(1) || len(2) || payload`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| Error::Protocol("result payload exceeds 64 KiB".into()))?;
        let mut out = PayloadWriter::with_capacity(self.payload.len() + 3);
        out.put_u8(self.code as u8);
        out.put_u16(len);
        out.put_bytes(&self.payload);
        Ok(out.finish())
    }
}

/// Big-endian payload builder
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u128(&mut self, value: u128) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Read a big-endian `u16` at `offset`
pub fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "payload too short: need {} bytes, got {}",
                offset + 2,
                bytes.len()
            ))
        })
}
