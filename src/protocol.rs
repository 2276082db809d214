//! Wire format for the sandbox command protocol.
//!
//! Every message is a fixed-size header followed by a payload whose length
//! is implied by the opcode:
//!
//! ```text
//! +------------+------------+---------------------------+
//! | opcode u32 | tag u32    | payload[table[opcode]]    |
//! +------------+------------+---------------------------+
//!   little-endian             no length prefix, no delimiter
//! ```
//!
//! Nothing here performs I/O. Lookups are constant time so the event loop
//! can validate a header inline.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of an encoded [`CommandHeader`] in bytes.
pub const HEADER_LEN: usize = 8;

/// Upper bound for any single payload in a [`PayloadTable`].
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Errors produced while validating headers or building a payload table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid opcode {0}")]
    InvalidOpcode(u32),
    #[error("opcode {0:?} declared more than once")]
    DuplicateOpcode(Opcode),
    #[error("opcode {0:?} has no payload size")]
    MissingOpcode(Opcode),
    #[error("payload for {opcode:?} is {len} bytes, limit is {max}", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge { opcode: Opcode, len: usize },
    #[error("payload for opcode {opcode} must be {expected} bytes, got {actual}")]
    PayloadLength {
        opcode: u32,
        expected: usize,
        actual: usize,
    },
}

/// Known command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    AddUnit = 0,
    GetUnit = 1,
}

impl Opcode {
    /// Number of declared opcodes. Any raw value at or above this is invalid.
    pub const COUNT: usize = 2;

    /// Every opcode, in wire order.
    pub const ALL: [Opcode; Opcode::COUNT] = [Opcode::AddUnit, Opcode::GetUnit];

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Opcode {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::AddUnit),
            1 => Ok(Opcode::GetUnit),
            other => Err(CodecError::InvalidOpcode(other)),
        }
    }
}

/// Fixed-size command header.
///
/// The opcode is kept raw so that out-of-range values can be carried to the
/// point where they are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: u32,
    /// Opaque correlation value chosen by the client.
    pub tag: u32,
}

impl CommandHeader {
    pub fn new(opcode: Opcode, tag: u32) -> Self {
        Self {
            opcode: opcode.as_u32(),
            tag,
        }
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let opcode = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let tag = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { opcode, tag }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..].copy_from_slice(&self.tag.to_le_bytes());
        out
    }

    /// Typed opcode, or `InvalidOpcode` if the raw value is out of range.
    pub fn command(&self) -> Result<Opcode, CodecError> {
        Opcode::try_from(self.opcode)
    }
}

/// Immutable opcode → payload size mapping.
///
/// Construction checks that every declared opcode appears exactly once, so
/// lookups afterwards cannot miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadTable {
    sizes: [usize; Opcode::COUNT],
}

impl PayloadTable {
    pub fn new(entries: &[(Opcode, usize)]) -> Result<Self, CodecError> {
        let mut sizes: [Option<usize>; Opcode::COUNT] = [None; Opcode::COUNT];

        for &(opcode, len) in entries {
            if len > MAX_PAYLOAD_LEN {
                return Err(CodecError::PayloadTooLarge { opcode, len });
            }
            let slot = &mut sizes[opcode as usize];
            if slot.is_some() {
                return Err(CodecError::DuplicateOpcode(opcode));
            }
            *slot = Some(len);
        }

        let mut resolved = [0usize; Opcode::COUNT];
        for opcode in Opcode::ALL {
            resolved[opcode as usize] =
                sizes[opcode as usize].ok_or(CodecError::MissingOpcode(opcode))?;
        }

        Ok(Self { sizes: resolved })
    }

    /// Payload length for a raw opcode taken off the wire.
    pub fn payload_len(&self, opcode: u32) -> Result<usize, CodecError> {
        self.sizes
            .get(opcode as usize)
            .copied()
            .ok_or(CodecError::InvalidOpcode(opcode))
    }

    pub fn max_payload_len(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0)
    }
}

impl Default for PayloadTable {
    fn default() -> Self {
        Self {
            sizes: [32, 16],
        }
    }
}

/// Build a complete frame for `header`, checking the payload length.
pub fn encode_command(
    header: &CommandHeader,
    payload: &[u8],
    table: &PayloadTable,
) -> Result<Bytes, CodecError> {
    let expected = table.payload_len(header.opcode)?;
    if payload.len() != expected {
        return Err(CodecError::PayloadLength {
            opcode: header.opcode,
            expected,
            actual: payload.len(),
        });
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(&header.encode());
    frame.put_slice(payload);
    Ok(frame.freeze())
}
