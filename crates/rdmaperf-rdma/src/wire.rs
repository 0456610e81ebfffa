//! Buffer descriptor wire format and transfer-mode translation.
//!
//! The descriptor is the only application-level message: a packed
//! 20-byte record, big-endian, sent with a two-sided send.
//!
//! ```text
//! 0       8       12      16      20
//! +-------+-------+-------+-------+
//! | addr  | rkey  | size  | mode  |
//! +-------+-------+-------+-------+
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RdmaError, Result};

/// Encoded size of a [`BufferDescriptor`].
pub const DESCRIPTOR_LEN: usize = 20;

/// Locally configured transfer mode: who issues which RDMA verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    /// This side issues RDMA reads.
    ActiveRead,
    /// This side issues RDMA writes.
    ActiveWrite,
    /// This side advertises a buffer for the peer to read.
    PassiveRead,
    /// This side advertises a buffer for the peer to write.
    PassiveWrite,
}

impl TransferMode {
    /// Raw representation for atomic storage.
    pub fn as_u8(self) -> u8 {
        self.wire() as u8
    }

    /// Inverse of [`TransferMode::as_u8`].
    pub fn from_u8(raw: u8) -> Option<Self> {
        WireMode::from_tag(raw as u32).map(WireMode::advertised)
    }

    /// Tag this side puts on the wire for its own mode.
    pub fn wire(self) -> WireMode {
        match self {
            TransferMode::ActiveRead => WireMode::ActRead,
            TransferMode::ActiveWrite => WireMode::ActWrite,
            TransferMode::PassiveRead => WireMode::PasRead,
            TransferMode::PassiveWrite => WireMode::PasWrite,
        }
    }

    /// True for the modes that issue RDMA verbs.
    pub fn is_active(self) -> bool {
        matches!(self, TransferMode::ActiveRead | TransferMode::ActiveWrite)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferMode::ActiveRead => "active-read",
            TransferMode::ActiveWrite => "active-write",
            TransferMode::PassiveRead => "passive-read",
            TransferMode::PassiveWrite => "passive-write",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TransferMode {
    type Err = RdmaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active-read" => Ok(TransferMode::ActiveRead),
            "active-write" => Ok(TransferMode::ActiveWrite),
            "passive-read" => Ok(TransferMode::PassiveRead),
            "passive-write" => Ok(TransferMode::PassiveWrite),
            other => Err(RdmaError::Config(format!("unknown transfer mode {other:?}"))),
        }
    }
}

/// Mode tag as carried in the descriptor's `mode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WireMode {
    /// Sender will RDMA-read.
    ActRead = 0,
    /// Sender will RDMA-write.
    ActWrite = 1,
    /// Sender's buffer is to be read.
    PasRead = 2,
    /// Sender's buffer is to be written.
    PasWrite = 3,
}

impl WireMode {
    /// Decode a raw tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(WireMode::ActRead),
            1 => Some(WireMode::ActWrite),
            2 => Some(WireMode::PasRead),
            3 => Some(WireMode::PasWrite),
            _ => None,
        }
    }

    /// The mode the sender was running when it put this tag on the wire.
    fn advertised(self) -> TransferMode {
        match self {
            WireMode::ActRead => TransferMode::ActiveRead,
            WireMode::ActWrite => TransferMode::ActiveWrite,
            WireMode::PasRead => TransferMode::PassiveRead,
            WireMode::PasWrite => TransferMode::PassiveWrite,
        }
    }

    /// Local mode implied on the receiving side: the counterpart of the sender's.
    pub fn local_mode(self) -> TransferMode {
        match self {
            WireMode::ActRead => TransferMode::PassiveRead,
            WireMode::ActWrite => TransferMode::PassiveWrite,
            WireMode::PasRead => TransferMode::ActiveRead,
            WireMode::PasWrite => TransferMode::ActiveWrite,
        }
    }
}

/// Remote buffer advertisement: where, with which key, how much, and in which mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Virtual address of the advertised buffer.
    pub addr: u64,
    /// Remote access key of the buffer's memory region.
    pub rkey: u32,
    /// Length in bytes.
    pub size: u32,
    /// Raw mode tag (see [`WireMode`]).
    pub mode: u32,
}

impl BufferDescriptor {
    /// Build a descriptor for a local buffer.
    pub fn new(addr: u64, rkey: u32, size: u32, mode: TransferMode) -> Self {
        Self {
            addr,
            rkey,
            size,
            mode: mode.wire() as u32,
        }
    }

    /// Encode into network byte order.
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut bytes = [0u8; DESCRIPTOR_LEN];
        bytes[0..8].copy_from_slice(&self.addr.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.size.to_be_bytes());
        bytes[16..20].copy_from_slice(&self.mode.to_be_bytes());
        bytes
    }

    /// Decode from network byte order. The slice must be exactly [`DESCRIPTOR_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; DESCRIPTOR_LEN] =
            bytes.try_into().map_err(|_| RdmaError::BadMessageSize {
                got: bytes.len() as u32,
                expected: DESCRIPTOR_LEN as u32,
            })?;
        let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&bytes[0..8]);
        Ok(Self {
            addr: u64::from_be_bytes(addr),
            rkey: word(8),
            size: word(12),
            mode: word(16),
        })
    }

    /// Parsed mode tag, if recognized.
    pub fn wire_mode(&self) -> Option<WireMode> {
        WireMode::from_tag(self.mode)
    }
}
