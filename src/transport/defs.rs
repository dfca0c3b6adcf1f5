use std::fmt::{self, Display};
use std::net::SocketAddrV4;
use std::time::Duration;
use thiserror::Error;

pub const MAX_DATA_SIZE: usize = 1024;
pub const HEADER_SIZE: usize = 20;
pub const SACK_BLOCK_SIZE: usize = 8;
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_DATA_SIZE;
// A cumulative ACK carries at most 3 SACK blocks; further runs are omitted.
pub const MAX_SACK_BLOCKS: usize = 3;
pub const WINDOW_SIZE: u32 = 16;
pub const RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(1000);
pub const MAX_CONTROL_RETRIES: usize = 5;
pub const DUP_ACK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Syn = 0x01,
    SynAck = 0x02,
    Data = 0x03,
    Ack = 0x04,
    Fin = 0x05,
    FinAck = 0x06,
    FileName = 0x07,
    FileNameAck = 0x08,
    Unknown,
}

impl From<u8> for FrameKind {
    fn from(value: u8) -> Self {
        match value {
            v if v == FrameKind::Syn as u8 => FrameKind::Syn,
            v if v == FrameKind::SynAck as u8 => FrameKind::SynAck,
            v if v == FrameKind::Data as u8 => FrameKind::Data,
            v if v == FrameKind::Ack as u8 => FrameKind::Ack,
            v if v == FrameKind::Fin as u8 => FrameKind::Fin,
            v if v == FrameKind::FinAck as u8 => FrameKind::FinAck,
            v if v == FrameKind::FileName as u8 => FrameKind::FileName,
            v if v == FrameKind::FileNameAck as u8 => FrameKind::FileNameAck,
            _ => FrameKind::Unknown,
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        kind as u8
    }
}

impl Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameKind::Syn => write!(f, "SYN"),
            FrameKind::SynAck => write!(f, "SYN-ACK"),
            FrameKind::Data => write!(f, "DATA"),
            FrameKind::Ack => write!(f, "ACK"),
            FrameKind::Fin => write!(f, "FIN"),
            FrameKind::FinAck => write!(f, "FIN-ACK"),
            FrameKind::FileName => write!(f, "FILE-NAME"),
            FrameKind::FileNameAck => write!(f, "FILE-NAME-ACK"),
            FrameKind::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ConnectionState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::SynSent => write!(f, "SYN-SENT"),
            ConnectionState::SynReceived => write!(f, "SYN-RECEIVED"),
            ConnectionState::Established => write!(f, "ESTABLISHED"),
            ConnectionState::FinWait => write!(f, "FIN-WAIT"),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

impl Display for CongestionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CongestionState::SlowStart => write!(f, "SLOW-START"),
            CongestionState::CongestionAvoidance => write!(f, "CONGESTION-AVOIDANCE"),
            CongestionState::FastRecovery => write!(f, "FAST-RECOVERY"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Connection establishment timed out after {retries} retries. remote addr: {remote}")]
    HandshakeTimeout { retries: usize, remote: SocketAddrV4 },
    #[error("File name handoff timed out after {retries} retries. remote addr: {remote}")]
    HandoffTimeout { retries: usize, remote: SocketAddrV4 },
}
