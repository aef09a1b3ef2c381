//! Frame and packet definitions for the 802.15.4 link and the TARP
//! network layer.
//!
//! Frames are plain structs rather than byte buffers: the simulator needs
//! their timing and header semantics, not their serialization. On-air
//! durations and header-detection offsets are fixed constants for
//! 802.15.4 at 2.4 GHz O-QPSK (250 kbps, 32 us per byte).

use std::fmt;

use indexmap::IndexMap;

/// 2-byte link address, packed big-endian on the (abstract) wire.
/// Assignment starts at 1; 0xFFFF is the broadcast address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkAddr(pub u16);

impl LinkAddr {
    pub const BROADCAST: LinkAddr = LinkAddr(0xFFFF);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn to_be_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Worst-case on-air duration of a 127-byte data frame (SHR + PHR + MAC
/// header + payload + FCS) at 250 kbps.
pub const DATA_ON_AIR_DURATION: f64 = 4.83e-3;
/// On-air duration of an ACK frame.
pub const ACK_ON_AIR_DURATION: f64 = 352e-6;
/// Time from preamble start until the destination address (byte 11) of a
/// data frame has been received and decoded.
pub const DADDR_DETECTION_TIME: f64 = 352e-6;
/// Time from preamble start until an ACK (9 bytes) can be classified.
pub const ACK_DETECTION_TIME: f64 = 288e-6;

/// What a link-layer frame is, for logging and monitor taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Ack,
}

/// 802.15.4 data frame carrying a network PDU.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub seqn: u8,
    pub tx_addr: LinkAddr,
    pub rx_addr: LinkAddr,
    pub requires_ack: bool,
    pub npdu: TarpPacket,
}

/// 802.15.4 acknowledgment frame.
#[derive(Debug, Clone, Copy)]
pub struct AckFrame {
    pub seqn: u8,
}

/// Any frame that can occupy the channel.
#[derive(Debug, Clone)]
pub enum MacFrame {
    Data(DataFrame),
    Ack(AckFrame),
}

impl MacFrame {
    pub fn on_air_duration(&self) -> f64 {
        match self {
            MacFrame::Data(_) => DATA_ON_AIR_DURATION,
            MacFrame::Ack(_) => ACK_ON_AIR_DURATION,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            MacFrame::Data(_) => FrameKind::Data,
            MacFrame::Ack(_) => FrameKind::Ack,
        }
    }

    pub fn seqn(&self) -> u8 {
        match self {
            MacFrame::Data(f) => f.seqn,
            MacFrame::Ack(a) => a.seqn,
        }
    }
}

/// Direction-independent unicast packet classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastKind {
    Data,
    Report,
}

impl fmt::Display for UnicastKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnicastKind::Data => write!(f, "DATA"),
            UnicastKind::Report => write!(f, "REPORT"),
        }
    }
}

/// Membership delta carried by a topology report: the subtree either
/// gained or lost the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Add,
    Remove,
}

/// TARP network-layer header.
#[derive(Debug, Clone)]
pub enum TarpHeader {
    Unicast {
        kind: UnicastKind,
        src: LinkAddr,
        dst: LinkAddr,
        hops: u8,
    },
    /// Tree beacon: epoch tag, advertised cost to sink, depth, and the
    /// sender's chosen parent (None while orphaned).
    Broadcast {
        epoch: u32,
        metric: f32,
        hops: u8,
        parent: Option<LinkAddr>,
    },
}

/// Payload attached to a TARP packet.
#[derive(Debug, Clone)]
pub enum TarpPayload {
    None,
    Data(Vec<u8>),
    /// Ordered subtree-membership deltas; insertion order is preserved so
    /// fragmentation offsets are deterministic.
    Report(IndexMap<LinkAddr, RouteStatus>),
}

/// A TARP network packet: header variant plus optional payload.
#[derive(Debug, Clone)]
pub struct TarpPacket {
    pub header: TarpHeader,
    pub payload: TarpPayload,
}
