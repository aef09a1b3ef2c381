//! Typed observer bus.
//!
//! Entities emit a signal on every state-change boundary (send, receive,
//! drop, parent change, start, timeout, failure). Monitors subscribe to
//! the bus and receive `(source, signal)` pairs in emission order; they own
//! any durable logging. Signals are tagged unions per emitter kind, so
//! monitors pattern-match instead of downcasting.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::engine::event::NodeId;
use crate::protocols::packets::{FrameKind, LinkAddr, UnicastKind};

/// Identity of the emitting entity.
#[derive(Debug, Clone, Copy)]
pub struct SignalSource {
    pub node: NodeId,
    pub addr: LinkAddr,
}

/// Why the network layer refused or discarded a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoParent,
    NoRoute,
    MaxHops,
    UnknownSender,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoParent => write!(f, "No Parent"),
            DropReason::NoRoute => write!(f, "No Route"),
            DropReason::MaxHops => write!(f, "Max Hops"),
            DropReason::UnknownSender => write!(f, "Unknown Sender"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PhySignal {
    PacketSent {
        timestamp: f64,
        kind: FrameKind,
        seqn: u8,
    },
    PacketReceived {
        timestamp: f64,
        kind: FrameKind,
        seqn: u8,
        rssi_dbm: f64,
    },
}

#[derive(Debug, Clone)]
pub enum MacSignal {
    /// Terminal outcome of a unicast transaction.
    TxOutcome {
        timestamp: f64,
        dst: LinkAddr,
        ok: bool,
        retries: u8,
    },
}

#[derive(Debug, Clone)]
pub enum TarpSignal {
    BroadcastSend {
        timestamp: f64,
        epoch: u32,
        metric: f32,
        hops: u8,
    },
    BroadcastReceive {
        timestamp: f64,
        source: LinkAddr,
        rssi_dbm: f64,
    },
    UnicastSend {
        timestamp: f64,
        kind: UnicastKind,
        src: LinkAddr,
        dst: LinkAddr,
        next_hop: LinkAddr,
    },
    UnicastReceive {
        timestamp: f64,
        kind: UnicastKind,
        src: LinkAddr,
        dst: LinkAddr,
        prev_hop: LinkAddr,
        report_entries: Option<usize>,
    },
    Forward {
        timestamp: f64,
        kind: UnicastKind,
        src: LinkAddr,
        dst: LinkAddr,
        prev_hop: LinkAddr,
        next_hop: LinkAddr,
    },
    Drop {
        timestamp: f64,
        kind: UnicastKind,
        src: LinkAddr,
        dst: LinkAddr,
        reason: DropReason,
    },
    ParentChange {
        timestamp: f64,
        old: Option<LinkAddr>,
        new: Option<LinkAddr>,
        reactive: bool,
    },
}

#[derive(Debug, Clone)]
pub enum AppSignal {
    Start {
        timestamp: f64,
    },
    Send {
        timestamp: f64,
        kind: &'static str,
        seq: u32,
        dst: LinkAddr,
    },
    SendFail {
        timestamp: f64,
        kind: &'static str,
        seq: u32,
        reason: DropReason,
    },
    Receive {
        timestamp: f64,
        kind: &'static str,
        seq: u32,
        src: LinkAddr,
        hops: u8,
    },
    Timeout {
        timestamp: f64,
        seq: u32,
    },
}

/// One signal from any emitter kind.
#[derive(Debug, Clone)]
pub enum Signal {
    Phy(PhySignal),
    Mac(MacSignal),
    Tarp(TarpSignal),
    App(AppSignal),
}

/// A subscriber on the observer bus.
pub trait Monitor {
    fn update(&mut self, source: &SignalSource, signal: &Signal);
}

/// Shared-handle monitors: attach an `Rc<RefCell<M>>` to the bus and keep a
/// clone to inspect results after the run (the simulation is
/// single-threaded, so this is safe and cheap).
impl<M: Monitor> Monitor for Rc<RefCell<M>> {
    fn update(&mut self, source: &SignalSource, signal: &Signal) {
        self.borrow_mut().update(source, signal);
    }
}

/// The bus itself: fan-out to every attached monitor, in attachment order.
pub struct MonitorBus {
    monitors: Vec<Box<dyn Monitor>>,
}

impl MonitorBus {
    pub fn new() -> Self {
        MonitorBus {
            monitors: Vec::new(),
        }
    }

    pub fn attach(&mut self, monitor: Box<dyn Monitor>) {
        self.monitors.push(monitor);
    }

    pub fn emit(&mut self, source: SignalSource, signal: Signal) {
        for monitor in &mut self.monitors {
            monitor.update(&source, &signal);
        }
    }
}

impl Default for MonitorBus {
    fn default() -> Self {
        Self::new()
    }
}
