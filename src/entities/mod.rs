//! Simulation entities: the shared wireless channel, node wiring, and the
//! observer bus that monitors attach to.

pub mod channel;
pub mod monitors;
pub mod node;
pub mod signals;

pub use channel::WirelessChannel;
pub use node::{Node, NodeStack};
pub use signals::{
    AppSignal, DropReason, MacSignal, Monitor, MonitorBus, PhySignal, Signal, SignalSource,
    TarpSignal,
};
