//! Event definitions for the simulation.
//!
//! Every state transition in the simulator is one of these variants. The
//! scheduler stores them wrapped with their firing time and a monotonic
//! insertion sequence; the simulation loop pops them in order and routes
//! each one to the owning node's protocol stack. Keeping the payload a
//! plain enum (rather than boxed callbacks) is what makes tie-breaking and
//! cancellation deterministic.

use std::rc::Rc;

use crate::protocols::phy::Transmission;

/// Index of a node inside the simulation's node table. The kernel passes
/// this id back into the stack on every event; layers never hold references
/// to their host.
pub type NodeId = usize;

/// All events the scheduler can carry.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// Sender-side start of a transmission: flips the radio to busy and
    /// lets the channel broker fan out per-receiver reception events.
    TxStart { node: NodeId, tx: Rc<Transmission> },
    /// Sender-side end of a transmission.
    TxEnd { node: NodeId, tx: Rc<Transmission> },
    /// A transmission's first energy reaches this receiver.
    RxStart { node: NodeId, tx: Rc<Transmission> },
    /// The last symbol of a transmission leaves this receiver.
    RxEnd { node: NodeId, tx: Rc<Transmission> },
    /// Enough bytes of a data frame arrived to read its destination
    /// address; `close_session` aborts the reception if the frame is for
    /// someone else.
    FrameAddrDetect {
        node: NodeId,
        tx_id: u64,
        close_session: bool,
    },
    /// Enough bytes of an ACK arrived to classify it; `close_session`
    /// aborts the reception if no matching ACK is pending.
    AckTypeDetect {
        node: NodeId,
        tx_id: u64,
        close_session: bool,
    },
    /// MAC should pop the next frame from its transmit queue.
    MacTrySendNext { node: NodeId },
    /// A CSMA backoff expired; hand the current frame to the RDC.
    MacSendRequest { node: NodeId },
    /// The ACK wait for the in-flight frame ran out.
    MacAckTimeout { node: NodeId },
    /// Turnaround elapsed after receiving a frame that requires an ACK.
    MacSendAck { node: NodeId, seqn: u8 },
    /// Beacon timer: the sink originates a new epoch, other nodes forward
    /// the wave.
    TarpBeacon { node: NodeId },
    /// Topology-report timer (periodic, reactive, or next-fragment).
    TarpReport { node: NodeId },
    /// Periodic neighbor-table cleanup.
    TarpCleanup { node: NodeId },
    /// Application-defined timer; `timer` is interpreted by the app alone.
    AppTimer { node: NodeId, timer: u32 },
}
