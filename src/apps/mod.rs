//! Traffic applications.
//!
//! An application sits on top of the network layer: it emits packets at
//! times of its choosing and consumes packets addressed to its node. The
//! bundled ones are the ping/pong pair used for latency experiments, a
//! Poisson traffic generator, and the idle no-op for pure-routing nodes.

pub mod ping_pong;
pub mod poisson;

use crate::entities::node::NodeStack;
use crate::protocols::packets::LinkAddr;
use crate::simulation::SimCtx;

pub use ping_pong::PingPongApp;
pub use poisson::PoissonTrafficApp;

/// A DATA packet delivered to this node, with the final hop count.
#[derive(Debug, Clone)]
pub struct AppDelivery {
    pub payload: Vec<u8>,
    pub src: LinkAddr,
    pub hops: u8,
}

/// Application interface consumed by the core. Timers are scheduler
/// events carrying an app-defined id; the stack handle gives access to
/// `net_send` and the node's identity.
pub trait Application {
    /// Called once after bootstrap.
    fn start(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx);

    /// A DATA packet addressed to this node arrived.
    fn receive(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx, delivery: AppDelivery);

    /// An `AppTimer` event scheduled by this application fired.
    fn on_timer(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx, timer: u32);
}

/// Application that neither sends nor reacts; routing-only nodes use it.
pub struct IdleApp;

impl Application for IdleApp {
    fn start(&mut self, _stack: &mut NodeStack, _ctx: &mut SimCtx) {}
    fn receive(&mut self, _stack: &mut NodeStack, _ctx: &mut SimCtx, _delivery: AppDelivery) {}
    fn on_timer(&mut self, _stack: &mut NodeStack, _ctx: &mut SimCtx, _timer: u32) {}
}

/// Parse an app payload of the form `"<KIND> #<seq> from <node>"`.
pub(crate) fn parse_payload(payload: &[u8]) -> Option<(&'static str, u32)> {
    let text = std::str::from_utf8(payload).ok()?;
    let kind = if text.starts_with("PING") {
        "PING"
    } else if text.starts_with("PONG") {
        "PONG"
    } else if text.starts_with("DATA") {
        "DATA"
    } else {
        return None;
    };
    let seq = text
        .split('#')
        .nth(1)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some((kind, seq))
}

#[cfg(test)]
mod tests {
    use super::parse_payload;

    #[test]
    fn payload_parsing_extracts_kind_and_seq() {
        assert_eq!(parse_payload(b"PING #12 from node-1"), Some(("PING", 12)));
        assert_eq!(parse_payload(b"PONG #3 from node-2"), Some(("PONG", 3)));
        assert_eq!(parse_payload(b"DATA #44 from node-9"), Some(("DATA", 44)));
        assert_eq!(parse_payload(b"garbage"), None);
    }
}
