//! Node wiring: one protocol stack per node plus its application.
//!
//! Layers never hold references to each other or to their host. The stack
//! owns them side by side and orchestrates every cross-layer call with
//! split borrows, so data flows Channel → PHY → RDC → MAC → Net → App on
//! reception and the other way on send without any shared ownership. The
//! application lives next to the stack (not inside it) so it can borrow
//! the whole stack mutably while handling its own callbacks.

use crate::apps::{AppDelivery, Application};
use crate::engine::event::NodeId;
use crate::environment::geometry::Point;
use crate::protocols::mac::{run_send_request, CsmaMac, MacTxOutcome};
use crate::protocols::packets::{AckFrame, MacFrame, LinkAddr};
use crate::protocols::phy::{PhyLayer, Transmission};
use crate::protocols::rdc::NullRdc;
use crate::protocols::tarp::Tarp;
use crate::simulation::SimCtx;
use crate::entities::signals::{MacSignal, Signal, SignalSource};

use std::rc::Rc;

pub struct Node {
    pub stack: NodeStack,
    pub app: Box<dyn Application>,
}

pub struct NodeStack {
    pub node: NodeId,
    pub name: String,
    pub linkaddr: LinkAddr,
    pub position: Point,
    pub phy: PhyLayer,
    pub rdc: NullRdc,
    pub mac: CsmaMac,
    pub net: Tarp,
}

impl NodeStack {
    /// Application-facing send: route `payload` toward `dst`. Returns
    /// whether a route existed.
    pub fn net_send(&mut self, ctx: &mut SimCtx, payload: Vec<u8>, dst: LinkAddr) -> bool {
        let NodeStack { net, mac, phy, .. } = self;
        net.send(ctx, mac, phy, payload, dst)
    }

    // --- radio events ----------------------------------------------------

    pub fn handle_tx_start(&mut self) {
        self.phy.on_tx_start();
    }

    pub fn handle_tx_end(&mut self, ctx: &mut SimCtx, tx: &Rc<Transmission>) {
        self.phy.on_tx_end();
        // RDC forwards the completion to the MAC verbatim
        let outcome = self.mac.on_rdc_sent(ctx.scheduler, &tx.frame);
        self.route_outcome(ctx, outcome);
    }

    pub fn handle_rx_start(&mut self, ctx: &mut SimCtx, tx: &Rc<Transmission>) {
        self.phy.on_rx_start(ctx, tx);
    }

    /// End of a reception: when the PHY decodes a frame it climbs the
    /// stack, possibly yielding a packet for the application.
    pub fn handle_rx_end(&mut self, ctx: &mut SimCtx, tx: &Rc<Transmission>) -> Option<AppDelivery> {
        let frame = self.phy.on_rx_end(ctx, tx)?;
        let rssi = self.phy.last_rssi_dbm();
        self.mac_receive(ctx, frame, rssi)
    }

    pub fn handle_addr_detect(&mut self, tx_id: u64, close_session: bool) {
        if close_session {
            self.phy.close_session_if(tx_id);
        }
    }

    // --- MAC events ------------------------------------------------------

    pub fn handle_mac_try_send(&mut self, ctx: &mut SimCtx) {
        let SimCtx {
            scheduler, random, ..
        } = &mut *ctx;
        self.mac.try_send_next(scheduler, random);
    }

    pub fn handle_mac_send_request(&mut self, ctx: &mut SimCtx) {
        let NodeStack { mac, rdc, phy, .. } = self;
        let outcome = run_send_request(mac, rdc, phy, ctx);
        self.route_outcome(ctx, outcome);
    }

    pub fn handle_mac_ack_timeout(&mut self, ctx: &mut SimCtx) {
        let outcome = {
            let SimCtx {
                scheduler, random, ..
            } = &mut *ctx;
            self.mac.on_ack_timeout(scheduler, random)
        };
        self.route_outcome(ctx, outcome);
    }

    pub fn handle_mac_send_ack(&mut self, ctx: &mut SimCtx, seqn: u8) {
        let NodeStack { rdc, phy, .. } = self;
        rdc.send(ctx, phy, MacFrame::Ack(AckFrame { seqn }));
    }

    // --- routing timers --------------------------------------------------

    pub fn handle_tarp_beacon(&mut self, ctx: &mut SimCtx) {
        let NodeStack { net, mac, phy, .. } = self;
        net.on_beacon_timer(ctx, mac, phy);
    }

    pub fn handle_tarp_report(&mut self, ctx: &mut SimCtx) {
        let NodeStack { net, mac, phy, .. } = self;
        net.on_report_timer(ctx, mac, phy);
    }

    pub fn handle_tarp_cleanup(&mut self, ctx: &mut SimCtx) {
        let NodeStack { net, mac, phy, .. } = self;
        net.on_cleanup_timer(ctx, mac, phy);
    }

    // --- upward flow -----------------------------------------------------

    fn mac_receive(
        &mut self,
        ctx: &mut SimCtx,
        frame: MacFrame,
        rssi_dbm: f64,
    ) -> Option<AppDelivery> {
        match frame {
            MacFrame::Data(frame) => {
                self.mac.on_data_received(ctx.scheduler, &frame);
                let NodeStack { net, mac, phy, .. } = self;
                net.receive(ctx, mac, phy, frame.npdu, frame.tx_addr, rssi_dbm)
            }
            MacFrame::Ack(ack) => {
                let outcome = self.mac.on_ack_received(ctx.scheduler, &ack, rssi_dbm);
                self.route_outcome(ctx, outcome);
                None
            }
        }
    }

    /// Terminal unicast outcome: announce it on the bus and let the
    /// routing layer update its link statistics.
    fn route_outcome(&mut self, ctx: &mut SimCtx, outcome: Option<MacTxOutcome>) {
        let Some(outcome) = outcome else {
            return;
        };
        ctx.monitors.emit(
            SignalSource {
                node: self.node,
                addr: self.linkaddr,
            },
            Signal::Mac(MacSignal::TxOutcome {
                timestamp: ctx.scheduler.now(),
                dst: outcome.dst,
                ok: outcome.ok,
                retries: outcome.retries,
            }),
        );
        let NodeStack { net, mac, phy, .. } = self;
        net.uc_sent(ctx, mac, phy, outcome);
    }
}
