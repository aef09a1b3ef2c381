//! Unslotted CSMA/CA MAC, ported from the ContikiOS csma.c behavior (not
//! strictly the IEEE state machine; where the two differ, Contiki wins).
//!
//! One frame is in flight at a time. Frames that need an ACK arm a timeout
//! after leaving the air; a timeout restarts the backoff as a retry, and
//! both the CCA-backoff budget and the retry budget are bounded. Terminal
//! unicast outcomes `(dst, ok, retries, ack_rssi)` are reported upward so
//! the routing layer can maintain its link estimates.
//!
//! All timers are scheduler events; the MAC never pre-empts itself because
//! the kernel is single-threaded.

use std::collections::VecDeque;

use crate::engine::event::{NodeId, SimEvent};
use crate::engine::random::{RandomError, RandomManager};
use crate::engine::scheduler::{EventHandle, Scheduler};
use crate::protocols::packets::{
    AckFrame, DataFrame, MacFrame, LinkAddr, TarpPacket,
};
use crate::simulation::SimCtx;

pub const MAC_MIN_BE: u8 = 3;
pub const MAC_MAX_BE: u8 = 5;
pub const MAC_MAX_CSMA_BACKOFFS: u8 = 4;
pub const MAC_MAX_FRAME_RETRIES: u8 = 3;
pub const A_UNIT_BACKOFF_PERIOD: f64 = 320e-6;
pub const MAC_ACK_WAIT_DURATION: f64 = 864e-6;
pub const A_TURNAROUND_TIME: f64 = 192e-6;

/// Pause before looking at the queue again after finishing a transaction.
const NEXT_SEND_DELAY: f64 = 5e-6;
/// Pause between enqueueing on an idle MAC and popping the queue.
const SEND_TRIGGER_DELAY: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacState {
    Idle,
    InBackoff,
    AwaitingAck,
    SendingAck,
}

/// Terminal result of a unicast transaction, reported to the network
/// layer. `retries` counts re-transmissions beyond the first attempt;
/// `ack_rssi` is the receiver-measured power of the closing ACK.
#[derive(Debug, Clone, Copy)]
pub struct MacTxOutcome {
    pub dst: LinkAddr,
    pub ok: bool,
    pub retries: u8,
    pub ack_rssi: Option<f64>,
}

pub struct CsmaMac {
    node: NodeId,
    addr: LinkAddr,
    rng_key: String,
    state: MacState,
    tx_queue: VecDeque<DataFrame>,
    current: Option<DataFrame>,
    seqn: u8,
    retry_count: u8,
    nb: u8,
    be: u8,
    pending_ack_timeout: Option<EventHandle>,
    pending_send_req: Option<EventHandle>,
}

impl CsmaMac {
    /// Create the MAC and its backoff RNG substream.
    pub fn new(
        node: NodeId,
        addr: LinkAddr,
        node_name: &str,
        random: &mut RandomManager,
    ) -> Result<Self, RandomError> {
        let rng_key = format!("node:{node_name}/mac");
        random.create_stream(&rng_key)?;
        Ok(CsmaMac {
            node,
            addr,
            rng_key,
            state: MacState::Idle,
            tx_queue: VecDeque::new(),
            current: None,
            seqn: 0,
            retry_count: 0,
            nb: 0,
            be: MAC_MIN_BE,
            pending_ack_timeout: None,
            pending_send_req: None,
        })
    }

    fn reset_contention_counters(&mut self) {
        self.be = MAC_MIN_BE;
        self.nb = 0;
    }

    fn reset_state(&mut self) {
        self.state = MacState::Idle;
        self.current = None;
        self.retry_count = 0;
        self.reset_contention_counters();
    }

    /// Accept a network packet for transmission to `dst`. Broadcasts never
    /// request an ACK.
    pub fn send(
        &mut self,
        scheduler: &mut Scheduler,
        radio_busy: bool,
        packet: TarpPacket,
        dst: LinkAddr,
    ) {
        let frame = DataFrame {
            seqn: 0, // assigned when the frame leaves the queue
            tx_addr: self.addr,
            rx_addr: dst,
            requires_ack: !dst.is_broadcast(),
            npdu: packet,
        };
        self.tx_queue.push_back(frame);

        if self.state == MacState::Idle && !radio_busy {
            scheduler.schedule(
                scheduler.now() + SEND_TRIGGER_DELAY,
                SimEvent::MacTrySendNext { node: self.node },
            );
        }
    }

    /// Pop the next queued frame and start contending for the channel.
    pub fn try_send_next(&mut self, scheduler: &mut Scheduler, random: &mut RandomManager) {
        if self.state != MacState::Idle {
            return;
        }
        let Some(mut frame) = self.tx_queue.pop_front() else {
            return;
        };
        self.seqn = self.seqn.wrapping_add(1);
        frame.seqn = self.seqn;
        if frame.rx_addr.is_broadcast() {
            frame.requires_ack = false;
        }
        self.current = Some(frame);
        self.retry_count = 0;
        self.reset_contention_counters();
        let _ = self.backoff_and_send(scheduler, random, false);
    }

    /// Draw a backoff and schedule the send request, or give up when the
    /// contention/retry budgets are exhausted.
    #[must_use]
    fn backoff_and_send(
        &mut self,
        scheduler: &mut Scheduler,
        random: &mut RandomManager,
        is_retry: bool,
    ) -> Option<MacTxOutcome> {
        if self.current.is_none() {
            return None;
        }
        self.state = MacState::InBackoff;

        if is_retry {
            if self.retry_count > MAC_MAX_FRAME_RETRIES {
                return self.finish_failure(scheduler);
            }
            self.retry_count += 1;
            self.reset_contention_counters();
        }

        if self.nb >= MAC_MAX_CSMA_BACKOFFS {
            return self.finish_failure(scheduler);
        }

        let max_slots = (1i64 << self.be) - 1;
        let slots = random
            .stream(&self.rng_key)
            .expect("mac stream created with the layer")
            .integers(0, max_slots);
        let send_time = scheduler.now() + slots as f64 * A_UNIT_BACKOFF_PERIOD;

        if let Some(handle) = self.pending_send_req.take() {
            scheduler.unschedule(handle);
        }
        self.pending_send_req =
            Some(scheduler.schedule(send_time, SimEvent::MacSendRequest { node: self.node }));
        None
    }

    /// The backoff expired: hand back the frame to push through the RDC.
    /// Returns `None` when the transaction ended in the meantime.
    pub fn frame_for_send_request(&self) -> Option<MacFrame> {
        self.current.clone().map(MacFrame::Data)
    }

    /// RDC reports the frame actually left the radio.
    pub fn on_rdc_sent(
        &mut self,
        scheduler: &mut Scheduler,
        sent: &MacFrame,
    ) -> Option<MacTxOutcome> {
        self.pending_send_req = None;

        if matches!(sent, MacFrame::Ack(_)) {
            // our side of the handshake is done; resume the queue
            self.state = MacState::Idle;
            scheduler.schedule(
                scheduler.now() + NEXT_SEND_DELAY,
                SimEvent::MacTrySendNext { node: self.node },
            );
            return None;
        }

        let current = self.current.as_ref()?;
        if current.requires_ack {
            self.state = MacState::AwaitingAck;
            self.pending_ack_timeout = Some(scheduler.schedule(
                scheduler.now() + MAC_ACK_WAIT_DURATION,
                SimEvent::MacAckTimeout { node: self.node },
            ));
            None
        } else {
            // broadcast: done as soon as it is on the air
            self.finish_success(scheduler, None)
        }
    }

    /// RDC reports a busy channel: bump the contention counters and retry.
    #[must_use]
    pub fn on_rdc_not_sent(
        &mut self,
        scheduler: &mut Scheduler,
        random: &mut RandomManager,
    ) -> Option<MacTxOutcome> {
        self.nb += 1;
        self.be = (self.be + 1).min(MAC_MAX_BE);
        self.backoff_and_send(scheduler, random, false)
    }

    /// The ACK wait expired: restart the backoff as a retry.
    #[must_use]
    pub fn on_ack_timeout(
        &mut self,
        scheduler: &mut Scheduler,
        random: &mut RandomManager,
    ) -> Option<MacTxOutcome> {
        if self.state != MacState::AwaitingAck {
            return None; // stale timeout
        }
        self.pending_ack_timeout = None;
        self.backoff_and_send(scheduler, random, true)
    }

    /// A data frame addressed to us arrived; schedule the ACK after the
    /// turnaround when requested.
    pub fn on_data_received(&mut self, scheduler: &mut Scheduler, frame: &DataFrame) {
        if frame.requires_ack {
            self.state = MacState::SendingAck;
            scheduler.schedule(
                scheduler.now() + A_TURNAROUND_TIME,
                SimEvent::MacSendAck {
                    node: self.node,
                    seqn: frame.seqn,
                },
            );
        }
    }

    /// An ACK arrived. Exact sequence equality closes the transaction;
    /// anything else is ignored and the timeout keeps running.
    #[must_use]
    pub fn on_ack_received(
        &mut self,
        scheduler: &mut Scheduler,
        ack: &AckFrame,
        rssi_dbm: f64,
    ) -> Option<MacTxOutcome> {
        let matches_current = self
            .current
            .as_ref()
            .is_some_and(|frame| frame.seqn == ack.seqn);
        if self.state != MacState::AwaitingAck || !matches_current {
            return None;
        }
        if let Some(handle) = self.pending_ack_timeout.take() {
            scheduler.unschedule(handle);
        }
        self.finish_success(scheduler, Some(rssi_dbm))
    }

    fn finish_success(
        &mut self,
        scheduler: &mut Scheduler,
        ack_rssi: Option<f64>,
    ) -> Option<MacTxOutcome> {
        if let Some(handle) = self.pending_send_req.take() {
            scheduler.unschedule(handle);
        }
        let outcome = self.current.as_ref().and_then(|frame| {
            (!frame.rx_addr.is_broadcast()).then_some(MacTxOutcome {
                dst: frame.rx_addr,
                ok: true,
                retries: self.retry_count,
                ack_rssi,
            })
        });
        self.reset_state();
        scheduler.schedule(
            scheduler.now() + NEXT_SEND_DELAY,
            SimEvent::MacTrySendNext { node: self.node },
        );
        outcome
    }

    fn finish_failure(&mut self, scheduler: &mut Scheduler) -> Option<MacTxOutcome> {
        if let Some(handle) = self.pending_send_req.take() {
            scheduler.unschedule(handle);
        }
        let outcome = self.current.as_ref().and_then(|frame| {
            (!frame.rx_addr.is_broadcast()).then_some(MacTxOutcome {
                dst: frame.rx_addr,
                ok: false,
                retries: self.retry_count,
                ack_rssi: None,
            })
        });
        log::debug!("node {}: unicast transaction failed", self.node);
        self.reset_state();
        scheduler.schedule(
            scheduler.now() + NEXT_SEND_DELAY,
            SimEvent::MacTrySendNext { node: self.node },
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::packets::{TarpHeader, TarpPayload, UnicastKind};

    fn dummy_packet(src: u16, dst: u16) -> TarpPacket {
        TarpPacket {
            header: TarpHeader::Unicast {
                kind: UnicastKind::Data,
                src: LinkAddr(src),
                dst: LinkAddr(dst),
                hops: 0,
            },
            payload: TarpPayload::None,
        }
    }

    fn mac_with_env() -> (CsmaMac, Scheduler, RandomManager) {
        let mut random = RandomManager::new(7, 0, false);
        let mac = CsmaMac::new(0, LinkAddr(1), "node-1", &mut random).unwrap();
        (mac, Scheduler::new(), random)
    }

    #[test]
    fn mismatched_ack_sequence_does_not_end_the_wait() {
        let (mut mac, mut scheduler, mut random) = mac_with_env();
        mac.send(&mut scheduler, false, dummy_packet(1, 2), LinkAddr(2));
        mac.try_send_next(&mut scheduler, &mut random);

        let frame = mac.frame_for_send_request().expect("frame in flight");
        assert!(mac.on_rdc_sent(&mut scheduler, &frame).is_none());
        assert_eq!(mac.state, MacState::AwaitingAck);

        let wrong = AckFrame {
            seqn: frame.seqn().wrapping_add(1),
        };
        assert!(mac
            .on_ack_received(&mut scheduler, &wrong, -60.0)
            .is_none());
        assert_eq!(mac.state, MacState::AwaitingAck);

        let right = AckFrame { seqn: frame.seqn() };
        let outcome = mac
            .on_ack_received(&mut scheduler, &right, -60.0)
            .expect("matching ack closes the transaction");
        assert!(outcome.ok);
        assert_eq!(outcome.dst, LinkAddr(2));
        assert_eq!(outcome.ack_rssi, Some(-60.0));
        assert_eq!(mac.state, MacState::Idle);
    }

    #[test]
    fn broadcast_frames_never_request_an_ack() {
        let (mut mac, mut scheduler, mut random) = mac_with_env();
        mac.send(
            &mut scheduler,
            false,
            dummy_packet(1, 0xFFFF),
            LinkAddr::BROADCAST,
        );
        mac.try_send_next(&mut scheduler, &mut random);
        let frame = mac.frame_for_send_request().expect("frame in flight");
        match &frame {
            MacFrame::Data(f) => assert!(!f.requires_ack),
            MacFrame::Ack(_) => panic!("expected a data frame"),
        }
        // broadcast completes on air without an outcome report
        assert!(mac.on_rdc_sent(&mut scheduler, &frame).is_none());
        assert_eq!(mac.state, MacState::Idle);
    }

    #[test]
    fn sequence_numbers_wrap_through_zero() {
        let (mut mac, mut scheduler, mut random) = mac_with_env();
        mac.seqn = 255;
        mac.send(&mut scheduler, false, dummy_packet(1, 2), LinkAddr(2));
        mac.try_send_next(&mut scheduler, &mut random);
        assert_eq!(mac.frame_for_send_request().unwrap().seqn(), 0);
    }
}

/// Drive one `MacSendRequest` through the RDC, routing a CCA bounce back
/// into the MAC. Free function so the node stack can borrow the layers
/// independently.
pub fn run_send_request(
    mac: &mut CsmaMac,
    rdc: &crate::protocols::rdc::NullRdc,
    phy: &mut crate::protocols::phy::PhyLayer,
    ctx: &mut SimCtx,
) -> Option<MacTxOutcome> {
    let frame = mac.frame_for_send_request()?;
    match rdc.send(ctx, phy, frame) {
        crate::protocols::rdc::RdcSend::Sent => None,
        crate::protocols::rdc::RdcSend::ChannelBusy => {
            let SimCtx {
                scheduler, random, ..
            } = &mut *ctx;
            mac.on_rdc_not_sent(scheduler, random)
        }
    }
}
