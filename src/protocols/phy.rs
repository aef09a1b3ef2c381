//! PHY layer: outbound transmission scheduling and the capture/SINR
//! reception model.
//!
//! Reception is tracked in a *session*: when the first decodable signal
//! arrives the receiver synchronizes on it, and every later overlapping
//! transmission opens a new interference segment. At session end the
//! minimum SINR across segments decides whether the synchronized frame is
//! decoded (capture). Per-transmission received powers are sampled exactly
//! once, on reception start, and reused for every SINR and segment
//! computation of that session.
//!
//! Decode failures are silent: a lost frame produces no upward event.

use std::collections::HashMap;
use std::rc::Rc;

use crate::config::PhyParams;
use crate::engine::event::{NodeId, SimEvent};
use crate::environment::geometry::Point;
use crate::environment::propagation::{watts_to_dbm, FADING_STREAM};
use crate::protocols::packets::{
    MacFrame, LinkAddr, ACK_DETECTION_TIME, DADDR_DETECTION_TIME,
};
use crate::entities::signals::{PhySignal, Signal, SignalSource};
use crate::simulation::SimCtx;

/// Offset between a send request and the radio actually keying up; keeps
/// TxStart strictly after the requesting event at the same instant.
const TX_START_EPSILON: f64 = 1e-12;

/// RSSI reported before anything was ever received.
const NO_RSSI_DBM: f64 = -150.0;

/// One frame in flight, shared between the sender, the channel broker, and
/// every receiver's session bookkeeping. A physical-layer object only;
/// network semantics live in the frame it carries.
#[derive(Debug)]
pub struct Transmission {
    pub id: u64,
    pub sender: NodeId,
    pub sender_addr: LinkAddr,
    /// Sender position, snapshotted at send time.
    pub origin: Point,
    pub power_dbm: f64,
    pub frame: MacFrame,
}

/// Interval of a reception during which the interferer set is constant.
#[derive(Debug)]
struct ReceptionSegment {
    t0: f64,
    t1: Option<f64>,
    /// Transmission ids interfering during this segment.
    interferers: Vec<u64>,
}

/// Per-receiver state of one decode attempt.
#[derive(Debug)]
struct ReceptionSession {
    captured: Rc<Transmission>,
    segments: Vec<ReceptionSegment>,
}

impl ReceptionSession {
    fn new(captured: Rc<Transmission>, interferers: Vec<u64>, t0: f64) -> Self {
        ReceptionSession {
            captured,
            segments: vec![ReceptionSegment {
                t0,
                t1: None,
                interferers,
            }],
        }
    }

    /// A new overlapping transmission appeared: close the running segment
    /// and open one with the interferer added.
    fn notify_tx_start(&mut self, now: f64, tx_id: u64) {
        let last = self.segments.last_mut().expect("session has a segment");
        last.t1 = Some(now);
        let mut interferers = last.interferers.clone();
        // pre-snapshotted transmissions must not be counted twice
        if !interferers.contains(&tx_id) {
            interferers.push(tx_id);
        }
        self.segments.push(ReceptionSegment {
            t0: now,
            t1: None,
            interferers,
        });
    }

    /// An interferer ended: close the running segment and open one without
    /// it. The synchronized transmission is unaffected.
    fn notify_tx_end(&mut self, now: f64, tx_id: u64) {
        let last = self.segments.last_mut().expect("session has a segment");
        last.t1 = Some(now);
        let interferers = last
            .interferers
            .iter()
            .copied()
            .filter(|&id| id != tx_id)
            .collect();
        self.segments.push(ReceptionSegment {
            t0: now,
            t1: None,
            interferers,
        });
    }
}

pub struct PhyLayer {
    node: NodeId,
    addr: LinkAddr,
    position: Point,
    params: PhyParams,
    busy_sending: bool,
    session: Option<ReceptionSession>,
    /// Sampled linear received power (Watts) of every transmission that is
    /// part of the current session's bookkeeping.
    rx_powers: HashMap<u64, f64>,
    /// Sequence number of the last data frame we put on the air, used to
    /// recognize a pending ACK early.
    last_sent_seqn: u8,
    last_rx_rssi_dbm: f64,
}

impl PhyLayer {
    pub fn new(node: NodeId, addr: LinkAddr, position: Point, params: PhyParams) -> Self {
        PhyLayer {
            node,
            addr,
            position,
            params,
            busy_sending: false,
            session: None,
            rx_powers: HashMap::new(),
            last_sent_seqn: 0,
            last_rx_rssi_dbm: NO_RSSI_DBM,
        }
    }

    pub fn position(&self) -> &Point {
        &self.position
    }

    pub fn set_tx_power_dbm(&mut self, dbm: f64) {
        self.params.tx_power_dbm = dbm;
    }

    /// The radio is busy while sending or while a reception session runs.
    pub fn is_radio_busy(&self) -> bool {
        self.busy_sending || self.session.is_some()
    }

    /// Linear power of the last successfully decoded frame, in dBm.
    pub fn last_rssi_dbm(&self) -> f64 {
        self.last_rx_rssi_dbm
    }

    pub fn on_tx_start(&mut self) {
        self.busy_sending = true;
    }

    pub fn on_tx_end(&mut self) {
        self.busy_sending = false;
    }

    /// Schedule a frame onto the air: TxStart just after now, TxEnd one
    /// on-air duration later. The channel broker takes over at TxStart.
    pub fn send(&mut self, ctx: &mut SimCtx, frame: MacFrame) {
        if self.busy_sending {
            // Overlapping sends from one radio should not happen; the MAC
            // serializes them. Keep going like the radio would, but shout.
            log::warn!("node {}: send while already sending", self.node);
        }
        ctx.monitors.emit(
            SignalSource {
                node: self.node,
                addr: self.addr,
            },
            Signal::Phy(PhySignal::PacketSent {
                timestamp: ctx.scheduler.now(),
                kind: frame.kind(),
                seqn: frame.seqn(),
            }),
        );

        if let MacFrame::Data(f) = &frame {
            self.last_sent_seqn = f.seqn;
        }

        let tx = Rc::new(Transmission {
            id: ctx.channel.next_tx_id(),
            sender: self.node,
            sender_addr: self.addr,
            origin: self.position,
            power_dbm: self.params.tx_power_dbm,
            frame,
        });

        let start = ctx.scheduler.now() + TX_START_EPSILON;
        let end = start + tx.frame.on_air_duration();
        ctx.scheduler.schedule(
            start,
            SimEvent::TxStart {
                node: self.node,
                tx: Rc::clone(&tx),
            },
        );
        ctx.scheduler
            .schedule(end, SimEvent::TxEnd { node: self.node, tx });
    }

    /// First energy of `tx` reaches this receiver.
    pub fn on_rx_start(&mut self, ctx: &mut SimCtx, tx: &Rc<Transmission>) {
        let SimCtx {
            scheduler,
            channel,
            random,
            ..
        } = &mut *ctx;
        let now = scheduler.now();
        let fading = random
            .stream(FADING_STREAM)
            .expect("fading stream created at bootstrap");

        // sample this link exactly once for the whole session
        let power_w = channel.linear_link_budget(&self.position, tx, fading);
        self.rx_powers.insert(tx.id, power_w);
        let power_dbm = watts_to_dbm(power_w);
        log::debug!(
            "node {}: signal from {} at {:.2} dBm (sensitivity {:.2})",
            self.node,
            tx.sender_addr,
            power_dbm,
            self.params.correlator_threshold_dbm
        );

        if power_dbm < self.params.correlator_threshold_dbm {
            // too weak for the correlator: drop and forget
            self.rx_powers.remove(&tx.id);
            return;
        }

        let mut synchronized = false;
        match &mut self.session {
            Some(session) => session.notify_tx_start(now, tx.id),
            None => {
                // open a session on this transmission; everything already
                // on the air becomes the initial interferer set
                let mut interferers = Vec::new();
                for other in channel.active() {
                    if other.sender == self.node || other.id == tx.id {
                        continue;
                    }
                    if !self.rx_powers.contains_key(&other.id) {
                        let p = channel.linear_link_budget(&self.position, other, fading);
                        self.rx_powers.insert(other.id, p);
                    }
                    interferers.push(other.id);
                }
                self.session = Some(ReceptionSession::new(Rc::clone(tx), interferers, now));
                synchronized = true;
            }
        }

        if synchronized {
            // schedule the header-detection point; if the frame turns out
            // not to concern us the session is aborted there
            match &tx.frame {
                MacFrame::Ack(ack) => {
                    let pending = ack.seqn == self.last_sent_seqn;
                    scheduler.schedule(
                        now + ACK_DETECTION_TIME,
                        SimEvent::AckTypeDetect {
                            node: self.node,
                            tx_id: tx.id,
                            close_session: !pending,
                        },
                    );
                }
                MacFrame::Data(frame) => {
                    let for_us =
                        frame.rx_addr == self.addr || frame.rx_addr.is_broadcast();
                    scheduler.schedule(
                        now + DADDR_DETECTION_TIME,
                        SimEvent::FrameAddrDetect {
                            node: self.node,
                            tx_id: tx.id,
                            close_session: !for_us,
                        },
                    );
                }
            }
        }
    }

    /// Last symbol of `tx` leaves this receiver. Returns the decoded frame
    /// when `tx` was the synchronized transmission and the capture check
    /// passed.
    pub fn on_rx_end(&mut self, ctx: &mut SimCtx, tx: &Rc<Transmission>) -> Option<MacFrame> {
        let now = ctx.scheduler.now();
        let ended_power = self.rx_powers.get(&tx.id).copied();

        let synchronized = matches!(&self.session, Some(s) if s.captured.id == tx.id);
        if synchronized {
            let decoded = self.capture_check(ctx);
            let frame = self
                .session
                .as_ref()
                .map(|s| s.captured.frame.clone())
                .expect("session checked above");
            self.close_session();

            if decoded {
                let power_w = ended_power.expect("synchronized power sampled at rx start");
                self.last_rx_rssi_dbm = watts_to_dbm(power_w);
                log::debug!(
                    "node {}: decoded frame from {} ({:.2} dBm)",
                    self.node,
                    tx.sender_addr,
                    self.last_rx_rssi_dbm
                );
                ctx.monitors.emit(
                    SignalSource {
                        node: self.node,
                        addr: self.addr,
                    },
                    Signal::Phy(PhySignal::PacketReceived {
                        timestamp: now,
                        kind: frame.kind(),
                        seqn: frame.seqn(),
                        rssi_dbm: self.last_rx_rssi_dbm,
                    }),
                );
                return Some(frame);
            }
            log::debug!(
                "node {}: frame from {} lost (capture check failed)",
                self.node,
                tx.sender_addr
            );
            return None;
        }

        if let Some(session) = &mut self.session {
            // an interferer ended; the synchronized frame keeps going
            session.notify_tx_end(now, tx.id);
        }
        None
    }

    /// Abort the current session if it is still synchronized on `tx_id`.
    /// Stale detection events for long-gone sessions are no-ops.
    pub fn close_session_if(&mut self, tx_id: u64) {
        if matches!(&self.session, Some(s) if s.captured.id == tx_id) {
            self.close_session();
        }
    }

    fn close_session(&mut self) {
        self.session = None;
        self.rx_powers.clear();
    }

    /// Minimum SINR across the session's segments against the capture
    /// threshold, using the powers sampled at reception start.
    fn capture_check(&self, ctx: &SimCtx) -> bool {
        let session = match &self.session {
            Some(s) => s,
            None => return false,
        };
        let noise_w = ctx.channel.linear_noise_floor();
        let signal_w = self
            .rx_powers
            .get(&session.captured.id)
            .copied()
            .unwrap_or(0.0);
        if session.segments.is_empty() || signal_w == 0.0 {
            return false;
        }

        let mut min_sinr = f64::INFINITY;
        for segment in &session.segments {
            let interference_w: f64 = segment
                .interferers
                .iter()
                .filter_map(|id| self.rx_powers.get(id))
                .sum();
            let sinr = signal_w / (noise_w + interference_w);
            if sinr < min_sinr {
                min_sinr = sinr;
            }
        }

        let min_sinr_db = if min_sinr > 0.0 {
            10.0 * min_sinr.log10()
        } else {
            f64::NEG_INFINITY
        };
        min_sinr_db >= self.params.capture_threshold_db
    }

    /// Clear-channel assessment (802.15.4 mode 1): busy while the radio is
    /// in use, or when the summed instantaneous power of everything on the
    /// air plus the noise floor exceeds the CCA threshold. Always a fresh
    /// sample; CCA is an instantaneous measurement.
    pub fn cca(&self, ctx: &mut SimCtx) -> bool {
        if self.is_radio_busy() {
            return true;
        }
        let SimCtx {
            channel, random, ..
        } = &mut *ctx;
        let fading = random
            .stream(FADING_STREAM)
            .expect("fading stream created at bootstrap");
        let mut total_w = channel.linear_noise_floor();
        for tx in channel.active() {
            total_w += channel.linear_link_budget(&self.position, tx, fading);
        }
        watts_to_dbm(total_w) > self.params.cca_threshold_dbm
    }
}
