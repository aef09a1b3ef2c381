//! Simulation assembly and the event dispatch loop.
//!
//! `Simulation` owns the only shared state in the process: the scheduler,
//! the random manager, the channel broker, the monitor bus, and the node
//! table. Everything runs on one logical thread: the kernel pops one
//! event at a time and calls synchronously into the owning node's stack,
//! so per-node data needs no locking. A `SimCtx` is the borrow-split view
//! of the shared services handed into stack callbacks.

use thiserror::Error;

use crate::apps::Application;
use crate::config::{ConfigError, PhyParams, SimConfig};
use crate::engine::event::{NodeId, SimEvent};
use crate::engine::random::{RandomError, RandomManager};
use crate::engine::scheduler::Scheduler;
use crate::entities::channel::WirelessChannel;
use crate::entities::node::{Node, NodeStack};
use crate::entities::signals::{Monitor, MonitorBus};
use crate::environment::geometry::{DSpace, Point};
use crate::environment::propagation::{NarrowbandChannelModel, FADING_STREAM, SHADOWING_STREAM};
use crate::protocols::mac::CsmaMac;
use crate::protocols::packets::LinkAddr;
use crate::protocols::phy::PhyLayer;
use crate::protocols::rdc::NullRdc;
use crate::protocols::tarp::Tarp;

/// Shared simulation services, borrow-split out of `Simulation` for the
/// duration of one callback.
pub struct SimCtx<'a> {
    pub scheduler: &'a mut Scheduler,
    pub channel: &'a mut WirelessChannel,
    pub random: &'a mut RandomManager,
    pub monitors: &'a mut MonitorBus,
}

impl SimCtx<'_> {
    pub fn now(&self) -> f64 {
        self.scheduler.now()
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("node id '{0}' already exists")]
    DuplicateId(String),
    #[error("a node already sits at position ({0}, {1})")]
    DuplicatePosition(f64, f64),
    #[error("position ({0}, {1}) is outside the discrete space grid")]
    OutOfBounds(f64, f64),
    #[error(transparent)]
    Random(#[from] RandomError),
}

pub struct Simulation {
    scheduler: Scheduler,
    random: RandomManager,
    channel: WirelessChannel,
    monitors: MonitorBus,
    nodes: Vec<Node>,
    phy_params: PhyParams,
}

impl Simulation {
    /// Build the shared services from a validated configuration: RNG
    /// substreams, the discrete space, and the channel model with its
    /// one-time shadowing map.
    pub fn bootstrap(cfg: &SimConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let channel_params = cfg.channel.resolve()?;

        let mut random = RandomManager::new(cfg.root_seed, cfg.worker_id, cfg.antithetic);
        random
            .create_stream(SHADOWING_STREAM)
            .expect("bootstrap stream keys are unique");
        random
            .create_stream(FADING_STREAM)
            .expect("bootstrap stream keys are unique");

        let dspace = DSpace::new(cfg.dspace_step, cfg.dspace_npt);
        let model = NarrowbandChannelModel::new(
            dspace,
            channel_params,
            random
                .stream(SHADOWING_STREAM)
                .expect("stream created above"),
        );

        log::info!(
            "bootstrap: seed {} worker {} antithetic {}",
            cfg.root_seed,
            cfg.worker_id,
            cfg.antithetic
        );

        Ok(Simulation {
            scheduler: Scheduler::new(),
            random,
            channel: WirelessChannel::new(model),
            monitors: MonitorBus::new(),
            nodes: Vec::new(),
            phy_params: cfg.phy,
        })
    }

    /// Spawn a node. Link addresses are assigned incrementally from 1 in
    /// spawn order; the first spawned sink is the tree root.
    pub fn add_node(
        &mut self,
        name: &str,
        position: Point,
        is_sink: bool,
        app: Box<dyn Application>,
    ) -> Result<NodeId, SpawnError> {
        if self.nodes.iter().any(|n| n.stack.name == name) {
            return Err(SpawnError::DuplicateId(name.to_string()));
        }
        if self.nodes.iter().any(|n| n.stack.position == position) {
            return Err(SpawnError::DuplicatePosition(position.x, position.y));
        }
        if !self.channel.model().dspace().contains(&position) {
            return Err(SpawnError::OutOfBounds(position.x, position.y));
        }

        let node = self.nodes.len();
        let linkaddr = LinkAddr((node + 1) as u16);

        let mac = CsmaMac::new(node, linkaddr, name, &mut self.random)?;
        let mut net = Tarp::new(node, linkaddr, name, is_sink, &mut self.random)?;
        net.bootstrap(&mut self.scheduler);

        let registered = self.channel.register(position);
        debug_assert_eq!(registered, node);

        self.nodes.push(Node {
            stack: NodeStack {
                node,
                name: name.to_string(),
                linkaddr,
                position,
                phy: PhyLayer::new(node, linkaddr, position, self.phy_params),
                rdc: NullRdc::new(),
                mac,
                net,
            },
            app,
        });
        log::debug!("spawned node {node} '{name}' at ({}, {})", position.x, position.y);
        Ok(node)
    }

    pub fn attach_monitor(&mut self, monitor: Box<dyn Monitor>) {
        self.monitors.attach(monitor);
    }

    pub fn now(&self) -> f64 {
        self.scheduler.now()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn stack(&self, node: NodeId) -> &NodeStack {
        &self.nodes[node].stack
    }

    pub fn stack_mut(&mut self, node: NodeId) -> &mut NodeStack {
        &mut self.nodes[node].stack
    }

    pub fn linkaddr(&self, node: NodeId) -> LinkAddr {
        self.nodes[node].stack.linkaddr
    }

    /// Set one node's transmit power (scenario knob).
    pub fn set_tx_power(&mut self, node: NodeId, dbm: f64) {
        self.nodes[node].stack.phy.set_tx_power_dbm(dbm);
    }

    /// Call every application's `start` hook. Run once, after all nodes
    /// are spawned.
    pub fn start(&mut self) {
        for i in 0..self.nodes.len() {
            let (node, mut ctx) = Self::split(
                &mut self.scheduler,
                &mut self.channel,
                &mut self.random,
                &mut self.monitors,
                &mut self.nodes,
                i,
            );
            let Node { stack, app } = node;
            app.start(stack, &mut ctx);
        }
    }

    /// Inject an application-level send at the current simulation time,
    /// outside any app. Used by scripted scenarios and experiments.
    pub fn send_from(&mut self, node: NodeId, payload: Vec<u8>, dst: LinkAddr) -> bool {
        let (n, mut ctx) = Self::split(
            &mut self.scheduler,
            &mut self.channel,
            &mut self.random,
            &mut self.monitors,
            &mut self.nodes,
            node,
        );
        n.stack.net_send(&mut ctx, payload, dst)
    }

    /// Run the kernel until the queue is exhausted or the next event lies
    /// beyond `t_end`.
    pub fn run_until(&mut self, t_end: f64) {
        while let Some(event) = self.scheduler.pop_due(t_end) {
            self.dispatch(event);
        }
    }

    fn split<'a>(
        scheduler: &'a mut Scheduler,
        channel: &'a mut WirelessChannel,
        random: &'a mut RandomManager,
        monitors: &'a mut MonitorBus,
        nodes: &'a mut [Node],
        node: NodeId,
    ) -> (&'a mut Node, SimCtx<'a>) {
        (
            &mut nodes[node],
            SimCtx {
                scheduler,
                channel,
                random,
                monitors,
            },
        )
    }

    fn dispatch(&mut self, event: SimEvent) {
        let Simulation {
            scheduler,
            random,
            channel,
            monitors,
            nodes,
            ..
        } = self;

        match event {
            SimEvent::TxStart { node, tx } => {
                nodes[node].stack.handle_tx_start();
                channel.on_tx_start(&tx, scheduler);
            }
            SimEvent::TxEnd { node, tx } => {
                channel.on_tx_end(tx.id);
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_tx_end(&mut ctx, &tx);
            }
            SimEvent::RxStart { node, tx } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_rx_start(&mut ctx, &tx);
            }
            SimEvent::RxEnd { node, tx } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                if let Some(delivery) = n.stack.handle_rx_end(&mut ctx, &tx) {
                    let Node { stack, app } = n;
                    app.receive(stack, &mut ctx, delivery);
                }
            }
            SimEvent::FrameAddrDetect {
                node,
                tx_id,
                close_session,
            }
            | SimEvent::AckTypeDetect {
                node,
                tx_id,
                close_session,
            } => {
                nodes[node].stack.handle_addr_detect(tx_id, close_session);
            }
            SimEvent::MacTrySendNext { node } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_mac_try_send(&mut ctx);
            }
            SimEvent::MacSendRequest { node } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_mac_send_request(&mut ctx);
            }
            SimEvent::MacAckTimeout { node } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_mac_ack_timeout(&mut ctx);
            }
            SimEvent::MacSendAck { node, seqn } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_mac_send_ack(&mut ctx, seqn);
            }
            SimEvent::TarpBeacon { node } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_tarp_beacon(&mut ctx);
            }
            SimEvent::TarpReport { node } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_tarp_report(&mut ctx);
            }
            SimEvent::TarpCleanup { node } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                n.stack.handle_tarp_cleanup(&mut ctx);
            }
            SimEvent::AppTimer { node, timer } => {
                let (n, mut ctx) = Self::split(scheduler, channel, random, monitors, nodes, node);
                let Node { stack, app } = n;
                app.on_timer(stack, &mut ctx, timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::apps::IdleApp;
    use crate::config::{ChannelParams, ChannelSpec};
    use crate::entities::signals::{MacSignal, PhySignal, Signal, SignalSource};
    use crate::protocols::packets::{
        DataFrame, MacFrame, TarpHeader, TarpPacket, TarpPayload, UnicastKind,
    };

    /// Records PHY receptions and MAC outcomes per node.
    #[derive(Default)]
    struct Recorder {
        received: Vec<(NodeId, u8, f64)>,
        outcomes: Vec<(NodeId, bool, u8)>,
    }

    impl Monitor for Recorder {
        fn update(&mut self, source: &SignalSource, signal: &Signal) {
            match signal {
                Signal::Phy(PhySignal::PacketReceived { seqn, rssi_dbm, .. }) => {
                    self.received.push((source.node, *seqn, *rssi_dbm));
                }
                Signal::Mac(MacSignal::TxOutcome { ok, retries, .. }) => {
                    self.outcomes.push((source.node, *ok, *retries));
                }
                _ => {}
            }
        }
    }

    fn flat_channel(pl_exponent: f64) -> ChannelSpec {
        ChannelSpec::Explicit(ChannelParams {
            pl_exponent,
            d0: 1.0,
            shadow_dev: 0.0,
            coh_dist: 50.0,
            fading_shape: 10.0,
            filter_bw: 2e6,
            freq: 2.4e9,
        })
    }

    fn sim_with(channel: ChannelSpec, positions: &[(f64, f64)]) -> (Simulation, Rc<RefCell<Recorder>>) {
        let mut cfg = SimConfig::with_preset(91, "stable", 1.0, 128);
        cfg.channel = channel;
        let mut sim = Simulation::bootstrap(&cfg).unwrap();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        sim.attach_monitor(Box::new(recorder.clone()));
        for (i, (x, y)) in positions.iter().enumerate() {
            sim.add_node(&format!("node-{}", i + 1), Point::new(*x, *y), false, Box::new(IdleApp))
                .unwrap();
        }
        (sim, recorder)
    }

    fn raw_data_frame(seqn: u8, tx: u16, rx: u16) -> MacFrame {
        MacFrame::Data(DataFrame {
            seqn,
            tx_addr: LinkAddr(tx),
            rx_addr: LinkAddr(rx),
            requires_ack: false,
            npdu: TarpPacket {
                header: TarpHeader::Unicast {
                    kind: UnicastKind::Data,
                    src: LinkAddr(tx),
                    dst: LinkAddr(rx),
                    hops: 0,
                },
                payload: TarpPayload::None,
            },
        })
    }

    /// Push a frame straight into a node's PHY, bypassing MAC contention.
    fn phy_send(sim: &mut Simulation, node: NodeId, frame: MacFrame) {
        let Simulation {
            scheduler,
            random,
            channel,
            monitors,
            nodes,
            ..
        } = sim;
        let mut ctx = SimCtx {
            scheduler,
            channel,
            random,
            monitors,
        };
        nodes[node].stack.phy.send(&mut ctx, frame);
    }

    #[test]
    fn lone_transmission_above_sensitivity_decodes() {
        let (mut sim, rec) = sim_with(flat_channel(2.0), &[(0.0, 0.0), (10.0, 0.0)]);
        phy_send(&mut sim, 0, raw_data_frame(5, 1, 2));
        sim.run_until(1.0);

        let rec = rec.borrow();
        assert_eq!(rec.received.len(), 1);
        let (node, seqn, rssi) = rec.received[0];
        assert_eq!(node, 1);
        assert_eq!(seqn, 5);
        // 0 dBm across 10 m of free space lands around -60 dBm
        assert!(rssi > -70.0 && rssi < -50.0, "rssi {rssi}");
    }

    #[test]
    fn equal_power_overlap_destroys_both_frames() {
        let (mut sim, rec) = sim_with(
            flat_channel(2.0),
            &[(0.0, 0.0), (-10.0, 0.0), (10.0, 0.0)],
        );
        // both neighbors talk to node 0 at the same instant, equal distance
        phy_send(&mut sim, 1, raw_data_frame(7, 2, 1));
        phy_send(&mut sim, 2, raw_data_frame(9, 3, 1));
        sim.run_until(1.0);

        let rec = rec.borrow();
        assert!(
            rec.received.iter().all(|(node, _, _)| *node != 0),
            "node 0 must not decode either frame: {:?}",
            rec.received
        );
    }

    #[test]
    fn stronger_transmission_captures_the_receiver() {
        let (mut sim, rec) = sim_with(
            flat_channel(2.0),
            &[(0.0, 0.0), (5.0, 0.0), (-20.0, 0.0)],
        );
        // node 1 is 12 dB stronger at node 0 than node 2
        phy_send(&mut sim, 1, raw_data_frame(7, 2, 1));
        phy_send(&mut sim, 2, raw_data_frame(9, 3, 1));
        sim.run_until(1.0);

        let rec = rec.borrow();
        let at_receiver: Vec<_> = rec
            .received
            .iter()
            .filter(|(node, _, _)| *node == 0)
            .collect();
        assert_eq!(at_receiver.len(), 1, "exactly one capture: {at_receiver:?}");
        assert_eq!(at_receiver[0].1, 7, "the stronger frame wins");
    }

    #[test]
    fn cca_reports_energy_on_the_channel() {
        let (mut sim, _rec) = sim_with(flat_channel(2.0), &[(0.0, 0.0), (5.0, 0.0)]);

        let quiet = {
            let Simulation {
                scheduler,
                random,
                channel,
                monitors,
                nodes,
                ..
            } = &mut sim;
            let mut ctx = SimCtx {
                scheduler,
                channel,
                random,
                monitors,
            };
            nodes[0].stack.phy.cca(&mut ctx)
        };
        assert!(!quiet, "empty channel must be clear");

        phy_send(&mut sim, 1, raw_data_frame(1, 2, 1));
        // advance just past TxStart but before the wavefront reaches node 0
        sim.run_until(1e-9);

        let busy = {
            let Simulation {
                scheduler,
                random,
                channel,
                monitors,
                nodes,
                ..
            } = &mut sim;
            let mut ctx = SimCtx {
                scheduler,
                channel,
                random,
                monitors,
            };
            nodes[0].stack.phy.cca(&mut ctx)
        };
        assert!(busy, "a -54 dBm neighbor transmission must trip CCA");
    }

    #[test]
    fn csma_gives_up_after_max_backoffs() {
        let mut cfg = SimConfig::with_preset(91, "stable", 1.0, 128);
        cfg.channel = flat_channel(2.0);
        // CCA threshold below the noise floor: the channel never clears
        cfg.phy.cca_threshold_dbm = -200.0;
        let mut sim = Simulation::bootstrap(&cfg).unwrap();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        sim.attach_monitor(Box::new(recorder.clone()));
        sim.add_node("node-1", Point::new(0.0, 0.0), false, Box::new(IdleApp))
            .unwrap();
        sim.add_node("node-2", Point::new(10.0, 0.0), false, Box::new(IdleApp))
            .unwrap();

        {
            let Simulation {
                scheduler, nodes, ..
            } = &mut sim;
            let packet = TarpPacket {
                header: TarpHeader::Unicast {
                    kind: UnicastKind::Data,
                    src: LinkAddr(1),
                    dst: LinkAddr(2),
                    hops: 0,
                },
                payload: TarpPayload::None,
            };
            nodes[0].stack.mac.send(scheduler, false, packet, LinkAddr(2));
        }
        sim.run_until(1.0);

        let rec = recorder.borrow();
        assert_eq!(rec.outcomes.len(), 1);
        let (node, ok, retries) = rec.outcomes[0];
        assert_eq!(node, 0);
        assert!(!ok);
        assert_eq!(retries, 0, "backoff exhaustion happens within one attempt");
    }

    #[test]
    fn unacked_unicast_fails_after_max_retries() {
        let (mut sim, rec) = sim_with(flat_channel(2.0), &[(0.0, 0.0), (10.0, 0.0)]);
        {
            let Simulation {
                scheduler, nodes, ..
            } = &mut sim;
            // destination address that nobody owns: no ACK will ever come
            let packet = TarpPacket {
                header: TarpHeader::Unicast {
                    kind: UnicastKind::Data,
                    src: LinkAddr(1),
                    dst: LinkAddr(0x42),
                    hops: 0,
                },
                payload: TarpPayload::None,
            };
            nodes[0]
                .stack
                .mac
                .send(scheduler, false, packet, LinkAddr(0x42));
        }
        sim.run_until(2.0);

        let rec = rec.borrow();
        assert_eq!(rec.outcomes.len(), 1);
        let (node, ok, retries) = rec.outcomes[0];
        assert_eq!(node, 0);
        assert!(!ok);
        // the retry counter passes the budget by one before giving up
        assert_eq!(retries, crate::protocols::mac::MAC_MAX_FRAME_RETRIES + 1);
    }

    #[test]
    fn spawn_rejects_duplicates_and_out_of_bounds() {
        let (mut sim, _rec) = sim_with(flat_channel(2.0), &[(0.0, 0.0)]);
        assert!(matches!(
            sim.add_node("node-1", Point::new(5.0, 5.0), false, Box::new(IdleApp)),
            Err(SpawnError::DuplicateId(_))
        ));
        assert!(matches!(
            sim.add_node("other", Point::new(0.0, 0.0), false, Box::new(IdleApp)),
            Err(SpawnError::DuplicatePosition(_, _))
        ));
        assert!(matches!(
            sim.add_node("far", Point::new(1e4, 0.0), false, Box::new(IdleApp)),
            Err(SpawnError::OutOfBounds(_, _))
        ));
    }
}
