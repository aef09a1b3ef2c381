//! TARP: tree-based any-to-any routing.
//!
//! The sink originates beacon epochs; every other node picks the parent
//! that minimizes `advertised metric + link ETX` (with hysteresis),
//! forwards the beacon wave once per epoch, and reports its subtree
//! membership upstream so any-to-any traffic can be routed down the tree.
//! Parent loss is repaired reactively from the neighbor table, or the node
//! goes orphan until the next wave.
//!
//! Port of the Contiki-style C implementation: timers, route management,
//! and topology discovery keep the reference's exact branch order,
//! including its early-boot epoch-0 special case.

pub mod params;
pub mod route;

use indexmap::IndexMap;

use crate::apps::AppDelivery;
use crate::engine::event::{NodeId, SimEvent};
use crate::engine::random::{RandomError, RandomManager, RandomStream};
use crate::engine::scheduler::{EventHandle, Scheduler};
use crate::entities::signals::{DropReason, Signal, SignalSource, TarpSignal};
use crate::protocols::mac::{CsmaMac, MacTxOutcome};
use crate::protocols::packets::{
    LinkAddr, RouteStatus, TarpHeader, TarpPacket, TarpPayload, UnicastKind,
};
use crate::protocols::phy::PhyLayer;
use crate::simulation::SimCtx;

use route::{etx_est_rssi, etx_update, metric, preferred, valid, NodeType, Route};

pub struct Tarp {
    node: NodeId,
    addr: LinkAddr,
    sink: bool,
    rng_key: String,
    parent: Option<LinkAddr>,
    nbr_tbl: IndexMap<LinkAddr, Route>,
    metric: f64,
    epoch: u32,
    hops: u8,
    /// Pending subtree-membership deltas to send upstream, plus the
    /// fragmentation cursor into them.
    tpl_buf: IndexMap<LinkAddr, RouteStatus>,
    tpl_buf_offset: usize,
    beacon_timer: Option<EventHandle>,
    report_timer: Option<EventHandle>,
    cleanup_timer: Option<EventHandle>,
}

impl Tarp {
    pub fn new(
        node: NodeId,
        addr: LinkAddr,
        node_name: &str,
        sink: bool,
        random: &mut RandomManager,
    ) -> Result<Self, RandomError> {
        let rng_key = format!("node:{node_name}/net_tarp");
        random.create_stream(&rng_key)?;
        Ok(Tarp {
            node,
            addr,
            sink,
            rng_key,
            parent: None,
            nbr_tbl: IndexMap::new(),
            metric: if sink { 0.0 } else { f64::INFINITY },
            epoch: 0,
            hops: if sink { 0 } else { params::MAX_PATH_LENGTH + 1 },
            tpl_buf: IndexMap::new(),
            tpl_buf_offset: 0,
            beacon_timer: None,
            report_timer: None,
            cleanup_timer: None,
        })
    }

    /// Arm the initial timers. The sink fires its first beacon one second
    /// in; everyone runs the periodic table cleanup.
    pub fn bootstrap(&mut self, scheduler: &mut Scheduler) {
        if self.sink {
            self.beacon_timer = Some(scheduler.schedule(
                scheduler.now() + 1.0,
                SimEvent::TarpBeacon { node: self.node },
            ));
        }
        self.reschedule_cleanup(scheduler);
    }

    pub fn is_sink(&self) -> bool {
        self.sink
    }

    pub fn parent(&self) -> Option<LinkAddr> {
        self.parent
    }

    pub fn hops(&self) -> u8 {
        self.hops
    }

    pub fn metric(&self) -> f64 {
        self.metric
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn route(&self, addr: LinkAddr) -> Option<&Route> {
        self.nbr_tbl.get(&addr)
    }

    pub fn neighbor_count(&self) -> usize {
        self.nbr_tbl.len()
    }

    /// Force a route entry to the always-invalid age so the next cleanup
    /// evicts it. Fault-injection hook for experiments.
    pub fn invalidate_route(&mut self, addr: LinkAddr) {
        if let Some(route) = self.nbr_tbl.get_mut(&addr) {
            route.age = params::ALWAYS_INVALID_AGE;
        }
    }

    fn emit(&self, ctx: &mut SimCtx, signal: TarpSignal) {
        ctx.monitors.emit(
            SignalSource {
                node: self.node,
                addr: self.addr,
            },
            Signal::Tarp(signal),
        );
    }

    fn rng<'a>(&self, random: &'a mut RandomManager) -> &'a mut RandomStream {
        random
            .stream(&self.rng_key)
            .expect("tarp stream created with the layer")
    }

    // --- application interface -------------------------------------------

    /// Route an application payload toward `dst`. Returns whether a next
    /// hop existed; `false` is the caller's cue to retry later.
    pub fn send(
        &mut self,
        ctx: &mut SimCtx,
        mac: &mut CsmaMac,
        phy: &PhyLayer,
        payload: Vec<u8>,
        dst: LinkAddr,
    ) -> bool {
        let now = ctx.scheduler.now();
        if !self.sink && self.parent.is_none() {
            self.emit(
                ctx,
                TarpSignal::Drop {
                    timestamp: now,
                    kind: UnicastKind::Data,
                    src: self.addr,
                    dst,
                    reason: DropReason::NoParent,
                },
            );
            return false;
        }
        let Some(next_hop) = self.lookup(now, dst) else {
            self.emit(
                ctx,
                TarpSignal::Drop {
                    timestamp: now,
                    kind: UnicastKind::Data,
                    src: self.addr,
                    dst,
                    reason: DropReason::NoRoute,
                },
            );
            return false;
        };

        let packet = TarpPacket {
            header: TarpHeader::Unicast {
                kind: UnicastKind::Data,
                src: self.addr,
                dst,
                hops: 0,
            },
            payload: TarpPayload::Data(payload),
        };
        self.emit(
            ctx,
            TarpSignal::UnicastSend {
                timestamp: now,
                kind: UnicastKind::Data,
                src: self.addr,
                dst,
                next_hop,
            },
        );
        mac.send(ctx.scheduler, phy.is_radio_busy(), packet, next_hop);
        true
    }

    /// Entry point for packets handed up by the MAC.
    pub fn receive(
        &mut self,
        ctx: &mut SimCtx,
        mac: &mut CsmaMac,
        phy: &PhyLayer,
        packet: TarpPacket,
        sender: LinkAddr,
        rssi_dbm: f64,
    ) -> Option<AppDelivery> {
        match packet.header {
            TarpHeader::Broadcast {
                epoch,
                metric,
                hops,
                parent,
            } => {
                self.bc_recv(ctx, epoch, metric, hops, parent, sender, rssi_dbm);
                None
            }
            TarpHeader::Unicast {
                kind,
                src,
                dst,
                hops,
            } => self.uc_recv(
                ctx,
                mac,
                phy,
                kind,
                src,
                dst,
                hops,
                packet.payload,
                sender,
                rssi_dbm,
            ),
        }
    }

    // --- beacon handling -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn bc_recv(
        &mut self,
        ctx: &mut SimCtx,
        epoch: u32,
        adv_metric: f32,
        sender_hops: u8,
        sender_parent: Option<LinkAddr>,
        sender: LinkAddr,
        rssi_dbm: f64,
    ) {
        if rssi_dbm < params::RSSI_LOW_THR {
            return;
        }
        let now = ctx.scheduler.now();

        // the sink generates epochs, it does not learn them
        if !self.sink && epoch < self.epoch {
            return;
        }

        // a beacon from a new epoch resets the node regardless of its
        // sender, which forces a fresh parent choice for the new wave
        if !self.sink && epoch > self.epoch {
            self.reset_connection_status(ctx.scheduler, epoch);
        } else if self.epoch == 0 && !self.sink {
            // a node booting into a network whose wave is at epoch 0
            // adopts it silently (early-boot quirk of the reference code)
            self.epoch = epoch;
        }

        self.emit(
            ctx,
            TarpSignal::BroadcastReceive {
                timestamp: now,
                source: sender,
                rssi_dbm,
            },
        );

        let adv = adv_metric as f64;
        if let Some(entry) = self.nbr_tbl.get_mut(&sender) {
            entry.age = now;
            entry.adv_metric = adv;
            entry.hops = sender_hops;
            entry.etx = etx_est_rssi(rssi_dbm);
        } else {
            self.nbr_tbl.insert(
                sender,
                Route {
                    kind: NodeType::Neighbor,
                    age: now,
                    nexthop: sender,
                    hops: sender_hops,
                    etx: etx_est_rssi(rssi_dbm),
                    num_tx: 0,
                    num_ack: 0,
                    adv_metric: adv,
                },
            );
        }
        let entry_etx = self.nbr_tbl[&sender].etx;
        let new_metric = metric(adv, entry_etx);

        // after an epoch reset `parent` is None, so this only matches
        // same-epoch refreshes from the current parent
        if self.parent == Some(sender) {
            self.metric = new_metric;
            self.hops = sender_hops + 1;
            // refresh beacons are not re-forwarded, or waves would loop
            return;
        }

        if preferred(new_metric, self.metric) {
            let old_parent = self.parent;
            if let Some(old) = old_parent
                && let Some(entry) = self.nbr_tbl.get_mut(&old)
            {
                entry.kind = NodeType::Neighbor;
            }

            self.parent = Some(sender);
            self.metric = new_metric;
            self.hops = sender_hops + 1;
            self.nbr_tbl[&sender].kind = NodeType::Parent;
            // needed when an orphan re-attaches within the same epoch
            self.epoch = epoch;

            log::info!(
                "node {}: parent {} -> {} (metric {:.2}, hops {})",
                self.node,
                old_parent.map(|a| a.to_string()).unwrap_or_default(),
                sender,
                self.metric,
                self.hops
            );
            self.emit(
                ctx,
                TarpSignal::ParentChange {
                    timestamp: now,
                    old: old_parent,
                    new: Some(sender),
                    reactive: false,
                },
            );

            // forward the wave after a jittered delay
            if let Some(handle) = self.beacon_timer.take() {
                ctx.scheduler.unschedule(handle);
            }
            let forward_delay = params::TREE_BEACON_FORWARD_BASE_DELAY
                + self
                    .rng(ctx.random)
                    .uniform(0.0, params::TREE_BEACON_FORWARD_MAX_JITTER);
            self.beacon_timer = Some(
                ctx.scheduler
                    .schedule(now + forward_delay, SimEvent::TarpBeacon { node: self.node }),
            );

            // first topology report, staggered by depth so reports flow
            // leaf-to-root without colliding with the wave itself
            if let Some(handle) = self.report_timer.take() {
                ctx.scheduler.unschedule(handle);
            }
            let base_delay = if self.hops > 0 {
                params::INITIAL_REPORT_BASE_DELAY / self.hops as f64
            } else {
                0.0
            };
            let report_delay = base_delay
                + self
                    .rng(ctx.random)
                    .uniform(0.0, params::INITIAL_REPORT_MAX_JITTER);
            self.report_timer = Some(
                ctx.scheduler
                    .schedule(now + report_delay, SimEvent::TarpReport { node: self.node }),
            );
        } else if sender_parent == Some(self.addr) {
            // not a parent candidate, but it claims us as its parent
            let entry = &mut self.nbr_tbl[&sender];
            if entry.kind != NodeType::Child {
                entry.kind = NodeType::Child;
                self.tpl_buf.insert(sender, RouteStatus::Add);
            }
        } else if self.nbr_tbl[&sender].kind == NodeType::Child {
            // was our child, no longer claims so
            self.nbr_tbl[&sender].kind = NodeType::Neighbor;
            self.tpl_buf.shift_remove(&sender);
        }
    }

    // --- unicast handling ------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn uc_recv(
        &mut self,
        ctx: &mut SimCtx,
        mac: &mut CsmaMac,
        phy: &PhyLayer,
        kind: UnicastKind,
        src: LinkAddr,
        dst: LinkAddr,
        hops: u8,
        payload: TarpPayload,
        sender: LinkAddr,
        rssi_dbm: f64,
    ) -> Option<AppDelivery> {
        let now = ctx.scheduler.now();

        if !self.nbr_tbl.contains_key(&sender) {
            match kind {
                // A child that adopted us from our beacon may never have
                // been heard itself (asymmetric links). Rejecting its
                // reports would make tree formation impossible, so insert
                // it reactively with an RSSI-estimated ETX.
                UnicastKind::Report => {
                    self.nbr_tbl.insert(
                        sender,
                        Route {
                            kind: NodeType::Child,
                            age: now,
                            nexthop: sender,
                            hops: hops + 1,
                            etx: etx_est_rssi(rssi_dbm),
                            num_tx: 0,
                            num_ack: 0,
                            adv_metric: f64::INFINITY,
                        },
                    );
                }
                UnicastKind::Data => {
                    self.emit(
                        ctx,
                        TarpSignal::Drop {
                            timestamp: now,
                            kind,
                            src,
                            dst,
                            reason: DropReason::UnknownSender,
                        },
                    );
                    return None;
                }
            }
        }

        let hops = hops + 1;
        if let Some(entry) = self.nbr_tbl.get_mut(&sender) {
            entry.age = now;
        }

        if hops > params::MAX_PATH_LENGTH {
            self.emit(
                ctx,
                TarpSignal::Drop {
                    timestamp: now,
                    kind,
                    src,
                    dst,
                    reason: DropReason::MaxHops,
                },
            );
            return None;
        }

        match kind {
            UnicastKind::Data => {
                if dst == self.addr {
                    self.emit(
                        ctx,
                        TarpSignal::UnicastReceive {
                            timestamp: now,
                            kind,
                            src,
                            dst,
                            prev_hop: sender,
                            report_entries: None,
                        },
                    );
                    let bytes = match payload {
                        TarpPayload::Data(b) => b,
                        _ => Vec::new(),
                    };
                    Some(AppDelivery {
                        payload: bytes,
                        src,
                        hops,
                    })
                } else {
                    self.forward_data(ctx, mac, phy, src, dst, hops, payload, sender);
                    None
                }
            }
            UnicastKind::Report => {
                let map = match payload {
                    TarpPayload::Report(m) => m,
                    _ => IndexMap::new(),
                };
                self.emit(
                    ctx,
                    TarpSignal::UnicastReceive {
                        timestamp: now,
                        kind,
                        src,
                        dst,
                        prev_hop: sender,
                        report_entries: Some(map.len()),
                    },
                );
                self.nbr_tbl_update(sender, &map);

                if !self.sink {
                    // fold the subtree deltas into our own pending report
                    // and push it out reactively
                    for (addr, status) in &map {
                        self.tpl_buf.insert(*addr, *status);
                    }
                    if let Some(handle) = self.report_timer.take() {
                        ctx.scheduler.unschedule(handle);
                    }
                    let delay = params::SUBTREE_REPORT_DELAY
                        + self
                            .rng(ctx.random)
                            .uniform(0.0, params::SUBTREE_REPORT_MAX_JITTER);
                    self.report_timer = Some(
                        ctx.scheduler
                            .schedule(now + delay, SimEvent::TarpReport { node: self.node }),
                    );
                }
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn forward_data(
        &mut self,
        ctx: &mut SimCtx,
        mac: &mut CsmaMac,
        phy: &PhyLayer,
        src: LinkAddr,
        dst: LinkAddr,
        hops: u8,
        payload: TarpPayload,
        prev_hop: LinkAddr,
    ) {
        let now = ctx.scheduler.now();
        let Some(next_hop) = self.lookup(now, dst) else {
            self.emit(
                ctx,
                TarpSignal::Drop {
                    timestamp: now,
                    kind: UnicastKind::Data,
                    src,
                    dst,
                    reason: DropReason::NoRoute,
                },
            );
            return;
        };
        self.emit(
            ctx,
            TarpSignal::Forward {
                timestamp: now,
                kind: UnicastKind::Data,
                src,
                dst,
                prev_hop,
                next_hop,
            },
        );
        let packet = TarpPacket {
            header: TarpHeader::Unicast {
                kind: UnicastKind::Data,
                src,
                dst,
                hops,
            },
            payload,
        };
        mac.send(ctx.scheduler, phy.is_radio_busy(), packet, next_hop);
    }

    // --- transmission outcomes -------------------------------------------

    /// MAC outcome for a unicast we originated or forwarded: advance the
    /// link counters, update ETX, and flag dead links for eviction.
    pub fn uc_sent(
        &mut self,
        ctx: &mut SimCtx,
        mac: &mut CsmaMac,
        phy: &PhyLayer,
        outcome: MacTxOutcome,
    ) {
        let now = ctx.scheduler.now();
        let Some(route) = self.nbr_tbl.get_mut(&outcome.dst) else {
            return;
        };
        route.num_tx += outcome.retries as u32;
        if outcome.ok {
            route.num_ack += 1;
        }
        route.etx = etx_update(route.num_tx, route.num_ack, route.etx, outcome.ack_rssi);

        if outcome.ok {
            route.age = now;
        } else {
            route.age = params::ALWAYS_INVALID_AGE;
            self.do_cleanup(ctx, mac, phy);
        }
    }

    // --- timers ----------------------------------------------------------

    /// Beacon timer fired: the sink opens a new epoch, everyone announces
    /// its current tree position.
    pub fn on_beacon_timer(&mut self, ctx: &mut SimCtx, mac: &mut CsmaMac, phy: &PhyLayer) {
        if self.sink {
            let next_epoch = self.epoch + 1;
            self.reset_connection_status(ctx.scheduler, next_epoch);
            self.beacon_timer = Some(ctx.scheduler.schedule(
                ctx.scheduler.now() + params::TREE_BEACON_INTERVAL,
                SimEvent::TarpBeacon { node: self.node },
            ));
            log::info!("node {}: starting epoch {}", self.node, next_epoch);
        }
        self.broadcast_send(ctx, mac, phy);
    }

    pub fn on_report_timer(&mut self, ctx: &mut SimCtx, mac: &mut CsmaMac, phy: &PhyLayer) {
        self.subtree_report(ctx, mac, phy);
    }

    pub fn on_cleanup_timer(&mut self, ctx: &mut SimCtx, mac: &mut CsmaMac, phy: &PhyLayer) {
        self.do_cleanup(ctx, mac, phy);
        self.reschedule_cleanup(ctx.scheduler);
    }

    fn broadcast_send(&mut self, ctx: &mut SimCtx, mac: &mut CsmaMac, phy: &PhyLayer) {
        let now = ctx.scheduler.now();
        self.emit(
            ctx,
            TarpSignal::BroadcastSend {
                timestamp: now,
                epoch: self.epoch,
                metric: self.metric as f32,
                hops: self.hops,
            },
        );
        let packet = TarpPacket {
            header: TarpHeader::Broadcast {
                epoch: self.epoch,
                metric: self.metric as f32,
                hops: self.hops,
                parent: self.parent,
            },
            payload: TarpPayload::None,
        };
        mac.send(
            ctx.scheduler,
            phy.is_radio_busy(),
            packet,
            LinkAddr::BROADCAST,
        );
    }

    /// Send the pending subtree deltas to the parent, fragmenting when the
    /// buffer exceeds one frame. An empty buffer still produces an empty
    /// report, which doubles as a keep-alive.
    fn subtree_report(&mut self, ctx: &mut SimCtx, mac: &mut CsmaMac, phy: &PhyLayer) {
        if self.tpl_buf_offset == 0 && self.tpl_buf.is_empty() {
            // periodic report: snapshot the full subtree
            self.buff_subtree();
        }

        if self.parent.is_none() {
            self.schedule_next_report(ctx);
            return;
        }

        if self.tpl_buf.is_empty() {
            self.send_report_fragment(ctx, mac, phy, IndexMap::new());
        } else {
            let remaining = self.tpl_buf.len() - self.tpl_buf_offset;
            if remaining > 0 {
                let take = remaining.min(params::MAX_STAT_PER_FRAGMENT);
                let fragment: IndexMap<LinkAddr, RouteStatus> = self
                    .tpl_buf
                    .iter()
                    .skip(self.tpl_buf_offset)
                    .take(take)
                    .map(|(addr, status)| (*addr, *status))
                    .collect();
                self.send_report_fragment(ctx, mac, phy, fragment);
                self.tpl_buf_offset += take;

                if self.tpl_buf_offset < self.tpl_buf.len() {
                    // more fragments pending: continue shortly
                    self.report_timer = Some(ctx.scheduler.schedule(
                        ctx.scheduler.now() + params::REPORT_FRAGMENT_SPACING,
                        SimEvent::TarpReport { node: self.node },
                    ));
                    return;
                }
            }
        }

        self.flush_tpl_buf();
        self.schedule_next_report(ctx);
    }

    fn send_report_fragment(
        &mut self,
        ctx: &mut SimCtx,
        mac: &mut CsmaMac,
        phy: &PhyLayer,
        fragment: IndexMap<LinkAddr, RouteStatus>,
    ) {
        let Some(parent) = self.parent else {
            return;
        };
        let now = ctx.scheduler.now();
        self.emit(
            ctx,
            TarpSignal::UnicastSend {
                timestamp: now,
                kind: UnicastKind::Report,
                src: self.addr,
                dst: parent,
                next_hop: parent,
            },
        );
        let packet = TarpPacket {
            header: TarpHeader::Unicast {
                kind: UnicastKind::Report,
                src: self.addr,
                dst: parent,
                hops: 0,
            },
            payload: TarpPayload::Report(fragment),
        };
        mac.send(ctx.scheduler, phy.is_radio_busy(), packet, parent);
    }

    fn schedule_next_report(&mut self, ctx: &mut SimCtx) {
        if self.sink || self.parent.is_none() {
            return;
        }
        if let Some(handle) = self.report_timer.take() {
            ctx.scheduler.unschedule(handle);
        }
        let interval = if self.hops == 0 {
            params::SUBTREE_REPORT_OFFSET
        } else {
            params::SUBTREE_REPORT_OFFSET * (1.0 + 1.0 / self.hops as f64)
                + self
                    .rng(ctx.random)
                    .uniform(0.0, params::SUBTREE_REPORT_MAX_JITTER)
        };
        self.report_timer = Some(ctx.scheduler.schedule(
            ctx.scheduler.now() + interval,
            SimEvent::TarpReport { node: self.node },
        ));
    }

    fn reschedule_cleanup(&mut self, scheduler: &mut Scheduler) {
        if let Some(handle) = self.cleanup_timer.take() {
            scheduler.unschedule(handle);
        }
        self.cleanup_timer = Some(scheduler.schedule(
            scheduler.now() + params::CLEANUP_INTERVAL,
            SimEvent::TarpCleanup { node: self.node },
        ));
    }

    // --- table management ------------------------------------------------

    /// Next hop for `dst`: the destination itself when a valid entry
    /// exists, otherwise up toward the parent.
    fn lookup(&self, now: f64, dst: LinkAddr) -> Option<LinkAddr> {
        if dst == self.addr {
            return Some(self.addr);
        }
        if let Some(route) = self.nbr_tbl.get(&dst)
            && valid(now, route)
        {
            return Some(route.nexthop);
        }
        self.parent
    }

    /// Fold a received report into the table: the sender is confirmed as a
    /// child, ADD entries become descendants routed through it, REMOVE
    /// entries are evicted.
    fn nbr_tbl_update(&mut self, sender: LinkAddr, buf: &IndexMap<LinkAddr, RouteStatus>) {
        if let Some(entry) = self.nbr_tbl.get_mut(&sender)
            && entry.kind == NodeType::Neighbor
        {
            entry.kind = NodeType::Child;
        }

        for (addr, status) in buf {
            match status {
                RouteStatus::Add => {
                    if let Some(entry) = self.nbr_tbl.get_mut(addr) {
                        entry.nexthop = sender;
                        entry.kind = NodeType::Descendant;
                        entry.age = params::ALWAYS_VALID_AGE;
                    } else {
                        self.nbr_tbl.insert(
                            *addr,
                            Route {
                                kind: NodeType::Descendant,
                                age: params::ALWAYS_VALID_AGE,
                                nexthop: sender,
                                hops: params::MAX_PATH_LENGTH + 1,
                                etx: 0.0,
                                num_tx: 0,
                                num_ack: 0,
                                adv_metric: f64::INFINITY,
                            },
                        );
                    }
                }
                RouteStatus::Remove => {
                    self.nbr_tbl.shift_remove(addr);
                }
            }
        }
    }

    /// Snapshot the current subtree (children and descendants) into the
    /// report buffer as ADD entries.
    fn buff_subtree(&mut self) {
        self.flush_tpl_buf();
        let mut buf = IndexMap::new();
        for (addr, entry) in &self.nbr_tbl {
            if matches!(entry.kind, NodeType::Child | NodeType::Descendant) {
                buf.insert(*addr, RouteStatus::Add);
            }
        }
        self.tpl_buf = buf;
    }

    fn flush_tpl_buf(&mut self) {
        self.tpl_buf.clear();
        self.tpl_buf_offset = 0;
    }

    /// New-epoch reset: children and the parent are demoted to plain
    /// neighbors, descendants are flagged for eviction, the pending report
    /// is flushed, and the node rejoins the tree from scratch.
    fn reset_connection_status(&mut self, scheduler: &mut Scheduler, epoch: u32) {
        for entry in self.nbr_tbl.values_mut() {
            match entry.kind {
                NodeType::Descendant => entry.age = params::ALWAYS_INVALID_AGE,
                NodeType::Child | NodeType::Parent => entry.kind = NodeType::Neighbor,
                NodeType::Neighbor => {}
            }
        }
        self.parent = None;
        self.metric = if self.sink { 0.0 } else { f64::INFINITY };
        self.hops = if self.sink {
            0
        } else {
            params::MAX_PATH_LENGTH + 1
        };
        self.epoch = epoch;
        self.flush_tpl_buf();

        if let Some(handle) = self.beacon_timer.take() {
            scheduler.unschedule(handle);
        }
        if let Some(handle) = self.report_timer.take() {
            scheduler.unschedule(handle);
        }
    }

    /// Evict expired entries. Losing a child drops its whole subtree (and
    /// queues REMOVE deltas); losing the parent triggers the reactive
    /// parent change.
    fn do_cleanup(&mut self, ctx: &mut SimCtx, mac: &mut CsmaMac, phy: &PhyLayer) {
        let now = ctx.scheduler.now();
        let expired: Vec<LinkAddr> = self
            .nbr_tbl
            .iter()
            .filter(|(_, route)| !valid(now, route))
            .map(|(addr, _)| *addr)
            .collect();

        let mut parent_lost = false;
        let mut to_remove: Vec<LinkAddr> = Vec::new();

        for addr in expired {
            let Some(route) = self.nbr_tbl.get(&addr) else {
                continue;
            };
            match route.kind {
                NodeType::Parent => parent_lost = true,
                NodeType::Child => {
                    self.remove_subtree(addr);
                    to_remove.push(addr);
                }
                _ => to_remove.push(addr),
            }
        }

        if parent_lost {
            if let Some(old_parent) = self.parent {
                self.change_parent(ctx, mac, phy, old_parent);
            }
            if let Some(current) = self.parent
                && !to_remove.contains(&current)
            {
                to_remove.push(current);
            }
        }

        for addr in to_remove {
            if let Some(route) = self.nbr_tbl.get(&addr)
                && !valid(now, route)
            {
                self.nbr_tbl.shift_remove(&addr);
            }
        }
    }

    /// Drop everything routed through a lost child and queue the REMOVE
    /// deltas for the next report upstream.
    fn remove_subtree(&mut self, child: LinkAddr) {
        let subtree: Vec<LinkAddr> = self
            .nbr_tbl
            .iter()
            .filter(|(_, route)| route.nexthop == child)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &subtree {
            self.nbr_tbl.shift_remove(addr);
            self.tpl_buf.insert(*addr, RouteStatus::Remove);
        }
        if !self.tpl_buf.contains_key(&child) {
            self.tpl_buf.insert(child, RouteStatus::Remove);
        }
    }

    /// Reactive parent change after losing the current parent: pick the
    /// neighbor with the best advertised cost, or go orphan. The old
    /// parent stays in the table, demoted and flagged invalid.
    fn change_parent(
        &mut self,
        ctx: &mut SimCtx,
        mac: &mut CsmaMac,
        phy: &PhyLayer,
        old_parent: LinkAddr,
    ) {
        let mut best_metric = f64::INFINITY;
        let mut new_parent: Option<LinkAddr> = None;
        let mut new_parent_hops = params::MAX_PATH_LENGTH + 1;

        // the old parent is still typed Parent here, so the scan skips it
        for (addr, entry) in &self.nbr_tbl {
            if entry.kind == NodeType::Neighbor {
                let candidate = metric(entry.adv_metric, entry.etx);
                if candidate < best_metric {
                    best_metric = candidate;
                    new_parent = Some(*addr);
                    new_parent_hops = entry.hops;
                }
            }
        }

        if let Some(entry) = self.nbr_tbl.get_mut(&old_parent) {
            entry.kind = NodeType::Neighbor;
            entry.age = params::ALWAYS_INVALID_AGE;
        }

        if let Some(np) = new_parent {
            self.parent = Some(np);
            self.metric = best_metric;
            self.nbr_tbl[&np].kind = NodeType::Parent;
            self.hops = new_parent_hops.saturating_add(1);
            // tell the new parent about our subtree right away
            self.subtree_report(ctx, mac, phy);
        } else {
            self.parent = None;
            self.metric = f64::INFINITY;
            self.hops = params::MAX_PATH_LENGTH + 1;
        }

        log::info!(
            "node {}: reactive parent change {} -> {}",
            self.node,
            old_parent,
            new_parent.map(|a| a.to_string()).unwrap_or_else(|| "none".into())
        );
        self.emit(
            ctx,
            TarpSignal::ParentChange {
                timestamp: ctx.scheduler.now(),
                old: Some(old_parent),
                new: new_parent,
                reactive: true,
            },
        );
    }
}
