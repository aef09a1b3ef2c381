//! The wireless channel broker.
//!
//! The channel is the one process-wide entity: every PHY registers with it
//! and hears about every other PHY's transmissions. A transmission is
//! broadcast by nature: on `on_tx_start` the broker schedules a
//! `RxStart`/`RxEnd` pair at *every* other node, offset by the per-link
//! propagation delay, regardless of the frame's destination. Receivers
//! need those events even for frames that are not for them, because the
//! energy still raises their interference floor.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::engine::event::{NodeId, SimEvent};
use crate::engine::random::RandomStream;
use crate::engine::scheduler::Scheduler;
use crate::environment::geometry::Point;
use crate::environment::propagation::{dbm_to_watts, NarrowbandChannelModel};
use crate::protocols::phy::Transmission;

pub struct WirelessChannel {
    model: NarrowbandChannelModel,
    positions: Vec<Point>,
    /// Transmissions currently on the air, by transmission id.
    active: IndexMap<u64, Rc<Transmission>>,
    tx_counter: u64,
}

impl WirelessChannel {
    pub fn new(model: NarrowbandChannelModel) -> Self {
        WirelessChannel {
            model,
            positions: Vec::new(),
            active: IndexMap::new(),
            tx_counter: 0,
        }
    }

    pub fn model(&self) -> &NarrowbandChannelModel {
        &self.model
    }

    /// Register a PHY at `position`; returns its index, which must match
    /// the node id assigned by the simulation.
    pub fn register(&mut self, position: Point) -> NodeId {
        self.positions.push(position);
        self.positions.len() - 1
    }

    pub fn participants(&self) -> usize {
        self.positions.len()
    }

    /// Allocate a unique id for a transmission about to be created.
    pub fn next_tx_id(&mut self) -> u64 {
        let id = self.tx_counter;
        self.tx_counter += 1;
        id
    }

    /// A sender's radio went on the air: register the transmission and
    /// schedule reception-start/end events at every other node.
    pub fn on_tx_start(&mut self, tx: &Rc<Transmission>, scheduler: &mut Scheduler) {
        self.active.insert(tx.id, Rc::clone(tx));
        let now = scheduler.now();
        let duration = tx.frame.on_air_duration();
        for (node, position) in self.positions.iter().enumerate() {
            if node == tx.sender {
                continue;
            }
            let delay = self.model.propagation_delay(&tx.origin, position);
            log::trace!(
                "channel: tx {} from node {} reaches node {} after {:.3} us",
                tx.id,
                tx.sender,
                node,
                delay * 1e6
            );
            scheduler.schedule(
                now + delay,
                SimEvent::RxStart {
                    node,
                    tx: Rc::clone(tx),
                },
            );
            scheduler.schedule(
                now + delay + duration,
                SimEvent::RxEnd {
                    node,
                    tx: Rc::clone(tx),
                },
            );
        }
    }

    /// The sender finished; the pre-scheduled RxEnd events do the rest.
    pub fn on_tx_end(&mut self, tx_id: u64) {
        self.active.shift_remove(&tx_id);
    }

    /// Transmissions currently occupying the channel.
    pub fn active(&self) -> impl Iterator<Item = &Rc<Transmission>> {
        self.active.values()
    }

    /// Thermal noise floor in Watts.
    pub fn linear_noise_floor(&self) -> f64 {
        dbm_to_watts(self.model.noise_floor_dbm())
    }

    /// Instantaneous received power of `tx` at `rx_position`, in Watts.
    /// Every call draws fresh fading, so this is a sample, not an average.
    pub fn linear_link_budget(
        &self,
        rx_position: &Point,
        tx: &Transmission,
        fading: &mut RandomStream,
    ) -> f64 {
        dbm_to_watts(
            self.model
                .link_budget_dbm(rx_position, &tx.origin, tx.power_dbm, fading),
        )
    }
}
