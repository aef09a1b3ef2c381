//! Bundled metric monitors: packet delivery ratio, end-to-end latency, and
//! parent stability. They accumulate in memory; exporting the records is
//! the caller's business.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::engine::event::NodeId;
use crate::protocols::packets::LinkAddr;

use super::signals::{AppSignal, Monitor, Signal, SignalSource, TarpSignal};

/// Tracks which application packets were delivered, keyed by
/// `(source, sequence, destination)`.
pub struct PdrMonitor {
    sent: IndexMap<(LinkAddr, u32, LinkAddr), bool>,
}

impl PdrMonitor {
    pub fn new() -> Self {
        PdrMonitor {
            sent: IndexMap::new(),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    pub fn delivered_count(&self) -> usize {
        self.sent.values().filter(|&&d| d).count()
    }

    /// Delivered / sent; 1.0 when nothing was sent yet.
    pub fn ratio(&self) -> f64 {
        if self.sent.is_empty() {
            return 1.0;
        }
        self.delivered_count() as f64 / self.sent.len() as f64
    }
}

impl Default for PdrMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for PdrMonitor {
    fn update(&mut self, source: &SignalSource, signal: &Signal) {
        match signal {
            Signal::App(AppSignal::Send { seq, dst, .. }) => {
                self.sent.insert((source.addr, *seq, *dst), false);
            }
            Signal::App(AppSignal::Receive { seq, src, .. }) => {
                if let Some(delivered) = self.sent.get_mut(&(*src, *seq, source.addr)) {
                    *delivered = true;
                }
            }
            _ => {}
        }
    }
}

/// One delivered packet with its measured end-to-end latency.
#[derive(Debug, Clone)]
pub struct LatencySample {
    pub src: LinkAddr,
    pub seq: u32,
    pub send_time: f64,
    pub receive_time: f64,
    pub latency: f64,
    pub hops: u8,
}

/// Measures end-to-end latency of application packets.
pub struct LatencyMonitor {
    pending: HashMap<(LinkAddr, u32), f64>,
    samples: Vec<LatencySample>,
}

impl LatencyMonitor {
    pub fn new() -> Self {
        LatencyMonitor {
            pending: HashMap::new(),
            samples: Vec::new(),
        }
    }

    pub fn samples(&self) -> &[LatencySample] {
        &self.samples
    }

    pub fn mean_latency(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|s| s.latency).sum::<f64>() / self.samples.len() as f64)
    }
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for LatencyMonitor {
    fn update(&mut self, source: &SignalSource, signal: &Signal) {
        match signal {
            Signal::App(AppSignal::Send { timestamp, seq, .. }) => {
                self.pending.insert((source.addr, *seq), *timestamp);
            }
            Signal::App(AppSignal::Receive {
                timestamp,
                seq,
                src,
                hops,
                ..
            }) => {
                if let Some(send_time) = self.pending.remove(&(*src, *seq)) {
                    self.samples.push(LatencySample {
                        src: *src,
                        seq: *seq,
                        send_time,
                        receive_time: *timestamp,
                        latency: *timestamp - send_time,
                        hops: *hops,
                    });
                }
            }
            _ => {}
        }
    }
}

/// One recorded parent transition.
#[derive(Debug, Clone)]
pub struct ParentChangeRecord {
    pub timestamp: f64,
    pub node: NodeId,
    pub old: Option<LinkAddr>,
    pub new: Option<LinkAddr>,
    pub reactive: bool,
}

/// Records every parent change the routing layer announces.
pub struct ParentChangeMonitor {
    records: Vec<ParentChangeRecord>,
}

impl ParentChangeMonitor {
    pub fn new() -> Self {
        ParentChangeMonitor {
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[ParentChangeRecord] {
        &self.records
    }

    /// Count of genuine re-parenting events for `node` after `since`:
    /// transitions from one known parent to a different one. Re-elections
    /// after an epoch reset start from an empty parent and do not count.
    pub fn reparent_count(&self, node: NodeId, since: f64) -> usize {
        self.records
            .iter()
            .filter(|r| {
                r.node == node
                    && r.timestamp >= since
                    && r.old.is_some()
                    && r.old != r.new
            })
            .count()
    }
}

impl Default for ParentChangeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for ParentChangeMonitor {
    fn update(&mut self, source: &SignalSource, signal: &Signal) {
        if let Signal::Tarp(TarpSignal::ParentChange {
            timestamp,
            old,
            new,
            reactive,
        }) = signal
        {
            self.records.push(ParentChangeRecord {
                timestamp: *timestamp,
                node: source.node,
                old: *old,
                new: *new,
                reactive: *reactive,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::signals::SignalSource;

    fn src(node: NodeId, addr: u16) -> SignalSource {
        SignalSource {
            node,
            addr: LinkAddr(addr),
        }
    }

    #[test]
    fn pdr_matches_send_receive_pairs() {
        let mut pdr = PdrMonitor::new();
        pdr.update(
            &src(0, 1),
            &Signal::App(AppSignal::Send {
                timestamp: 1.0,
                kind: "DATA",
                seq: 1,
                dst: LinkAddr(2),
            }),
        );
        pdr.update(
            &src(0, 1),
            &Signal::App(AppSignal::Send {
                timestamp: 2.0,
                kind: "DATA",
                seq: 2,
                dst: LinkAddr(2),
            }),
        );
        pdr.update(
            &src(1, 2),
            &Signal::App(AppSignal::Receive {
                timestamp: 2.5,
                kind: "DATA",
                seq: 1,
                src: LinkAddr(1),
                hops: 1,
            }),
        );
        assert_eq!(pdr.sent_count(), 2);
        assert_eq!(pdr.delivered_count(), 1);
        assert!((pdr.ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn latency_is_receive_minus_send() {
        let mut lat = LatencyMonitor::new();
        lat.update(
            &src(0, 1),
            &Signal::App(AppSignal::Send {
                timestamp: 10.0,
                kind: "DATA",
                seq: 7,
                dst: LinkAddr(2),
            }),
        );
        lat.update(
            &src(1, 2),
            &Signal::App(AppSignal::Receive {
                timestamp: 10.25,
                kind: "DATA",
                seq: 7,
                src: LinkAddr(1),
                hops: 2,
            }),
        );
        assert_eq!(lat.samples().len(), 1);
        assert!((lat.mean_latency().unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn reparent_count_ignores_epoch_reelections() {
        let mut mon = ParentChangeMonitor::new();
        // epoch re-election: old parent empty
        mon.update(
            &src(3, 4),
            &Signal::Tarp(TarpSignal::ParentChange {
                timestamp: 100.0,
                old: None,
                new: Some(LinkAddr(1)),
                reactive: false,
            }),
        );
        // genuine switch
        mon.update(
            &src(3, 4),
            &Signal::Tarp(TarpSignal::ParentChange {
                timestamp: 130.0,
                old: Some(LinkAddr(1)),
                new: Some(LinkAddr(2)),
                reactive: true,
            }),
        );
        assert_eq!(mon.reparent_count(3, 0.0), 1);
        assert_eq!(mon.reparent_count(3, 200.0), 0);
    }
}
