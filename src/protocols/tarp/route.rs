//! Neighbor-table entries and the ETX/metric helpers.

use crate::protocols::packets::LinkAddr;

use super::params;

/// Role of a neighbor-table entry relative to this node's tree position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Parent,
    Child,
    Descendant,
    Neighbor,
}

/// One routing-table entry.
#[derive(Debug, Clone)]
pub struct Route {
    pub kind: NodeType,
    /// Last refresh time; `ALWAYS_VALID_AGE` and `ALWAYS_INVALID_AGE` are
    /// the two sentinel values.
    pub age: f64,
    pub nexthop: LinkAddr,
    /// Advertised hop distance to the sink of this neighbor.
    pub hops: u8,
    pub etx: f64,
    pub num_tx: u32,
    pub num_ack: u32,
    pub adv_metric: f64,
}

/// Piecewise-linear ETX estimate from a measured RSSI.
pub fn etx_est_rssi(rssi: f64) -> f64 {
    if rssi > params::RSSI_HIGH_REF {
        return 1.0;
    }
    if rssi < params::RSSI_LOW_THR {
        return 10.0;
    }
    let span = params::RSSI_HIGH_REF - params::RSSI_LOW_THR;
    let frac = (params::RSSI_HIGH_REF - rssi) / span;
    1.0 + frac * 9.0
}

/// Whether `route` is still usable at `now`.
pub fn valid(now: f64, route: &Route) -> bool {
    now - route.age < params::ENTRY_EXPIRATION_TIME
}

/// Candidate routing metric through a neighbor.
pub fn metric(adv_metric: f64, etx: f64) -> f64 {
    adv_metric + etx
}

fn metric_improv_thr(cur_metric: f64) -> f64 {
    if cur_metric <= 0.0 {
        return f64::INFINITY;
    }
    let thr = params::THR_H / cur_metric;
    if thr < params::DELTA_ETX_MIN {
        params::DELTA_ETX_MIN
    } else {
        thr
    }
}

/// Hysteresis-guarded parent preference: a new candidate metric must
/// undercut the current one by a margin that shrinks as the current cost
/// grows, so near-equal alternatives do not cause oscillation.
pub fn preferred(new_metric: f64, cur_metric: f64) -> bool {
    new_metric + metric_improv_thr(cur_metric) < cur_metric
}

/// ETX update after a transmission outcome. With at least one ACK the
/// estimate is an EWMA of the delivery ratio; with none it falls back to
/// the RSSI heuristic (a missing RSSI pins it to the worst bucket).
pub fn etx_update(num_tx: u32, num_ack: u32, old_etx: f64, rssi: Option<f64>) -> f64 {
    if num_ack == 0 || params::ALPHA == 1.0 {
        let effective = rssi.unwrap_or(params::RSSI_LOW_THR - 1.0);
        etx_est_rssi(effective)
    } else {
        let ratio = num_tx as f64 / num_ack as f64;
        params::ALPHA * old_etx + (1.0 - params::ALPHA) * ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tarp::params::{ALWAYS_INVALID_AGE, ALWAYS_VALID_AGE};

    #[test]
    fn etx_map_endpoints_and_midpoint() {
        assert_eq!(etx_est_rssi(-30.0), 1.0);
        assert_eq!(etx_est_rssi(-90.0), 10.0);
        let mid = etx_est_rssi(-60.0);
        assert!((mid - 5.5).abs() < 1e-12); // halfway between the anchors
    }

    #[test]
    fn sentinel_ages_behave() {
        let mut route = Route {
            kind: NodeType::Neighbor,
            age: ALWAYS_VALID_AGE,
            nexthop: LinkAddr(2),
            hops: 1,
            etx: 1.0,
            num_tx: 0,
            num_ack: 0,
            adv_metric: 0.0,
        };
        assert!(valid(1e9, &route));
        route.age = ALWAYS_INVALID_AGE;
        assert!(!valid(500.0, &route));
    }

    #[test]
    fn preference_applies_hysteresis() {
        // large current metric: threshold floor DELTA_ETX_MIN applies
        assert!(preferred(10.0, 1000.0));
        // near-equal candidates do not win
        assert!(!preferred(9.9, 10.0));
        // a clear improvement does
        assert!(preferred(4.0, 10.0));
        // a fresh node at +inf accepts anything finite
        assert!(preferred(11.0, f64::INFINITY));
        // the sink (metric 0) never prefers anyone
        assert!(!preferred(0.1, 0.0));
    }

    #[test]
    fn etx_update_blends_or_resets() {
        // EWMA path: 0.5*2.0 + 0.5*(6/3)
        let blended = etx_update(6, 3, 2.0, Some(-50.0));
        assert!((blended - 2.0).abs() < 1e-12);
        // no ACKs: RSSI heuristic
        let reset = etx_update(4, 0, 2.0, Some(-90.0));
        assert_eq!(reset, 10.0);
        // no ACKs, no RSSI: worst bucket
        assert_eq!(etx_update(4, 0, 2.0, None), 10.0);
    }
}
