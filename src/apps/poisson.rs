//! Poisson traffic generator: exponential inter-arrival times to
//! destinations drawn from a configurable list.

use crate::engine::event::SimEvent;
use crate::entities::node::NodeStack;
use crate::entities::signals::{AppSignal, DropReason, Signal, SignalSource};
use crate::protocols::packets::LinkAddr;
use crate::simulation::SimCtx;

use super::{parse_payload, AppDelivery, Application};

const TIMER_SEND: u32 = 1;

/// Spread of the one-shot start jitter, so a fleet of generators does not
/// fire in lockstep.
const START_JITTER_MAX: f64 = 30.0;

pub struct PoissonTrafficApp {
    destinations: Vec<LinkAddr>,
    mean_interarrival: f64,
    start_delay: f64,
    packet_counter: u32,
    rng_key: Option<String>,
}

impl PoissonTrafficApp {
    pub fn new(destinations: Vec<LinkAddr>, mean_interarrival: f64, start_delay: f64) -> Self {
        PoissonTrafficApp {
            destinations,
            mean_interarrival,
            start_delay,
            packet_counter: 0,
            rng_key: None,
        }
    }

    fn emit(&self, stack: &NodeStack, ctx: &mut SimCtx, signal: AppSignal) {
        ctx.monitors.emit(
            SignalSource {
                node: stack.node,
                addr: stack.linkaddr,
            },
            Signal::App(signal),
        );
    }

    fn rng_key(&self) -> &str {
        self.rng_key.as_deref().expect("app started")
    }

    fn schedule_next_send(&self, stack: &NodeStack, ctx: &mut SimCtx) {
        let interarrival = ctx
            .random
            .stream(self.rng_key())
            .expect("app stream created at start")
            .exponential(self.mean_interarrival);
        ctx.scheduler.schedule(
            ctx.scheduler.now() + interarrival,
            SimEvent::AppTimer {
                node: stack.node,
                timer: TIMER_SEND,
            },
        );
    }

    fn send_packet_and_reschedule(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx) {
        if self.destinations.is_empty() {
            return;
        }
        let dst = *ctx
            .random
            .stream(self.rng_key())
            .expect("app stream created at start")
            .choice(&self.destinations)
            .expect("destinations not empty");

        self.packet_counter += 1;
        let payload = format!("DATA #{} from {}", self.packet_counter, stack.name);
        let ok = stack.net_send(ctx, payload.into_bytes(), dst);
        let now = ctx.scheduler.now();

        if ok {
            self.emit(
                stack,
                ctx,
                AppSignal::Send {
                    timestamp: now,
                    kind: "DATA",
                    seq: self.packet_counter,
                    dst,
                },
            );
        } else {
            self.emit(
                stack,
                ctx,
                AppSignal::SendFail {
                    timestamp: now,
                    kind: "DATA",
                    seq: self.packet_counter,
                    reason: DropReason::NoRoute,
                },
            );
        }

        self.schedule_next_send(stack, ctx);
    }
}

impl Application for PoissonTrafficApp {
    fn start(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx) {
        let key = format!("node:{}/traffic_app", stack.name);
        ctx.random
            .create_stream(&key)
            .expect("traffic app stream key is unique per node");
        self.rng_key = Some(key);

        self.emit(
            stack,
            ctx,
            AppSignal::Start {
                timestamp: ctx.scheduler.now(),
            },
        );

        if self.destinations.is_empty() {
            log::warn!("node {}: traffic app has no destinations", stack.node);
            return;
        }

        let jitter = ctx
            .random
            .stream(self.rng_key())
            .expect("app stream created above")
            .uniform(0.0, START_JITTER_MAX);
        ctx.scheduler.schedule(
            self.start_delay + jitter,
            SimEvent::AppTimer {
                node: stack.node,
                timer: TIMER_SEND,
            },
        );
    }

    fn receive(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx, delivery: AppDelivery) {
        let Some((kind, seq)) = parse_payload(&delivery.payload) else {
            return;
        };
        self.emit(
            stack,
            ctx,
            AppSignal::Receive {
                timestamp: ctx.scheduler.now(),
                kind,
                seq,
                src: delivery.src,
                hops: delivery.hops,
            },
        );
    }

    fn on_timer(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx, timer: u32) {
        if timer == TIMER_SEND {
            self.send_packet_and_reschedule(stack, ctx);
        }
    }
}
