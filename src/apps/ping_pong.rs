//! Ping/pong application: one node pings a peer on a fixed cadence, the
//! peer answers, and timeouts trigger retries. Mostly a debugging and
//! latency-measurement workload.

use crate::engine::event::SimEvent;
use crate::engine::scheduler::EventHandle;
use crate::entities::node::NodeStack;
use crate::entities::signals::{AppSignal, DropReason, Signal, SignalSource};
use crate::protocols::packets::LinkAddr;
use crate::simulation::SimCtx;

use super::{parse_payload, AppDelivery, Application};

/// Wait for a PONG before declaring the PING lost.
const PING_TIMEOUT: f64 = 35.0;
/// Pause after a loss before the next attempt.
const PING_RETRY_INTERVAL: f64 = 15.0;

const TIMER_SEND: u32 = 1;
const TIMER_TIMEOUT: u32 = 2;

pub struct PingPongApp {
    is_pinger: bool,
    peer: Option<LinkAddr>,
    ping_interval: f64,
    start_delay: f64,
    ping_count: u32,
    started: bool,
    timeout_handle: Option<EventHandle>,
}

impl PingPongApp {
    /// A pinger targeting `peer`, starting at absolute time `start_delay`.
    pub fn pinger(peer: LinkAddr, ping_interval: f64, start_delay: f64) -> Self {
        PingPongApp {
            is_pinger: true,
            peer: Some(peer),
            ping_interval,
            start_delay,
            ping_count: 0,
            started: false,
            timeout_handle: None,
        }
    }

    /// The answering side.
    pub fn ponger() -> Self {
        PingPongApp {
            is_pinger: false,
            peer: None,
            ping_interval: 0.0,
            start_delay: 0.0,
            ping_count: 0,
            started: false,
            timeout_handle: None,
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

    fn send_ping(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx) {
        let Some(peer) = self.peer else {
            return;
        };
        if !self.started {
            return;
        }
        if let Some(handle) = self.timeout_handle.take() {
            ctx.scheduler.unschedule(handle);
        }

        self.ping_count += 1;
        let payload = format!("PING #{} from {}", self.ping_count, stack.name);
        let ok = stack.net_send(ctx, payload.into_bytes(), peer);
        let now = ctx.scheduler.now();

        if ok {
            self.emit(
                stack,
                ctx,
                AppSignal::Send {
                    timestamp: now,
                    kind: "PING",
                    seq: self.ping_count,
                    dst: peer,
                },
            );
            self.timeout_handle = Some(ctx.scheduler.schedule(
                now + PING_TIMEOUT,
                SimEvent::AppTimer {
                    node: stack.node,
                    timer: TIMER_TIMEOUT,
                },
            ));
        } else {
            self.emit(
                stack,
                ctx,
                AppSignal::SendFail {
                    timestamp: now,
                    kind: "PING",
                    seq: self.ping_count,
                    reason: DropReason::NoRoute,
                },
            );
            self.on_ping_timeout(stack, ctx);
        }
    }

    fn on_ping_timeout(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx) {
        if self.timeout_handle.take().is_some() {
            self.emit(
                stack,
                ctx,
                AppSignal::Timeout {
                    timestamp: ctx.scheduler.now(),
                    seq: self.ping_count,
                },
            );
        }
        ctx.scheduler.schedule(
            ctx.scheduler.now() + PING_RETRY_INTERVAL,
            SimEvent::AppTimer {
                node: stack.node,
                timer: TIMER_SEND,
            },
        );
    }
}

impl Application for PingPongApp {
    fn start(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx) {
        self.started = true;
        self.emit(
            stack,
            ctx,
            AppSignal::Start {
                timestamp: ctx.scheduler.now(),
            },
        );
        if self.is_pinger {
            ctx.scheduler.schedule(
                self.start_delay,
                SimEvent::AppTimer {
                    node: stack.node,
                    timer: TIMER_SEND,
                },
            );
        }
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

        if kind == "PING" && !self.is_pinger {
            let payload = format!("PONG #{} from {}", seq, stack.name);
            let ok = stack.net_send(ctx, payload.into_bytes(), delivery.src);
            let now = ctx.scheduler.now();
            if ok {
                self.emit(
                    stack,
                    ctx,
                    AppSignal::Send {
                        timestamp: now,
                        kind: "PONG",
                        seq,
                        dst: delivery.src,
                    },
                );
            } else {
                self.emit(
                    stack,
                    ctx,
                    AppSignal::SendFail {
                        timestamp: now,
                        kind: "PONG",
                        seq,
                        reason: DropReason::NoRoute,
                    },
                );
            }
        }

        if kind == "PONG" && self.is_pinger {
            if let Some(handle) = self.timeout_handle.take() {
                ctx.scheduler.unschedule(handle);
            }
            ctx.scheduler.schedule(
                ctx.scheduler.now() + self.ping_interval,
                SimEvent::AppTimer {
                    node: stack.node,
                    timer: TIMER_SEND,
                },
            );
        }
    }

    fn on_timer(&mut self, stack: &mut NodeStack, ctx: &mut SimCtx, timer: u32) {
        match timer {
            TIMER_SEND => self.send_ping(stack, ctx),
            TIMER_TIMEOUT => self.on_ping_timeout(stack, ctx),
            _ => {}
        }
    }
}
