//! # tarpsim
//!
//! Discrete-event simulator for low-power wireless sensor networks. Models
//! the full stack of a TARP deployment (a correlated-shadowing narrowband
//! channel, a capture-based PHY, unslotted 802.15.4 CSMA/CA, and the
//! tree-based any-to-any routing layer) to measure end-to-end latency,
//! delivery ratio, and parent stability under configurable topologies and
//! channel conditions.
//!
//! ## Architecture
//!
//! A single-threaded kernel pops priority-ordered events and dispatches
//! each to the owning node's protocol stack. The wireless channel broker
//! is the only process-wide entity: every transmission fans out as
//! reception events at every other node, which is what makes interference
//! and capture observable. Reproducibility comes from named RNG
//! substreams derived from one root seed, with an antithetic mode for
//! variance reduction across paired replications.
//!
//! ## Quick start
//!
//! ```no_run
//! use tarpsim::apps::PingPongApp;
//! use tarpsim::config::SimConfig;
//! use tarpsim::environment::Point;
//! use tarpsim::protocols::packets::LinkAddr;
//! use tarpsim::Simulation;
//!
//! let cfg = SimConfig::with_preset(42, "stable", 1.0, 64);
//! let mut sim = Simulation::bootstrap(&cfg).unwrap();
//! let sink = sim
//!     .add_node("node-1", Point::new(0.0, 0.0), true, Box::new(PingPongApp::pinger(LinkAddr(2), 15.0, 120.0)))
//!     .unwrap();
//! sim.add_node("node-2", Point::new(10.0, 0.0), false, Box::new(PingPongApp::ponger()))
//!     .unwrap();
//! assert_eq!(sim.linkaddr(sink), LinkAddr(1));
//! sim.start();
//! sim.run_until(600.0);
//! ```

pub mod apps;
pub mod config;
pub mod engine;
pub mod entities;
pub mod environment;
pub mod protocols;
pub mod simulation;

pub use simulation::{SimCtx, Simulation, SpawnError};
