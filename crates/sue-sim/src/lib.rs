//! # SUE-Sim
//!
//! Discrete-event simulator for a lossless, credit-flow-controlled,
//! multi-virtual-channel scale-up interconnect. XPU hosts attach to a
//! switch through point-to-point links; every link runs credit-based flow
//! control and optional link-layer retransmission per virtual channel.
//!
//! The crate is organised around a single event queue: [`world::World`]
//! owns arenas of ports and hosts, and every interaction between them is a
//! scheduled [`world::Event`].

pub mod balancer;
pub mod client;
pub mod config;
pub mod host;
pub mod logging;
pub mod port;
pub mod server;
pub mod switch;
pub mod topology;
pub mod traffic;
pub mod world;

pub use config::{Cli, Params, SueSimConfig};
pub use logging::PerfLogger;
pub use world::{Summary, World};
