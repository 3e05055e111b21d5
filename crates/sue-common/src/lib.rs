//! # SUE-Sim Common
//!
//! Shared building blocks for the SUE interconnect simulator: stable
//! component identifiers, the virtual nanosecond clock, and the cancellable
//! discrete-event queue that drives every other crate.

pub mod events;
pub mod ids;
pub mod time;

pub use events::{EventHandle, EventQueue};
pub use ids::{NodeId, PortId, PortKind, SueId, Vc, XpuId};
pub use time::{Nanos, ParseError, Rate};
