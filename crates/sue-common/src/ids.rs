//! Stable integer identifiers for simulation components.
//!
//! The topology is a collection of arenas indexed by these ids; there are no
//! cross-references between components at the storage level.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                $name(v as u32)
            }
        }
    };
}

id_type!(
    /// Host compute node endpoint, in `[0, nXpus)`.
    XpuId,
    "xpu"
);
id_type!(
    /// A node in the topology: either an XPU or the switch.
    NodeId,
    "node"
);
id_type!(
    /// Global index into the port arena.
    PortId,
    "port"
);
id_type!(
    /// Per-XPU SUE engine index.
    SueId,
    "sue"
);

/// Virtual channel id, in `[0, numVcs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vc(pub u8);

impl Vc {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Vc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vc{}", self.0)
    }
}

/// Role of a port, assigned at topology construction.
///
/// Selects the forwarding behaviour and the LLR manager flavour. This is an
/// explicit field rather than a property derived from the MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Host-side port: delivers upward to the server sink.
    Xpu,
    /// Switch-side port: participates in MAC-indexed forwarding.
    Switch,
}

impl PortKind {
    #[inline]
    pub fn is_switch(self) -> bool {
        matches!(self, PortKind::Switch)
    }
}
