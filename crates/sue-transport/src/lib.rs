//! # SUE Transport
//!
//! The protocol layer of the SUE interconnect simulator: wire formats for
//! every header the link carries, the stacked-header packet store, and the
//! three per-port state machines — CBFC credit accounting, the bounded VC
//! queue bank, and the LLR retransmission window.
//!
//! Everything here is scheduler-free: transitions take the current virtual
//! time as an argument and return verdicts/actions for the port pipeline to
//! act on, so each machine is unit-testable in isolation.

pub mod cbfc;
pub mod llr;
pub mod packet;
pub mod vcq;
pub mod wire;

pub use cbfc::{CbfcManager, CreditError};
pub use llr::{AckAction, LlrManager, NackAction, RxVerdict};
pub use packet::{Packet, PacketTags};
pub use vcq::VcQueueBank;
pub use wire::{
    CbfcHeader, EthernetHeader, Ipv4Header, Mac48, PppHeader, SueHeader, UdpHeader, WireHeader,
    ACK_REV, ETH_P_IPV4, ETH_P_IPV6, NACK_REV, PROT_CBFC_UPDATE,
};
