//! Load balancer: SUE selection and admission control.
//!
//! Each outgoing transaction is steered to a SUE engine by a configurable
//! hash of its destination and VC. Destination-queue space acts as the
//! admission check; transactions that no SUE can accept are buffered here
//! and the traffic generator is paused until space frees up.

use crate::config::Params;
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use std::collections::VecDeque;
use sue_common::{Vc, XpuId};
use sue_transport::Packet;
use tracing::warn;

/// Key of a destination queue: (destination XPU, virtual channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Destination {
    pub xpu: XpuId,
    pub vc: Vc,
}

/// SUE selection algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    SimpleMod,
    ModWithSeed,
    PrimeHash,
    EnhancedHash,
    RoundRobin,
    ConsistentHash,
}

impl Algorithm {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Algorithm::SimpleMod,
            1 => Algorithm::ModWithSeed,
            2 => Algorithm::PrimeHash,
            3 => Algorithm::EnhancedHash,
            4 => Algorithm::RoundRobin,
            5 => Algorithm::ConsistentHash,
            _ => return None,
        })
    }
}

pub struct LoadBalancer {
    pub local: XpuId,
    n_xpus: u32,
    algorithm: Algorithm,
    hash_seed: u32,
    prime1: u32,
    rr_counter: u32,
    /// Transactions no SUE could admit, in arrival order.
    pub buffer: VecDeque<(Packet, Destination)>,
    /// Buffer nonempty implies the traffic generator is paused.
    pub paused: bool,
    pub peak_buffered: usize,
    /// Successful SUE selections (one per admitted transaction).
    pub selections: u64,
    rng: StdRng,
}

impl LoadBalancer {
    pub fn new(cfg: &Params, local: XpuId) -> Self {
        let algorithm =
            Algorithm::from_u32(cfg.load_balance_algorithm).unwrap_or(Algorithm::SimpleMod);
        if algorithm == Algorithm::ConsistentHash {
            warn!("consistent hashing is not implemented; falling back to simple modulo");
        }
        LoadBalancer {
            local,
            n_xpus: cfg.n_xpus,
            algorithm,
            hash_seed: cfg.hash_seed,
            prime1: cfg.prime1,
            rr_counter: 0,
            buffer: VecDeque::new(),
            paused: false,
            peak_buffered: 0,
            selections: 0,
            rng: StdRng::seed_from_u64(cfg.seed.wrapping_add(u64::from(local.0)).wrapping_mul(31)),
        }
    }

    /// Primary SUE candidate for (destination, VC) under the configured
    /// algorithm.
    pub fn select_sue(&mut self, dest: XpuId, vc: Vc, n_sues: usize) -> usize {
        if n_sues == 0 {
            return 0;
        }
        let n = n_sues as u32;
        let d = dest.0;
        let sue = match self.algorithm {
            Algorithm::SimpleMod | Algorithm::ConsistentHash => d % n,
            Algorithm::ModWithSeed => (d.wrapping_add(self.hash_seed)) % n,
            Algorithm::PrimeHash => {
                d.wrapping_mul(self.prime1).wrapping_add(self.hash_seed) % n
            }
            Algorithm::EnhancedHash => (d.wrapping_add(u32::from(vc.0))) % n,
            Algorithm::RoundRobin => {
                let sue = (d.wrapping_add(self.rr_counter)) % n;
                self.rr_counter = (self.rr_counter + 1) % n;
                sue
            }
        };
        sue as usize
    }

    /// Random destination excluding the local XPU. Used defensively when a
    /// transaction arrives addressed to its own host.
    pub fn random_dest(&mut self) -> XpuId {
        debug_assert!(self.n_xpus >= 2);
        loop {
            let d = self.rng.random_range(0..self.n_xpus);
            if d != self.local.0 {
                return XpuId(d);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lb(algorithm: u32) -> LoadBalancer {
        let cfg = crate::config::SueSimConfig {
            load_balance_algorithm: algorithm,
            n_xpus: 8,
            hash_seed: 3,
            prime1: 7919,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        LoadBalancer::new(&cfg, XpuId(0))
    }

    #[test]
    fn simple_mod_ignores_vc() {
        let mut b = lb(0);
        assert_eq!(b.select_sue(XpuId(5), Vc(0), 4), 1);
        assert_eq!(b.select_sue(XpuId(5), Vc(3), 4), 1);
    }

    #[test]
    fn mod_with_seed_shifts_selection() {
        let mut b = lb(1);
        assert_eq!(b.select_sue(XpuId(5), Vc(0), 4), (5 + 3) % 4);
    }

    #[test]
    fn prime_hash_uses_prime_and_seed() {
        let mut b = lb(2);
        assert_eq!(
            b.select_sue(XpuId(5), Vc(0), 4),
            ((5u32.wrapping_mul(7919) + 3) % 4) as usize
        );
    }

    #[test]
    fn enhanced_hash_mixes_vc() {
        let mut b = lb(3);
        assert_eq!(b.select_sue(XpuId(5), Vc(2), 4), (5 + 2) % 4);
        assert_ne!(
            b.select_sue(XpuId(5), Vc(2), 4),
            b.select_sue(XpuId(5), Vc(3), 4)
        );
    }

    #[test]
    fn round_robin_advances_per_call() {
        let mut b = lb(4);
        let first = b.select_sue(XpuId(0), Vc(0), 4);
        let second = b.select_sue(XpuId(0), Vc(0), 4);
        assert_eq!((first + 1) % 4, second);
    }

    #[test]
    fn consistent_hash_falls_back_to_simple_mod() {
        let mut b = lb(5);
        assert_eq!(b.select_sue(XpuId(6), Vc(1), 4), 6 % 4);
    }

    #[test]
    fn random_dest_never_returns_local() {
        let mut b = lb(0);
        for _ in 0..200 {
            assert_ne!(b.random_dest(), XpuId(0));
        }
    }
}
