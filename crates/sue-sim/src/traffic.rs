//! Traffic generation.
//!
//! Three pluggable sources behind one tagged enum: a uniform-rate random
//! generator, a CSV of fine-grained per-flow rates, and a timestamped
//! operation trace. All three honour pause/resume from the load balancer:
//! while paused the tick re-arms without emitting.

use crate::config::{Params, TrafficMode};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use std::path::Path;
use sue_common::{Nanos, Rate, Vc, XpuId};
use sue_transport::{Packet, SueHeader};
use tracing::{info, warn};

/// Outcome of one generator tick.
pub enum TgStep {
    /// Emit a transaction and come back after `next`.
    Emit {
        pkt: Packet,
        dest: XpuId,
        vc: Vc,
        next: Nanos,
    },
    /// Paused (or waiting): re-arm after `next` without emitting.
    Idle { next: Nanos },
    /// All offered work has been generated.
    Complete,
}

// ─── Fine-grained flows ─────────────────────────────────────────────────────

/// One row of the fine-grained flow CSV:
/// `srcXpu,dstXpu,sueId,portIdx,vc,rateMbps,totalBytes`.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    pub src: u32,
    pub dst: u32,
    pub sue_id: u32,
    pub port_idx: u32,
    pub vc: u8,
    pub rate_mbps: f64,
    pub total_bytes: u64,
}

struct FlowState {
    dest: XpuId,
    vc: Vc,
    interval: Nanos,
    next_due: Nanos,
    sent: u64,
    total: u64,
}

// ─── Trace entries ──────────────────────────────────────────────────────────

struct TraceEntry {
    at: Nanos,
    dest: XpuId,
    vc: Vc,
}

enum Mode {
    Uniform {
        interval: Nanos,
        max_xpu: u32,
        min_vc: u8,
        max_vc: u8,
    },
    Flows {
        flows: Vec<FlowState>,
    },
    Trace {
        entries: Vec<TraceEntry>,
        idx: usize,
    },
}

pub struct TrafficGenerator {
    pub xpu: XpuId,
    mode: Mode,
    pub paused: bool,
    pub complete: bool,
    /// Application bytes generated so far.
    pub bytes_sent: u64,
    pub pause_count: u64,
    psn: u16,
    transaction_size: u32,
    total_bytes: u64,
    started: bool,
    rng: StdRng,
}

impl TrafficGenerator {
    pub fn new(cfg: &Params, xpu: XpuId) -> Self {
        let mode = match cfg.traffic_mode {
            TrafficMode::Uniform => {
                let interval = packet_interval(cfg.transaction_size, cfg.thread_rate);
                Mode::Uniform {
                    interval,
                    max_xpu: cfg.n_xpus - 1,
                    min_vc: 0,
                    max_vc: cfg.vc_num - 1,
                }
            }
            TrafficMode::Flows => {
                let specs = load_flows(Path::new(&cfg.flow_file)).unwrap_or_else(|e| {
                    warn!(xpu = xpu.0, error = %e, "cannot load flow file; no flows active");
                    Vec::new()
                });
                Mode::Flows {
                    flows: flow_states(&specs, xpu, cfg),
                }
            }
            TrafficMode::Trace => {
                // Trace replay drives a single sender.
                let entries = if xpu.0 == 0 {
                    let rows = load_trace(
                        Path::new(&cfg.trace_file),
                        &cfg.trace_operation,
                        cfg.trace_tile,
                    )
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "cannot load trace file; nothing to replay");
                        Vec::new()
                    });
                    trace_entries(&rows, xpu, cfg.n_xpus)
                } else {
                    Vec::new()
                };
                Mode::Trace { entries, idx: 0 }
            }
        };
        TrafficGenerator {
            xpu,
            mode,
            paused: false,
            complete: false,
            bytes_sent: 0,
            pause_count: 0,
            psn: 0,
            transaction_size: cfg.transaction_size,
            total_bytes: cfg.total_bytes_to_send,
            started: false,
            rng: StdRng::seed_from_u64(cfg.seed.wrapping_add(u64::from(xpu.0)).wrapping_mul(97)),
        }
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            self.pause_count += 1;
            info!(xpu = self.xpu.0, "traffic generation paused");
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            info!(xpu = self.xpu.0, "traffic generation resumed");
        }
    }

    /// Stop offering new transactions (scheduled client-stop time).
    pub fn force_complete(&mut self) {
        self.complete = true;
    }

    /// Advance the generator by one tick.
    pub fn step(&mut self, now: Nanos) -> TgStep {
        if self.complete {
            return TgStep::Complete;
        }
        if self.paused {
            return TgStep::Idle {
                next: self.rearm_interval(now),
            };
        }
        if !self.started {
            self.started = true;
            // Flow due times are relative to the generator start.
            if let Mode::Flows { flows } = &mut self.mode {
                for f in flows.iter_mut() {
                    f.next_due = now;
                }
            }
        }
        match &mut self.mode {
            Mode::Uniform {
                interval,
                max_xpu,
                min_vc,
                max_vc,
            } => {
                if self.bytes_sent >= self.total_bytes {
                    self.complete = true;
                    return TgStep::Complete;
                }
                // Draw a destination, walking off the local id.
                let mut dest = self.rng.random_range(0..=*max_xpu);
                while dest == self.xpu.0 {
                    dest = (dest + 1) % (*max_xpu + 1);
                }
                let vc = Vc(self.rng.random_range(*min_vc..=*max_vc));
                let pkt = transaction(self.transaction_size, &mut self.psn, XpuId(dest), vc);
                self.bytes_sent += u64::from(self.transaction_size);
                TgStep::Emit {
                    pkt,
                    dest: XpuId(dest),
                    vc,
                    next: *interval,
                }
            }
            Mode::Flows { flows } => {
                let due = flows
                    .iter_mut()
                    .filter(|f| f.sent < f.total)
                    .min_by_key(|f| f.next_due);
                let Some(flow) = due else {
                    self.complete = true;
                    return TgStep::Complete;
                };
                let dest = flow.dest;
                let vc = flow.vc;
                flow.sent += u64::from(self.transaction_size);
                flow.next_due = flow.next_due + flow.interval;
                let pkt = transaction(self.transaction_size, &mut self.psn, dest, vc);
                self.bytes_sent += u64::from(self.transaction_size);

                let next = flows
                    .iter()
                    .filter(|f| f.sent < f.total)
                    .map(|f| f.next_due)
                    .min()
                    .map(|due| due.saturating_sub(now))
                    .unwrap_or(Nanos::ZERO);
                TgStep::Emit {
                    pkt,
                    dest,
                    vc,
                    next,
                }
            }
            Mode::Trace { entries, idx } => {
                let Some(entry) = entries.get(*idx) else {
                    self.complete = true;
                    return TgStep::Complete;
                };
                let dest = entry.dest;
                let vc = entry.vc;
                let next = entries
                    .get(*idx + 1)
                    .map(|n| n.at.saturating_sub(entries[*idx].at))
                    .unwrap_or(Nanos::ZERO);
                *idx += 1;
                let pkt = transaction(self.transaction_size, &mut self.psn, dest, vc);
                self.bytes_sent += u64::from(self.transaction_size);
                TgStep::Emit {
                    pkt,
                    dest,
                    vc,
                    next,
                }
            }
        }
    }

    /// Re-arm delay while paused.
    fn rearm_interval(&self, now: Nanos) -> Nanos {
        match &self.mode {
            Mode::Uniform { interval, .. } => *interval,
            Mode::Flows { flows } => flows
                .iter()
                .filter(|f| f.sent < f.total)
                .map(|f| f.next_due)
                .min()
                .map(|due| due.saturating_sub(now).max(Nanos(1)))
                .unwrap_or(Nanos(1)),
            Mode::Trace { .. } => Nanos(1_000),
        }
    }
}

/// Inter-transaction gap at the configured rate.
fn packet_interval(transaction_size: u32, rate: Rate) -> Nanos {
    rate.time_for_bytes(transaction_size as usize)
}

fn transaction(size: u32, psn: &mut u16, dest: XpuId, vc: Vc) -> Packet {
    let mut pkt = Packet::new(size as usize);
    pkt.add_header(&SueHeader::data(*psn, dest.0 as u16, vc.0));
    *psn = psn.wrapping_add(1);
    pkt
}

// ─── CSV loaders ────────────────────────────────────────────────────────────

/// Load the fine-grained flow table. Rows that fail to parse are skipped
/// with a warning so a header line is harmless.
pub fn load_flows(path: &Path) -> Result<Vec<FlowSpec>, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut flows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let parsed = (|| {
            Some(FlowSpec {
                src: record.get(0)?.parse().ok()?,
                dst: record.get(1)?.parse().ok()?,
                sue_id: record.get(2)?.parse().ok()?,
                port_idx: record.get(3)?.parse().ok()?,
                vc: record.get(4)?.parse().ok()?,
                rate_mbps: record.get(5)?.parse().ok()?,
                total_bytes: record.get(6)?.parse().ok()?,
            })
        })();
        match parsed {
            Some(f) => flows.push(f),
            None => warn!(row = ?record, "skipping unparseable flow row"),
        }
    }
    Ok(flows)
}

fn flow_states(specs: &[FlowSpec], local: XpuId, cfg: &Params) -> Vec<FlowState> {
    specs
        .iter()
        .filter(|f| f.src == local.0)
        .filter(|f| {
            if f.dst == local.0 || f.dst >= cfg.n_xpus {
                warn!(src = f.src, dst = f.dst, "flow destination invalid; row ignored");
                return false;
            }
            true
        })
        .map(|f| {
            let rate = Rate::from_mbps(f.rate_mbps);
            FlowState {
                dest: XpuId(f.dst),
                vc: Vc(f.vc & 0x03),
                interval: rate.time_for_bytes(cfg.transaction_size as usize),
                next_due: Nanos::ZERO,
                sent: 0,
                total: f.total_bytes,
            }
        })
        .collect()
}

/// Load a `(timestamp_ns, gpuId, dieId, operation, tileId)` trace, keeping
/// rows matching the operation and tile filters.
pub fn load_trace(
    path: &Path,
    operation: &str,
    tile: u32,
) -> Result<Vec<(u64, u32, String)>, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let parsed = (|| {
            let ts: u64 = record.get(0)?.parse().ok()?;
            let gpu: u32 = record.get(1)?.parse().ok()?;
            let op = record.get(3)?.to_string();
            let tile_id: u32 = record.get(4)?.parse().ok()?;
            Some((ts, gpu, op, tile_id))
        })();
        if let Some((ts, gpu, op, tile_id)) = parsed {
            if op == operation && tile_id == tile {
                rows.push((ts, gpu, op));
            }
        }
    }
    Ok(rows)
}

fn trace_entries(rows: &[(u64, u32, String)], local: XpuId, n_xpus: u32) -> Vec<TraceEntry> {
    let first_ts = rows.first().map(|r| r.0).unwrap_or(0);
    rows.iter()
        .map(|(ts, gpu, op)| {
            let mut dest = gpu % n_xpus;
            if dest == local.0 {
                dest = (dest + 1) % n_xpus;
            }
            TraceEntry {
                at: Nanos(ts.saturating_sub(first_ts)),
                dest: XpuId(dest),
                vc: operation_vc(op),
            }
        })
        .collect()
}

/// LOAD→0, STORE→1, everything else→2.
fn operation_vc(op: &str) -> Vc {
    match op {
        "LOAD" => Vc(0),
        "STORE" => Vc(1),
        _ => Vc(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SueSimConfig;
    use std::io::Write;

    fn uniform_cfg() -> Params {
        SueSimConfig {
            n_xpus: 4,
            thread_rate: 1000.0,
            total_bytes_to_send: 1,
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn uniform_interval_matches_rate() {
        // 256 bytes at 1000 Mbps: 2048 ns per transaction.
        assert_eq!(
            packet_interval(256, Rate::from_mbps(1000.0)),
            Nanos(2_048)
        );
    }

    #[test]
    fn uniform_never_targets_local_xpu() {
        let cfg = uniform_cfg();
        let mut tg = TrafficGenerator::new(&cfg, XpuId(2));
        for _ in 0..200 {
            match tg.step(Nanos::ZERO) {
                TgStep::Emit { dest, vc, .. } => {
                    assert_ne!(dest, XpuId(2));
                    assert!(vc.0 < 4);
                }
                _ => panic!("generator should be emitting"),
            }
        }
    }

    #[test]
    fn uniform_completes_at_total_bytes() {
        let cfg = uniform_cfg(); // 1 MB total, 256-byte transactions
        let mut tg = TrafficGenerator::new(&cfg, XpuId(0));
        let mut emitted = 0u64;
        loop {
            match tg.step(Nanos::ZERO) {
                TgStep::Emit { .. } => emitted += 1,
                TgStep::Complete => break,
                TgStep::Idle { .. } => panic!("not paused"),
            }
        }
        assert_eq!(emitted, 1024 * 1024 / 256);
        assert!(tg.complete);
    }

    #[test]
    fn paused_generator_rearms_without_emitting() {
        let cfg = uniform_cfg();
        let mut tg = TrafficGenerator::new(&cfg, XpuId(0));
        tg.pause();
        assert!(matches!(tg.step(Nanos::ZERO), TgStep::Idle { .. }));
        assert_eq!(tg.bytes_sent, 0);
        assert_eq!(tg.pause_count, 1);

        tg.resume();
        assert!(matches!(tg.step(Nanos::ZERO), TgStep::Emit { .. }));
    }

    #[test]
    fn flow_rows_filter_to_local_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "0,1,0,0,2,100,4096").unwrap();
        writeln!(f, "1,0,0,0,1,100,4096").unwrap();
        writeln!(f, "junk,row,should,be,skipped").unwrap();
        drop(f);

        let specs = load_flows(&path).unwrap();
        assert_eq!(specs.len(), 2);

        let cfg = uniform_cfg();
        let states = flow_states(&specs, XpuId(0), &cfg);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].dest, XpuId(1));
        assert_eq!(states[0].vc, Vc(2));
    }

    #[test]
    fn trace_filters_and_maps_operations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "1000,1,0,STORE,3").unwrap();
        writeln!(f, "2000,1,0,LOAD,3").unwrap(); // wrong op
        writeln!(f, "3000,2,0,STORE,1").unwrap(); // wrong tile
        writeln!(f, "4000,2,0,STORE,3").unwrap();
        drop(f);

        let rows = load_trace(&path, "STORE", 3).unwrap();
        assert_eq!(rows.len(), 2);

        let entries = trace_entries(&rows, XpuId(0), 4);
        assert_eq!(entries[0].at, Nanos(0));
        assert_eq!(entries[1].at, Nanos(3_000));
        assert_eq!(entries[0].vc, Vc(1)); // STORE
        assert_eq!(entries[0].dest, XpuId(1));
    }

    #[test]
    fn trace_gap_drives_next_delay() {
        let cfg = SueSimConfig {
            traffic_mode: crate::config::TrafficMode::Trace,
            trace_file: "/nonexistent".into(),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        // Missing file: the generator starts empty and completes at once.
        let mut tg = TrafficGenerator::new(&cfg, XpuId(0));
        assert!(matches!(tg.step(Nanos::ZERO), TgStep::Complete));
    }
}
