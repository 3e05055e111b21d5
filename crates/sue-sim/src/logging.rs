//! Performance event sinks.
//!
//! Twelve append-only CSV files, one per sink, created under
//! `<outputDir>/<sink>/<sink>.csv`. Rows are written at the moment of the
//! event from the single-threaded simulation loop and flushed at teardown.
//!
//! Two gates: the global `StatLoggingEnabled` switch (no files are even
//! created when off) and a runtime link-statistics gate that traffic
//! completion flips off so drained runs stop accumulating rows.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;
use sue_common::{Nanos, NodeId, SueId, Vc, XpuId};
use sue_transport::Mac48;

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    VcQueueFull,
    MainQueueFull,
    ProcessingQueueFull,
    DestQueueFull,
    PhyRxDrop,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::VcQueueFull => "VCQueueFull",
            DropReason::MainQueueFull => "MainQueueFull",
            DropReason::ProcessingQueueFull => "ProcessingQueueFull",
            DropReason::DestQueueFull => "DestQueueFull",
            DropReason::PhyRxDrop => "PhyRxDrop",
        };
        f.write_str(s)
    }
}

/// Packet direction for the per-frame sink.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Tx => "Tx",
            Direction::Rx => "Rx",
        })
    }
}

type Sink = csv::Writer<BufWriter<File>>;

struct Writers {
    performance: Sink,
    link_credit: Sink,
    vc_queue: Sink,
    main_queue: Sink,
    processing_queue: Sink,
    destination_queue: Sink,
    sue_buffer_queue: Sink,
    xpu_delay: Sink,
    drop: Sink,
    load_balance: Sink,
    wait_time: Sink,
    pack_num: Sink,
}

fn open_sink(base: &Path, name: &str, header: &[&str]) -> io::Result<Sink> {
    let dir = base.join(name);
    fs::create_dir_all(&dir)?;
    let file = File::create(dir.join(format!("{name}.csv")))?;
    let mut w = csv::Writer::from_writer(BufWriter::new(file));
    w.write_record(header)?;
    Ok(w)
}

impl Writers {
    fn open(base: &Path) -> io::Result<Self> {
        Ok(Writers {
            performance: open_sink(
                base,
                "performance_logs",
                &["Time", "NodeId", "DeviceId", "VCId", "Direction", "DataSize"],
            )?,
            link_credit: open_sink(
                base,
                "link_credit_logs",
                &["TimeNs", "NodeId", "DeviceId", "VCId", "Direction", "Credits", "MacAddress"],
            )?,
            vc_queue: open_sink(
                base,
                "vc_queue_logs",
                &["TimeNs", "NodeId", "DeviceId", "VCId", "CurrentSize", "MaxSize", "Utilization"],
            )?,
            main_queue: open_sink(
                base,
                "main_queue_logs",
                &["TimeNs", "NodeId", "DeviceId", "CurrentSize", "MaxSize", "Utilization"],
            )?,
            processing_queue: open_sink(
                base,
                "processing_queue_logs",
                &["TimeNs", "NodeId", "DeviceId", "QueueLength", "MaxSize", "Utilization"],
            )?,
            destination_queue: open_sink(
                base,
                "destination_queue_logs",
                &["TimeNs", "XpuId", "SueId", "DestXpuId", "VcId", "CurrentSize", "MaxSize", "Utilization"],
            )?,
            sue_buffer_queue: open_sink(base, "sue_buffer_queue_logs", &["TimeNs", "XpuId", "BufferSize"])?,
            xpu_delay: open_sink(base, "xpu_delay_logs", &["TimeNs", "XpuId", "PortId", "Delay(ns)"])?,
            drop: open_sink(
                base,
                "drop_logs",
                &["TimeNs", "NodeId", "DeviceId", "VCId", "DropReason", "PacketSize"],
            )?,
            load_balance: open_sink(
                base,
                "load_balance_logs",
                &["LocalXpuId", "DestXpuId", "VcId", "SueId"],
            )?,
            wait_time: open_sink(base, "wait_time_logs", &["XpuId", "WaitTime(ns)"])?,
            pack_num: open_sink(base, "pack_num_logs", &["XpuId", "PackNums"])?,
        })
    }
}

/// Owned collection of the CSV event sinks.
pub struct PerfLogger {
    writers: Option<Writers>,
    link_stats_enabled: bool,
    drop_counts: HashMap<DropReason, u64>,
}

impl PerfLogger {
    /// Create the sinks under `base`, or a disabled logger when statistics
    /// are off.
    pub fn new(base: &Path, enabled: bool) -> io::Result<Self> {
        let writers = if enabled {
            Some(Writers::open(base)?)
        } else {
            None
        };
        Ok(PerfLogger {
            writers,
            link_stats_enabled: true,
            drop_counts: HashMap::new(),
        })
    }

    /// A logger that records drop counters but writes no files.
    pub fn disabled() -> Self {
        PerfLogger {
            writers: None,
            link_stats_enabled: true,
            drop_counts: HashMap::new(),
        }
    }

    /// Stop emitting link-level statistics rows (traffic complete).
    pub fn stop_link_stats(&mut self) {
        self.link_stats_enabled = false;
    }

    pub fn link_stats_enabled(&self) -> bool {
        self.link_stats_enabled
    }

    pub fn drop_count(&self, reason: DropReason) -> u64 {
        self.drop_counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_drops(&self) -> u64 {
        self.drop_counts.values().sum()
    }

    fn util(cur: u32, max: u32) -> String {
        if max == 0 {
            "0.000".into()
        } else {
            format!("{:.3}", f64::from(cur) / f64::from(max))
        }
    }

    // ─── Link-layer sinks ───────────────────────────────────────────────

    pub fn packet(
        &mut self,
        t: Nanos,
        node: NodeId,
        dev: u32,
        vc: Option<Vc>,
        dir: Direction,
        size: usize,
    ) {
        if !self.link_stats_enabled {
            return;
        }
        if let Some(w) = &mut self.writers {
            let vc = vc.map(|v| v.0.to_string()).unwrap_or_default();
            let _ = w.performance.write_record([
                t.as_nanos().to_string(),
                node.0.to_string(),
                dev.to_string(),
                vc,
                dir.to_string(),
                size.to_string(),
            ]);
        }
    }

    pub fn credit_change(
        &mut self,
        t: Nanos,
        node: NodeId,
        dev: u32,
        vc: Vc,
        dir: Direction,
        credits: u32,
        mac: Mac48,
    ) {
        if !self.link_stats_enabled {
            return;
        }
        if let Some(w) = &mut self.writers {
            let _ = w.link_credit.write_record([
                t.as_nanos().to_string(),
                node.0.to_string(),
                dev.to_string(),
                vc.0.to_string(),
                dir.to_string(),
                credits.to_string(),
                mac.to_string(),
            ]);
        }
    }

    pub fn vc_queue(&mut self, t: Nanos, node: NodeId, dev: u32, vc: Vc, cur: u32, max: u32) {
        if !self.link_stats_enabled {
            return;
        }
        if let Some(w) = &mut self.writers {
            let _ = w.vc_queue.write_record([
                t.as_nanos().to_string(),
                node.0.to_string(),
                dev.to_string(),
                vc.0.to_string(),
                cur.to_string(),
                max.to_string(),
                Self::util(cur, max),
            ]);
        }
    }

    pub fn main_queue(&mut self, t: Nanos, node: NodeId, dev: u32, cur: u32, max: u32) {
        if !self.link_stats_enabled {
            return;
        }
        if let Some(w) = &mut self.writers {
            let _ = w.main_queue.write_record([
                t.as_nanos().to_string(),
                node.0.to_string(),
                dev.to_string(),
                cur.to_string(),
                max.to_string(),
                Self::util(cur, max),
            ]);
        }
    }

    pub fn processing_queue(&mut self, t: Nanos, node: NodeId, dev: u32, cur: u32, max: u32) {
        if !self.link_stats_enabled {
            return;
        }
        if let Some(w) = &mut self.writers {
            let _ = w.processing_queue.write_record([
                t.as_nanos().to_string(),
                node.0.to_string(),
                dev.to_string(),
                cur.to_string(),
                max.to_string(),
                Self::util(cur, max),
            ]);
        }
    }

    pub fn drop(
        &mut self,
        t: Nanos,
        node: NodeId,
        dev: u32,
        vc: Option<Vc>,
        reason: DropReason,
        size: usize,
    ) {
        *self.drop_counts.entry(reason).or_insert(0) += 1;
        if let Some(w) = &mut self.writers {
            let vc = vc.map(|v| v.0.to_string()).unwrap_or_default();
            let _ = w.drop.write_record([
                t.as_nanos().to_string(),
                node.0.to_string(),
                dev.to_string(),
                vc,
                reason.to_string(),
                size.to_string(),
            ]);
        }
    }

    // ─── Host-layer sinks ───────────────────────────────────────────────

    pub fn destination_queue(
        &mut self,
        t: Nanos,
        xpu: XpuId,
        sue: SueId,
        dest: XpuId,
        vc: Vc,
        cur: u32,
        max: u32,
    ) {
        if let Some(w) = &mut self.writers {
            let _ = w.destination_queue.write_record([
                t.as_nanos().to_string(),
                xpu.0.to_string(),
                sue.0.to_string(),
                dest.0.to_string(),
                vc.0.to_string(),
                cur.to_string(),
                max.to_string(),
                Self::util(cur, max),
            ]);
        }
    }

    pub fn buffer_queue(&mut self, t: Nanos, xpu: XpuId, size: usize) {
        if let Some(w) = &mut self.writers {
            let _ = w.sue_buffer_queue.write_record([
                t.as_nanos().to_string(),
                xpu.0.to_string(),
                size.to_string(),
            ]);
        }
    }

    pub fn xpu_delay(&mut self, t: Nanos, xpu: XpuId, port: u32, delay: Nanos) {
        if let Some(w) = &mut self.writers {
            let _ = w.xpu_delay.write_record([
                t.as_nanos().to_string(),
                xpu.0.to_string(),
                port.to_string(),
                delay.as_nanos().to_string(),
            ]);
        }
    }

    pub fn load_balance(&mut self, local: XpuId, dest: XpuId, vc: Vc, sue: SueId) {
        if let Some(w) = &mut self.writers {
            let _ = w.load_balance.write_record([
                local.0.to_string(),
                dest.0.to_string(),
                vc.0.to_string(),
                sue.0.to_string(),
            ]);
        }
    }

    pub fn wait_time(&mut self, xpu: XpuId, wait: Nanos) {
        if let Some(w) = &mut self.writers {
            let _ = w
                .wait_time
                .write_record([xpu.0.to_string(), wait.as_nanos().to_string()]);
        }
    }

    pub fn pack_num(&mut self, xpu: XpuId, packs: usize) {
        if let Some(w) = &mut self.writers {
            let _ = w
                .pack_num
                .write_record([xpu.0.to_string(), packs.to_string()]);
        }
    }

    /// Flush every sink to disk.
    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(w) = &mut self.writers {
            w.performance.flush()?;
            w.link_credit.flush()?;
            w.vc_queue.flush()?;
            w.main_queue.flush()?;
            w.processing_queue.flush()?;
            w.destination_queue.flush()?;
            w.sue_buffer_queue.flush()?;
            w.xpu_delay.flush()?;
            w.drop.flush()?;
            w.load_balance.flush()?;
            w.wait_time.flush()?;
            w.pack_num.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logger_still_counts_drops() {
        let mut l = PerfLogger::disabled();
        l.drop(Nanos(1), NodeId(0), 0, Some(Vc(0)), DropReason::VcQueueFull, 64);
        l.drop(Nanos(2), NodeId(0), 0, None, DropReason::PhyRxDrop, 64);
        assert_eq!(l.drop_count(DropReason::VcQueueFull), 1);
        assert_eq!(l.total_drops(), 2);
    }

    #[test]
    fn sinks_are_created_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = PerfLogger::new(dir.path(), true).unwrap();
        l.packet(Nanos(5), NodeId(1), 0, Some(Vc(2)), Direction::Tx, 1500);
        l.flush().unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("performance_logs/performance_logs.csv"))
                .unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Time,NodeId,DeviceId,VCId,Direction,DataSize"
        );
        assert_eq!(lines.next().unwrap(), "5,1,0,2,Tx,1500");
    }

    #[test]
    fn link_stats_gate_silences_link_sinks_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = PerfLogger::new(dir.path(), true).unwrap();
        l.stop_link_stats();
        l.packet(Nanos(1), NodeId(0), 0, None, Direction::Rx, 10);
        l.xpu_delay(Nanos(1), XpuId(0), 1, Nanos(123));
        l.flush().unwrap();

        let perf =
            std::fs::read_to_string(dir.path().join("performance_logs/performance_logs.csv"))
                .unwrap();
        assert_eq!(perf.lines().count(), 1, "header only");
        let delay =
            std::fs::read_to_string(dir.path().join("xpu_delay_logs/xpu_delay_logs.csv")).unwrap();
        assert_eq!(delay.lines().count(), 2, "header plus one row");
    }
}
