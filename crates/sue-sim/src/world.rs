//! Simulation world: component arenas and the event dispatch loop.
//!
//! The topology is stored as flat arenas indexed by stable ids; components
//! never hold references to each other. Every interaction between
//! components is an [`Event`] scheduled on the global queue, so all
//! mutation happens at event boundaries on a single thread.

use crate::balancer::Destination;
use crate::client;
use crate::config::Params;
use crate::host::Host;
use crate::logging::PerfLogger;
use crate::port::Port;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use sue_common::{EventQueue, Nanos, NodeId, PortId, SueId, Vc, XpuId};
use sue_transport::{Mac48, Packet};
use tracing::info;

/// One node in the topology.
pub struct Node {
    pub id: NodeId,
    pub is_switch: bool,
    pub ports: Vec<PortId>,
}

/// Everything that can be scheduled. Each variant corresponds to one of the
/// model's suspension points.
pub enum Event {
    // ─── Link layer ─────────────────────────────────────────────────────
    /// Re-evaluate a port's transmit arbitration.
    TryTransmit(PortId),
    /// A frame finished serializing; the port returns to READY.
    TransmitComplete(PortId),
    /// A frame reaches the far end of the channel.
    FrameArrive(PortId, Packet),
    /// The head of a port's processing queue finished deserialization.
    CompleteProcessing(PortId),
    /// Delayed enqueue into a port's VC queues (switch handoff, internal
    /// ACK/NACK routing).
    EnqueueToVc(PortId, Packet),
    /// A built credit-update frame leaves the credit manager.
    SendCredit {
        port: PortId,
        frame: Packet,
        target: Mac48,
    },
    /// A built ACK/NACK frame enters the port's send path.
    SendControl {
        port: PortId,
        frame: Packet,
        protocol: u16,
    },
    /// LLR ACK processing after its configured delay.
    ProcessAck(PortId, Packet),
    /// LLR NACK processing after its configured delay.
    ProcessNack(PortId, Packet),
    /// LLR retransmit timer expiry for one (peer, VC).
    LlrResend {
        port: PortId,
        peer: Mac48,
        vc: Vc,
    },
    /// Hand a received payload from an XPU port up to the host.
    DeliverUp(PortId, Packet),

    // ─── Host layer ─────────────────────────────────────────────────────
    /// Start one XPU's traffic generator and SUE schedulers.
    StartClient(XpuId),
    /// Force one XPU's generator to stop offering new transactions.
    StopClient(XpuId),
    /// One SUE engine's scheduling-interval tick.
    SueSchedule { xpu: XpuId, sue: SueId },
    /// A packed burst leaves a SUE after its packing delay.
    SueSendBurst {
        xpu: XpuId,
        sue: SueId,
        dest: Destination,
        frame: Packet,
        port: PortId,
        transactions: u32,
    },
    /// Traffic generator tick.
    TgEmit(XpuId),
    /// Periodic flush of buffered client statistics.
    FlushClientStats(XpuId),
}

/// Shared context handed to component methods: everything a component may
/// touch besides its own state.
pub struct Ctx<'a> {
    pub cfg: &'a Params,
    pub queue: &'a mut EventQueue<Event>,
    pub logger: &'a mut PerfLogger,
    pub ip_to_mac: &'a HashMap<Ipv4Addr, Mac48>,
    pub mac_to_port: &'a HashMap<Mac48, PortId>,
}

impl Ctx<'_> {
    #[inline]
    pub fn now(&self) -> Nanos {
        self.queue.now()
    }
}

/// End-of-run accounting, aggregated over all hosts and ports.
#[derive(Debug, Default, Clone)]
pub struct Summary {
    /// Application bytes produced by all traffic generators.
    pub offered_bytes: u64,
    /// Application bytes that left SUE clients in packed frames.
    pub client_bytes_sent: u64,
    /// Application bytes received by all server sinks.
    pub delivered_bytes: u64,
    /// Transactions counted by the server sinks.
    pub delivered_transactions: u64,
    /// Packed frames received by the server sinks.
    pub delivered_packets: u64,
    /// Per-VC application bytes sent by clients.
    pub per_vc_sent: [u64; 4],
    /// Per-VC application bytes received by servers.
    pub per_vc_delivered: [u64; 4],
    /// All recorded drops, any reason.
    pub total_drops: u64,
    /// Error-model drops.
    pub phy_rx_drops: u64,
    /// Largest load-balancer buffer depth observed on any XPU.
    pub peak_buffered: usize,
    /// Traffic-generator pause transitions across all XPUs.
    pub pause_events: u64,
    /// SUE selections recorded by the load balancers.
    pub lb_selections: u64,
}

pub struct World {
    pub cfg: Params,
    pub queue: EventQueue<Event>,
    pub nodes: Vec<Node>,
    pub ports: Vec<Port>,
    pub hosts: Vec<Host>,
    pub ip_to_mac: HashMap<Ipv4Addr, Mac48>,
    pub mac_to_port: HashMap<Mac48, PortId>,
    pub logger: PerfLogger,
}

impl World {
    /// Schedule application start/stop per the timing configuration.
    pub fn start_apps(&mut self) {
        for x in 0..self.cfg.n_xpus {
            let start = self.cfg.client_start
                + Nanos(self.cfg.thread_start_interval.as_nanos() * u64::from(x));
            self.queue.schedule_at(start, Event::StartClient(XpuId(x)));
            if self.cfg.client_stop > start {
                self.queue
                    .schedule_at(self.cfg.client_stop, Event::StopClient(XpuId(x)));
            }
        }
    }

    /// Run until the event queue drains or simulated time passes the
    /// configured horizon, then flush sinks and aggregate the summary.
    pub fn run(&mut self) -> Summary {
        let horizon = self.cfg.simulation_time;
        while let Some((t, ev)) = self.queue.pop() {
            if t > horizon {
                break;
            }
            self.dispatch(ev);
        }
        let summary = self.summarize();
        let _ = self.logger.flush();
        summary
    }

    fn summarize(&self) -> Summary {
        let mut s = Summary::default();
        for host in &self.hosts {
            s.offered_bytes += host.traffic.bytes_sent;
            s.pause_events += host.traffic.pause_count;
            s.peak_buffered = s.peak_buffered.max(host.balancer.peak_buffered);
            s.lb_selections += host.balancer.selections;
            for sue in &host.sues {
                s.client_bytes_sent += sue.bytes_sent;
                for vc in 0..4 {
                    s.per_vc_sent[vc] += sue.per_vc_bytes[vc];
                }
            }
            for srv in &host.servers {
                s.delivered_bytes += srv.bytes_received;
                s.delivered_transactions += srv.transactions;
                s.delivered_packets += srv.packets_received;
                for vc in 0..4 {
                    s.per_vc_delivered[vc] += srv.per_vc_bytes[vc];
                }
            }
        }
        s.total_drops = self.logger.total_drops();
        s.phy_rx_drops = self
            .logger
            .drop_count(crate::logging::DropReason::PhyRxDrop);
        s
    }

    /// Log the end-of-run summary lines.
    pub fn report(&self, summary: &Summary) {
        for host in &self.hosts {
            let sent: u64 = host.sues.iter().map(|s| s.packets_sent).sum();
            info!(
                xpu = host.xpu.0,
                packets_sent = sent,
                generated_bytes = host.traffic.bytes_sent,
                "client summary"
            );
            for srv in &host.servers {
                info!(
                    xpu = host.xpu.0,
                    port = srv.port_index,
                    packets = srv.packets_received,
                    transactions = srv.transactions,
                    "server summary"
                );
            }
        }
        info!(
            offered = summary.offered_bytes,
            delivered = summary.delivered_bytes,
            drops = summary.total_drops,
            "simulation complete"
        );
    }

    pub fn dispatch(&mut self, ev: Event) {
        let World {
            cfg,
            queue,
            ports,
            hosts,
            logger,
            ip_to_mac,
            mac_to_port,
            ..
        } = self;
        let mut ctx = Ctx {
            cfg,
            queue: &mut *queue,
            logger: &mut *logger,
            ip_to_mac,
            mac_to_port,
        };

        let mut tg_completed = false;
        match ev {
            Event::TryTransmit(p) => ports[p.index()].on_try_transmit(&mut ctx),
            Event::TransmitComplete(p) => ports[p.index()].transmit_complete(&mut ctx),
            Event::FrameArrive(p, pkt) => ports[p.index()].receive(pkt, &mut ctx),
            Event::CompleteProcessing(p) => ports[p.index()].complete_processing(&mut ctx),
            Event::EnqueueToVc(p, pkt) => {
                ports[p.index()].enqueue_to_vc(pkt, &mut ctx);
            }
            Event::SendCredit {
                port,
                frame,
                target,
            } => ports[port.index()].send_credit_frame(frame, target, &mut ctx),
            Event::SendControl {
                port,
                frame,
                protocol,
            } => {
                ports[port.index()].send(frame, protocol, &mut ctx);
            }
            Event::ProcessAck(p, pkt) => ports[p.index()].process_llr_ack(pkt, &mut ctx),
            Event::ProcessNack(p, pkt) => ports[p.index()].process_llr_nack(pkt, &mut ctx),
            Event::LlrResend { port, peer, vc } => {
                ports[port.index()].llr_resend_timer(peer, vc, &mut ctx)
            }
            Event::DeliverUp(p, pkt) => {
                if let Some(xpu) = ports[p.index()].xpu {
                    hosts[xpu.index()].deliver(pkt, &mut ctx);
                }
            }

            Event::StartClient(x) => hosts[x.index()].start(&mut ctx),
            Event::StopClient(x) => hosts[x.index()].traffic.force_complete(),
            Event::SueSchedule { xpu, sue } => {
                client::sue_schedule(hosts, ports, xpu, sue, &mut ctx)
            }
            Event::SueSendBurst {
                xpu,
                sue,
                dest,
                frame,
                port,
                transactions,
            } => client::sue_send_burst(
                hosts,
                ports,
                xpu,
                sue,
                dest,
                frame,
                port,
                transactions,
                &mut ctx,
            ),
            Event::TgEmit(x) => {
                tg_completed = hosts[x.index()].tg_tick(&mut ctx);
            }
            Event::FlushClientStats(x) => hosts[x.index()].flush_client_stats(&mut ctx),
        }
        drop(ctx);

        if tg_completed && hosts.iter().all(|h| h.traffic.complete) {
            // Last generator done: stop accumulating link statistics.
            logger.stop_link_stats();
        }
    }
}
