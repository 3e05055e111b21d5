//! Per-XPU host: traffic generator, load balancer, SUE engines, and the
//! server sinks, wired together by the distribute / notify cycle.

use crate::balancer::{Destination, LoadBalancer};
use crate::client::SueClient;
use crate::server::ServerSink;
use crate::traffic::{TgStep, TrafficGenerator};
use crate::world::{Ctx, Event};
use sue_common::{Nanos, NodeId, SueId, Vc, XpuId};
use sue_transport::{Ipv4Header, Packet, UdpHeader};
use tracing::{debug, info};

pub struct Host {
    pub xpu: XpuId,
    pub node: NodeId,
    pub balancer: LoadBalancer,
    pub sues: Vec<SueClient>,
    pub traffic: TrafficGenerator,
    pub servers: Vec<ServerSink>,
}

impl Host {
    /// Client application start: first generator tick, the per-SUE
    /// schedulers, and the statistics flush cycle.
    pub fn start(&mut self, ctx: &mut Ctx) {
        info!(xpu = self.xpu.0, "client starting");
        ctx.queue.schedule(Nanos::ZERO, Event::TgEmit(self.xpu));
        for (i, sue) in self.sues.iter_mut().enumerate() {
            sue.scheduler_running = true;
            ctx.queue.schedule(
                ctx.cfg.scheduling_interval,
                Event::SueSchedule {
                    xpu: self.xpu,
                    sue: SueId(i as u32),
                },
            );
        }
        ctx.queue.schedule(
            ctx.cfg.client_stat_interval,
            Event::FlushClientStats(self.xpu),
        );
    }

    /// One traffic-generator tick. Returns true when the generator just
    /// finished its offered volume.
    pub fn tg_tick(&mut self, ctx: &mut Ctx) -> bool {
        match self.traffic.step(ctx.now()) {
            TgStep::Complete => {
                info!(
                    xpu = self.xpu.0,
                    generated = self.traffic.bytes_sent,
                    "traffic generation complete"
                );
                for sue in &mut self.sues {
                    sue.logging_enabled = false;
                }
                true
            }
            TgStep::Idle { next } => {
                ctx.queue.schedule(next, Event::TgEmit(self.xpu));
                false
            }
            TgStep::Emit {
                pkt,
                dest,
                vc,
                next,
            } => {
                ctx.queue.schedule(next, Event::TgEmit(self.xpu));
                self.distribute(pkt, dest, vc, ctx);
                false
            }
        }
    }

    /// Steer one transaction to a SUE engine, or buffer it (pausing the
    /// generator) when every destination queue is full.
    pub fn distribute(&mut self, pkt: Packet, dest_xpu: XpuId, vc: Vc, ctx: &mut Ctx) {
        let mut dest_xpu = dest_xpu;
        if dest_xpu == self.xpu {
            dest_xpu = self.balancer.random_dest();
        }
        let dest = Destination { xpu: dest_xpu, vc };
        let size = pkt.len() as u32;
        let n = self.sues.len();

        let primary = self.balancer.select_sue(dest_xpu, vc, n);
        let chosen = if self.sues[primary].can_accept(dest, size) {
            Some(primary)
        } else {
            (0..n).find(|&i| self.sues[i].can_accept(dest, size))
        };

        match chosen {
            Some(i) => {
                self.balancer.selections += 1;
                ctx.logger
                    .load_balance(self.xpu, dest_xpu, vc, SueId(i as u32));
                self.sues[i].add_transaction(ctx.now(), pkt, dest, ctx);
            }
            None => {
                self.balancer.buffer.push_back((pkt, dest));
                self.balancer.peak_buffered =
                    self.balancer.peak_buffered.max(self.balancer.buffer.len());
                ctx.logger
                    .buffer_queue(ctx.now(), self.xpu, self.balancer.buffer.len());
                if self.balancer.buffer.len() == 1 && !self.balancer.paused {
                    self.balancer.paused = true;
                    self.traffic.pause();
                }
            }
        }
    }

    /// Destination-queue space opened up: drain the buffer front-to-back
    /// and resume the generator once it is empty.
    pub fn notify_space_available(&mut self, ctx: &mut Ctx) {
        loop {
            let Some((size, dest)) = self
                .balancer
                .buffer
                .front()
                .map(|(p, d)| (p.len() as u32, *d))
            else {
                break;
            };
            let n = self.sues.len();
            let primary = self.balancer.select_sue(dest.xpu, dest.vc, n);
            let chosen = if self.sues[primary].can_accept(dest, size) {
                Some(primary)
            } else {
                (0..n).find(|&i| self.sues[i].can_accept(dest, size))
            };
            let Some(i) = chosen else {
                break;
            };
            let Some((pkt, dest)) = self.balancer.buffer.pop_front() else {
                break;
            };
            self.balancer.selections += 1;
            ctx.logger
                .load_balance(self.xpu, dest.xpu, dest.vc, SueId(i as u32));
            ctx.logger
                .buffer_queue(ctx.now(), self.xpu, self.balancer.buffer.len());
            self.sues[i].add_transaction(ctx.now(), pkt, dest, ctx);
        }

        if self.balancer.buffer.is_empty() && self.balancer.paused {
            self.balancer.paused = false;
            self.traffic.resume();
        }
    }

    /// A payload arrived from the link layer: demultiplex to the server
    /// sink by UDP destination port.
    pub fn deliver(&mut self, mut pkt: Packet, ctx: &mut Ctx) {
        let Some(_ip) = pkt.remove_header::<Ipv4Header>() else {
            return;
        };
        let Some(udp) = pkt.remove_header::<UdpHeader>() else {
            return;
        };
        let Some(idx) = (udp.dst_port as usize).checked_sub(8080) else {
            debug!(xpu = self.xpu.0, port = udp.dst_port, "no listener on port");
            return;
        };
        if let Some(server) = self.servers.get_mut(idx) {
            server.handle(pkt, ctx);
        } else {
            debug!(xpu = self.xpu.0, port = udp.dst_port, "no listener on port");
        }
    }

    /// Periodic flush of buffered packing statistics.
    pub fn flush_client_stats(&mut self, ctx: &mut Ctx) {
        let xpu = self.xpu;
        for sue in &mut self.sues {
            let (delays, counts) = sue.take_pack_stats();
            for d in delays {
                ctx.logger.wait_time(xpu, Nanos(d));
            }
            for c in counts {
                ctx.logger.pack_num(xpu, c);
            }
        }
        if !self.traffic.complete {
            ctx.queue
                .schedule(ctx.cfg.client_stat_interval, Event::FlushClientStats(xpu));
        }
    }
}
