//! Server sink: per-port receiver for packed frames.
//!
//! Reads the SUE header, measures end-to-end delay from the send-timestamp
//! tag when present, and estimates the transaction count from the payload
//! length. No reply is generated.

use crate::world::Ctx;
use sue_common::XpuId;
use sue_transport::{Packet, SueHeader};
use tracing::debug;

pub struct ServerSink {
    pub xpu: XpuId,
    /// Local port index this sink listens on (UDP port `8080 + index`).
    pub port_index: u32,
    transaction_size: u32,
    pub packets_received: u64,
    pub transactions: u64,
    pub bytes_received: u64,
    pub per_vc_bytes: [u64; 4],
}

impl ServerSink {
    pub fn new(xpu: XpuId, port_index: u32, transaction_size: u32) -> Self {
        ServerSink {
            xpu,
            port_index,
            transaction_size,
            packets_received: 0,
            transactions: 0,
            bytes_received: 0,
            per_vc_bytes: [0; 4],
        }
    }

    /// Consume one packed frame (`SUE | payload`).
    pub fn handle(&mut self, mut pkt: Packet, ctx: &mut Ctx) {
        let Some(sue) = pkt.remove_header::<SueHeader>() else {
            debug!(xpu = self.xpu.0, port = self.port_index, "runt frame at server");
            return;
        };
        let payload = pkt.len() as u64;
        self.packets_received += 1;
        self.bytes_received += payload;
        self.per_vc_bytes[usize::from(sue.vc & 0x03)] += payload;
        // Each frame carries whole fixed-size transactions.
        let count = payload
            .div_ceil(u64::from(self.transaction_size.max(1)))
            .max(1);
        self.transactions += count;

        if let Some(sent) = pkt.tags.sent_at {
            let delay = ctx.now().saturating_sub(sent);
            ctx.logger
                .xpu_delay(ctx.now(), self.xpu, self.port_index, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SueSimConfig;
    use crate::logging::PerfLogger;
    use std::collections::HashMap;
    use sue_common::{EventQueue, Nanos};

    #[test]
    fn counts_transactions_and_vc_bytes() {
        let cfg = SueSimConfig::default().resolve().unwrap();
        let mut queue = EventQueue::new();
        let mut logger = PerfLogger::disabled();
        let ip_to_mac = HashMap::new();
        let mac_to_port = HashMap::new();
        let mut ctx = Ctx {
            cfg: &cfg,
            queue: &mut queue,
            logger: &mut logger,
            ip_to_mac: &ip_to_mac,
            mac_to_port: &mac_to_port,
        };

        let mut srv = ServerSink::new(XpuId(1), 0, 256);
        let mut pkt = Packet::new(7 * 256);
        pkt.add_header(&SueHeader::data(0, 1, 2));
        pkt.tags.sent_at = Some(Nanos(5));
        srv.handle(pkt, &mut ctx);

        assert_eq!(srv.packets_received, 1);
        assert_eq!(srv.transactions, 7);
        assert_eq!(srv.bytes_received, 7 * 256);
        assert_eq!(srv.per_vc_bytes[2], 7 * 256);
    }

    #[test]
    fn runt_frames_are_ignored() {
        let cfg = SueSimConfig::default().resolve().unwrap();
        let mut queue = EventQueue::new();
        let mut logger = PerfLogger::disabled();
        let ip_to_mac = HashMap::new();
        let mac_to_port = HashMap::new();
        let mut ctx = Ctx {
            cfg: &cfg,
            queue: &mut queue,
            logger: &mut logger,
            ip_to_mac: &ip_to_mac,
            mac_to_port: &mac_to_port,
        };

        let mut srv = ServerSink::new(XpuId(0), 0, 256);
        srv.handle(Packet::new(3), &mut ctx);
        assert_eq!(srv.packets_received, 0);
    }
}
