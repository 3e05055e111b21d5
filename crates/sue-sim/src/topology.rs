//! Topology construction.
//!
//! One switch connects every XPU port: XPU `i` port `p` attaches to switch
//! port `i * portsPerXpu + p`. MACs are assigned sequentially, IPs follow
//! the `10.(xpu+1).(port+1).0/30` plan with the XPU side at `.1` and the
//! switch side at `.2`, and the process-wide IP to MAC map is built here
//! once and never mutated afterwards.

use crate::balancer::LoadBalancer;
use crate::client::SueClient;
use crate::config::Params;
use crate::host::Host;
use crate::logging::PerfLogger;
use crate::port::Port;
use crate::server::ServerSink;
use crate::switch::build_forwarding_table;
use crate::traffic::TrafficGenerator;
use crate::world::{Node, World};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use sue_common::{EventQueue, NodeId, PortId, PortKind, SueId, XpuId};
use sue_transport::Mac48;
use tracing::info;

/// Build the full world for a configuration.
pub fn build(cfg: Params, logger: PerfLogger) -> World {
    let n = cfg.n_xpus;
    let ppx = cfg.ports_per_xpu;
    let total_xpu_ports = n * ppx;
    let switch_node = NodeId(n);

    let mut ports = Vec::with_capacity((total_xpu_ports * 2) as usize);
    let mut ip_to_mac = HashMap::new();
    let mut mac_to_port = HashMap::new();

    // XPU-side ports first: global id = xpu * portsPerXpu + port.
    for x in 0..n {
        for p in 0..ppx {
            let id = PortId(x * ppx + p);
            let mac = Mac48::from_index(id.0);
            let ip = Ipv4Addr::new(10, (x + 1) as u8, (p + 1) as u8, 1);
            ip_to_mac.insert(ip, mac);
            mac_to_port.insert(mac, id);
            ports.push(Port::new(
                &cfg,
                id,
                NodeId(x),
                PortKind::Xpu,
                Some(XpuId(x)),
                p,
                mac,
                ip,
            ));
        }
    }

    // Switch-side ports mirror the XPU ports one-to-one.
    for i in 0..total_xpu_ports {
        let id = PortId(total_xpu_ports + i);
        let mac = Mac48::from_index(id.0);
        let x = i / ppx;
        let p = i % ppx;
        let ip = Ipv4Addr::new(10, (x + 1) as u8, (p + 1) as u8, 2);
        ip_to_mac.insert(ip, mac);
        mac_to_port.insert(mac, id);
        ports.push(Port::new(
            &cfg,
            id,
            switch_node,
            PortKind::Switch,
            None,
            i,
            mac,
            ip,
        ));
    }

    // Wire each XPU port to its switch port and seed link credits: host
    // ports use the configured initial value, switch ports the (larger)
    // switch default.
    for i in 0..total_xpu_ports as usize {
        let sw = total_xpu_ports as usize + i;
        let xpu_mac = ports[i].mac;
        let sw_mac = ports[sw].mac;
        ports[i].connect(PortId(sw as u32), sw_mac);
        ports[sw].connect(PortId(i as u32), xpu_mac);
        ports[i].cbfc.add_peer(sw_mac, cfg.link_credits);
        ports[sw].cbfc.add_peer(xpu_mac, cfg.switch_credits);
    }

    // Forwarding: destination XPU-port MAC selects the switch port it is
    // attached to. Shared read-only by every switch port, along with the
    // sibling set and internal credit views.
    let entries: Vec<(Mac48, PortId, Mac48)> = (0..total_xpu_ports as usize)
        .map(|i| {
            let sw = PortId((total_xpu_ports as usize + i) as u32);
            (ports[i].mac, sw, ports[sw.index()].mac)
        })
        .collect();
    let table = build_forwarding_table(entries);
    let sibling_macs: Vec<Mac48> = (total_xpu_ports as usize..2 * total_xpu_ports as usize)
        .map(|i| ports[i].mac)
        .collect();
    for i in total_xpu_ports as usize..2 * total_xpu_ports as usize {
        let my_mac = ports[i].mac;
        ports[i].forwarding = Some(table.clone());
        for &m in &sibling_macs {
            if m != my_mac {
                ports[i].sibling_macs.insert(m);
                ports[i].cbfc.add_peer(m, cfg.switch_credits);
            }
        }
    }

    let mut nodes: Vec<Node> = (0..n)
        .map(|x| Node {
            id: NodeId(x),
            is_switch: false,
            ports: (x * ppx..(x + 1) * ppx).map(PortId).collect(),
        })
        .collect();
    nodes.push(Node {
        id: switch_node,
        is_switch: true,
        ports: (total_xpu_ports..2 * total_xpu_ports).map(PortId).collect(),
    });

    // Hosts: SUE engines own consecutive port groups of portsPerSue.
    let hosts = (0..n)
        .map(|x| {
            let sues = (0..cfg.sues_per_xpu)
                .map(|s| {
                    let owned: Vec<PortId> = (0..cfg.ports_per_sue)
                        .map(|k| PortId(x * ppx + s * cfg.ports_per_sue + k))
                        .collect();
                    SueClient::new(&cfg, XpuId(x), SueId(s), owned)
                })
                .collect();
            let servers = (0..ppx)
                .map(|p| ServerSink::new(XpuId(x), p, cfg.transaction_size))
                .collect();
            Host {
                xpu: XpuId(x),
                node: NodeId(x),
                balancer: LoadBalancer::new(&cfg, XpuId(x)),
                sues,
                traffic: TrafficGenerator::new(&cfg, XpuId(x)),
                servers,
            }
        })
        .collect();

    info!(
        xpus = n,
        ports_per_xpu = ppx,
        sues_per_xpu = cfg.sues_per_xpu,
        "topology built"
    );

    World {
        cfg,
        queue: EventQueue::new(),
        nodes,
        ports,
        hosts,
        ip_to_mac,
        mac_to_port,
        logger,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SueSimConfig;

    fn world() -> World {
        let cfg = SueSimConfig {
            n_xpus: 2,
            ports_per_xpu: 2,
            ports_per_sue: 2,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        build(cfg, PerfLogger::disabled())
    }

    #[test]
    fn port_counts_and_kinds() {
        let w = world();
        assert_eq!(w.ports.len(), 8); // 4 XPU + 4 switch
        assert_eq!(w.nodes.len(), 3);
        assert!(w.nodes[2].is_switch);
        assert!(w.ports[0..4].iter().all(|p| p.kind == PortKind::Xpu));
        assert!(w.ports[4..8].iter().all(|p| p.kind == PortKind::Switch));
    }

    #[test]
    fn links_are_symmetric() {
        let w = world();
        for p in &w.ports {
            let peer = &w.ports[p.peer_port.index()];
            assert_eq!(peer.peer_port, p.id);
            assert_eq!(peer.peer_mac, p.mac);
        }
    }

    #[test]
    fn ip_plan_matches_addressing_scheme() {
        let w = world();
        // XPU 1, port 0 lives at 10.2.1.1.
        let mac = w.ip_to_mac[&Ipv4Addr::new(10, 2, 1, 1)];
        let pid = w.mac_to_port[&mac];
        assert_eq!(w.ports[pid.index()].xpu, Some(XpuId(1)));
        assert_eq!(w.ports[pid.index()].local_index, 0);
    }

    #[test]
    fn forwarding_covers_every_xpu_port() {
        let w = world();
        let table = w.ports[4].forwarding.as_ref().unwrap();
        assert_eq!(table.len(), 4);
        for xpu_port in &w.ports[0..4] {
            let route = &table[&xpu_port.mac];
            // The egress is the switch port wired to that XPU port.
            assert_eq!(route.egress, xpu_port.peer_port);
        }
    }

    #[test]
    fn sues_partition_the_ports() {
        let w = world();
        let host = &w.hosts[0];
        assert_eq!(host.sues.len(), 1); // 2 ports / 2 per SUE
        assert_eq!(host.sues[0].ports, vec![PortId(0), PortId(1)]);
        assert_eq!(host.servers.len(), 2);
    }
}
