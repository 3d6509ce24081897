//! Peer discovery: on startup a node scans a configured
//! address range with a short per-address timeout, attempting
//! `get_node_info` on each responder; if a responder already knows a
//! coordinator, the scanner queries that coordinator directly and adopts
//! its view.
//!
//! Probes every address in a one-subnet sweep, collecting whichever
//! targets answer rather than requiring a static seed list.

use crate::protocol::{codec::FrameCodec, Envelope, Message, NodeDescriptor};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Generates every host address in the /24 containing `base` (excluding
/// the network and broadcast addresses), each paired with `port` — the
/// one-subnet sweep used by startup discovery.
pub fn subnet_sweep_targets(base: Ipv4Addr, port: u16) -> Vec<SocketAddr> {
    let octets = base.octets();
    (1..=254u8)
        .map(|last| {
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], last)),
                port,
            )
        })
        .collect()
}

/// Sends `get_node_info` to `addr` with a per-address timeout, returning
/// the responder's descriptor — its own, or the coordinator's it already
/// knows about, per the `get_node_info` reply contract.
pub async fn probe(
    codec: &FrameCodec,
    addr: SocketAddr,
    timeout: Duration,
) -> Option<NodeDescriptor> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        codec
            .write_message(&mut stream, &Envelope::new(0, Message::GetNodeInfo))
            .await
            .ok()?;
        let reply = codec.read_message(&mut stream, None).await.ok()?;
        match reply.message {
            Message::AnsNodeInfo(descriptor) => Some(descriptor),
            _ => None,
        }
    };
    tokio::time::timeout(timeout, attempt).await.ok().flatten()
}

/// Sweeps every address in `targets` concurrently and returns whatever
/// responded within `per_address_timeout`.
pub async fn sweep(
    codec: &FrameCodec,
    targets: &[SocketAddr],
    per_address_timeout: Duration,
) -> Vec<NodeDescriptor> {
    let probes = targets
        .iter()
        .map(|addr| probe(codec, *addr, per_address_timeout));
    futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Queries `coordinator_addr` directly for its full cluster view
/// (`get_nodes_info`) and adopts it wholesale.
pub async fn fetch_coordinator_view(
    codec: &FrameCodec,
    coordinator_addr: SocketAddr,
    timeout: Duration,
) -> Option<Vec<NodeDescriptor>> {
    let attempt = async {
        let mut stream = TcpStream::connect(coordinator_addr).await.ok()?;
        codec
            .write_message(&mut stream, &Envelope::new(0, Message::GetNodesInfo))
            .await
            .ok()?;
        let reply = codec.read_message(&mut stream, None).await.ok()?;
        match reply.message {
            Message::AnsNodesInfo(members) => Some(members),
            _ => None,
        }
    };
    tokio::time::timeout(timeout, attempt).await.ok().flatten()
}
