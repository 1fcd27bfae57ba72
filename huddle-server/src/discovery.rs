//! LAN discovery: UDP multicast advertisements, parse peer beacons,
//! maintain a last-seen table. Browsing connects to the first discovered
//! match per advertisement; there is no ranking of candidates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use huddle_core::{ServiceAdvertisement, SERVICE_TYPE};

use crate::config::Config;

const MULTICAST_GROUP: &str = "239.255.70.70";
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

struct PeerState {
    last_seen: Instant,
}

/// Advertise this instance and browse for others; discovered peers are
/// pushed to `connect_tx` for the transport to dial.
pub async fn run_discovery(
    config: Arc<Config>,
    instance_id: Uuid,
    connect_tx: mpsc::UnboundedSender<SocketAddr>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(config.discovery_port).await?);
    let advert = ServiceAdvertisement::new(&config.service_name, instance_id, config.peer_port);
    info!(
        "advertising {} ({}) on udp port {}",
        advert.name, advert.service_type, config.discovery_port
    );

    let peers: Arc<Mutex<HashMap<Uuid, PeerState>>> = Arc::new(Mutex::new(HashMap::new()));

    let beacon_socket = socket.clone();
    let beacon_advert = advert.clone();
    let discovery_port = config.discovery_port;
    let beacon_task = tokio::spawn(async move {
        beacon_loop(beacon_socket, beacon_advert, discovery_port).await
    });

    let recv_peers = peers.clone();
    let recv_task = tokio::spawn(async move {
        recv_loop(socket, advert, recv_peers, connect_tx).await
    });

    let timeout_task = tokio::spawn(async move { peer_timeout_loop(peers).await });

    let _ = tokio::try_join!(beacon_task, recv_task, timeout_task);
    Ok(())
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let multicast: std::net::Ipv4Addr = MULTICAST_GROUP
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    std_sock.join_multicast_v4(&multicast, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    advert: ServiceAdvertisement,
    discovery_port: u16,
) -> std::io::Result<()> {
    let frame = serde_json::to_vec(&advert)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest: SocketAddr = format!("{MULTICAST_GROUP}:{discovery_port}")
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    loop {
        let _ = socket.send_to(&frame, dest).await;
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    ours: ServiceAdvertisement,
    peers: Arc<Mutex<HashMap<Uuid, PeerState>>>,
    connect_tx: mpsc::UnboundedSender<SocketAddr>,
) -> std::io::Result<()> {
    let response = serde_json::to_vec(&ours)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok(advert) = serde_json::from_slice::<ServiceAdvertisement>(&buf[..n]) else {
            continue;
        };
        if advert.instance_id == ours.instance_id || advert.service_type != SERVICE_TYPE {
            continue;
        }

        let is_new = {
            let mut p = peers.lock().await;
            let is_new = !p.contains_key(&advert.instance_id);
            p.insert(
                advert.instance_id,
                PeerState {
                    last_seen: Instant::now(),
                },
            );
            is_new
        };
        if is_new {
            let addr = SocketAddr::new(from.ip(), advert.listen_port);
            debug!(
                "discovered {} ({}) at {addr}",
                advert.name, advert.instance_id
            );
            // First match wins: dial as soon as the peer shows up.
            let _ = connect_tx.send(addr);
            // Answer directly so the beaconing side learns us without
            // waiting for our next multicast.
            let _ = socket.send_to(&response, from).await;
        }
    }
}

async fn peer_timeout_loop(peers: Arc<Mutex<HashMap<Uuid, PeerState>>>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let mut p = peers.lock().await;
        p.retain(|_, s| now.duration_since(s.last_seen) < PEER_TIMEOUT);
    }
}
