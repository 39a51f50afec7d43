//! LAN provider routing: UDP multicast beacons carrying the keys each node provides.
//!
//! Every node multicasts its peer id, stream port and provided keys on an interval and
//! answers a newly seen peer directly. Peers not heard from for four intervals are dropped.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use peershare_core::transport::{ContentRouting, ProviderRecord};
use peershare_core::PeerId;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::transport::AddressBook;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_MAGIC: [u8; 4] = *b"PSHR";
const BEACON_VERSION: u8 = 1;
/// Keys per datagram; larger sets are split over several beacons.
const KEYS_PER_BEACON: usize = 256;
const EXPIRY_FACTOR: u32 = 4;
const LOOKUP_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    magic: [u8; 4],
    version: u8,
    peer: PeerId,
    listen_port: u16,
    /// Set on beacons sent in answer to a newly seen peer; those are not answered again.
    reply: bool,
    keys: Vec<Vec<u8>>,
}

type PeerTable = Arc<Mutex<HashMap<PeerId, PeerState>>>;

struct PeerState {
    addr: SocketAddr,
    keys: HashSet<Vec<u8>>,
    last_seen: Instant,
}

pub struct LanRouting {
    local: PeerId,
    listen_port: u16,
    interval: Duration,
    book: AddressBook,
    peers: PeerTable,
    provided: Mutex<BTreeSet<Vec<u8>>>,
}

impl LanRouting {
    pub fn new(local: PeerId, listen_port: u16, interval: Duration, book: AddressBook) -> Self {
        Self {
            local,
            listen_port,
            interval,
            book,
            peers: Arc::new(Mutex::new(HashMap::new())),
            provided: Mutex::new(BTreeSet::new()),
        }
    }

    /// Beacon, receive and expiry loops. Returns only on a socket error.
    pub async fn run(self: Arc<Self>, discovery_port: u16) -> io::Result<()> {
        let socket = Arc::new(make_multicast_socket(discovery_port)?);
        let group = SocketAddr::from((MULTICAST_GROUP, discovery_port));
        tracing::info!(port = discovery_port, group = %group, "lan discovery started");

        let beacon = tokio::spawn(self.clone().beacon_loop(socket.clone(), group));
        let recv = tokio::spawn(self.clone().recv_loop(socket));
        let expire = tokio::spawn(self.expire_loop());
        tokio::select! {
            res = beacon => res.map_err(io::Error::other)?,
            res = recv => res.map_err(io::Error::other)?,
            res = expire => res.map_err(io::Error::other)?,
        }
    }

    async fn beacon_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        group: SocketAddr,
    ) -> io::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            for datagram in self.beacons(false).await? {
                if let Err(err) = socket.send_to(&datagram, group).await {
                    tracing::debug!(error = %err, "beacon send failed");
                }
            }
        }
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) -> io::Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            let Some(beacon) = parse_beacon(&buf[..n]) else {
                continue;
            };
            let answer = !beacon.reply;
            if self.observe(beacon, from).await && answer {
                for datagram in self.beacons(true).await? {
                    let _ = socket.send_to(&datagram, from).await;
                }
            }
        }
    }

    async fn expire_loop(self: Arc<Self>) -> io::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            for peer in self.expire(Instant::now()).await {
                self.book.remove(&peer).await;
                tracing::info!(peer = %peer, "peer left");
            }
        }
    }

    /// Record a beacon. Returns true when the peer was not known before.
    async fn observe(&self, beacon: Beacon, from: SocketAddr) -> bool {
        if beacon.peer == self.local {
            return false;
        }
        let addr = SocketAddr::new(from.ip(), beacon.listen_port);
        let is_new = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&beacon.peer) {
                Some(state) => {
                    state.addr = addr;
                    state.last_seen = Instant::now();
                    state.keys.extend(beacon.keys);
                    false
                }
                None => {
                    peers.insert(
                        beacon.peer,
                        PeerState {
                            addr,
                            keys: beacon.keys.into_iter().collect(),
                            last_seen: Instant::now(),
                        },
                    );
                    true
                }
            }
        };
        self.book.insert(beacon.peer, addr).await;
        if is_new {
            tracing::info!(peer = %beacon.peer, addr = %addr, "peer joined");
        }
        is_new
    }

    async fn expire(&self, now: Instant) -> Vec<PeerId> {
        let timeout = self.interval * EXPIRY_FACTOR;
        let mut peers = self.peers.lock().await;
        let gone: Vec<PeerId> = peers
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            peers.remove(id);
        }
        gone
    }

    async fn providers_of(&self, key: &[u8]) -> Vec<ProviderRecord> {
        providers_in(&self.peers, key).await
    }

    async fn beacons(&self, reply: bool) -> io::Result<Vec<Vec<u8>>> {
        let provided = self.provided.lock().await;
        let keys: Vec<Vec<u8>> = provided.iter().cloned().collect();
        drop(provided);
        let mut out = Vec::new();
        let mut chunks: Vec<&[Vec<u8>]> = keys.chunks(KEYS_PER_BEACON).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let beacon = Beacon {
                magic: BEACON_MAGIC,
                version: BEACON_VERSION,
                peer: self.local,
                listen_port: self.listen_port,
                reply,
                keys: chunk.to_vec(),
            };
            out.push(
                bincode::serialize(&beacon)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl ContentRouting for LanRouting {
    async fn provide(&self, key: &[u8]) -> io::Result<()> {
        self.provided.lock().await.insert(key.to_vec());
        Ok(())
    }

    /// Reports providers already known, then keeps watching incoming beacons until the
    /// caller drops the receiver.
    async fn find_providers(&self, key: &[u8]) -> io::Result<mpsc::Receiver<ProviderRecord>> {
        let (tx, rx) = mpsc::channel(16);
        let mut seen = HashSet::new();
        for record in self.providers_of(key).await {
            let peer = record.peer;
            if tx.try_send(record).is_err() {
                break;
            }
            seen.insert(peer);
        }
        let peers = Arc::downgrade(&self.peers);
        let key = key.to_vec();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(LOOKUP_POLL) => {}
                }
                let Some(peers) = peers.upgrade() else {
                    return;
                };
                for record in providers_in(&peers, &key).await {
                    if seen.insert(record.peer) && tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

async fn providers_in(peers: &PeerTable, key: &[u8]) -> Vec<ProviderRecord> {
    peers
        .lock()
        .await
        .iter()
        .filter(|(_, s)| s.keys.contains(key))
        .map(|(id, s)| ProviderRecord {
            peer: *id,
            addrs: vec![format!("/tcp/{}", s.addr)],
        })
        .collect()
}

fn parse_beacon(datagram: &[u8]) -> Option<Beacon> {
    let beacon: Beacon = bincode::deserialize(datagram).ok()?;
    (beacon.magic == BEACON_MAGIC && beacon.version == BEACON_VERSION).then_some(beacon)
}

fn make_multicast_socket(discovery_port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing(book: &AddressBook) -> LanRouting {
        LanRouting::new(PeerId::generate(), 45680, Duration::from_secs(4), book.clone())
    }

    fn beacon_from(peer: PeerId, keys: &[&[u8]]) -> Beacon {
        Beacon {
            magic: BEACON_MAGIC,
            version: BEACON_VERSION,
            peer,
            listen_port: 7000,
            reply: false,
            keys: keys.iter().map(|k| k.to_vec()).collect(),
        }
    }

    fn from() -> SocketAddr {
        "192.168.1.20:45681".parse().unwrap()
    }

    #[tokio::test]
    async fn beacon_registers_peer_address_and_keys() {
        let book = AddressBook::default();
        let lan = routing(&book);
        let peer = PeerId::generate();

        assert!(lan.observe(beacon_from(peer, &[b"song"]), from()).await);
        assert!(!lan.observe(beacon_from(peer, &[b"video"]), from()).await);

        let addr: SocketAddr = "192.168.1.20:7000".parse().unwrap();
        assert_eq!(book.get(&peer).await, Some(addr));
        let found = lan.providers_of(b"video").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer, peer);
        assert_eq!(found[0].addrs, vec!["/tcp/192.168.1.20:7000".to_string()]);
        assert!(lan.providers_of(b"other").await.is_empty());
    }

    #[tokio::test]
    async fn own_beacons_are_ignored() {
        let book = AddressBook::default();
        let lan = routing(&book);
        assert!(!lan.observe(beacon_from(lan.local, &[b"k"]), from()).await);
        assert!(lan.providers_of(b"k").await.is_empty());
    }

    #[tokio::test]
    async fn silent_peers_expire() {
        let book = AddressBook::default();
        let lan = routing(&book);
        let peer = PeerId::generate();
        lan.observe(beacon_from(peer, &[b"k"]), from()).await;

        assert!(lan.expire(Instant::now()).await.is_empty());
        let later = Instant::now() + Duration::from_secs(16);
        assert_eq!(lan.expire(later).await, vec![peer]);
        assert!(lan.providers_of(b"k").await.is_empty());
    }

    #[tokio::test]
    async fn provided_keys_split_across_beacons() {
        let book = AddressBook::default();
        let lan = routing(&book);
        assert_eq!(lan.beacons(false).await.unwrap().len(), 1);
        for i in 0..(KEYS_PER_BEACON + 1) {
            lan.provide(format!("key-{i}").as_bytes()).await.unwrap();
        }
        let datagrams = lan.beacons(true).await.unwrap();
        assert_eq!(datagrams.len(), 2);
        let first = parse_beacon(&datagrams[0]).unwrap();
        assert!(first.reply);
        assert_eq!(first.peer, lan.local);
        assert_eq!(first.keys.len(), KEYS_PER_BEACON);
        assert!(parse_beacon(b"not a beacon").is_none());
    }

    #[tokio::test]
    async fn lookup_reports_known_then_late_providers() {
        let book = AddressBook::default();
        let lan = routing(&book);
        let early = PeerId::generate();
        let late = PeerId::generate();
        lan.observe(beacon_from(early, &[b"k"]), from()).await;

        let mut rx = lan.find_providers(b"k").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().peer, early);

        lan.observe(beacon_from(late, &[b"k"]), from()).await;
        lan.observe(beacon_from(early, &[b"k"]), from()).await;
        assert_eq!(rx.recv().await.unwrap().peer, late);
    }
}
