use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::wire::message::NetworkAddress;

/// Reference to a live connection. The socket itself is owned by the task
/// that performs I/O on it; the table never closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: u64,
    pub remote: SocketAddr,
}

/// What the node knows about one peer in one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// The address as it would be advertised to other peers.
    pub address: NetworkAddress,
    pub connection: Option<ConnectionHandle>,
    /// Last time a connection attempt was made. `None` for addresses only
    /// learned from other peers.
    pub last_contacted: Option<Instant>,
}

impl PeerEntry {
    pub fn new(address: NetworkAddress) -> Self {
        Self {
            address,
            connection: None,
            last_contacted: None,
        }
    }

    pub fn with_connection(mut self, handle: ConnectionHandle) -> Self {
        self.connection = Some(handle);
        self
    }
}

type StreamPeers = HashMap<SocketAddr, PeerEntry>;

/// Known peers, partitioned by stream.
///
/// All access goes through one mutex and every operation is a short
/// synchronous critical section, so snapshots never observe a half-applied
/// update and no guard outlives a call.
#[derive(Debug, Default)]
pub struct PeerTable {
    streams: Mutex<HashMap<u32, StreamPeers>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, StreamPeers>> {
        // Every mutation is a single insert/remove, so a poisoned map is
        // still consistent.
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the entry for `key` and marks it contacted now.
    ///
    /// An existing connection reference is kept when `entry` carries none.
    /// The stream is created on first insert.
    pub fn add_or_refresh(&self, stream: u32, key: SocketAddr, mut entry: PeerEntry) {
        let mut streams = self.lock();
        let peers = streams.entry(stream).or_default();

        if entry.connection.is_none() {
            entry.connection = peers.get(&key).and_then(|e| e.connection);
        }
        entry.last_contacted = Some(Instant::now());

        peers.insert(key, entry);
    }

    /// Records an address advertised by another peer.
    ///
    /// Returns true when the address was not known in this stream before.
    /// A known entry only has its advertised time moved forward.
    pub fn learn(&self, stream: u32, address: NetworkAddress) -> bool {
        let key = address.socket_addr();
        let mut streams = self.lock();
        let peers = streams.entry(stream).or_default();

        match peers.get_mut(&key) {
            Some(existing) => {
                existing.address.time = existing.address.time.max(address.time);
                false
            }
            None => {
                peers.insert(key, PeerEntry::new(address));
                true
            }
        }
    }

    pub fn remove(&self, stream: u32, key: &SocketAddr) -> Option<PeerEntry> {
        let mut streams = self.lock();
        let peers = streams.get_mut(&stream)?;
        let removed = peers.remove(key);
        if peers.is_empty() {
            streams.remove(&stream);
        }
        removed
    }

    /// Addresses known in `stream`, for advertisement to other peers.
    pub fn snapshot(&self, stream: u32) -> Vec<NetworkAddress> {
        self.lock()
            .get(&stream)
            .map(|peers| peers.values().map(|e| e.address).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, stream: u32, key: &SocketAddr) -> Option<PeerEntry> {
        self.lock().get(&stream)?.get(key).cloned()
    }

    /// Number of peers in `stream`.
    pub fn len(&self, stream: u32) -> usize {
        self.lock().get(&stream).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values().all(HashMap::is_empty)
    }

    /// Streams that currently hold at least one peer.
    pub fn streams(&self) -> Vec<u32> {
        let mut streams: Vec<u32> = self.lock().keys().copied().collect();
        streams.sort_unstable();
        streams
    }

    /// Retry policy: returns false when `key` is connected or was contacted
    /// within `cooldown`, otherwise stamps the attempt and returns true.
    ///
    /// Unknown peers are always allowed; they are recorded once the dial
    /// succeeds.
    pub fn begin_contact(&self, stream: u32, key: &SocketAddr, cooldown: Duration) -> bool {
        let mut streams = self.lock();
        let Some(entry) = streams.get_mut(&stream).and_then(|p| p.get_mut(key)) else {
            return true;
        };

        if entry.connection.is_some() {
            return false;
        }

        let now = Instant::now();
        if entry
            .last_contacted
            .is_some_and(|at| now.duration_since(at) < cooldown)
        {
            return false;
        }

        entry.last_contacted = Some(now);
        true
    }

    /// Clears the reference to connection `id` wherever it is stored. The
    /// entries themselves stay so that later attempts can retry them.
    pub fn detach(&self, id: u64) {
        for peers in self.lock().values_mut() {
            for entry in peers.values_mut() {
                if entry.connection.is_some_and(|c| c.id == id) {
                    entry.connection = None;
                }
            }
        }
    }

    /// Moves the entry for `key` from its provisional stream to the streams
    /// the peer announced in its version message.
    pub fn reassign(&self, key: &SocketAddr, from: u32, to: &[u32]) {
        let mut streams = self.lock();

        let entry = match streams.get(&from).and_then(|p| p.get(key)) {
            Some(entry) => entry.clone(),
            None => return,
        };

        if !to.contains(&from) {
            if let Some(peers) = streams.get_mut(&from) {
                peers.remove(key);
                if peers.is_empty() {
                    streams.remove(&from);
                }
            }
        }

        for &stream in to {
            let mut moved = entry.clone();
            moved.address.stream = stream;
            streams.entry(stream).or_default().insert(*key, moved);
        }
    }

    /// Forgets peers that are not connected and were not advertised within
    /// `max_age` of UNIX time `now`. Returns how many were removed.
    pub fn prune(&self, now: u64, max_age: Duration) -> usize {
        let cutoff = now.saturating_sub(max_age.as_secs());
        let mut removed = 0;

        let mut streams = self.lock();
        for peers in streams.values_mut() {
            let before = peers.len();
            peers.retain(|_, e| e.connection.is_some() || u64::from(e.address.time) >= cutoff);
            removed += before - peers.len();
        }
        streams.retain(|_, peers| !peers.is_empty());

        if removed > 0 {
            debug!(removed, "pruned stale peers");
        }
        removed
    }
}
