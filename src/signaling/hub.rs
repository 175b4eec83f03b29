//! The Signaling Hub — a per-call pair of bidirectional message channels
//! (`spec.md` §4.2).
//!
//! Data: `calls: map[callID -> map[peerID -> HubClient]]` under a single
//! mutex. Connection writes and queue closes happen outside the lock; under
//! the lock the code only snapshots or swaps table entries (`spec.md` §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

/// Bounded outbound queue capacity per peer (`spec.md` §3, §5).
pub const OUTBOUND_CAPACITY: usize = 32;

/// Non-owning handle the Hub holds for routing. The owning read/write tasks
/// hold the matching [`Registration`] returned by [`SignalingHub::add`].
#[derive(Clone)]
pub struct HubClient {
    sender: mpsc::Sender<String>,
    close_signal: Arc<Notify>,
    generation: u64,
}

/// Returned by [`SignalingHub::add`] to the caller that owns the connection.
///
/// `generation` must be remembered and passed back to
/// [`SignalingHub::remove`] — it is the mechanism that prevents a stale
/// predecessor's cleanup from evicting a newcomer that has since displaced
/// it (`spec.md` §5, §9 open point; see `DESIGN.md` for the resolution).
pub struct Registration {
    pub generation: u64,
    pub receiver: mpsc::Receiver<String>,
    pub close_signal: Arc<Notify>,
}

struct Bucket {
    clients: HashMap<String, HubClient>,
}

/// Cheaply cloneable handle to the shared routing table — all clones share
/// the same underlying map via `Arc`.
#[derive(Clone)]
pub struct SignalingHub {
    calls: Arc<Mutex<HashMap<String, Bucket>>>,
    next_generation: Arc<AtomicU64>,
}

impl SignalingHub {
    pub fn new() -> Self {
        SignalingHub {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// `Add(client)` — displaces any existing client registered for the
    /// same `(callID, peerID)`: its connection and outbound queue are closed
    /// before the newcomer is installed (`spec.md` §4.2, §5).
    pub fn add(&self, call_id: &str, peer_id: &str) -> Registration {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let close_signal = Arc::new(Notify::new());
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let client = HubClient {
            sender: tx,
            close_signal: close_signal.clone(),
            generation,
        };

        let mut calls = self.calls.lock().unwrap();
        let bucket = calls
            .entry(call_id.to_string())
            .or_insert_with(|| Bucket {
                clients: HashMap::new(),
            });

        if let Some(predecessor) = bucket.clients.insert(peer_id.to_string(), client) {
            tracing::info!(call_id = %call_id, peer_id = %peer_id, "displacing existing socket");
            predecessor.close_signal.notify_one();
            // `predecessor` is dropped here; its `Sender` half goes with it,
            // which is how the old write loop's `recv()` observes closure.
        }

        Registration {
            generation,
            receiver: rx,
            close_signal,
        }
    }

    /// `Remove(callID, peerID)` — guarded by `generation` so a displaced
    /// predecessor's delayed cleanup can never evict the newcomer that
    /// replaced it (`spec.md` §9 open point).
    pub fn remove(&self, call_id: &str, peer_id: &str, generation: u64) {
        let mut calls = self.calls.lock().unwrap();
        let Some(bucket) = calls.get_mut(call_id) else {
            return;
        };

        if let std::collections::hash_map::Entry::Occupied(entry) =
            bucket.clients.entry(peer_id.to_string())
        {
            if entry.get().generation == generation {
                entry.remove();
            }
        }

        if bucket.clients.is_empty() {
            calls.remove(call_id);
        }
    }

    fn snapshot_client(&self, call_id: &str, peer_id: &str) -> Option<HubClient> {
        let calls = self.calls.lock().unwrap();
        calls.get(call_id)?.clients.get(peer_id).cloned()
    }

    fn snapshot_other(&self, call_id: &str, from_peer_id: &str) -> Option<(String, HubClient)> {
        let calls = self.calls.lock().unwrap();
        let bucket = calls.get(call_id)?;
        bucket
            .clients
            .iter()
            .find(|(peer_id, _)| peer_id.as_str() != from_peer_id)
            .map(|(peer_id, client)| (peer_id.clone(), client.clone()))
    }

    fn snapshot_bucket(&self, call_id: &str) -> Vec<HubClient> {
        let calls = self.calls.lock().unwrap();
        calls
            .get(call_id)
            .map(|bucket| bucket.clients.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Non-blocking offer to the target's outbound queue. If the queue is
    /// full, the slow/dead consumer policy closes the connection
    /// (`spec.md` §4.2, §5).
    pub fn send_to(&self, call_id: &str, peer_id: &str, payload: String) -> bool {
        match self.snapshot_client(call_id, peer_id) {
            Some(client) => offer(&client, payload),
            None => false,
        }
    }

    /// Picks the unique other peer in the bucket, if present (`spec.md`
    /// §4.2).
    pub fn send_to_other(&self, call_id: &str, from_peer_id: &str, payload: String) -> bool {
        match self.snapshot_other(call_id, from_peer_id) {
            Some((_, client)) => offer(&client, payload),
            None => false,
        }
    }

    /// Snapshot the bucket under the lock, release it, then non-blocking
    /// send to each; dead consumers are closed (`spec.md` §4.2).
    pub fn broadcast(&self, call_id: &str, payload: String) {
        for client in self.snapshot_bucket(call_id) {
            offer(&client, payload.clone());
        }
    }

    /// Snapshot and remove the bucket; close every connection and outbound
    /// queue. Used to tear down sockets when a call ends (`spec.md` §4.2).
    pub fn close_call(&self, call_id: &str) {
        let bucket = {
            let mut calls = self.calls.lock().unwrap();
            calls.remove(call_id)
        };
        if let Some(bucket) = bucket {
            for client in bucket.clients.values() {
                client.close_signal.notify_one();
            }
        }
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking offer with the backpressure policy from `spec.md` §4.2/§5:
/// a full or closed queue closes the connection and reports failure.
fn offer(client: &HubClient, payload: String) -> bool {
    match client.sender.try_send(payload) {
        Ok(()) => true,
        Err(_) => {
            client.close_signal.notify_one();
            false
        }
    }
}
