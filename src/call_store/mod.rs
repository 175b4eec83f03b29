//! The Call Store — an in-memory state machine per call (`spec.md` §3, §4.1).
//!
//! All public operations acquire a single coarse `std::sync::Mutex` covering
//! the call map and its secondary status index. No operation performs I/O
//! while holding the lock, so a `std::sync::Mutex` (rather than a
//! `tokio::sync::Mutex`) is the right tool — critical sections never `.await`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::ids;

/// A call's lifecycle status (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Waiting,
    Active,
    Ended,
}

/// Which slot a peer occupies in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Waiting => "waiting",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
        }
    }
}

/// One of the (at most two) participants in a call.
#[derive(Debug, Clone)]
pub struct Participant {
    pub peer_id: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub is_present: bool,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
}

impl Participant {
    fn empty() -> Self {
        Participant {
            peer_id: None,
            joined_at: None,
            is_present: false,
            disconnected_at: None,
            reconnect_count: 0,
        }
    }

    fn matches(&self, peer_id: &str) -> bool {
        self.peer_id.as_deref() == Some(peer_id)
    }
}

/// A two-peer call session (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Call {
    pub id: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub host: Participant,
    pub guest: Participant,
}

impl Call {
    /// Count of non-empty `peerID` slots — always in `{1, 2}` for a live call.
    pub fn participants_count(&self) -> usize {
        [&self.host, &self.guest]
            .iter()
            .filter(|p| p.peer_id.is_some())
            .count()
    }

    /// Whether the given peer is the other participant's.
    fn other_role(&self, role: Role) -> Role {
        match role {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }

    pub fn participant(&self, role: Role) -> &Participant {
        match role {
            Role::Host => &self.host,
            Role::Guest => &self.guest,
        }
    }

    /// Whether the peer occupying the *other* slot from `role` is present.
    pub fn peer_online(&self, role: Role) -> bool {
        self.participant(self.other_role(role)).is_present
    }

    /// The envelope/HTTP-facing view of this call. Internal fields (raw
    /// participant structs, timestamps) are never serialized directly to a
    /// client — this is the one shape both `GET /api/calls/:id` and the
    /// `state` signaling envelope agree on.
    pub fn to_dto(&self) -> CallDto {
        CallDto {
            call_id: self.id.clone(),
            status: self.status.as_str(),
            participants: ParticipantsDto {
                count: self.participants_count(),
            },
        }
    }
}

/// Wire shape for a call's public state, shared by the HTTP and WebSocket
/// surfaces (`spec.md` §4.3.1, §6.1).
#[derive(Debug, Clone, Serialize)]
pub struct CallDto {
    pub call_id: String,
    pub status: &'static str,
    pub participants: ParticipantsDto,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantsDto {
    pub count: usize,
}

struct Inner {
    calls: HashMap<String, Call>,
    // status -> (created_at, call_id), sorted for ListByStatus.
    by_status: HashMap<CallStatus, BTreeSet<(DateTime<Utc>, String)>>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            calls: HashMap::new(),
            by_status: HashMap::new(),
        }
    }

    fn reindex(&mut self, old_status: Option<CallStatus>, call: &Call) {
        if let Some(old) = old_status {
            if let Some(set) = self.by_status.get_mut(&old) {
                set.remove(&(call.created_at, call.id.clone()));
            }
        }
        self.by_status
            .entry(call.status)
            .or_default()
            .insert((call.created_at, call.id.clone()));
    }

    fn remove_from_index(&mut self, call: &Call) {
        if let Some(set) = self.by_status.get_mut(&call.status) {
            set.remove(&(call.created_at, call.id.clone()));
        }
    }

    /// Evict the call if it is `Ended` or past `expires_at`. Returns the
    /// evicted call's terminal snapshot, or `None` if the call is still live.
    fn evict_if_dead(&mut self, call_id: &str, now: DateTime<Utc>) -> Option<Call> {
        let is_dead = {
            let call = self.calls.get(call_id)?;
            call.status == CallStatus::Ended || now > call.expires_at
        };
        if !is_dead {
            return None;
        }
        let mut call = self.calls.remove(call_id)?;
        self.remove_from_index(&call);
        call.status = CallStatus::Ended;
        Some(call)
    }
}

/// Cheaply cloneable handle to the shared call state — all clones share the
/// same underlying map via `Arc`.
#[derive(Clone)]
pub struct CallStore {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl CallStore {
    pub fn new(ttl: Duration) -> Self {
        CallStore {
            inner: Arc::new(Mutex::new(Inner::new())),
            ttl,
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(30))
    }

    /// `CreateCall(now) -> Call` (`spec.md` §4.1).
    pub fn create_call(&self, now: DateTime<Utc>) -> Call {
        let mut inner = self.inner.lock().unwrap();

        let id = loop {
            let candidate = ids::generate();
            if !inner.calls.contains_key(&candidate) {
                break candidate;
            }
        };

        let call = Call {
            id: id.clone(),
            status: CallStatus::Waiting,
            created_at: now,
            updated_at: now,
            expires_at: self.expiry_from(now),
            host: Participant {
                peer_id: None,
                joined_at: Some(now),
                is_present: true,
                disconnected_at: None,
                reconnect_count: 0,
            },
            guest: Participant::empty(),
        };

        inner.calls.insert(id, call.clone());
        inner.reindex(None, &call);
        tracing::info!(call_id = %call.id, "call created");
        call
    }

    /// `GetByID(callID, now) -> Call | {NotFound, Ended}`.
    pub fn get_by_id(&self, call_id: &str, now: DateTime<Utc>) -> Result<Call, AppError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(evicted) = inner.evict_if_dead(call_id, now) {
            let _ = evicted;
            return Err(AppError::Ended);
        }

        inner
            .calls
            .get(call_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    /// `Join(callID, now) -> (peerID, Call) | {NotFound, Ended, Full}`.
    pub fn join(&self, call_id: &str, now: DateTime<Utc>) -> Result<(String, Call), AppError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.evict_if_dead(call_id, now).is_some() {
            return Err(AppError::Ended);
        }

        let call = inner.calls.get_mut(call_id).ok_or(AppError::NotFound)?;

        if call.participants_count() >= 2 {
            return Err(AppError::Full);
        }

        let peer_id = ids::generate();
        let old_status = call.status;
        call.guest = Participant {
            peer_id: Some(peer_id.clone()),
            joined_at: Some(now),
            is_present: true,
            disconnected_at: None,
            reconnect_count: 0,
        };
        call.status = CallStatus::Active;
        call.updated_at = now;
        call.expires_at = self.expiry_from(now);

        let snapshot = call.clone();
        inner.reindex(Some(old_status), &snapshot);
        tracing::info!(call_id = %call_id, peer_id = %peer_id, "guest joined");
        Ok((peer_id, snapshot))
    }

    /// `EnsureHostPeerID(callID, now) -> (peerID, Call) | {NotFound, Ended}`.
    ///
    /// Idempotent: a second call returns the same `peer_id` unchanged.
    pub fn ensure_host_peer_id(
        &self,
        call_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, Call), AppError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.evict_if_dead(call_id, now).is_some() {
            return Err(AppError::Ended);
        }

        let call = inner.calls.get_mut(call_id).ok_or(AppError::NotFound)?;

        if let Some(existing) = call.host.peer_id.clone() {
            return Ok((existing, call.clone()));
        }

        let peer_id = ids::generate();
        call.host.peer_id = Some(peer_id.clone());
        call.host.joined_at = Some(now);
        call.host.is_present = true;
        call.updated_at = now;
        call.expires_at = self.expiry_from(now);

        let snapshot = call.clone();
        tracing::info!(call_id = %call_id, peer_id = %peer_id, "host peer id assigned");
        Ok((peer_id, snapshot))
    }

    /// `ValidatePeer(callID, peerID, now) -> (role, Call, wasReconnect) |
    /// {NotFound, Ended, InvalidPeer}`.
    pub fn validate_peer(
        &self,
        call_id: &str,
        peer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Role, Call, bool), AppError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.evict_if_dead(call_id, now).is_some() {
            return Err(AppError::Ended);
        }

        let call = inner.calls.get_mut(call_id).ok_or(AppError::NotFound)?;

        let role = if call.host.matches(peer_id) {
            Role::Host
        } else if call.guest.matches(peer_id) {
            Role::Guest
        } else {
            return Err(AppError::InvalidPeer);
        };

        let participant = match role {
            Role::Host => &mut call.host,
            Role::Guest => &mut call.guest,
        };

        let was_reconnect = !participant.is_present;
        if was_reconnect {
            participant.is_present = true;
            participant.reconnect_count += 1;
        }
        participant.disconnected_at = None;

        call.updated_at = now;
        call.expires_at = self.expiry_from(now);

        let snapshot = call.clone();
        if was_reconnect {
            tracing::info!(call_id = %call_id, peer_id = %peer_id, ?role, "peer reconnected");
        }
        Ok((role, snapshot, was_reconnect))
    }

    /// `MarkPeerDisconnected(callID, peerID, now)` — best-effort, never ends
    /// the call.
    pub fn mark_peer_disconnected(&self, call_id: &str, peer_id: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(call) = inner.calls.get_mut(call_id) else {
            return;
        };

        if call.host.matches(peer_id) {
            call.host.is_present = false;
            call.host.disconnected_at = Some(now);
        } else if call.guest.matches(peer_id) {
            call.guest.is_present = false;
            call.guest.disconnected_at = Some(now);
        }
    }

    /// `EndCall(callID, now) -> Call | {NotFound}`.
    pub fn end_call(&self, call_id: &str, now: DateTime<Utc>) -> Result<Call, AppError> {
        let mut inner = self.inner.lock().unwrap();

        let call = inner.calls.get_mut(call_id).ok_or(AppError::NotFound)?;
        let old_status = call.status;
        call.status = CallStatus::Ended;
        call.updated_at = now;
        call.host.is_present = false;
        call.guest.is_present = false;

        let snapshot = call.clone();
        inner.reindex(Some(old_status), &snapshot);
        inner.calls.remove(call_id);
        inner.remove_from_index(&snapshot);
        tracing::info!(call_id = %call_id, "call ended");
        Ok(snapshot)
    }

    /// `ListByStatus(status, limit, now) -> [Call]`, sorted by
    /// `(createdAt, id)` ascending. Sweeps expired calls during the scan.
    pub fn list_by_status(
        &self,
        status: CallStatus,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<Call> {
        let mut inner = self.inner.lock().unwrap();

        let candidates: Vec<String> = inner
            .by_status
            .get(&status)
            .map(|set| set.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(candidates.len().min(limit));
        for call_id in candidates {
            if inner.evict_if_dead(&call_id, now).is_some() {
                continue;
            }
            if let Some(call) = inner.calls.get(&call_id) {
                out.push(call.clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    /// Sweep every live call and evict those past `expires_at`. Used by the
    /// background sweeper (`spec.md` §3, §5 — period 3 hours).
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().unwrap();

        let ids: Vec<String> = inner.calls.keys().cloned().collect();
        let mut evicted = 0;
        for id in ids {
            if inner.evict_if_dead(&id, now).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "sweeper evicted expired calls");
        }
        evicted
    }

    /// Live call counts by status, for the `/metrics` ambient surface.
    pub fn stats(&self) -> HashMap<CallStatus, usize> {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for call in inner.calls.values() {
            *counts.entry(call.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn store() -> CallStore {
        CallStore::new(Duration::from_secs(1800))
    }

    #[test]
    fn create_call_starts_waiting_with_no_guest() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);

        assert_eq!(call.status, CallStatus::Waiting);
        assert_eq!(call.participants_count(), 0);
        assert!(call.guest.peer_id.is_none());
        assert!(call.host.peer_id.is_none());
    }

    #[test]
    fn ensure_host_peer_id_is_idempotent() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);

        let (p1, call1) = store.ensure_host_peer_id(&call.id, now).unwrap();
        let (p2, call2) = store.ensure_host_peer_id(&call.id, now).unwrap();

        assert_eq!(p1, p2);
        assert_eq!(call1.status, call2.status);
        assert_eq!(call1.status, CallStatus::Waiting);
    }

    #[test]
    fn join_transitions_to_active_and_assigns_guest() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);

        let (peer_id, call) = store.join(&call.id, now).unwrap();
        assert!(!peer_id.is_empty());
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(call.participants_count(), 1);
    }

    #[test]
    fn third_join_returns_full() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);

        store.join(&call.id, now).unwrap();
        let result = store.join(&call.id, now);
        assert_eq!(result, Err(AppError::Full));
    }

    #[test]
    fn join_unknown_call_returns_not_found() {
        let store = store();
        let result = store.join("does-not-exist", Utc::now());
        assert_eq!(result, Err(AppError::NotFound));
    }

    #[test]
    fn validate_peer_rejects_unknown_peer() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);
        store.ensure_host_peer_id(&call.id, now).unwrap();

        let result = store.validate_peer(&call.id, "not-a-real-peer", now);
        assert_eq!(result, Err(AppError::InvalidPeer));
    }

    #[test]
    fn validate_peer_on_present_peer_does_not_increment_reconnect_count() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);
        let (host_peer, _) = store.ensure_host_peer_id(&call.id, now).unwrap();

        let (_, call, was_reconnect) = store.validate_peer(&call.id, &host_peer, now).unwrap();
        assert!(!was_reconnect);
        assert_eq!(call.host.reconnect_count, 0);
    }

    #[test]
    fn disconnect_then_validate_marks_reconnect_and_increments_count() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);
        let (host_peer, _) = store.ensure_host_peer_id(&call.id, now).unwrap();

        store.mark_peer_disconnected(&call.id, &host_peer, now);
        let (role, call, was_reconnect) =
            store.validate_peer(&call.id, &host_peer, now).unwrap();

        assert_eq!(role, Role::Host);
        assert!(was_reconnect);
        assert_eq!(call.host.reconnect_count, 1);
        assert!(call.host.is_present);
    }

    #[test]
    fn mark_peer_disconnected_does_not_end_call() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);
        let (host_peer, _) = store.ensure_host_peer_id(&call.id, now).unwrap();
        store.join(&call.id, now).unwrap();

        store.mark_peer_disconnected(&call.id, &host_peer, now);

        let call = store.get_by_id(&call.id, now).unwrap();
        assert_eq!(call.status, CallStatus::Active);
        assert!(!call.host.is_present);
    }

    #[test]
    fn end_call_is_terminal_and_evicts() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);

        let ended = store.end_call(&call.id, now).unwrap();
        assert_eq!(ended.status, CallStatus::Ended);

        let result = store.get_by_id(&call.id, now);
        assert_eq!(result, Err(AppError::NotFound));
    }

    #[test]
    fn ttl_expiry_returns_ended_and_evicts() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);

        let past_ttl = now + ChronoDuration::minutes(31);
        let result = store.get_by_id(&call.id, past_ttl);
        assert_eq!(result, Err(AppError::Ended));

        // Evicted: a second lookup is NotFound, not Ended again.
        let result2 = store.get_by_id(&call.id, past_ttl);
        assert_eq!(result2, Err(AppError::NotFound));
    }

    #[test]
    fn sweep_expired_evicts_stale_calls() {
        let store = store();
        let now = Utc::now();
        let call = store.create_call(now);

        let past_ttl = now + ChronoDuration::minutes(31);
        let evicted = store.sweep_expired(past_ttl);
        assert_eq!(evicted, 1);

        let result = store.get_by_id(&call.id, past_ttl);
        assert_eq!(result, Err(AppError::NotFound));
    }

    #[test]
    fn list_by_status_sorted_by_created_at_then_id() {
        let store = store();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);

        let c1 = store.create_call(t0);
        let c2 = store.create_call(t1);

        let calls = store.list_by_status(CallStatus::Waiting, 10, t1);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, c1.id);
        assert_eq!(calls[1].id, c2.id);
    }

    #[test]
    fn generated_call_and_peer_ids_are_unique_across_many_calls() {
        let store = store();
        let now = Utc::now();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..200 {
            let call = store.create_call(now);
            assert!(seen.insert(call.id.clone()));
            let (peer_id, _) = store.join(&call.id, now).unwrap();
            assert!(seen.insert(peer_id));
        }
    }
}
