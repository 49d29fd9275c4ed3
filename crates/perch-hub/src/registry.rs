//! Connection registry — the process-local map from stable identity to live
//! channel.
//!
//! The registry is authoritative for liveness: `online == true` exactly when
//! it holds a channel for that identity. It is a sharded map; each shard is
//! guarded by a plain mutex that is never held across an await point. Sends
//! go through a bounded per-connection queue and never block the caller: a
//! full queue drops the frame and schedules the connection for eviction.
//!
//! Each attach is stamped with a generation so that a detach racing a
//! supersede cannot remove the newer connection.

use perch_common::proto::{close, Envelope};
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

const SHARD_COUNT: usize = 16;

/// Frames queued to a connection's writer pump.
#[derive(Debug)]
pub enum Outbound {
    Frame(Envelope),
    Close { code: u16, reason: &'static str },
}

/// Write side of a live connection: the frame queue plus the signal that
/// tells the reader to stop.
#[derive(Clone)]
pub struct ConnHandle {
    pub tx: mpsc::Sender<Outbound>,
    pub kill: Arc<Notify>,
}

impl ConnHandle {
    /// Queue a close frame, falling back to the kill signal when the queue
    /// is unusable.
    fn close(&self, code: u16, reason: &'static str) {
        if self.tx.try_send(Outbound::Close { code, reason }).is_err() {
            self.kill.notify_one();
        }
    }
}

struct Entry {
    handle: ConnHandle,
    generation: u64,
    last_heartbeat: Instant,
    /// Session ids this connection participates in, for disconnect fanout
    /// when the persistence store cannot be queried.
    sessions: HashSet<String>,
}

/// What a detach hands back to the caller: the sessions the connection was
/// tracking, for the end-of-session fanout.
#[derive(Debug)]
pub struct DetachedPeer {
    pub sessions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotConnected,
    /// Queue was full: the frame was dropped and the connection is being
    /// evicted.
    Dropped,
}

struct Directory<K> {
    shards: Vec<Mutex<HashMap<K, Entry>>>,
    generations: AtomicU64,
}

impl<K: Eq + Hash + Clone> Directory<K> {
    fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            generations: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Insert a channel, closing any prior one for the same key with a
    /// "superseded" close. Returns the generation stamp for this attach.
    fn attach(&self, key: K, handle: ConnHandle) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let prior = self.shard(&key).lock().expect("registry shard lock").insert(
            key,
            Entry {
                handle,
                generation,
                last_heartbeat: Instant::now(),
                sessions: HashSet::new(),
            },
        );
        if let Some(prior) = prior {
            prior.handle.close(close::SUPERSEDED, "superseded");
        }
        generation
    }

    /// Remove the entry if the generation still matches. A stale generation
    /// means a newer connection superseded this one; the map is untouched.
    fn detach(&self, key: &K, generation: u64) -> Option<DetachedPeer> {
        let mut shard = self.shard(key).lock().expect("registry shard lock");
        if shard.get(key).is_some_and(|e| e.generation == generation) {
            let entry = shard.remove(key)?;
            return Some(DetachedPeer {
                sessions: entry.sessions.into_iter().collect(),
            });
        }
        None
    }

    fn send(&self, key: &K, env: Envelope) -> SendOutcome {
        let shard = self.shard(key).lock().expect("registry shard lock");
        let Some(entry) = shard.get(key) else {
            return SendOutcome::NotConnected;
        };
        match entry.handle.tx.try_send(Outbound::Frame(env)) {
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => {
                entry.handle.kill.notify_one();
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SendOutcome::NotConnected,
        }
    }

    fn evict(&self, key: &K, code: u16, reason: &'static str) {
        let shard = self.shard(key).lock().expect("registry shard lock");
        if let Some(entry) = shard.get(key) {
            entry.handle.close(code, reason);
        }
    }

    fn touch(&self, key: &K) {
        let mut shard = self.shard(key).lock().expect("registry shard lock");
        if let Some(entry) = shard.get_mut(key) {
            entry.last_heartbeat = Instant::now();
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.shard(key).lock().expect("registry shard lock").contains_key(key)
    }

    fn track_session(&self, key: &K, session_id: &str) {
        let mut shard = self.shard(key).lock().expect("registry shard lock");
        if let Some(entry) = shard.get_mut(key) {
            entry.sessions.insert(session_id.to_string());
        }
    }

    fn untrack_session(&self, key: &K, session_id: &str) {
        let mut shard = self.shard(key).lock().expect("registry shard lock");
        if let Some(entry) = shard.get_mut(key) {
            entry.sessions.remove(session_id);
        }
    }

    /// Keys whose last heartbeat is older than `cutoff`.
    fn stale(&self, cutoff: Duration) -> Vec<K> {
        let now = Instant::now();
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .expect("registry shard lock")
                    .iter()
                    .filter(|(_, e)| now.duration_since(e.last_heartbeat) > cutoff)
                    .map(|(k, _)| k.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn close_all(&self, code: u16, reason: &'static str) {
        for shard in &self.shards {
            for entry in shard.lock().expect("registry shard lock").values() {
                entry.handle.close(code, reason);
            }
        }
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("registry shard lock").len())
            .sum()
    }
}

/// Live channels for devices (keyed by device-id string) and viewers (keyed
/// by user id). At most one channel per identity at any time.
pub struct ConnectionRegistry {
    devices: Directory<String>,
    viewers: Directory<i64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            devices: Directory::new(),
            viewers: Directory::new(),
        }
    }

    // === Devices ===

    pub fn attach_device(&self, device_id: &str, handle: ConnHandle) -> u64 {
        self.devices.attach(device_id.to_string(), handle)
    }

    pub fn detach_device(&self, device_id: &str, generation: u64) -> Option<DetachedPeer> {
        self.devices.detach(&device_id.to_string(), generation)
    }

    pub fn send_to_device(&self, device_id: &str, env: Envelope) -> SendOutcome {
        let outcome = self.devices.send(&device_id.to_string(), env);
        if outcome == SendOutcome::Dropped {
            tracing::warn!(device = %device_id, "Outbound queue full — frame dropped, evicting connection");
        }
        outcome
    }

    pub fn is_device_online(&self, device_id: &str) -> bool {
        self.devices.contains(&device_id.to_string())
    }

    pub fn touch_device(&self, device_id: &str) {
        self.devices.touch(&device_id.to_string());
    }

    pub fn track_device_session(&self, device_id: &str, session_id: &str) {
        self.devices.track_session(&device_id.to_string(), session_id);
    }

    pub fn untrack_device_session(&self, device_id: &str, session_id: &str) {
        self.devices.untrack_session(&device_id.to_string(), session_id);
    }

    pub fn evict_device(&self, device_id: &str, code: u16, reason: &'static str) {
        self.devices.evict(&device_id.to_string(), code, reason);
    }

    pub fn stale_devices(&self, cutoff: Duration) -> Vec<String> {
        self.devices.stale(cutoff)
    }

    // === Viewers ===

    pub fn attach_viewer(&self, user_id: i64, handle: ConnHandle) -> u64 {
        self.viewers.attach(user_id, handle)
    }

    pub fn detach_viewer(&self, user_id: i64, generation: u64) -> Option<DetachedPeer> {
        self.viewers.detach(&user_id, generation)
    }

    pub fn send_to_viewer(&self, user_id: i64, env: Envelope) -> SendOutcome {
        let outcome = self.viewers.send(&user_id, env);
        if outcome == SendOutcome::Dropped {
            tracing::warn!(user = %user_id, "Outbound queue full — frame dropped, evicting connection");
        }
        outcome
    }

    pub fn is_viewer_online(&self, user_id: i64) -> bool {
        self.viewers.contains(&user_id)
    }

    pub fn touch_viewer(&self, user_id: i64) {
        self.viewers.touch(&user_id);
    }

    pub fn track_viewer_session(&self, user_id: i64, session_id: &str) {
        self.viewers.track_session(&user_id, session_id);
    }

    pub fn untrack_viewer_session(&self, user_id: i64, session_id: &str) {
        self.viewers.untrack_session(&user_id, session_id);
    }

    pub fn evict_viewer(&self, user_id: i64, code: u16, reason: &'static str) {
        self.viewers.evict(&user_id, code, reason);
    }

    pub fn stale_viewers(&self, cutoff: Duration) -> Vec<i64> {
        self.viewers.stale(cutoff)
    }

    // === Lifecycle ===

    /// Ask every connection to close (server shutdown).
    pub fn close_all(&self, code: u16, reason: &'static str) {
        self.devices.close_all(code, reason);
        self.viewers.close_all(code, reason);
    }

    pub fn connection_count(&self) -> usize {
        self.devices.len() + self.viewers.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_common::proto::{Empty, MessageBody};

    fn handle(depth: usize) -> (ConnHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth);
        (
            ConnHandle {
                tx,
                kill: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    fn heartbeat() -> Envelope {
        Envelope::new(MessageBody::Heartbeat(Empty {}))
    }

    #[tokio::test]
    async fn attach_supersedes_prior_connection() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = handle(8);
        let (second, _second_rx) = handle(8);

        let gen1 = registry.attach_device("cam-1", first);
        let gen2 = registry.attach_device("cam-1", second);
        assert_ne!(gen1, gen2);

        // The first connection got a superseded close.
        match first_rx.recv().await {
            Some(Outbound::Close { code, reason }) => {
                assert_eq!(code, close::SUPERSEDED);
                assert_eq!(reason, "superseded");
            }
            other => panic!("expected close, got {other:?}"),
        }

        // A detach from the superseded reader must not evict the newcomer.
        assert!(registry.detach_device("cam-1", gen1).is_none());
        assert!(registry.is_device_online("cam-1"));

        assert!(registry.detach_device("cam-1", gen2).is_some());
        assert!(!registry.is_device_online("cam-1"));
    }

    #[tokio::test]
    async fn send_to_absent_identity_is_not_connected() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.send_to_device("ghost", heartbeat()),
            SendOutcome::NotConnected
        );
        assert_eq!(registry.send_to_viewer(99, heartbeat()), SendOutcome::NotConnected);
    }

    #[tokio::test]
    async fn full_queue_drops_frame_and_schedules_eviction() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = handle(1);
        let kill = conn.kill.clone();
        registry.attach_device("cam-1", conn);

        assert_eq!(registry.send_to_device("cam-1", heartbeat()), SendOutcome::Sent);
        assert_eq!(
            registry.send_to_device("cam-1", heartbeat()),
            SendOutcome::Dropped
        );

        // Eviction was signalled.
        tokio::time::timeout(Duration::from_millis(100), kill.notified())
            .await
            .expect("kill signal pending");

        // The queued frame is still there; nothing after it.
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn heartbeat_staleness_tracking() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = handle(8);
        registry.attach_device("cam-1", conn);

        assert_eq!(registry.stale_devices(Duration::ZERO), vec!["cam-1".to_string()]);
        assert!(registry.stale_devices(Duration::from_secs(90)).is_empty());

        registry.touch_device("cam-1");
        assert!(registry.stale_devices(Duration::from_secs(90)).is_empty());
    }

    #[tokio::test]
    async fn detach_returns_tracked_sessions() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = handle(8);
        let generation = registry.attach_device("cam-1", conn);

        registry.track_device_session("cam-1", "s1");
        registry.track_device_session("cam-1", "s2");
        registry.untrack_device_session("cam-1", "s1");

        let detached = registry.detach_device("cam-1", generation).unwrap();
        assert_eq!(detached.sessions, vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn close_all_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let (device, mut device_rx) = handle(8);
        let (viewer, mut viewer_rx) = handle(8);
        registry.attach_device("cam-1", device);
        registry.attach_viewer(7, viewer);
        assert_eq!(registry.connection_count(), 2);

        registry.close_all(close::GOING_AWAY, "going away");

        assert!(matches!(
            device_rx.recv().await,
            Some(Outbound::Close { code: close::GOING_AWAY, .. })
        ));
        assert!(matches!(
            viewer_rx.recv().await,
            Some(Outbound::Close { code: close::GOING_AWAY, .. })
        ));
    }
}
