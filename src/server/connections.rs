//! In-memory registry of control-plane client sessions.
//!
//! Each WebSocket gets an outbound frame channel; the socket's write task
//! drains it. All registry state sits behind one mutex, and every operation
//! inside the lock is a map lookup or a non-blocking channel push, so the
//! lock is never held across an await.
//!
//! Fan-out is best-effort: a failed push marks the session for removal and
//! the loop moves on. Clients sharing a `client_session_id` (multiple tabs
//! of one user) can be deduplicated per broadcast.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{ErrorEnvelope, Event, EventPayload, now_iso};

/// Idle time after which a session is reaped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Sliding window for trigger rate limiting.
const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Maximum workflow triggers per window per connection.
const MAX_TRIGGERS_PER_WINDOW: usize = 30;

/// Frame pushed to a socket's write task.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    /// Ask the write task to send a close frame and hang up.
    Close(String),
}

pub type FrameSender = mpsc::UnboundedSender<Frame>;

struct ClientSession {
    id: String,
    tx: FrameSender,
    connected_at: Instant,
    last_activity: Instant,
    message_count: u64,
    trigger_timestamps: VecDeque<Instant>,
    client_session_id: Option<String>,
    /// None means the connection receives every event.
    subscriptions: Option<HashSet<String>>,
    #[allow(dead_code)]
    client_info: Value,
}

#[derive(Default)]
struct Registry {
    counter: u64,
    sessions: HashMap<String, ClientSession>,
    by_session: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct ConnectionManager {
    inner: Mutex<Registry>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and send it a `connection_ack`.
    pub fn connect(&self, tx: FrameSender, client_info: Value) -> String {
        let mut registry = self.lock();
        registry.counter += 1;
        let connection_id = format!(
            "conn_{}_{}",
            registry.counter,
            chrono::Utc::now().timestamp_millis()
        );

        let session = ClientSession {
            id: connection_id.clone(),
            tx,
            connected_at: Instant::now(),
            last_activity: Instant::now(),
            message_count: 0,
            trigger_timestamps: VecDeque::new(),
            client_session_id: None,
            subscriptions: None,
            client_info,
        };

        let ack = Event::new(EventPayload::ConnectionAck {
            connection_id: connection_id.clone(),
            connected_at: now_iso(),
            message: "Connected to ADW trigger server".to_string(),
        });
        push_frame(&session.tx, &ack);

        registry.sessions.insert(connection_id.clone(), session);
        info!(
            connection_id = %connection_id,
            total = registry.sessions.len(),
            "client connected"
        );
        connection_id
    }

    pub fn disconnect(&self, connection_id: &str) {
        let mut registry = self.lock();
        remove_session(&mut registry, connection_id);
    }

    /// Bind an application-level session id so tabs of one user can be
    /// deduplicated on fan-out.
    pub fn register_session(
        &self,
        connection_id: &str,
        session_id: &str,
        _client_info: Value,
    ) -> bool {
        let mut registry = self.lock();
        let Some(session) = registry.sessions.get_mut(connection_id) else {
            warn!(connection_id, "register_session for unknown connection");
            return false;
        };
        session.client_session_id = Some(session_id.to_string());
        registry
            .by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        info!(
            connection_id,
            session_id,
            sessions = registry.by_session.len(),
            "session registered"
        );
        true
    }

    pub fn subscribe_to_adw(&self, connection_id: &str, adw_id: &str) -> bool {
        let mut registry = self.lock();
        let Some(session) = registry.sessions.get_mut(connection_id) else {
            return false;
        };
        session
            .subscriptions
            .get_or_insert_with(HashSet::new)
            .insert(adw_id.to_string());
        true
    }

    pub fn unsubscribe_from_adw(&self, connection_id: &str, adw_id: &str) -> bool {
        let mut registry = self.lock();
        let Some(session) = registry.sessions.get_mut(connection_id) else {
            return false;
        };
        if let Some(subs) = session.subscriptions.as_mut() {
            subs.remove(adw_id);
        }
        true
    }

    /// Enforce the sliding-window trigger quota. A permitted call counts
    /// the trigger; a rejected one has no side effect.
    pub fn check_rate_limit(&self, connection_id: &str) -> Result<(), String> {
        let mut registry = self.lock();
        let Some(session) = registry.sessions.get_mut(connection_id) else {
            return Ok(());
        };
        let now = Instant::now();
        while let Some(front) = session.trigger_timestamps.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                session.trigger_timestamps.pop_front();
            } else {
                break;
            }
        }
        if session.trigger_timestamps.len() >= MAX_TRIGGERS_PER_WINDOW {
            return Err(format!(
                "Rate limit exceeded: max {} triggers per minute",
                MAX_TRIGGERS_PER_WINDOW
            ));
        }
        session.trigger_timestamps.push_back(now);
        Ok(())
    }

    /// Record inbound activity for idle tracking.
    pub fn touch(&self, connection_id: &str) {
        let mut registry = self.lock();
        if let Some(session) = registry.sessions.get_mut(connection_id) {
            session.last_activity = Instant::now();
            session.message_count += 1;
        }
    }

    /// Send one event to one connection. Returns false when the connection
    /// is gone (and removes it).
    pub fn send_to(&self, connection_id: &str, event: &Event) -> bool {
        let mut registry = self.lock();
        let Some(session) = registry.sessions.get_mut(connection_id) else {
            return false;
        };
        if push_frame(&session.tx, event) {
            session.last_activity = Instant::now();
            true
        } else {
            remove_session(&mut registry, connection_id);
            false
        }
    }

    pub fn send_error(&self, connection_id: &str, error: ErrorEnvelope) {
        self.send_to(connection_id, &Event::new(EventPayload::Error(error)));
    }

    /// Fan an event out to every connection. With `deduplicate_by_session`
    /// at most one frame goes to each registered client session;
    /// connections that never registered a session always receive.
    pub fn broadcast(&self, event: &Event, deduplicate_by_session: bool) {
        let Ok(json) = serde_json::to_string(event) else {
            warn!("failed to serialize event for broadcast");
            return;
        };
        let mut registry = self.lock();
        let mut sessions_sent: HashSet<String> = HashSet::new();
        let mut dead: Vec<String> = Vec::new();

        for session in registry.sessions.values_mut() {
            if deduplicate_by_session
                && let Some(sid) = &session.client_session_id
            {
                if sessions_sent.contains(sid) {
                    continue;
                }
                sessions_sent.insert(sid.clone());
            }
            if session.tx.send(Frame::Text(json.clone())).is_ok() {
                session.last_activity = Instant::now();
            } else {
                dead.push(session.id.clone());
            }
        }
        for id in dead {
            remove_session(&mut registry, &id);
        }
    }

    /// Send to subscribers of one workflow, plus every connection with no
    /// subscription set.
    pub fn broadcast_for_adw(&self, adw_id: &str, event: &Event) {
        let Ok(json) = serde_json::to_string(event) else {
            warn!("failed to serialize event for broadcast");
            return;
        };
        let mut registry = self.lock();
        let mut dead: Vec<String> = Vec::new();

        for session in registry.sessions.values_mut() {
            let wants = match &session.subscriptions {
                None => true,
                Some(subs) => subs.contains(adw_id),
            };
            if !wants {
                continue;
            }
            if session.tx.send(Frame::Text(json.clone())).is_ok() {
                session.last_activity = Instant::now();
            } else {
                dead.push(session.id.clone());
            }
        }
        for id in dead {
            remove_session(&mut registry, &id);
        }
    }

    /// Route an event: workflow-scoped payloads go to subscribers, control
    /// payloads to everyone.
    pub fn publish(&self, event: &Event) {
        match event.payload.adw_id() {
            Some(adw_id) => {
                let adw_id = adw_id.to_string();
                self.broadcast_for_adw(&adw_id, event);
            }
            None => self.broadcast(event, false),
        }
    }

    pub fn heartbeat(&self) {
        let event = Event::new(EventPayload::Heartbeat {
            active_connections: self.connection_count(),
            server_status: "healthy".to_string(),
        });
        self.broadcast(&event, false);
        debug!("broadcast heartbeat");
    }

    /// Close and remove sessions idle past [`IDLE_TIMEOUT`].
    pub fn reap_idle(&self) -> usize {
        let mut registry = self.lock();
        let now = Instant::now();
        let stale: Vec<String> = registry
            .sessions
            .values()
            .filter(|s| now.duration_since(s.last_activity) > IDLE_TIMEOUT)
            .map(|s| s.id.clone())
            .collect();

        for id in &stale {
            if let Some(session) = registry.sessions.get(id) {
                let idle = now.duration_since(session.last_activity).as_secs();
                info!(connection_id = %id, idle_secs = idle, "reaping idle connection");
                let _ = session
                    .tx
                    .send(Frame::Close("Connection timeout due to inactivity".to_string()));
            }
            remove_session(&mut registry, id);
        }
        stale.len()
    }

    /// Send every connection a close frame (server shutdown).
    pub fn close_all(&self, reason: &str) {
        let mut registry = self.lock();
        let ids: Vec<String> = registry.sessions.keys().cloned().collect();
        for id in ids {
            if let Some(session) = registry.sessions.get(&id) {
                let _ = session.tx.send(Frame::Close(reason.to_string()));
            }
            remove_session(&mut registry, &id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn backdate_activity(&self, connection_id: &str, by: Duration) {
        let mut registry = self.lock();
        if let Some(session) = registry.sessions.get_mut(connection_id)
            && let Some(past) = Instant::now().checked_sub(by)
        {
            session.last_activity = past;
        }
    }
}

fn push_frame(tx: &FrameSender, event: &Event) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => tx.send(Frame::Text(json)).is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize event");
            false
        }
    }
}

fn remove_session(registry: &mut Registry, connection_id: &str) {
    let Some(session) = registry.sessions.remove(connection_id) else {
        return;
    };
    if let Some(session_id) = &session.client_session_id
        && let Some(peers) = registry.by_session.get_mut(session_id)
    {
        peers.remove(connection_id);
        if peers.is_empty() {
            registry.by_session.remove(session_id);
            info!(session_id = %session_id, "session completely disconnected");
        }
    }
    let duration = session.connected_at.elapsed().as_secs();
    info!(
        connection_id,
        duration_secs = duration,
        messages = session.message_count,
        total = registry.sessions.len(),
        "client disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(manager: &ConnectionManager) -> (String, UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = manager.connect(tx, Value::Null);
        (id, rx)
    }

    fn drain_texts(rx: &mut UnboundedReceiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Text(text) = frame {
                out.push(text);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_connect_sends_ack() {
        let manager = ConnectionManager::new();
        let (id, mut rx) = connect(&manager);
        assert!(id.starts_with("conn_"));
        let frames = drain_texts(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"type\":\"connection_ack\""));
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_session_index() {
        let manager = ConnectionManager::new();
        let (id, _rx) = connect(&manager);
        manager.register_session(&id, "abc", Value::Null);
        manager.disconnect(&id);
        assert_eq!(manager.connection_count(), 0);

        // A fresh registration under the same session id works.
        let (id2, _rx2) = connect(&manager);
        assert!(manager.register_session(&id2, "abc", Value::Null));
    }

    #[tokio::test]
    async fn test_broadcast_dedup_by_session() {
        let manager = ConnectionManager::new();
        let (a, mut rx_a) = connect(&manager);
        let (b, mut rx_b) = connect(&manager);
        manager.register_session(&a, "abc", Value::Null);
        manager.register_session(&b, "abc", Value::Null);
        drain_texts(&mut rx_a);
        drain_texts(&mut rx_b);

        let event = Event::new(EventPayload::Heartbeat {
            active_connections: 2,
            server_status: "healthy".to_string(),
        });
        manager.broadcast(&event, true);

        let delivered = drain_texts(&mut rx_a).len() + drain_texts(&mut rx_b).len();
        assert_eq!(delivered, 1);

        // Without dedup, both tabs receive.
        manager.broadcast(&event, false);
        let delivered = drain_texts(&mut rx_a).len() + drain_texts(&mut rx_b).len();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn test_unregistered_connections_always_receive_on_dedup() {
        let manager = ConnectionManager::new();
        let (a, mut rx_a) = connect(&manager);
        let (_b, mut rx_b) = connect(&manager);
        manager.register_session(&a, "abc", Value::Null);
        drain_texts(&mut rx_a);
        drain_texts(&mut rx_b);

        let event = Event::new(EventPayload::Heartbeat {
            active_connections: 2,
            server_status: "healthy".to_string(),
        });
        manager.broadcast(&event, true);
        assert_eq!(drain_texts(&mut rx_a).len(), 1);
        assert_eq!(drain_texts(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_routing() {
        let manager = ConnectionManager::new();
        let (only_a, mut rx_scoped) = connect(&manager);
        let (_open, mut rx_open) = connect(&manager);
        manager.subscribe_to_adw(&only_a, "adw-aaaa");
        drain_texts(&mut rx_scoped);
        drain_texts(&mut rx_open);

        let event_b = Event::new(EventPayload::TextBlock {
            adw_id: "adw-bbbb".to_string(),
            content: "b".to_string(),
            sequence: None,
        });
        manager.broadcast_for_adw("adw-bbbb", &event_b);
        assert_eq!(drain_texts(&mut rx_scoped).len(), 0);
        assert_eq!(drain_texts(&mut rx_open).len(), 1);

        let event_a = Event::new(EventPayload::TextBlock {
            adw_id: "adw-aaaa".to_string(),
            content: "a".to_string(),
            sequence: None,
        });
        manager.broadcast_for_adw("adw-aaaa", &event_a);
        assert_eq!(drain_texts(&mut rx_scoped).len(), 1);
        assert_eq!(drain_texts(&mut rx_open).len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let manager = ConnectionManager::new();
        let (id, mut rx) = connect(&manager);
        manager.subscribe_to_adw(&id, "adw-aaaa");
        manager.unsubscribe_from_adw(&id, "adw-aaaa");
        drain_texts(&mut rx);

        let event = Event::new(EventPayload::TextBlock {
            adw_id: "adw-aaaa".to_string(),
            content: "a".to_string(),
            sequence: None,
        });
        manager.broadcast_for_adw("adw-aaaa", &event);
        // Empty subscription set is not "no subscriptions": nothing arrives.
        assert_eq!(drain_texts(&mut rx).len(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_31st_trigger_rejected() {
        let manager = ConnectionManager::new();
        let (id, _rx) = connect(&manager);
        for _ in 0..30 {
            assert!(manager.check_rate_limit(&id).is_ok());
        }
        let err = manager.check_rate_limit(&id).unwrap_err();
        assert!(err.contains("Rate limit exceeded"));

        // The rejected trigger left no residue: the window still holds 30.
        let err2 = manager.check_rate_limit(&id).unwrap_err();
        assert!(err2.contains("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn test_dead_connection_removed_on_broadcast() {
        let manager = ConnectionManager::new();
        let (_live, mut rx_live) = connect(&manager);
        let (dead, rx_dead) = connect(&manager);
        drop(rx_dead);
        drain_texts(&mut rx_live);

        let event = Event::new(EventPayload::Heartbeat {
            active_connections: 2,
            server_status: "healthy".to_string(),
        });
        manager.broadcast(&event, false);

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(drain_texts(&mut rx_live).len(), 1);
        assert!(!manager.send_to(&dead, &event));
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let manager = ConnectionManager::new();
        let (idle, mut rx_idle) = connect(&manager);
        let (_fresh, _rx_fresh) = connect(&manager);
        manager.backdate_activity(&idle, Duration::from_secs(400));

        assert_eq!(manager.reap_idle(), 1);
        assert_eq!(manager.connection_count(), 1);

        // The reaped session was told to close.
        let mut saw_close = false;
        while let Ok(frame) = rx_idle.try_recv() {
            if matches!(frame, Frame::Close(_)) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_publish_routes_by_scope() {
        let manager = ConnectionManager::new();
        let (scoped, mut rx) = connect(&manager);
        manager.subscribe_to_adw(&scoped, "adw-aaaa");
        drain_texts(&mut rx);

        manager.publish(&Event::new(EventPayload::Heartbeat {
            active_connections: 1,
            server_status: "healthy".to_string(),
        }));
        // Control events reach even scoped connections.
        assert_eq!(drain_texts(&mut rx).len(), 1);

        manager.publish(&Event::new(EventPayload::TextBlock {
            adw_id: "adw-bbbb".to_string(),
            content: "x".to_string(),
            sequence: None,
        }));
        assert_eq!(drain_texts(&mut rx).len(), 0);
    }
}
