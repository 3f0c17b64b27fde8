//! Agent registry: accepts agent WebSockets, authenticates `register`
//! frames, binds each session to a tunnel record, evicts stale duplicates,
//! and keeps the persisted `is_active` flag consistent with the live map.
//!
//! ## Session lifecycle
//!
//! 1. `GET /api/agent/connect` upgrades; the server sends `welcome`.
//! 2. The first inbound frame must be `register` (agent id + session token).
//!    Bad token → close 4001. Subdomain conflict or storage failure →
//!    `error` frame + close 4003.
//! 3. A prior live session for the same tunnel id is closed with 4002 and
//!    removed *before* the new one is installed.
//! 4. On transport close (or heartbeat eviction) the session is removed, its
//!    in-flight responders are cancelled, and the tunnel row is marked
//!    disconnected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::Utc;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HEARTBEAT_TIMEOUT_SECS;
use crate::db::TunnelUpsert;
use crate::error::AppError;
use crate::mux::{Outbound, Pending};
use crate::protocol::{
    RegisterFrame, CLOSE_AUTH_FAILED, CLOSE_DUPLICATE, CLOSE_NORMAL, CLOSE_REGISTRATION_FAILED,
};
use crate::state::AppState;

/// Outbound channel depth per session.
const SESSION_CHANNEL_CAPACITY: usize = 256;

/// A live agent session bound to one tunnel id.
pub struct AgentSession {
    /// Distinguishes this session from a successor that took its tunnel id.
    pub session_id: Uuid,
    pub tunnel_id: String,
    /// Feed the session's writer task.
    pub tx: mpsc::Sender<Outbound>,
    /// In-flight public requests awaiting this agent.
    pub pending: Pending,
    pub last_heartbeat: Arc<Mutex<Instant>>,
    pub connected_since: Instant,
}

/// The live map `tunnel id → session`.
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<String, AgentSession>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles for forwarding a public request to a live session.
    pub async fn handles(&self, tunnel_id: &str) -> Option<(mpsc::Sender<Outbound>, Pending)> {
        let sessions = self.sessions.read().await;
        sessions
            .get(tunnel_id)
            .map(|s| (s.tx.clone(), s.pending.clone()))
    }

    pub async fn is_live(&self, tunnel_id: &str) -> bool {
        self.sessions.read().await.contains_key(tunnel_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Install a session, taking over its tunnel id. Check, duplicate
    /// eviction, and insert happen under one write-lock acquisition, so two
    /// racing registrations for the same id serialise here: the loser's
    /// session is closed with 4002 and its responders cancelled before the
    /// map ever holds the winner.
    async fn install(&self, session: AgentSession) {
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.remove(&session.tunnel_id) {
            info!(tunnel_id = %session.tunnel_id, "Evicting duplicate agent session");
            let _ = old
                .tx
                .send(Outbound::Close {
                    code: CLOSE_DUPLICATE,
                    reason: "duplicate tunnel id".to_string(),
                })
                .await;
            old.pending.cancel_all(false).await;
        }
        sessions.insert(session.tunnel_id.clone(), session);
    }

    /// Remove the session only when it is still the one installed for its
    /// tunnel id. An evicted session finds a successor there and must not
    /// touch its bookkeeping.
    async fn remove_if_current(&self, tunnel_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.get(tunnel_id).map(|s| s.session_id) == Some(session_id) {
            sessions.remove(tunnel_id);
            true
        } else {
            false
        }
    }

    /// Evict sessions whose last heartbeat is older than the timeout.
    /// Returns the affected tunnel ids.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let timeout = Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);
        let now = Instant::now();

        let mut stale = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (tunnel_id, session) in sessions.iter() {
                let last = *session.last_heartbeat.lock().await;
                if now.duration_since(last) > timeout {
                    stale.push((tunnel_id.clone(), session.session_id));
                }
            }
        }

        let mut evicted = Vec::new();
        for (tunnel_id, session_id) in stale {
            let mut sessions = self.sessions.write().await;
            let current = sessions.get(&tunnel_id).map(|s| s.session_id) == Some(session_id);
            if !current {
                continue;
            }
            let session = sessions.remove(&tunnel_id).expect("checked above");
            drop(sessions);

            warn!(tunnel_id = %tunnel_id, "Evicting agent session (heartbeat timeout)");
            let _ = session.tx.try_send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "heartbeat timeout".to_string(),
            });
            session.pending.cancel_all(false).await;
            evicted.push(tunnel_id);
        }
        evicted
    }

    /// Close every session (code 1000) and cancel its responders as 503.
    /// Returns the tunnel ids that were connected, for disconnect
    /// bookkeeping by the caller.
    pub async fn drain_all(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut drained = Vec::with_capacity(sessions.len());
        for (tunnel_id, session) in sessions.drain() {
            session.pending.cancel_all(true).await;
            let _ = session.tx.try_send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "server shutting down".to_string(),
            });
            drained.push(tunnel_id);
        }
        drained
    }

    /// Introspection for the debug listing endpoint.
    pub async fn summaries(&self) -> Vec<Value> {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let mut list = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            let last = *session.last_heartbeat.lock().await;
            list.push(json!({
                "tunnelId": session.tunnel_id,
                "connectedSecs": now.duration_since(session.connected_since).as_secs(),
                "lastHeartbeatAgoMs": now.duration_since(last).as_millis() as u64,
                "inFlight": session.pending.len().await,
            }));
        }
        list
    }
}

/// `GET /api/agent/connect` — agent WebSocket upgrade.
pub async fn connect_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_ws(socket, state))
}

/// Drive one agent connection from accept to close.
async fn handle_agent_ws(socket: WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(SESSION_CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_outbound(ws_sink, rx));

    let _ = tx
        .send(Outbound::Frame(json!({
            "type": "welcome",
            "timestamp": Utc::now().timestamp_millis(),
        })))
        .await;

    // First frame must be `register`.
    let Some(Ok(Message::Text(text))) = ws_stream.next().await else {
        debug!("Agent disconnected before registering");
        writer.abort();
        return;
    };

    let frame = match parse_register(&text) {
        Some(frame) => frame,
        None => {
            warn!("First agent frame was not a valid register");
            close_with_error(&tx, CLOSE_REGISTRATION_FAILED, "expected a register frame").await;
            let _ = writer.await;
            return;
        }
    };

    let tunnel_id = frame.agent_id.clone();

    // Authenticate. Verification is total; a bad token is just `None`.
    let Some(claims) = state.tokens.verify(&frame.token) else {
        info!(tunnel_id = %tunnel_id, "Agent token rejected");
        let _ = tx
            .send(Outbound::Close {
                code: CLOSE_AUTH_FAILED,
                reason: "authentication failed".to_string(),
            })
            .await;
        let _ = writer.await;
        return;
    };

    // Registration writes: user, subdomain, tunnel row. These run before
    // any live-map mutation, so a storage failure touches nothing.
    let tunnel = match register_tunnel(&state, &frame, &claims).await {
        Ok(tunnel) => tunnel,
        Err(AppError::Conflict(message)) => {
            info!(tunnel_id = %tunnel_id, "Subdomain conflict");
            close_with_error(&tx, CLOSE_REGISTRATION_FAILED, &message).await;
            let _ = writer.await;
            return;
        }
        Err(e) => {
            warn!(tunnel_id = %tunnel_id, error = %e, "Registration storage failure");
            close_with_error(&tx, CLOSE_REGISTRATION_FAILED, "registration failed").await;
            let _ = writer.await;
            return;
        }
    };

    // Take over the tunnel id; a concurrent holder is evicted with 4002
    // inside the same critical section that installs this session.
    let session_id = Uuid::new_v4();
    let pending = Pending::new();
    let heartbeat = Arc::new(Mutex::new(Instant::now()));
    state
        .registry
        .install(AgentSession {
            session_id,
            tunnel_id: tunnel_id.clone(),
            tx: tx.clone(),
            pending: pending.clone(),
            last_heartbeat: heartbeat.clone(),
            connected_since: Instant::now(),
        })
        .await;

    let url = format!("{}/{}", state.config.base_url, tunnel.subdomain);
    info!(tunnel_id = %tunnel_id, url = %url, "Agent registered");
    let _ = tx
        .send(Outbound::Frame(json!({
            "type": "registered",
            "tunnel": tunnel,
            "url": url,
        })))
        .await;

    // Reader loop: responses, heartbeats.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    warn!(tunnel_id = %tunnel_id, "Dropping non-JSON agent frame");
                    continue;
                };
                let frame_type = parsed["type"].as_str().unwrap_or("").to_string();
                match frame_type.as_str() {
                    "response" => match serde_json::from_value(parsed) {
                        Ok(frame) => {
                            pending.fulfil(frame).await;
                        }
                        Err(e) => {
                            warn!(tunnel_id = %tunnel_id, error = %e, "Dropping malformed response frame");
                        }
                    },
                    "ping" => {
                        *heartbeat.lock().await = Instant::now();
                        let _ = tx
                            .send(Outbound::Frame(json!({
                                "type": "pong",
                                "timestamp": Utc::now().timestamp_millis(),
                            })))
                            .await;
                    }
                    "pong" => {
                        *heartbeat.lock().await = Instant::now();
                    }
                    other => {
                        warn!(tunnel_id = %tunnel_id, frame_type = %other, "Unknown agent frame");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Transport closed: bookkeeping only if this session still owns the id.
    let removed = state
        .registry
        .remove_if_current(&tunnel_id, session_id)
        .await;
    let cancelled = pending.cancel_all(false).await;
    if cancelled > 0 {
        info!(tunnel_id = %tunnel_id, cancelled, "Cancelled in-flight requests on disconnect");
    }
    if removed {
        if let Err(e) = state.store.mark_tunnel_disconnected(&tunnel_id).await {
            warn!(tunnel_id = %tunnel_id, error = %e, "Failed to mark tunnel disconnected");
        }
        info!(tunnel_id = %tunnel_id, "Agent disconnected");
    }
    writer.abort();
}

/// Writer task: serialise frames onto the socket; a `Close` stops writing.
async fn write_outbound(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(value) => {
                let text = serde_json::to_string(&value).expect("Value serializes");
                if ws_sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = ws_sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

fn parse_register(text: &str) -> Option<RegisterFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value["type"].as_str() != Some("register") {
        return None;
    }
    serde_json::from_value(value).ok()
}

async fn close_with_error(tx: &mpsc::Sender<Outbound>, code: u16, message: &str) {
    let _ = tx
        .send(Outbound::Frame(json!({
            "type": "error",
            "message": message,
        })))
        .await;
    let _ = tx
        .send(Outbound::Close {
            code,
            reason: message.to_string(),
        })
        .await;
}

/// Resolve the subdomain, ensure the owning user exists, and upsert the
/// tunnel row. No live-map mutation happens here.
async fn register_tunnel(
    state: &AppState,
    frame: &RegisterFrame,
    claims: &crate::token::Claims,
) -> Result<crate::db::models::Tunnel, AppError> {
    state
        .store
        .create_user_if_missing(claims.sub, &claims.email)
        .await?;

    let tunnel_id = &frame.agent_id;
    let subdomain = match &frame.subdomain {
        Some(explicit) => match state.store.subdomain_owner(explicit).await? {
            Some(owner) if owner != *tunnel_id => {
                return Err(AppError::Conflict(format!(
                    "subdomain '{explicit}' is already taken"
                )));
            }
            _ => explicit.clone(),
        },
        None => resolve_free_subdomain(state, frame).await?,
    };

    let name = frame
        .tunnel_name
        .clone()
        .unwrap_or_else(|| tunnel_id.clone());

    let tunnel = state
        .store
        .upsert_tunnel(&TunnelUpsert {
            id: tunnel_id.clone(),
            subdomain,
            user_id: claims.sub,
            name,
            description: frame.description.clone(),
            local_port: frame.local_port,
        })
        .await?;
    Ok(tunnel)
}

/// No explicit subdomain: try the agent id, then slug variants of the tunnel
/// name with `-<n>` suffixes, then a time-based suffix.
async fn resolve_free_subdomain(
    state: &AppState,
    frame: &RegisterFrame,
) -> Result<String, AppError> {
    let tunnel_id = &frame.agent_id;

    match state.store.subdomain_owner(tunnel_id).await? {
        None => return Ok(tunnel_id.clone()),
        Some(owner) if owner == *tunnel_id => return Ok(tunnel_id.clone()),
        Some(_) => {}
    }

    let base = slugify(frame.tunnel_name.as_deref().unwrap_or(tunnel_id));
    for n in 1..=100u32 {
        let candidate = format!("{base}-{n}");
        match state.store.subdomain_owner(&candidate).await? {
            None => return Ok(candidate),
            Some(owner) if owner == *tunnel_id => return Ok(candidate),
            Some(_) => {}
        }
    }
    Ok(time_suffixed(&base, Utc::now().timestamp()))
}

/// Lowercase, alphanumerics only, first 20 chars; `"tunnel"` when nothing
/// survives.
fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(20)
        .collect();
    if slug.is_empty() {
        "tunnel".to_string()
    } else {
        slug
    }
}

fn time_suffixed(slug: &str, unix_secs: i64) -> String {
    let mut n = unix_secs.unsigned_abs();
    let mut suffix = String::new();
    if n == 0 {
        suffix.push('0');
    }
    while n > 0 {
        let digit = (n % 36) as u32;
        suffix.insert(0, char::from_digit(digit, 36).unwrap_or('0'));
        n /= 36;
    }
    format!("{slug}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(tunnel_id: &str) -> (AgentSession, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (
            AgentSession {
                session_id: Uuid::new_v4(),
                tunnel_id: tunnel_id.to_string(),
                tx,
                pending: Pending::new(),
                last_heartbeat: Arc::new(Mutex::new(Instant::now())),
                connected_since: Instant::now(),
            },
            rx,
        )
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My App"), "myapp");
        assert_eq!(slugify("My-App_2!"), "myapp2");
        assert_eq!(slugify("ALLCAPS"), "allcaps");
        assert_eq!(slugify("???"), "tunnel");
        assert_eq!(slugify("abcdefghijklmnopqrstuvwxyz"), "abcdefghijklmnopqrst");
        assert_eq!(slugify("abcdefghijklmnopqrst").len(), 20);
    }

    #[test]
    fn test_time_suffixed_base36() {
        assert_eq!(time_suffixed("app", 0), "app-0");
        assert_eq!(time_suffixed("app", 35), "app-z");
        assert_eq!(time_suffixed("app", 36), "app-10");
    }

    #[tokio::test]
    async fn test_at_most_one_session_per_tunnel_id() {
        let registry = Registry::new();
        let (first, mut rx1) = session("t1");
        let first_id = first.session_id;
        registry.install(first).await;
        assert!(registry.is_live("t1").await);

        // A second registration takes over the id.
        let (second, _rx2) = session("t1");
        let second_id = second.session_id;
        registry.install(second).await;
        assert_eq!(registry.len().await, 1);

        // The prior session was closed with 4002 during the takeover.
        match rx1.recv().await {
            Some(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_DUPLICATE),
            _ => panic!("expected duplicate close"),
        }

        // The evicted session's cleanup must not remove its successor.
        assert!(!registry.remove_if_current("t1", first_id).await);
        assert!(registry.is_live("t1").await);
        assert!(registry.remove_if_current("t1", second_id).await);
        assert!(!registry.is_live("t1").await);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_close_the_loser() {
        let registry = Registry::new();
        let (a, mut rx_a) = session("t1");
        let (b, mut rx_b) = session("t1");
        let a_id = a.session_id;
        let b_id = b.session_id;

        // Race two installs for the same tunnel id on separate tasks.
        let r_a = registry.clone();
        let r_b = registry.clone();
        let (done_a, done_b) = tokio::join!(
            tokio::spawn(async move { r_a.install(a).await }),
            tokio::spawn(async move { r_b.install(b).await }),
        );
        done_a.unwrap();
        done_b.unwrap();

        // Exactly one session survives, and exactly one was told 4002.
        assert_eq!(registry.len().await, 1);
        let a_evicted = matches!(
            rx_a.try_recv(),
            Ok(Outbound::Close {
                code: CLOSE_DUPLICATE,
                ..
            })
        );
        let b_evicted = matches!(
            rx_b.try_recv(),
            Ok(Outbound::Close {
                code: CLOSE_DUPLICATE,
                ..
            })
        );
        assert!(a_evicted != b_evicted, "exactly one loser must be closed");

        let survivor = if a_evicted { b_id } else { a_id };
        assert!(registry.remove_if_current("t1", survivor).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_all_closes_and_cancels() {
        let registry = Registry::new();
        let (s1, mut rx1) = session("t1");
        let (s2, mut rx2) = session("t2");
        registry.install(s1).await;
        registry.install(s2).await;

        let mut drained = registry.drain_all().await;
        drained.sort();
        assert_eq!(drained, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(registry.len().await, 0);

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await {
                Some(Outbound::Close { code, .. }) => assert_eq!(code, CLOSE_NORMAL),
                other => panic!("expected close, got {:?}", other.is_some()),
            }
        }
    }
}
