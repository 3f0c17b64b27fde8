//! Request/response correlation between ingress tasks and agent sessions.
//!
//! Each public request registers a *responder* keyed by a fresh correlation
//! id, sends a `request` frame down the owning session, and waits. Exactly
//! one of {matching response, deadline, agent disconnect, shutdown} fulfils
//! the responder; a late `response` frame finds no entry and is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::config::REQUEST_DEADLINE_SECS;
use crate::ids;
use crate::protocol::{RequestFrame, ResponseFrame};

/// Message for a session's writer task.
pub enum Outbound {
    /// JSON frame to serialise onto the socket.
    Frame(Value),
    /// Close the socket with a code and reason, then stop writing.
    Close { code: u16, reason: String },
}

/// How a responder was fulfilled when no response frame arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    /// The frame could not be written to the session.
    SendFailed,
    /// The agent did not answer within the deadline.
    DeadlineExceeded,
    /// The session closed while the request was in flight.
    Disconnected,
    /// The server is shutting down.
    ShuttingDown,
}

enum Reply {
    Response(Box<ResponseFrame>),
    Disconnected,
    ShuttingDown,
}

/// Correlation map for one agent session.
///
/// Holding the map per session (rather than globally) means a session close
/// cancels exactly its own responders; ids remain process-unique UUIDs.
#[derive(Clone, Default)]
pub struct Pending {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>,
}

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(id.to_string(), tx);
        rx
    }

    async fn remove(&self, id: &str) {
        self.inner.lock().await.remove(id);
    }

    /// Deliver a `response` frame to its waiting responder. Returns false
    /// when no responder is registered (late or unknown id).
    pub async fn fulfil(&self, frame: ResponseFrame) -> bool {
        let sender = self.inner.lock().await.remove(&frame.id);
        match sender {
            Some(tx) => tx.send(Reply::Response(Box::new(frame))).is_ok(),
            None => {
                debug!(id = %frame.id, "Discarding response with no waiting request");
                false
            }
        }
    }

    /// Cancel every outstanding responder, as a disconnect (502) or a
    /// shutdown (503). Returns how many were cancelled.
    pub async fn cancel_all(&self, shutting_down: bool) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.len();
        for (_, tx) in inner.drain() {
            let reply = if shutting_down {
                Reply::ShuttingDown
            } else {
                Reply::Disconnected
            };
            let _ = tx.send(reply);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Send one framed request down a session and await its correlated response.
pub async fn forward(
    session_tx: &mpsc::Sender<Outbound>,
    pending: &Pending,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
) -> Result<ResponseFrame, ForwardError> {
    forward_with_deadline(
        session_tx,
        pending,
        method,
        path,
        headers,
        body,
        Duration::from_secs(REQUEST_DEADLINE_SECS),
    )
    .await
}

pub async fn forward_with_deadline(
    session_tx: &mpsc::Sender<Outbound>,
    pending: &Pending,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
    deadline: Duration,
) -> Result<ResponseFrame, ForwardError> {
    let id = ids::correlation_id();
    let rx = pending.register(&id).await;

    let frame = RequestFrame::new(id.clone(), method, path, headers, body);
    let value = serde_json::to_value(&frame).expect("frame serializes");
    if session_tx.send(Outbound::Frame(value)).await.is_err() {
        pending.remove(&id).await;
        return Err(ForwardError::SendFailed);
    }

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(Reply::Response(frame))) => Ok(*frame),
        Ok(Ok(Reply::Disconnected)) | Ok(Err(_)) => Err(ForwardError::Disconnected),
        Ok(Ok(Reply::ShuttingDown)) => Err(ForwardError::ShuttingDown),
        Err(_) => {
            // Deadline hit: unregister so a late response frame is discarded.
            pending.remove(&id).await;
            Err(ForwardError::DeadlineExceeded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str, status: u16) -> ResponseFrame {
        ResponseFrame {
            id: id.to_string(),
            status_code: Some(status),
            headers: None,
            body: Some(json!("ok")),
        }
    }

    /// Pull the correlation id out of a written frame.
    async fn recv_request_id(rx: &mut mpsc::Receiver<Outbound>) -> String {
        match rx.recv().await {
            Some(Outbound::Frame(v)) => v["id"].as_str().unwrap().to_string(),
            _ => panic!("expected a request frame"),
        }
    }

    #[tokio::test]
    async fn test_forward_happy_path() {
        let (tx, mut rx) = mpsc::channel(8);
        let pending = Pending::new();

        let fut = forward_with_deadline(
            &tx,
            &pending,
            "GET".into(),
            "/ping".into(),
            HashMap::new(),
            String::new(),
            Duration::from_secs(5),
        );

        let pending2 = pending.clone();
        let responder = tokio::spawn(async move {
            let id = recv_request_id(&mut rx).await;
            assert!(pending2.fulfil(response(&id, 200)).await);
        });

        let frame = fut.await.expect("response should arrive");
        assert_eq!(frame.status_code, Some(200));
        responder.await.unwrap();
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_forward_deadline_fulfils_once_and_discards_late() {
        let (tx, mut rx) = mpsc::channel(8);
        let pending = Pending::new();

        let err = forward_with_deadline(
            &tx,
            &pending,
            "GET".into(),
            "/slow".into(),
            HashMap::new(),
            String::new(),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ForwardError::DeadlineExceeded);

        // The agent answers after the deadline: entry is gone, frame dropped.
        let id = recv_request_id(&mut rx).await;
        assert!(!pending.fulfil(response(&id, 200)).await);
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_forward_send_failure() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let pending = Pending::new();

        let err = forward_with_deadline(
            &tx,
            &pending,
            "GET".into(),
            "/x".into(),
            HashMap::new(),
            String::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ForwardError::SendFailed);
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_all_disconnect_and_shutdown() {
        let (tx, mut rx) = mpsc::channel(8);
        let pending = Pending::new();

        let fut = forward_with_deadline(
            &tx,
            &pending,
            "GET".into(),
            "/x".into(),
            HashMap::new(),
            String::new(),
            Duration::from_secs(5),
        );

        let pending2 = pending.clone();
        let canceller = tokio::spawn(async move {
            let _ = recv_request_id(&mut rx).await;
            assert_eq!(pending2.cancel_all(false).await, 1);
        });

        assert_eq!(fut.await.unwrap_err(), ForwardError::Disconnected);
        canceller.await.unwrap();

        // Shutdown variant
        let (tx, mut rx) = mpsc::channel(8);
        let fut = forward_with_deadline(
            &tx,
            &pending,
            "GET".into(),
            "/x".into(),
            HashMap::new(),
            String::new(),
            Duration::from_secs(5),
        );
        let pending2 = pending.clone();
        let canceller = tokio::spawn(async move {
            let _ = recv_request_id(&mut rx).await;
            assert_eq!(pending2.cancel_all(true).await, 1);
        });
        assert_eq!(fut.await.unwrap_err(), ForwardError::ShuttingDown);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_correlation_ids_not_reused() {
        let (tx, mut rx) = mpsc::channel(8);
        let pending = Pending::new();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..10 {
            let fut = forward_with_deadline(
                &tx,
                &pending,
                "GET".into(),
                "/x".into(),
                HashMap::new(),
                String::new(),
                Duration::from_secs(5),
            );
            let pending2 = pending.clone();
            let (fut_result, id) = tokio::join!(fut, async {
                let id = recv_request_id(&mut rx).await;
                pending2.fulfil(response(&id, 200)).await;
                id
            });
            fut_result.unwrap();
            assert!(seen.insert(id), "correlation id reused");
        }
    }
}
