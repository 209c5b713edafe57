//! Peer Messaging Facade
//!
//! Connection-agnostic handle for a remote peer (client, spawner node or
//! spawned game server). The transport owns the outbound receiver and is
//! responsible for framing; everything above this layer only ever sees
//! `Peer`, `IncomingMessage` and `Response`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::network::protocol::{OpCode, ResponseStatus};

/// Unique peer connection identifier, assigned by the transport.
pub type PeerId = u64;

/// A response to a request, carrying a status and a JSON payload.
#[derive(Debug)]
pub struct Response {
    pub status: ResponseStatus,
    pub payload: Value,
}

impl Response {
    /// Successful response with a payload.
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        Self {
            status: ResponseStatus::Success,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// Failed response with a reason string.
    pub fn error(status: ResponseStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            payload: Value::String(reason.into()),
        }
    }

    /// Deserialize the payload into a concrete packet type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Payload as a string, or the fallback when it is not one.
    pub fn as_str(&self, fallback: &str) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            _ => fallback.to_string(),
        }
    }
}

/// Request (or notification) queued for delivery to a peer.
///
/// `responder` is `None` for fire-and-forget notifications.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub opcode: OpCode,
    pub payload: Value,
    pub responder: Option<oneshot::Sender<Response>>,
}

/// Minimal security context attached to a peer.
///
/// Stands in for the authentication extension, which lives outside this
/// crate: the transport layer fills these in after it has verified identity.
#[derive(Debug, Clone, Default)]
pub struct PeerSecurity {
    pub username: Option<String>,
    pub permission_level: i32,
}

/// Handle to a connected peer.
pub struct Peer {
    id: PeerId,
    connected: AtomicBool,
    security: RwLock<PeerSecurity>,
    outbound: mpsc::UnboundedSender<OutgoingRequest>,
}

impl Peer {
    /// Create a peer handle and the outbound queue the transport drains.
    pub fn channel(id: PeerId) -> (Arc<Peer>, mpsc::UnboundedReceiver<OutgoingRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer {
            id,
            connected: AtomicBool::new(true),
            security: RwLock::new(PeerSecurity::default()),
            outbound: tx,
        });
        (peer, rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flag the peer as gone. The transport calls this before running the
    /// disconnect cascades.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn username(&self) -> Option<String> {
        self.security.read().ok().and_then(|s| s.username.clone())
    }

    pub fn set_username(&self, username: impl Into<String>) {
        if let Ok(mut security) = self.security.write() {
            security.username = Some(username.into());
        }
    }

    pub fn permission_level(&self) -> i32 {
        self.security.read().map(|s| s.permission_level).unwrap_or(0)
    }

    pub fn set_permission_level(&self, level: i32) {
        if let Ok(mut security) = self.security.write() {
            security.permission_level = level;
        }
    }

    /// Send a request and await the response, up to `timeout`.
    ///
    /// A peer that is gone (or never answers) yields a `Failed` or `Timeout`
    /// response rather than an error: every cross-peer exchange resolves to
    /// exactly one `Response`.
    pub async fn request<T: Serialize>(
        &self,
        opcode: OpCode,
        payload: &T,
        timeout: Duration,
    ) -> Response {
        if !self.is_connected() {
            return Response::error(ResponseStatus::Failed, "Peer is not connected");
        }

        let (tx, rx) = oneshot::channel();
        let request = OutgoingRequest {
            opcode,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            responder: Some(tx),
        };

        if self.outbound.send(request).is_err() {
            return Response::error(ResponseStatus::Failed, "Peer is not connected");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::error(ResponseStatus::Failed, "Peer dropped the request"),
            Err(_) => Response::error(ResponseStatus::Timeout, "Request timed out"),
        }
    }

    /// Fire-and-forget notification.
    pub fn notify<T: Serialize>(&self, opcode: OpCode, payload: &T) {
        if !self.is_connected() {
            return;
        }
        let request = OutgoingRequest {
            opcode,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            responder: None,
        };
        if self.outbound.send(request).is_err() {
            warn!("Dropped notification to peer {}: queue closed", self.id);
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// An inbound message being handled by the master.
///
/// Consuming `respond` enforces the single-response contract; notifications
/// carry no responder and silently swallow any reply.
#[derive(Debug)]
pub struct IncomingMessage {
    pub peer: Arc<Peer>,
    pub opcode: OpCode,
    pub payload: Value,
    responder: Option<oneshot::Sender<Response>>,
}

impl IncomingMessage {
    /// Build a request message; the caller keeps the receiving half.
    pub fn request<T: Serialize>(
        peer: Arc<Peer>,
        opcode: OpCode,
        payload: &T,
    ) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            peer,
            opcode,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            responder: Some(tx),
        };
        (message, rx)
    }

    /// Build a notification message (no response channel).
    pub fn notification<T: Serialize>(peer: Arc<Peer>, opcode: OpCode, payload: &T) -> Self {
        Self {
            peer,
            opcode,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            responder: None,
        }
    }

    /// Deserialize the payload into a concrete packet type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Send the one and only response for this message.
    pub fn respond<T: Serialize>(self, payload: &T, status: ResponseStatus) {
        if let Some(responder) = self.responder {
            let _ = responder.send(Response {
                status,
                payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            });
        }
    }

    /// Respond with `Success` and a payload.
    pub fn respond_ok<T: Serialize>(self, payload: &T) {
        self.respond(payload, ResponseStatus::Success);
    }

    /// Respond with a failure status and a reason string.
    pub fn respond_error(self, status: ResponseStatus, reason: impl Into<String>) {
        if let Some(responder) = self.responder {
            let _ = responder.send(Response::error(status, reason));
        }
    }
}
