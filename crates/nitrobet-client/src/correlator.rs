//! Matches inbound replies to outstanding requests by id.
//!
//! Each request gets exactly one outcome: the reply, a remote error, a timeout,
//! or a disconnect. A reply that arrives after its request timed out is logged
//! and dropped. Frames that match no request are handed back to the caller as
//! unsolicited messages for the router.

use crate::error::{ClientError, Result};
use crate::signer::{SignError, SignRequest, Signer};
use crate::transport::Transport;
use nitrobet_core::message;
use nitrobet_core::{RequestFrame, ResponseFrame, RpcPayload, ServerMessage};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// How many timed-out ids are remembered for late-reply detection.
const EXPIRED_MEMORY: usize = 256;

type Outcome = Result<ServerMessage>;

struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Outcome>,
    created_at: Instant,
    deadline: Instant,
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Completed the pending request with this id.
    Resolved(u64),
    /// Reply for a request that already timed out; dropped.
    Late(u64),
    /// Not a reply to anything outstanding.
    Unsolicited(ServerMessage),
    /// Could not be decoded.
    Malformed(String),
}

#[derive(Default)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    expired: Mutex<VecDeque<u64>>,
    transport: Mutex<Option<Transport>>,
    signer: Mutex<Option<Arc<dyn Signer>>>,
    /// Unix seconds after which the auth session must be redone.
    session_expiry: Mutex<Option<u64>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route subsequent requests through `transport`.
    pub fn attach(&self, transport: Transport) {
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(transport);
        }
    }

    /// Drop the transport and fail everything outstanding with `NotConnected`.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.transport.lock() {
            *slot = None;
        }
        let drained: Vec<(u64, PendingRequest)> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (id, request) in drained {
            tracing::debug!(request_id = id, method = %request.method, "failing request on disconnect");
            let _ = request.reply.send(Err(ClientError::NotConnected));
        }
    }

    /// Sign every subsequent request with `signer`, or stop signing.
    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        if let Ok(mut slot) = self.signer.lock() {
            *slot = signer;
        }
    }

    /// Refuse requests once the unix time reaches `expires_at`. `None` lifts the limit.
    pub fn set_session_expiry(&self, expires_at: Option<u64>) {
        if let Ok(mut slot) = self.session_expiry.lock() {
            *slot = expires_at;
        }
    }

    /// Whether an installed session limit has passed.
    pub fn session_expired(&self) -> bool {
        let expiry = self.session_expiry.lock().ok().and_then(|e| *e);
        expiry.is_some_and(|at| nitrobet_core::now_millis() / 1000 >= at)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Issue a request, signed by the installed signer if any.
    pub async fn request<P: Serialize>(
        &self,
        method_tag: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<ServerMessage> {
        self.send_request(method_tag, params, None, timeout).await
    }

    /// Issue a request carrying explicit signatures.
    pub async fn request_with_sig<P: Serialize>(
        &self,
        method_tag: &str,
        params: &P,
        sig: Vec<String>,
        timeout: Duration,
    ) -> Result<ServerMessage> {
        self.send_request(method_tag, params, Some(sig), timeout).await
    }

    async fn send_request<P: Serialize>(
        &self,
        method_tag: &str,
        params: &P,
        sig: Option<Vec<String>>,
        timeout: Duration,
    ) -> Result<ServerMessage> {
        if self.session_expired() {
            tracing::warn!(method = method_tag, "auth session expired, refusing request");
            return Err(ClientError::InvalidState {
                operation: "send a request",
                state: "auth session expired".to_string(),
            });
        }
        let transport = self
            .transport
            .lock()
            .ok()
            .and_then(|t| t.clone())
            .ok_or(ClientError::NotConnected)?;

        let params = serde_json::to_value(params).map_err(|e| ClientError::Remote {
            method: method_tag.to_string(),
            message: format!("unserializable params: {e}"),
        })?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = RpcPayload::new(id, method_tag, params, nitrobet_core::now_millis());

        let sig = match sig {
            Some(sig) => sig,
            None => self.sign(&payload).await?,
        };

        let text = serde_json::to_string(&RequestFrame { req: payload, sig }).map_err(|e| {
            ClientError::Remote {
                method: method_tag.to_string(),
                message: format!("unserializable frame: {e}"),
            }
        })?;

        let (reply, mut rx) = oneshot::channel();
        let now = Instant::now();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                id,
                PendingRequest {
                    method: method_tag.to_string(),
                    reply,
                    created_at: now,
                    deadline: now + timeout,
                },
            );
        }

        tracing::debug!(request_id = id, method = method_tag, "sending request");
        if let Err(e) = transport.send(text) {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                if self.expire(id) {
                    tracing::warn!(request_id = id, method = method_tag, "request timed out");
                    Err(ClientError::Timeout {
                        method: method_tag.to_string(),
                        after: timeout,
                    })
                } else {
                    // The reply claimed the entry just as the deadline passed.
                    rx.try_recv().unwrap_or(Err(ClientError::Timeout {
                        method: method_tag.to_string(),
                        after: timeout,
                    }))
                }
            }
        }
    }

    async fn sign(&self, payload: &RpcPayload) -> Result<Vec<String>> {
        let signer = self.signer.lock().ok().and_then(|s| s.clone());
        let Some(signer) = signer else {
            return Ok(Vec::new());
        };
        match signer.sign(&SignRequest::rpc(&payload.signing_bytes())).await {
            Ok(sig) => Ok(vec![sig.0]),
            Err(SignError::Rejected) => Err(ClientError::SignatureDenied(format!(
                "request '{}' was not signed",
                payload.method()
            ))),
            Err(e) => Err(ClientError::SignatureDenied(e.to_string())),
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Remove a timed-out entry. Returns false if a reply already claimed it.
    fn expire(&self, id: u64) -> bool {
        let removed = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&id))
            .is_some();
        if removed && let Ok(mut expired) = self.expired.lock() {
            if expired.len() >= EXPIRED_MEMORY {
                expired.pop_front();
            }
            expired.push_back(id);
        }
        removed
    }

    fn take_expired(&self, id: u64) -> bool {
        let Ok(mut expired) = self.expired.lock() else {
            return false;
        };
        match expired.iter().position(|&e| e == id) {
            Some(i) => {
                expired.remove(i);
                true
            }
            None => false,
        }
    }

    /// Handle one inbound text frame.
    pub fn on_message(&self, raw: &str) -> Dispatch {
        let frame = match ResponseFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping undecodable frame: {}", e);
                return Dispatch::Malformed(e.to_string());
            }
        };
        let id = frame.res.id();
        let method_tag = frame.res.method().to_string();

        // Even if a push's id collides with a pending request.
        if !message::is_push(&method_tag) {
            let entry = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
            if let Some(request) = entry {
                let outcome = match frame.error_message() {
                    Some(message) => Err(ClientError::Remote {
                        method: request.method.clone(),
                        message,
                    }),
                    None => ServerMessage::decode(&method_tag, frame.res.2).map_err(ClientError::from),
                };
                tracing::debug!(
                    request_id = id,
                    method = %request.method,
                    elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                    overdue = Instant::now() > request.deadline,
                    "reply received"
                );
                let _ = request.reply.send(outcome);
                return Dispatch::Resolved(id);
            }

            if self.take_expired(id) {
                tracing::warn!(request_id = id, method = %method_tag, "late reply after timeout dropped");
                return Dispatch::Late(id);
            }
        }

        match ServerMessage::decode(&method_tag, frame.res.2) {
            Ok(message) => Dispatch::Unsolicited(message),
            Err(e) => {
                tracing::warn!(method = %method_tag, "dropping malformed push: {}", e);
                Dispatch::Malformed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::LocalSigner;
    use nitrobet_core::message::{AuthChallenge, BalanceUpdate, method};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn setup() -> (Arc<Correlator>, mpsc::UnboundedReceiver<Message>) {
        let (transport, rx) = Transport::loopback();
        let correlator = Arc::new(Correlator::new());
        correlator.attach(transport);
        (correlator, rx)
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Message>) -> RequestFrame {
        match rx.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn reply(id: u64, method_tag: &str, params: serde_json::Value) -> String {
        serde_json::to_string(&ResponseFrame::new(id, method_tag, params, 1)).unwrap()
    }

    #[tokio::test]
    async fn resolves_matching_reply() {
        let (correlator, mut rx) = setup();
        let c = correlator.clone();
        let call = tokio::spawn(async move {
            c.request(method::AUTH_REQUEST, &json!({}), Duration::from_secs(5)).await
        });

        let sent = next_request(&mut rx).await;
        assert_eq!(sent.req.method(), method::AUTH_REQUEST);
        let dispatch = correlator.on_message(&reply(
            sent.req.id(),
            method::AUTH_CHALLENGE,
            json!({ "challenge_message": "nonce-1" }),
        ));
        assert_eq!(dispatch, Dispatch::Resolved(sent.req.id()));

        let msg = call.await.unwrap().unwrap();
        assert_eq!(
            msg,
            ServerMessage::AuthChallenge(AuthChallenge { challenge_message: "nonce-1".into() })
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let (correlator, mut rx) = setup();
        for _ in 0..3 {
            let c = correlator.clone();
            tokio::spawn(async move {
                let _ = c.request(method::GET_CONFIG, &json!({}), Duration::from_millis(50)).await;
            });
        }
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(next_request(&mut rx).await.req.id());
        }
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unmatched_reply_is_unsolicited() {
        let (correlator, _rx) = setup();
        let dispatch = correlator.on_message(&reply(42, method::BALANCE_UPDATE, json!({ "balance_updates": [] })));
        assert_eq!(
            dispatch,
            Dispatch::Unsolicited(ServerMessage::BalanceUpdate(BalanceUpdate { balance_updates: vec![] }))
        );
    }

    #[tokio::test]
    async fn push_with_colliding_id_does_not_resolve() {
        let (correlator, mut rx) = setup();
        let c = correlator.clone();
        let call = tokio::spawn(async move {
            c.request(method::GET_CONFIG, &json!({}), Duration::from_millis(200)).await
        });
        let sent = next_request(&mut rx).await;

        let dispatch = correlator.on_message(&reply(
            sent.req.id(),
            method::BALANCE_UPDATE,
            json!({ "balance_updates": [] }),
        ));
        assert!(matches!(dispatch, Dispatch::Unsolicited(_)));
        assert_eq!(correlator.pending_count(), 1);

        assert!(call.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn timeout_then_late_reply_has_one_outcome() {
        let (correlator, mut rx) = setup();
        let c = correlator.clone();
        let call = tokio::spawn(async move {
            c.request(method::RESIZE_CHANNEL, &json!({}), Duration::from_millis(30)).await
        });
        let sent = next_request(&mut rx).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Timeout { ref method, .. } if method == "resize_channel"));
        assert_eq!(correlator.pending_count(), 0);

        let late = correlator.on_message(&reply(sent.req.id(), method::RESIZE_CHANNEL, json!({})));
        assert_eq!(late, Dispatch::Late(sent.req.id()));

        // A second copy is no longer recognized as late.
        let again = correlator.on_message(&reply(sent.req.id(), "resize_channel", json!({ "x": 1 })));
        assert!(matches!(again, Dispatch::Malformed(_)));
    }

    #[tokio::test]
    async fn error_field_is_remote_error() {
        let (correlator, mut rx) = setup();
        let c = correlator.clone();
        let call = tokio::spawn(async move {
            c.request(method::CREATE_CHANNEL, &json!({}), Duration::from_secs(5)).await
        });
        let sent = next_request(&mut rx).await;
        correlator.on_message(
            &serde_json::to_string(&ResponseFrame::error(sent.req.id(), "insufficient funds", 1)).unwrap(),
        );
        let err = call.await.unwrap().unwrap_err();
        assert!(
            matches!(err, ClientError::Remote { ref method, ref message } if method == "create_channel" && message == "insufficient funds")
        );
    }

    #[tokio::test]
    async fn detach_fails_outstanding() {
        let (correlator, mut rx) = setup();
        let c = correlator.clone();
        let call = tokio::spawn(async move {
            c.request(method::GET_CHANNELS, &json!({}), Duration::from_secs(5)).await
        });
        next_request(&mut rx).await;
        correlator.detach();
        assert!(call.await.unwrap().unwrap_err().is_disconnect());

        let err = correlator
            .request(method::GET_CHANNELS, &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn installed_signer_signs_requests() {
        let (correlator, mut rx) = setup();
        let address = format!("0x{}", "a".repeat(40)).parse().unwrap();
        correlator.set_signer(Some(Arc::new(LocalSigner::new(address, "k"))));
        let c = correlator.clone();
        tokio::spawn(async move {
            let _ = c.request(method::GET_CONFIG, &json!({}), Duration::from_millis(50)).await;
        });
        let sent = next_request(&mut rx).await;
        assert_eq!(sent.sig.len(), 1);
        assert!(sent.sig[0].starts_with("0x"));
    }

    #[tokio::test]
    async fn rejected_request_signature_is_denied() {
        let (correlator, _rx) = setup();
        let address = format!("0x{}", "a".repeat(40)).parse().unwrap();
        correlator.set_signer(Some(Arc::new(LocalSigner::rejecting(address))));
        let err = correlator
            .request(method::GET_CONFIG, &json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::SignatureDenied(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn expired_session_refuses_requests() {
        let (correlator, mut rx) = setup();
        correlator.set_session_expiry(Some(1));
        assert!(correlator.session_expired());
        let err = correlator
            .request(method::GET_CONFIG, &json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
        assert!(rx.try_recv().is_err());

        correlator.set_session_expiry(None);
        assert!(!correlator.session_expired());
    }
}
