//! Signing capability exposed to untrusted page script.
//!
//! [`PageBridge`] is the page side: it posts tagged requests onto the page's
//! window bus and waits for the tagged response carrying the same id.
//! Requests and responses share the window topic, so a bridge keeps few
//! enough calls in flight that neither side can fall a whole buffer behind.
//! [`BridgeRelay`] is the content-script side: it picks those requests off the
//! window bus, hands them to the router and posts the answer back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use extension_bus::{Bus, ContextKind, Origin, TOPIC_CAPACITY, TOPIC_WINDOW};
use guardian_proto::{
    Operation, PageOutcome, PageRequest, PageResponse, RemoteFailure, RequestIds, RuntimeMessage,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OnceCell, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GuardianError, GuardianResult};
use crate::router::{MessageRouter, RouterReply};

use crate::config::DEFAULT_RPC_TIMEOUT_MS;

type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<PageOutcome>>>>;

/// Each call puts a request and a response on the window topic.
const MAX_IN_FLIGHT: usize = TOPIC_CAPACITY / 4;

struct PendingCallGuard<'a> {
    calls: &'a PendingCalls,
    id: &'a str,
}

impl Drop for PendingCallGuard<'_> {
    fn drop(&mut self) {
        self.calls.lock().remove(self.id);
    }
}

pub struct PageBridge {
    bus: Arc<dyn Bus>,
    marker: String,
    origin: Origin,
    ids: RequestIds,
    calls: PendingCalls,
    in_flight: Semaphore,
    timeout: Duration,
    public_key: OnceCell<Value>,
    listener: JoinHandle<()>,
}

impl PageBridge {
    /// Starts listening for responses immediately; must be called inside a
    /// tokio runtime.
    pub fn new(bus: Arc<dyn Bus>, marker: impl Into<String>, page_url: impl Into<String>) -> Self {
        let marker = marker.into();
        let calls: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let listener = tokio::spawn(listen_for_responses(
            bus.subscribe(TOPIC_WINDOW),
            calls.clone(),
            marker.clone(),
        ));
        Self {
            bus,
            marker,
            origin: Origin::new(ContextKind::Page, page_url),
            ids: RequestIds::new(),
            calls,
            in_flight: Semaphore::new(MAX_IN_FLIGHT),
            timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            public_key: OnceCell::new(),
            listener,
        }
    }

    /// Bounds how long a call waits for its response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pending(&self) -> usize {
        self.calls.lock().len()
    }

    /// Memoized for the bridge's lifetime after the first success.
    pub async fn get_public_key(&self) -> GuardianResult<Value> {
        self.public_key
            .get_or_try_init(|| self.call(Operation::GetPublicKey, json!({})))
            .await
            .cloned()
    }

    pub async fn sign_event(&self, event: Value) -> GuardianResult<Value> {
        self.call(Operation::SignEvent, json!({ "event": event })).await
    }

    pub async fn get_relays(&self) -> GuardianResult<Value> {
        self.call(Operation::GetRelays, json!({})).await
    }

    pub async fn nip04_encrypt(&self, peer: &str, plaintext: &str) -> GuardianResult<Value> {
        self.call(Operation::Nip04Encrypt, json!({ "peer": peer, "plaintext": plaintext }))
            .await
    }

    pub async fn nip04_decrypt(&self, peer: &str, ciphertext: &str) -> GuardianResult<Value> {
        self.call(Operation::Nip04Decrypt, json!({ "peer": peer, "ciphertext": ciphertext }))
            .await
    }

    pub async fn nip44_encrypt(&self, peer: &str, plaintext: &str) -> GuardianResult<Value> {
        self.call(Operation::Nip44Encrypt, json!({ "peer": peer, "plaintext": plaintext }))
            .await
    }

    pub async fn nip44_decrypt(&self, peer: &str, ciphertext: &str) -> GuardianResult<Value> {
        self.call(Operation::Nip44Decrypt, json!({ "peer": peer, "ciphertext": ciphertext }))
            .await
    }

    async fn call(&self, op: Operation, params: Value) -> GuardianResult<Value> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| GuardianError::Transport("page bridge closed".into()))?;
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(id.clone(), tx);
        let _guard = PendingCallGuard {
            calls: &self.calls,
            id: &id,
        };

        info!(target = "guardian::bridge", id = %id, op = %op, params = %params, "calling");
        let request = PageRequest {
            id: id.clone(),
            ext: self.marker.clone(),
            kind: op.as_str().to_string(),
            params,
        };
        let payload = serde_json::to_value(&request)
            .map_err(|err| GuardianError::Transport(err.to_string()))?;
        self.bus.publish(TOPIC_WINDOW, self.origin.clone(), payload)?;

        let outcome = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(GuardianError::Transport("page bridge stopped listening".into()));
            }
            Err(_) => {
                warn!(target = "guardian::bridge", id = %id, op = %op, "page call timed out");
                return Err(GuardianError::Timeout);
            }
        };
        if outcome.success {
            debug!(target = "guardian::bridge", id = %id, "result received");
            return Ok(outcome.result.unwrap_or(Value::Null));
        }
        let failure = outcome
            .error
            .unwrap_or_else(|| RemoteFailure::new("unknown error"));
        debug!(target = "guardian::bridge", id = %id, error = %failure.message, "call failed");
        Err(GuardianError::RemoteError {
            message: format!("{}: {}", self.marker, failure.message),
            stack: failure.stack,
        })
    }
}

impl Drop for PageBridge {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen_for_responses(
    mut window: tokio::sync::broadcast::Receiver<extension_bus::BusMessage>,
    calls: PendingCalls,
    marker: String,
) {
    loop {
        let message = match window.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                // Any outstanding call may have lost its response.
                let lost: Vec<_> = calls.lock().drain().collect();
                warn!(
                    target = "guardian::bridge",
                    skipped,
                    failed = lost.len(),
                    "window listener lagged"
                );
                for (_, settle) in lost {
                    let _ = settle.send(PageOutcome::from_result(Err(RemoteFailure::new(
                        "response lost on the window bus",
                    ))));
                }
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(response) = PageResponse::from_window(&message.payload, &marker) else {
            continue;
        };
        let pending = calls.lock().remove(&response.id);
        if let Some(settle) = pending {
            let _ = settle.send(response.response);
        }
    }
}

/// Content-script side of the page bridge.
pub struct BridgeRelay {
    handle: JoinHandle<()>,
}

impl BridgeRelay {
    pub fn spawn(bus: Arc<dyn Bus>, router: Arc<MessageRouter>, marker: impl Into<String>) -> Self {
        let marker = marker.into();
        let window = bus.subscribe(TOPIC_WINDOW);
        let handle = tokio::spawn(relay_requests(bus, window, router, marker));
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for BridgeRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn relay_requests(
    bus: Arc<dyn Bus>,
    mut window: tokio::sync::broadcast::Receiver<extension_bus::BusMessage>,
    router: Arc<MessageRouter>,
    marker: String,
) {
    loop {
        let message = match window.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                // Skipped requests cannot be answered; their callers hit their deadline.
                error!(target = "guardian::bridge", skipped, "relay dropped page requests");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(request) = PageRequest::from_window(&message.payload, &marker) else {
            continue;
        };
        let Some(op) = Operation::parse(&request.kind) else {
            debug!(target = "guardian::bridge", kind = %request.kind, "ignoring unknown page request");
            continue;
        };
        let sender = Origin {
            context: ContextKind::ContentScript,
            url: message.origin.url.clone(),
        };
        let bus = bus.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let reply = router
                .dispatch(
                    RuntimeMessage::Operation {
                        op,
                        params: request.params,
                    },
                    &sender,
                )
                .await;
            let response = match reply {
                Some(RouterReply::Outcome(outcome)) => outcome,
                Some(RouterReply::Failure(failure)) => PageOutcome::from_result(Err(failure)),
                _ => PageOutcome::from_result(Err(RemoteFailure::new("no reply from extension"))),
            };
            let payload = match serde_json::to_value(PageResponse {
                id: request.id,
                ext: request.ext,
                response,
            }) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(target = "guardian::bridge", error = %err, "failed to encode page response");
                    return;
                }
            };
            if let Err(err) = bus.publish(TOPIC_WINDOW, sender, payload) {
                warn!(target = "guardian::bridge", error = %err, "failed to post page response");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extension_bus::LocalBus;

    /// Answers window requests the way the relay would, from a script.
    fn scripted_extension(
        bus: Arc<LocalBus>,
        answer: impl Fn(&PageRequest) -> PageOutcome + Send + 'static,
    ) -> JoinHandle<Vec<PageRequest>> {
        let mut window = bus.subscribe(TOPIC_WINDOW);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(message) = window.recv().await {
                if let Some(request) = PageRequest::from_window(&message.payload, "nos2x") {
                    let response = PageResponse {
                        id: request.id.clone(),
                        ext: request.ext.clone(),
                        response: answer(&request),
                    };
                    seen.push(request);
                    bus.publish(
                        TOPIC_WINDOW,
                        Origin::anonymous(ContextKind::ContentScript),
                        serde_json::to_value(response).unwrap(),
                    )
                    .unwrap();
                    if seen.len() == 2 {
                        break;
                    }
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn public_key_is_memoized() {
        let bus = Arc::new(LocalBus::new());
        let extension = scripted_extension(bus.clone(), |_| {
            PageOutcome::from_result(Ok(json!("f00dface")))
        });
        let bridge = PageBridge::new(bus.clone(), "nos2x", "https://app.example/");

        assert_eq!(bridge.get_public_key().await.unwrap(), json!("f00dface"));
        assert_eq!(bridge.get_public_key().await.unwrap(), json!("f00dface"));

        // Only the relay call below reaches the extension after the first key.
        assert_eq!(bridge.get_relays().await.unwrap(), json!("f00dface"));
        let seen = extension.await.unwrap();
        let kinds: Vec<_> = seen.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["getPublicKey", "getRelays"]);
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn failures_carry_marker_and_stack() {
        let bus = Arc::new(LocalBus::new());
        let _extension = scripted_extension(bus.clone(), |_| {
            PageOutcome::from_result(Err(RemoteFailure {
                message: "user rejected".into(),
                stack: Some("at approve (signer.js:9)".into()),
            }))
        });
        let bridge = PageBridge::new(bus.clone(), "nos2x", "https://app.example/");

        match bridge.sign_event(json!({"kind": 1})).await.unwrap_err() {
            GuardianError::RemoteError { message, stack } => {
                assert_eq!(message, "nos2x: user rejected");
                assert_eq!(stack.as_deref(), Some("at approve (signer.js:9)"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn params_follow_provider_shapes() {
        let bus = Arc::new(LocalBus::new());
        let extension = scripted_extension(bus.clone(), |request| {
            PageOutcome::from_result(Ok(request.params.clone()))
        });
        let bridge = PageBridge::new(bus.clone(), "nos2x", "https://app.example/");

        let echoed = bridge.nip44_encrypt("peer-pk", "hello").await.unwrap();
        assert_eq!(echoed, json!({"peer": "peer-pk", "plaintext": "hello"}));
        let echoed = bridge.nip04_decrypt("peer-pk", "Zm9v?iv=YmFy").await.unwrap();
        assert_eq!(echoed, json!({"peer": "peer-pk", "ciphertext": "Zm9v?iv=YmFy"}));

        let seen = extension.await.unwrap();
        assert_eq!(seen[0].kind, "nip44.encrypt");
        assert_eq!(seen[1].kind, "nip04.decrypt");
        assert_ne!(seen[0].id, seen[1].id);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn unanswered_call_times_out() {
        let bus = Arc::new(LocalBus::new());
        let bridge = PageBridge::new(bus.clone(), "nos2x", "https://app.example/")
            .with_timeout(Duration::from_secs(60));

        let started = tokio::time::Instant::now();
        let err = bridge.sign_event(json!({"kind": 1})).await.unwrap_err();
        assert!(matches!(err, GuardianError::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn lagged_listener_fails_outstanding_calls() {
        let bus = Arc::new(LocalBus::new());
        let bridge = PageBridge::new(bus.clone(), "nos2x", "https://app.example/");
        let mut window = bus.subscribe(TOPIC_WINDOW);

        let call = bridge.get_relays();
        tokio::pin!(call);
        tokio::select! {
            _ = &mut call => panic!("call settled without a response"),
            message = window.recv() => assert!(message.is_ok()),
        }

        // Flood the window before the listener gets to run again.
        let origin = Origin::anonymous(ContextKind::Page);
        for n in 0..TOPIC_CAPACITY + 1 {
            bus.publish(TOPIC_WINDOW, origin.clone(), json!({"noise": n})).unwrap();
        }
        match call.await.unwrap_err() {
            GuardianError::RemoteError { message, .. } => {
                assert_eq!(message, "nos2x: response lost on the window bus");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn foreign_marker_responses_are_ignored() {
        let bus = Arc::new(LocalBus::new());
        let bridge = PageBridge::new(bus.clone(), "nos2x", "https://app.example/");
        let mut window = bus.subscribe(TOPIC_WINDOW);

        let call = bridge.get_relays();
        tokio::pin!(call);
        let request = loop {
            tokio::select! {
                _ = &mut call => panic!("call settled without a response"),
                message = window.recv() => {
                    if let Some(request) = PageRequest::from_window(&message.unwrap().payload, "nos2x") {
                        break request;
                    }
                }
            }
        };

        let origin = Origin::anonymous(ContextKind::ContentScript);
        bus.publish(
            TOPIC_WINDOW,
            origin.clone(),
            json!({"id": request.id, "ext": "other", "response": {"success": true, "result": "spoof"}}),
        )
        .unwrap();
        bus.publish(
            TOPIC_WINDOW,
            origin,
            json!({"id": request.id, "ext": "nos2x", "response": {"success": true, "result": {"wss://relay": {"read": true}}}}),
        )
        .unwrap();

        assert_eq!(call.await.unwrap(), json!({"wss://relay": {"read": true}}));
    }
}
