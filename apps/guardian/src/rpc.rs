//! Request/response correlation over the peer data channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use guardian_proto::{Operation, RequestIds, RpcRequest, RpcResponse};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{GuardianError, GuardianResult};
use crate::signaling::{ChannelSink, SignalingController};

type Settlement = GuardianResult<Value>;

struct PendingRequest {
    generation: u64,
    op: Operation,
    settle: oneshot::Sender<Settlement>,
}

/// In-flight requests keyed by correlation id. Removal from the table is the
/// settlement: whoever removes an entry is the only one allowed to resolve it,
/// and it sends before the lock is released.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn register(&self, id: &str, generation: u64, op: Operation) -> oneshot::Receiver<Settlement> {
        let (settle, rx) = oneshot::channel();
        self.entries.lock().insert(
            id.to_string(),
            PendingRequest {
                generation,
                op,
                settle,
            },
        );
        rx
    }

    fn remove(&self, id: &str) -> Option<PendingRequest> {
        self.entries.lock().remove(id)
    }

    fn settle(&self, id: &str, outcome: Settlement) -> bool {
        let mut entries = self.entries.lock();
        match entries.remove(id) {
            Some(pending) => {
                let _ = pending.settle.send(outcome);
                true
            }
            None => false,
        }
    }

    fn fail_generation(&self, generation: u64, reason: &str) {
        let mut entries = self.entries.lock();
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, pending)| pending.generation == generation)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(pending) = entries.remove(&id) {
                debug!(target = "guardian::rpc", id = %id, op = %pending.op, error = %reason, "failing pending request");
                let _ = pending
                    .settle
                    .send(Err(GuardianError::Transport(reason.to_string())));
            }
        }
    }

    /// Deadline path. Whatever settled the entry first wins: if it is already
    /// gone, its outcome is sitting in `settled`.
    fn expire(&self, id: &str, settled: &mut oneshot::Receiver<Settlement>) -> Settlement {
        if self.remove(id).is_some() {
            return Err(GuardianError::Timeout);
        }
        settled.try_recv().unwrap_or(Err(GuardianError::Timeout))
    }
}

impl ChannelSink for PendingTable {
    fn on_message(&self, generation: u64, text: &str) {
        let response: RpcResponse = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(err) => {
                warn!(target = "guardian::rpc", generation, error = %err, "ignoring unparseable frame");
                return;
            }
        };
        trace!(target = "guardian::rpc", id = %response.id, success = response.success, "response received");
        let id = response.id.clone();
        let outcome = response.into_result().map_err(GuardianError::from);
        if !self.settle(&id, outcome) {
            debug!(target = "guardian::rpc", id = %id, "ignoring response with no pending request");
        }
    }

    fn on_error(&self, generation: u64, reason: &str) {
        self.fail_generation(generation, reason);
    }

    fn on_closed(&self, generation: u64) {
        self.fail_generation(generation, "peer session closed");
    }
}

/// Deregisters a pending request when its caller goes away early.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

#[derive(Clone)]
pub struct RpcMultiplexer {
    controller: SignalingController,
    pending: Arc<PendingTable>,
    ids: Arc<RequestIds>,
    timeout: Duration,
}

impl RpcMultiplexer {
    pub fn new(controller: SignalingController, pending: Arc<PendingTable>, timeout: Duration) -> Self {
        Self {
            controller,
            pending,
            ids: Arc::new(RequestIds::new()),
            timeout,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Sends one operation to the remote signer and waits for its matching
    /// response. Fails with `TransportUnavailable` before sending anything
    /// when no channel is open.
    pub async fn call(&self, op: Operation, params: Value) -> GuardianResult<Value> {
        let Some((generation, channel)) = self.controller.active_channel() else {
            debug!(target = "guardian::rpc", op = %op, "no open data channel");
            return Err(GuardianError::TransportUnavailable);
        };

        let id = self.ids.next_id();
        let frame = serde_json::to_string(&RpcRequest {
            id: id.clone(),
            op,
            params,
        })
        .map_err(|err| GuardianError::Transport(err.to_string()))?;

        let mut settled = self.pending.register(&id, generation, op);
        let _guard = PendingGuard {
            table: &self.pending,
            id: &id,
        };
        debug!(target = "guardian::rpc", id = %id, op = %op, generation, "sending request");
        channel.send_text(frame).await?;

        match tokio::time::timeout(self.timeout, &mut settled).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GuardianError::Transport("request abandoned".into())),
            Err(_) => {
                let outcome = self.pending.expire(&id, &mut settled);
                if matches!(outcome, Err(GuardianError::Timeout)) {
                    warn!(target = "guardian::rpc", id = %id, op = %op, "request timed out");
                }
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extension_bus::{ContextKind, LocalBus, Origin};
    use serde_json::json;
    use transport_webrtc::mock::{MockConnector, MockPeer};

    async fn connected() -> (RpcMultiplexer, Arc<MockPeer>, SignalingController) {
        let connector = Arc::new(MockConnector::new());
        let pending = Arc::new(PendingTable::new());
        let controller = SignalingController::new(
            connector.clone(),
            Arc::new(LocalBus::new()),
            pending.clone(),
            "lan",
            Origin::anonymous(ContextKind::Offscreen),
        );
        controller.request_offer(false).await.unwrap();
        assert!(controller.apply_answer("v=0\r\n").await);
        let peer = connector.latest().unwrap();
        peer.establish();
        while controller.active_channel().is_none() {
            tokio::task::yield_now().await;
        }
        let rpc = RpcMultiplexer::new(controller.clone(), pending, Duration::from_secs(60));
        (rpc, peer, controller)
    }

    fn request_id(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn no_channel_fails_without_sending() {
        let connector = Arc::new(MockConnector::new());
        let pending = Arc::new(PendingTable::new());
        let controller = SignalingController::new(
            connector.clone(),
            Arc::new(LocalBus::new()),
            pending.clone(),
            "lan",
            Origin::anonymous(ContextKind::Offscreen),
        );
        let rpc = RpcMultiplexer::new(controller.clone(), pending, Duration::from_secs(60));
        let err = rpc.call(Operation::GetPublicKey, json!({})).await.unwrap_err();
        assert!(matches!(err, GuardianError::TransportUnavailable));

        // An offered but unopened channel is still unavailable.
        controller.request_offer(false).await.unwrap();
        let err = rpc.call(Operation::GetPublicKey, json!({})).await.unwrap_err();
        assert!(matches!(err, GuardianError::TransportUnavailable));
        assert!(connector.latest().unwrap().sent_frames().is_empty());
        assert_eq!(rpc.pending(), 0);
    }

    #[tokio::test]
    async fn request_frame_shape() {
        let (rpc, peer, _controller) = connected().await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::SignEvent, json!({"event": {"kind": 1}})).await }
        });
        let frames = peer.wait_for_sent(1).await;
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "signEvent");
        assert_eq!(frame["params"]["event"]["kind"], 1);

        let id = frame["id"].as_str().unwrap();
        peer.deliver(json!({"id": id, "success": true, "result": {"sig": "ff"}}).to_string());
        assert_eq!(call.await.unwrap().unwrap(), json!({"sig": "ff"}));
        assert_eq!(rpc.pending(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_settle_their_own_calls() {
        let (rpc, peer, _controller) = connected().await;
        let mut calls = Vec::new();
        for n in 0..3 {
            let rpc = rpc.clone();
            calls.push(tokio::spawn(async move {
                rpc.call(Operation::Nip04Encrypt, json!({"peer": "p", "plaintext": n}))
                    .await
            }));
        }
        let frames = peer.wait_for_sent(3).await;
        let mut requests: Vec<(String, i64)> = frames
            .iter()
            .map(|frame| {
                let value: Value = serde_json::from_str(frame).unwrap();
                (
                    value["id"].as_str().unwrap().to_string(),
                    value["params"]["plaintext"].as_i64().unwrap(),
                )
            })
            .collect();
        requests.reverse();
        for (id, n) in &requests {
            peer.deliver(json!({"id": id, "success": true, "result": format!("cipher-{n}")}).to_string());
        }

        for (n, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), json!(format!("cipher-{n}")));
        }
        let ids: std::collections::HashSet<_> = requests.iter().map(|(id, _)| id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn remote_failure_surfaces_message_and_stack() {
        let (rpc, peer, _controller) = connected().await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::Nip44Decrypt, json!({})).await }
        });
        let frames = peer.wait_for_sent(1).await;
        peer.deliver(
            json!({
                "id": request_id(&frames[0]),
                "success": false,
                "error": {"message": "bad ciphertext", "stack": "at decrypt"}
            })
            .to_string(),
        );
        match call.await.unwrap().unwrap_err() {
            GuardianError::RemoteError { message, stack } => {
                assert_eq!(message, "bad ciphertext");
                assert_eq!(stack.as_deref(), Some("at decrypt"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn late_response_after_timeout_is_ignored() {
        let (rpc, peer, _controller) = connected().await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::GetRelays, json!({})).await }
        });
        let frames = peer.wait_for_sent(1).await;
        let id = request_id(&frames[0]);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GuardianError::Timeout));
        assert_eq!(rpc.pending(), 0);

        peer.deliver(json!({"id": id, "success": true, "result": {}}).to_string());
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(rpc.pending(), 0);
    }

    #[test_timeout::timeout]
    fn settlement_that_beats_the_deadline_wins() {
        let table = PendingTable::new();
        let mut settled = table.register("abc-0", 1, Operation::SignEvent);
        table.on_message(1, &json!({"id": "abc-0", "success": true, "result": "sig"}).to_string());
        assert!(table.is_empty());
        assert_eq!(table.expire("abc-0", &mut settled).unwrap(), json!("sig"));

        let mut unanswered = table.register("abc-1", 1, Operation::SignEvent);
        assert!(matches!(
            table.expire("abc-1", &mut unanswered),
            Err(GuardianError::Timeout)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn channel_error_fails_every_outstanding_call() {
        let (rpc, peer, _controller) = connected().await;
        let first = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::GetPublicKey, json!({})).await }
        });
        let second = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::GetRelays, json!({})).await }
        });
        let frames = peer.wait_for_sent(2).await;

        peer.channel_error("sctp abort");
        for call in [first, second] {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, GuardianError::Transport(reason) if reason == "sctp abort"));
        }
        assert_eq!(rpc.pending(), 0);

        // A response racing in after the error is a no-op.
        peer.deliver(json!({"id": request_id(&frames[0]), "success": true}).to_string());
    }

    #[tokio::test]
    async fn teardown_fails_calls_of_that_session() {
        let (rpc, peer, controller) = connected().await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::SignEvent, json!({})).await }
        });
        peer.wait_for_sent(1).await;
        controller.reset().await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GuardianError::Transport(_)));
        assert!(matches!(
            rpc.call(Operation::SignEvent, json!({})).await,
            Err(GuardianError::TransportUnavailable)
        ));
    }

    #[tokio::test]
    async fn closed_channel_is_unavailable() {
        let (rpc, peer, controller) = connected().await;
        peer.close_channel_remotely();
        while controller.active_channel().is_some() {
            tokio::task::yield_now().await;
        }
        let err = rpc.call(Operation::GetRelays, json!({})).await.unwrap_err();
        assert!(matches!(err, GuardianError::TransportUnavailable));
        assert!(peer.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored() {
        let (rpc, peer, _controller) = connected().await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::GetPublicKey, json!({})).await }
        });
        let frames = peer.wait_for_sent(1).await;
        peer.deliver("not json at all");
        peer.deliver(json!({"id": "someone-else", "success": true}).to_string());
        peer.deliver(json!({"id": request_id(&frames[0]), "success": true, "result": "pk"}).to_string());
        assert_eq!(call.await.unwrap().unwrap(), json!("pk"));
    }

    #[tokio::test]
    async fn dropped_caller_deregisters() {
        let (rpc, peer, _controller) = connected().await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call(Operation::GetPublicKey, json!({})).await }
        });
        peer.wait_for_sent(1).await;
        assert_eq!(rpc.pending(), 1);
        call.abort();
        let _ = call.await;
        assert_eq!(rpc.pending(), 0);
    }
}
