//! Cross-context messaging for the guardian extension.
//!
//! Contexts (background, offscreen host, popup, content script, page) share no
//! memory; they only exchange [`BusMessage`]s. Every message carries the
//! [`Origin`] the platform vouches for, which is what the trust boundary
//! checks before acting on control traffic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Extension-internal broadcasts (`CONNECTION_ESTABLISHED` and friends).
pub const TOPIC_RUNTIME: &str = "runtime";
/// The page's ambient message bus; any listener can observe it.
pub const TOPIC_WINDOW: &str = "window";

/// Messages a topic buffers before its slowest receiver starts losing them.
pub const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Background,
    Offscreen,
    Popup,
    Options,
    ContentScript,
    Page,
}

/// Sender identity as reported by the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub context: ContextKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Origin {
    pub fn new(context: ContextKind, url: impl Into<String>) -> Self {
        Self {
            context,
            url: Some(url.into()),
        }
    }

    pub fn anonymous(context: ContextKind) -> Self {
        Self { context, url: None }
    }

    /// True when the reported url begins with `prefix`. Senders without a
    /// url never match.
    pub fn url_starts_with(&self, prefix: &str) -> bool {
        self.url
            .as_deref()
            .is_some_and(|url| url.starts_with(prefix))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub origin: Origin,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no listeners on topic {0}")]
    NoListeners(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, origin: Origin, payload: Value) -> BusResult<()>;
}

/// In-process bus used when every context lives in one runtime, and by tests.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, origin: Origin, payload: Value) -> BusResult<()> {
        let sender = self.sender_for(topic);
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                origin,
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::NoListeners(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_bus_carries_origin() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(TOPIC_RUNTIME);
        let origin = Origin::new(ContextKind::Offscreen, "chrome-extension://abc/offscreen.html");
        bus.publish(
            TOPIC_RUNTIME,
            origin.clone(),
            json!({"type": "CONNECTION_ESTABLISHED"}),
        )
        .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, TOPIC_RUNTIME);
        assert_eq!(msg.origin, origin);
        assert_eq!(msg.payload["type"], "CONNECTION_ESTABLISHED");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut window = bus.subscribe(TOPIC_WINDOW);
        let _runtime = bus.subscribe(TOPIC_RUNTIME);
        bus.publish(
            TOPIC_RUNTIME,
            Origin::anonymous(ContextKind::Background),
            json!({"n": 1}),
        )
        .unwrap();
        bus.publish(
            TOPIC_WINDOW,
            Origin::anonymous(ContextKind::Page),
            json!({"n": 2}),
        )
        .unwrap();
        let msg = window.recv().await.unwrap();
        assert_eq!(msg.payload["n"], 2);
        assert!(window.try_recv().is_err());
    }

    #[test]
    fn publish_without_listeners_reports_topic() {
        let bus = LocalBus::new();
        let err = bus
            .publish(
                TOPIC_RUNTIME,
                Origin::anonymous(ContextKind::Offscreen),
                json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, BusError::NoListeners(topic) if topic == TOPIC_RUNTIME));
    }

    #[test]
    fn url_prefix_match_requires_url() {
        let popup = Origin::new(ContextKind::Popup, "chrome-extension://abc/popup.html?x=1");
        assert!(popup.url_starts_with("chrome-extension://abc/popup.html"));
        assert!(!popup.url_starts_with("chrome-extension://evil/popup.html"));
        assert!(!Origin::anonymous(ContextKind::Popup).url_starts_with(""));
    }
}
