//! The broker's pub/sub port. Subjects follow `task.<id>.<event>`,
//! `backlog.<id>.<event>`, `stage.<id>.<event>` etc.
//!
//! Two implementations: [`NatsEventBus`] talks to a real NATS/JetStream
//! deployment in production; [`InMemoryEventBus`] is a `tokio::sync::broadcast`
//! backed test double with no external dependency.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::broadcast;

/// A received message: the subject it was published on and its payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Json,
}

/// The broker's publish/subscribe port.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: &Json) -> Result<()>;

    /// Subscribe to a subject (including NATS-style wildcards like
    /// `task.*.completed`). Returns a receiver of matching messages.
    async fn subscribe(&self, subject_filter: &str) -> Result<broadcast::Receiver<Message>>;
}

const _: () = {
    fn assert_object_safe(_: &dyn EventBus) {}
};

fn subject_matches(filter: &str, subject: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('.').collect();
    let subject_parts: Vec<&str> = subject.split('.').collect();

    if filter_parts.last() == Some(&">") {
        let prefix = &filter_parts[..filter_parts.len() - 1];
        return subject_parts.len() >= prefix.len()
            && prefix
                .iter()
                .zip(subject_parts.iter())
                .all(|(f, s)| *f == "*" || f == s);
    }

    filter_parts.len() == subject_parts.len()
        && filter_parts
            .iter()
            .zip(subject_parts.iter())
            .all(|(f, s)| *f == "*" || f == s)
}

/// Production `EventBus` backed by a real NATS/JetStream connection.
pub struct NatsEventBus {
    client: async_nats::Client,
}

impl NatsEventBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {url}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, subject: &str, payload: &Json) -> Result<()> {
        let bytes = serde_json::to_vec(payload).context("failed to serialize event payload")?;
        self.client
            .publish(subject.to_owned(), bytes.into())
            .await
            .with_context(|| format!("failed to publish to subject {subject}"))?;
        Ok(())
    }

    async fn subscribe(&self, subject_filter: &str) -> Result<broadcast::Receiver<Message>> {
        // NATS subscriptions are independent of any local broadcast
        // channel; we bridge them into one here so callers see the same
        // `Receiver<Message>` shape as `InMemoryEventBus`.
        let mut nats_sub = self
            .client
            .subscribe(subject_filter.to_owned())
            .await
            .with_context(|| format!("failed to subscribe to {subject_filter}"))?;

        let (tx, rx) = broadcast::channel(256);
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(msg) = nats_sub.next().await {
                let payload: Json = serde_json::from_slice(&msg.payload).unwrap_or(Json::Null);
                let _ = tx.send(Message {
                    subject: msg.subject.to_string(),
                    payload,
                });
            }
        });
        Ok(rx)
    }
}

/// Test-double `EventBus` backed by an in-process broadcast channel. No
/// network, no external process required.
pub struct InMemoryEventBus {
    tx: broadcast::Sender<Message>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, subject: &str, payload: &Json) -> Result<()> {
        // No receivers is not an error: publishing before anyone has
        // subscribed is normal during startup.
        let _ = self.tx.send(Message {
            subject: subject.to_owned(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn subscribe(&self, subject_filter: &str) -> Result<broadcast::Receiver<Message>> {
        // The underlying channel carries every message; filtering by
        // `subject_filter` happens in a forwarding task so each
        // subscriber only sees what it asked for.
        let mut all = self.tx.subscribe();
        let (tx, rx) = broadcast::channel(256);
        let filter = subject_filter.to_owned();
        tokio::spawn(async move {
            while let Ok(msg) = all.recv().await {
                if subject_matches(&filter, &msg.subject) {
                    let _ = tx.send(msg);
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_subject_matches() {
        assert!(subject_matches("task.123.completed", "task.123.completed"));
        assert!(!subject_matches("task.123.completed", "task.123.failed"));
    }

    #[test]
    fn single_wildcard_matches_one_segment() {
        assert!(subject_matches("task.*.completed", "task.123.completed"));
        assert!(!subject_matches("task.*.completed", "task.123.456.completed"));
    }

    #[test]
    fn trailing_wildcard_matches_any_suffix() {
        assert!(subject_matches("task.>", "task.123.completed"));
        assert!(subject_matches("task.>", "task.123.events.created"));
        assert!(!subject_matches("task.>", "backlog.123.completed"));
    }

    #[tokio::test]
    async fn in_memory_bus_delivers_matching_messages() {
        let bus = InMemoryEventBus::new();
        let mut rx = bus.subscribe("task.*.completed").await.unwrap();

        bus.publish("task.abc.completed", &serde_json::json!({"ok": true}))
            .await
            .unwrap();
        bus.publish("task.abc.failed", &serde_json::json!({"ok": false}))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject, "task.abc.completed");
    }
}
