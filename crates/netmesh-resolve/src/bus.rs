//! Message bus seam towards the cluster.
//!
//! The wire client lives outside this crate; everything here talks to a
//! [`MessageBus`]. [`LocalBus`] is the in-process implementation used by the
//! standalone daemon. Tests use its recording variant.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::BusResult;

/// Callback invoked with `(topic, payload)` for every delivered message.
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) -> BoxFuture + Send + Sync>;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Deliver messages on `topic` to `handler`, replacing any earlier one.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> BusResult<()>;

    async fn unsubscribe(&self, topic: &str) -> BusResult<()>;
}

/// Topic names, all scoped below the node's own prefix except job updates.
pub mod topics {
    pub fn table_query_request(node_id: &str) -> String {
        format!("nodes/{node_id}/net/tablequery/request")
    }

    pub fn table_query_result(node_id: &str) -> String {
        format!("nodes/{node_id}/net/tablequery/result")
    }

    pub fn interest_remove(node_id: &str) -> String {
        format!("nodes/{node_id}/net/interest/remove")
    }

    pub fn job_updates(job_name: &str) -> String {
        format!("jobs/{job_name}/updates_available")
    }
}

#[derive(Default)]
struct LocalBusInner {
    handlers: RwLock<HashMap<String, MessageHandler>>,
    /// `None` unless built with [`LocalBus::recording`].
    published: Option<RwLock<Vec<(String, Vec<u8>)>>>,
}

/// In-process bus with exact topic matching.
///
/// Handlers run on their own tasks, so a handler may publish again without
/// deadlocking.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that also keeps every published message for inspection.
    pub fn recording() -> Self {
        Self {
            inner: Arc::new(LocalBusInner {
                handlers: RwLock::default(),
                published: Some(RwLock::default()),
            }),
        }
    }

    /// Every message published so far, in order. Always empty unless the
    /// bus is recording.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        match &self.inner.published {
            Some(published) => published
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            None => Vec::new(),
        }
    }

    /// Messages published on `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BusResult<()> {
        trace!(topic, bytes = payload.len(), "publish");
        if let Some(published) = &self.inner.published {
            published
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic.to_string(), payload.clone()));
        }

        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned();
        if let Some(handler) = handler {
            tokio::spawn(handler(topic.to_string(), payload));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> BusResult<()> {
        debug!(topic, "subscribed");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        debug!(topic, "unsubscribed");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivers_to_exact_topic() {
        let bus = LocalBus::recording();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |topic, payload| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((topic, payload));
            })
        });
        bus.subscribe("jobs/a/updates_available", handler).await.unwrap();

        bus.publish("jobs/b/updates_available", b"ignored".to_vec()).await.unwrap();
        bus.publish("jobs/a/updates_available", b"hit".to_vec()).await.unwrap();

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "jobs/a/updates_available");
        assert_eq!(payload, b"hit");
        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.published_on("jobs/b/updates_available").len(), 1);

        bus.unsubscribe("jobs/a/updates_available").await.unwrap();
        assert!(!bus.is_subscribed("jobs/a/updates_available"));
    }

    #[tokio::test]
    async fn plain_bus_keeps_no_history() {
        let bus = LocalBus::new();
        for i in 0..1000u32 {
            bus.publish("nodes/n1/net/tablequery/request", i.to_be_bytes().to_vec())
                .await
                .unwrap();
        }
        assert!(bus.published().is_empty());
        assert!(bus.published_on("nodes/n1/net/tablequery/request").is_empty());
    }

    #[test]
    fn topic_names() {
        assert_eq!(topics::table_query_request("n1"), "nodes/n1/net/tablequery/request");
        assert_eq!(topics::table_query_result("n1"), "nodes/n1/net/tablequery/result");
        assert_eq!(topics::interest_remove("n1"), "nodes/n1/net/interest/remove");
        assert_eq!(topics::job_updates("a.b.c.d"), "jobs/a.b.c.d/updates_available");
    }
}
