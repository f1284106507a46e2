//! Standing interests in remote jobs.
//!
//! Registering an interest subscribes to the job's update topic and starts
//! an idle watcher. Every table hit for the job resets the watcher; when it
//! fires and no local instance of the job is deployed, the interest is
//! withdrawn from the cluster and the job's rows are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{topics, MessageBus, MessageHandler};
use crate::error::ResolveResult;
use crate::events::{Event, EventBus, EventKind};
use crate::messages::InterestRemoveRequest;

/// What an interest does to the local state it protects.
#[async_trait]
pub trait JobActions: Send + Sync {
    /// Re-query the job and replace its rows.
    async fn refresh_service_table(&self, job_name: &str);

    fn remove_service_entries(&self, job_name: &str);

    /// Whether an instance of the job runs on this node.
    fn is_service_deployed(&self, job_name: &str) -> bool;
}

struct InterestSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct InterestRegistry {
    bus: Arc<dyn MessageBus>,
    events: Arc<EventBus>,
    node_id: String,
    idle_timeout: Duration,
    /// Interest key (job name or service address) → watcher.
    interests: RwLock<HashMap<String, InterestSlot>>,
}

impl InterestRegistry {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        events: Arc<EventBus>,
        node_id: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            events,
            node_id: node_id.into(),
            idle_timeout,
            interests: RwLock::new(HashMap::new()),
        }
    }

    /// Register an interest in `job_name`. Registering twice is a no-op.
    pub async fn register(self: &Arc<Self>, job_name: &str, actions: Arc<dyn JobActions>) -> ResolveResult<()> {
        let mut interests = self.interests.write().await;
        if interests.contains_key(job_name) {
            return Ok(());
        }

        let weak_actions = Arc::downgrade(&actions);
        let handler: MessageHandler = Arc::new(move |topic, _payload| {
            let actions = weak_actions.clone();
            Box::pin(async move {
                let Some(actions) = actions.upgrade() else {
                    return;
                };
                let Some(job) = topic
                    .strip_prefix("jobs/")
                    .and_then(|rest| rest.strip_suffix("/updates_available"))
                else {
                    return;
                };
                debug!(job, "job update announced");
                actions.refresh_service_table(job).await;
            })
        });
        self.bus.subscribe(&topics::job_updates(job_name), handler).await?;

        let activity = match self.events.register(EventKind::TableQuery, job_name) {
            Ok(rx) => rx,
            Err(e) => {
                let _ = self.bus.unsubscribe(&topics::job_updates(job_name)).await;
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::downgrade(self);
        let actions = Arc::downgrade(&actions);
        let job = job_name.to_string();
        let idle_timeout = self.idle_timeout;
        let handle = tokio::spawn(async move {
            run_idle_loop(job, idle_timeout, registry, actions, activity, shutdown_rx).await;
        });

        interests.insert(job_name.to_string(), InterestSlot { handle, shutdown_tx });
        info!(job = job_name, "interest registered");
        Ok(())
    }

    pub async fn is_registered(&self, job_name: &str) -> bool {
        self.interests.read().await.contains_key(job_name)
    }

    /// Keys with a standing interest, sorted.
    pub async fn active(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.interests.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop every watcher without withdrawing interests from the cluster.
    pub async fn stop_all(&self) {
        let mut interests = self.interests.write().await;
        for (job, slot) in interests.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            self.events.deregister(EventKind::TableQuery, &job);
            debug!(%job, "interest watcher stopped");
        }
    }

    /// Withdraw an idle interest and drop the job's rows.
    async fn expire(&self, job_name: &str, actions: &dyn JobActions) {
        let request = InterestRemoveRequest {
            appname: job_name.to_string(),
        };
        match serde_json::to_vec(&request) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&topics::interest_remove(&self.node_id), payload).await {
                    warn!(job = job_name, error = %e, "failed to withdraw interest");
                }
            }
            Err(e) => warn!(job = job_name, error = %e, "failed to encode interest removal"),
        }
        if let Err(e) = self.bus.unsubscribe(&topics::job_updates(job_name)).await {
            warn!(job = job_name, error = %e, "failed to unsubscribe from job updates");
        }
        self.interests.write().await.remove(job_name);
        self.events.deregister(EventKind::TableQuery, job_name);
        actions.remove_service_entries(job_name);
        info!(job = job_name, "interest expired");
    }
}

async fn run_idle_loop(
    job: String,
    idle_timeout: Duration,
    registry: Weak<InterestRegistry>,
    actions: Weak<dyn JobActions>,
    mut activity: mpsc::Receiver<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = activity.recv() => {
                if event.is_none() {
                    break;
                }
            }
            _ = tokio::time::sleep(idle_timeout) => {
                let (Some(registry), Some(actions)) = (registry.upgrade(), actions.upgrade()) else {
                    break;
                };
                if actions.is_service_deployed(&job) {
                    debug!(%job, "job deployed locally, keeping interest");
                    continue;
                }
                registry.expire(&job, actions.as_ref()).await;
                break;
            }
        }
    }
}
