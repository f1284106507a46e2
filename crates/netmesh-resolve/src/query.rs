//! Request/response table queries against the cluster authority.
//!
//! A query publishes a request on the node's request topic and parks a
//! oneshot sender under its key until a matching result arrives on the
//! result topic or the timeout fires. At most one query per key is in
//! flight.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{topics, MessageBus, MessageHandler};
use crate::error::{ResolveError, ResolveResult};
use crate::interests::InterestRegistry;
use crate::messages::{TableQueryRequest, TableQueryResponse};

pub struct ResolutionCache {
    bus: Arc<dyn MessageBus>,
    interests: Arc<InterestRegistry>,
    node_id: String,
    timeout: Duration,
    /// Query key → waiter.
    pending: Mutex<HashMap<String, oneshot::Sender<TableQueryResponse>>>,
}

impl ResolutionCache {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        interests: Arc<InterestRegistry>,
        node_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            interests,
            node_id: node_id.into(),
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Route results published for this node into [`Self::handle_response`].
    pub async fn subscribe(self: &Arc<Self>) -> ResolveResult<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let handler: MessageHandler = Arc::new(move |topic, payload| {
            let cache = cache.clone();
            Box::pin(async move {
                let Some(cache) = cache.upgrade() else {
                    return;
                };
                if let Err(e) = cache.handle_response(&payload) {
                    warn!(%topic, error = %e, "discarding table query result");
                }
            })
        });
        self.bus
            .subscribe(&topics::table_query_result(&self.node_id), handler)
            .await?;
        Ok(())
    }

    /// Ask which instances sit behind a service address.
    ///
    /// Without `force`, an address that already has a standing interest is
    /// refused with [`ResolveError::InterestRegistered`].
    pub async fn query_by_service_ip(&self, ip: IpAddr, force: bool) -> ResolveResult<TableQueryResponse> {
        self.query("", &ip.to_string(), force).await
    }

    /// Ask for every instance of a job.
    pub async fn query_by_job_name(&self, job_name: &str, force: bool) -> ResolveResult<TableQueryResponse> {
        self.query(job_name, "", force).await
    }

    async fn query(&self, sname: &str, sip: &str, force: bool) -> ResolveResult<TableQueryResponse> {
        let key = format!("{sip}{sname}");
        if !force && self.interests.is_registered(&key).await {
            return Err(ResolveError::InterestRegistered(key));
        }

        let rx = {
            let mut pending = self.pending();
            if pending.contains_key(&key) {
                return Err(ResolveError::InProgress(key));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(key.clone(), tx);
            rx
        };

        let request = TableQueryRequest {
            sname: sname.to_string(),
            sip: sip.to_string(),
        };
        let published = match serde_json::to_vec(&request) {
            Ok(payload) => self
                .bus
                .publish(&topics::table_query_request(&self.node_id), payload)
                .await
                .map_err(ResolveError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            self.pending().remove(&key);
            return Err(e);
        }
        debug!(%key, "table query sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending().remove(&key);
                debug!(%key, "table query timed out");
                Err(ResolveError::Timeout(key))
            }
        }
    }

    /// Hand a result to every waiter it answers. Returns how many were woken.
    pub fn handle_response(&self, payload: &[u8]) -> ResolveResult<usize> {
        let response: TableQueryResponse = serde_json::from_slice(payload)?;
        let waiters: Vec<_> = {
            let mut pending = self.pending();
            response
                .correlation_keys()
                .into_iter()
                .filter_map(|key| pending.remove(&key))
                .collect()
        };
        let woken = waiters
            .into_iter()
            .filter_map(|tx| tx.send(response.clone()).ok())
            .count();
        debug!(job = %response.job_name, woken, "table query result");
        Ok(woken)
    }

    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<TableQueryResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
