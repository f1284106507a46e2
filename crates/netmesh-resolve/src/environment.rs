//! Node routing environment: the translation table plus everything that
//! keeps it in sync with the cluster.
//!
//! The tunnel sees the environment only as a [`RouteDirectory`]. A lookup
//! that hits signals activity for the job; a miss returns nothing and
//! resolves the address in the background so a later packet finds it.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use netmesh_core::{instance_key, ResolutionConfig, TableEntry};
use netmesh_table::{RouteDirectory, TableError, TableResult, TranslationTable};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::error::{ResolveError, ResolveResult};
use crate::events::{EventBus, EventKind};
use crate::interests::{InterestRegistry, JobActions};
use crate::query::ResolutionCache;

/// An instance running on this node.
#[derive(Debug, Clone)]
struct DeployedInstance {
    job_name: String,
    namespace_ip: Ipv4Addr,
}

pub struct Environment {
    me: Weak<Environment>,
    table: Arc<TranslationTable>,
    events: Arc<EventBus>,
    interests: Arc<InterestRegistry>,
    resolver: Arc<ResolutionCache>,
    /// `job.instance` → deployed instance.
    deployed: RwLock<HashMap<String, DeployedInstance>>,
}

impl Environment {
    /// Wire up the event bus, interest registry and resolution cache
    /// around `table`.
    pub fn new(
        table: Arc<TranslationTable>,
        bus: Arc<dyn MessageBus>,
        node_id: &str,
        config: &ResolutionConfig,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new(config.event_buffer));
        let interests = Arc::new(InterestRegistry::new(
            bus.clone(),
            events.clone(),
            node_id,
            config.interest_idle_timeout(),
        ));
        let resolver = Arc::new(ResolutionCache::new(
            bus,
            interests.clone(),
            node_id,
            config.query_timeout(),
        ));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            table,
            events,
            interests,
            resolver,
            deployed: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe to query results. Must run before any resolution can
    /// complete.
    pub async fn start(&self) -> ResolveResult<()> {
        self.resolver.subscribe().await
    }

    /// Stop every interest watcher.
    pub async fn shutdown(&self) {
        self.interests.stop_all().await;
    }

    pub fn table(&self) -> &Arc<TranslationTable> {
        &self.table
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn interests(&self) -> &Arc<InterestRegistry> {
        &self.interests
    }

    pub fn resolver(&self) -> &Arc<ResolutionCache> {
        &self.resolver
    }

    fn actions(&self) -> Option<Arc<dyn JobActions>> {
        self.me.upgrade().map(|me| me as Arc<dyn JobActions>)
    }

    /// Replace the row with the same namespace address, if any.
    pub fn add_table_query_entry(&self, entry: TableEntry) {
        if let Some(ns) = entry.namespace_ip {
            let _ = self.table.remove_by_namespace_ip(IpAddr::V4(ns));
        }
        if let Err(e) = self.table.add(entry) {
            warn!(error = %e, "dropping resolved entry");
        }
    }

    /// Ask the cluster who serves `ip`, store the answer and keep it fresh.
    ///
    /// Returns the number of rows now exposing `ip`.
    pub async fn resolve_service_ip(&self, ip: IpAddr) -> ResolveResult<usize> {
        let entries = self.resolver.query_by_service_ip(ip, false).await?.into_entries()?;
        let actions = self.actions();

        if let (Some(first), Some(actions)) = (entries.first(), actions.clone()) {
            self.register_interest(&first.job_name, actions).await;
        }
        for entry in entries {
            self.add_table_query_entry(entry);
        }
        if let Some(actions) = actions {
            self.register_interest(&ip.to_string(), actions).await;
        }

        let found = self.table.search_by_service_ip(ip).len();
        debug!(service_ip = %ip, found, "service address resolved");
        Ok(found)
    }

    async fn register_interest(&self, key: &str, actions: Arc<dyn JobActions>) {
        if let Err(e) = self.interests.register(key, actions).await {
            warn!(%key, error = %e, "failed to register interest");
        }
    }

    fn spawn_resolution(&self, ip: IpAddr) {
        let Ok(runtime) = Handle::try_current() else {
            debug!(service_ip = %ip, "no runtime, skipping resolution");
            return;
        };
        let Some(env) = self.me.upgrade() else {
            return;
        };
        runtime.spawn(async move {
            match env.resolve_service_ip(ip).await {
                Ok(_) => {}
                Err(e @ (ResolveError::InterestRegistered(_) | ResolveError::InProgress(_))) => {
                    debug!(service_ip = %ip, reason = %e, "resolution skipped");
                }
                Err(e) => warn!(service_ip = %ip, error = %e, "resolution failed"),
            }
        });
    }

    pub fn remove_namespace_ip_entries(&self, ip: IpAddr) {
        let _ = self.table.remove_by_namespace_ip(ip);
    }

    /// Record a locally deployed instance and make its row visible.
    pub fn attach_local_instance(&self, entry: TableEntry) -> TableResult<Ipv4Addr> {
        let namespace_ip = entry
            .namespace_ip
            .ok_or_else(|| TableError::InvalidEntry("namespace_ip is missing".to_string()))?;
        let key = entry.instance_key();
        let job_name = entry.job_name.clone();

        let _ = self.table.remove_by_namespace_ip(IpAddr::V4(namespace_ip));
        self.table.add(entry)?;
        self.deployed_mut().insert(
            key,
            DeployedInstance {
                job_name: job_name.clone(),
                namespace_ip,
            },
        );
        info!(job = %job_name, %namespace_ip, "local instance attached");
        Ok(namespace_ip)
    }

    /// Forget a local instance. Without a standing interest in its job,
    /// the job's remaining rows go too.
    pub async fn detach_local_instance(&self, job_name: &str, instance_number: i32) {
        let Some(instance) = self.deployed_mut().remove(&instance_key(job_name, instance_number)) else {
            debug!(job = job_name, instance = instance_number, "instance not deployed here");
            return;
        };
        let _ = self.table.remove_by_namespace_ip(IpAddr::V4(instance.namespace_ip));
        if !self.interests.is_registered(job_name).await {
            self.remove_service_entries(job_name);
        }
        info!(job = job_name, instance = instance_number, "local instance detached");
    }

    /// Pull the job's full row set once and keep it fresh, unless an
    /// interest already does so.
    pub async fn track_local_job(&self, job_name: &str) {
        if self.interests.is_registered(job_name).await {
            return;
        }
        self.refresh_service_table(job_name).await;
        if let Some(actions) = self.actions() {
            self.register_interest(job_name, actions).await;
        }
    }

    fn deployed_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DeployedInstance>> {
        self.deployed.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobActions for Environment {
    async fn refresh_service_table(&self, job_name: &str) {
        debug!(job = job_name, "refreshing service table");
        let entries = match self.resolver.query_by_job_name(job_name, true).await {
            Ok(response) => response.into_entries(),
            Err(e) => Err(e),
        };
        match entries {
            Ok(entries) => {
                self.table.remove_by_job_name(job_name);
                for entry in entries {
                    self.add_table_query_entry(entry);
                }
            }
            Err(e) => debug!(job = job_name, error = %e, "refresh failed"),
        }
    }

    fn remove_service_entries(&self, job_name: &str) {
        self.table.remove_by_job_name(job_name);
    }

    fn is_service_deployed(&self, job_name: &str) -> bool {
        self.deployed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|instance| instance.job_name == job_name)
    }
}

impl RouteDirectory for Environment {
    fn entries_by_service_ip(&self, ip: IpAddr) -> Vec<TableEntry> {
        let entries = self.table.search_by_service_ip(ip);
        match entries.first() {
            Some(first) => {
                self.events.emit(EventKind::TableQuery, &first.job_name);
            }
            None => self.spawn_resolution(ip),
        }
        entries
    }

    fn entry_by_namespace_ip(&self, ip: IpAddr) -> Option<TableEntry> {
        self.table.search_by_namespace_ip(ip)
    }

    fn entry_by_instance_ip(&self, ip: IpAddr) -> Option<TableEntry> {
        self.table.search_by_instance_ip(ip)
    }
}
