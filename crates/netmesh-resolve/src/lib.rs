//! netmesh-resolve — keeps the local translation table in sync with the
//! cluster.
//!
//! When the tunnel meets a service IP it has no route for, the
//! [`Environment`] asks the cluster authority over the [`MessageBus`]
//! through the [`ResolutionCache`], inserts the answer and registers a
//! standing interest so pushed updates keep the rows fresh. Interests expire
//! when the [`EventBus`] reports no table activity for the job within the
//! idle timeout.

pub mod bus;
pub mod environment;
pub mod error;
pub mod events;
pub mod interests;
pub mod messages;
pub mod query;

pub use bus::{topics, LocalBus, MessageBus, MessageHandler};
pub use environment::Environment;
pub use error::{BusError, BusResult, EventError, ResolveError, ResolveResult};
pub use events::{Event, EventBus, EventKind};
pub use interests::{InterestRegistry, JobActions};
pub use messages::{InterestRemoveRequest, ServiceInstance, Sip, TableQueryRequest, TableQueryResponse};
pub use query::ResolutionCache;
