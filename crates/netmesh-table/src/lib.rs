//! netmesh-table — the translation table behind the packet proxy.
//!
//! Holds one [`TableEntry`](netmesh_core::TableEntry) per known service
//! instance. Rows are copied out on read; the backing collection is only
//! mutated under a single write lock.
//!
//! The tunnel does not depend on the table directly but on the
//! [`RouteDirectory`] capability, so lookups can be backed by a plain table
//! in tests or by a resolving environment in the daemon.

pub mod directory;
pub mod error;
pub mod table;

pub use directory::RouteDirectory;
pub use error::{TableError, TableResult};
pub use table::TranslationTable;
