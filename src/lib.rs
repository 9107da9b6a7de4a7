//! Bibsync - Shared Database Synchronization Engine
//!
//! Keeps a local, in-memory bibliographic database consistent with a remote
//! SQL store shared by multiple concurrent clients. Conflicts are detected
//! optimistically through a per-entry version counter, change propagation is
//! loop-free thanks to source-tagged mutation events, and the same logical
//! three-table schema is maintained across MySQL, PostgreSQL and SQLite.
//!
//! # Architecture
//!
//! Layered bottom-up:
//!
//! - [`dialect`] enumerates the supported backends and their differences
//!   (quoting, ports, DDL, placeholder syntax, generated-key retrieval)
//! - [`connector`] opens a connection with a login timeout and uniform
//!   error reporting
//! - [`gateway`] executes SQL over the one exclusively-owned connection
//! - [`processor`] owns the shared schema and the entry/metadata operations,
//!   including the optimistic-locked update
//! - [`synchronizer`] orchestrates bidirectional sync and reports
//!   conditions that need a caller decision
//!
//! # Concurrency
//!
//! Every remote operation blocks (awaits) on network I/O and takes
//! `&mut self`, so all use of one session is serialized at compile time.
//! Hosts driving a synchronizer from several tasks wrap it in a
//! `tokio::sync::Mutex`.
//!
//! # Example
//!
//! ```no_run
//! use bibsync::prelude::*;
//!
//! # async fn run() -> bibsync::Result<()> {
//! let mut synchronizer = DbSynchronizer::new(LocalDatabase::new(), MetadataStore::new());
//!
//! let mut config = ConnectionConfig::new(Dialect::Postgres, "references");
//! config.user = "alice".to_string();
//! config.password = "secret".to_string();
//! synchronizer.open_shared_database(&config).await?;
//!
//! let entry = BibEntry::new("article");
//! let id = entry.id();
//! synchronizer
//!     .local_database_mut()
//!     .insert_entry(entry, EntryEventSource::Local);
//! synchronizer
//!     .local_database_mut()
//!     .set_field(id, "author", Some("Knuth, Donald E."), EntryEventSource::Local);
//! synchronizer.process_pending().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod dialect;
pub mod entry;
pub mod error;
pub mod event;
pub mod gateway;
pub mod local;
pub mod processor;
pub mod synchronizer;

pub use config::ConnectionConfig;
pub use dialect::Dialect;
pub use entry::BibEntry;
pub use error::{Error, Result};
pub use event::{EntryEvent, EntryEventSource, SyncEvent};
pub use synchronizer::DbSynchronizer;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ConnectionConfig;
    pub use crate::dialect::Dialect;
    pub use crate::entry::BibEntry;
    pub use crate::error::{Error, Result};
    pub use crate::event::{EntryEvent, EntryEventSource, SyncEvent};
    pub use crate::local::{LocalDatabase, MetadataStore};
    pub use crate::processor::DbProcessor;
    pub use crate::synchronizer::DbSynchronizer;
}
