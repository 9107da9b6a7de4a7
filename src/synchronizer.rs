//! Synchronizer
//!
//! Orchestrates bidirectional synchronization between the local in-memory
//! database and one shared database. Local mutations arrive as
//! [`EntryEvent`]s; only those tagged [`EntryEventSource::Local`] or
//! [`EntryEventSource::Undo`] are pushed, so the synchronizer never reacts
//! to the `Shared`-tagged writes of its own pull passes and no feedback
//! loop can form. Conditions that need a caller decision are reported as
//! [`SyncEvent`]s.
//!
//! Every operation takes `&mut self`, which serializes all use of the one
//! underlying connection at compile time. A host driving the synchronizer
//! from several tasks wraps it in a `tokio::sync::Mutex`.

use std::collections::BTreeMap;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::connector;
use crate::dialect::Dialect;
use crate::entry::BibEntry;
use crate::error::{Error, Result};
use crate::event::{EntryEvent, EntryEventSource, EventBus, SyncEvent};
use crate::gateway::QueryGateway;
use crate::local::{LocalDatabase, MetadataStore};
use crate::processor::DbProcessor;

/// Synchronizes the local database with its shared counterpart
pub struct DbSynchronizer {
    local: LocalDatabase,
    metadata: MetadataStore,
    processor: Option<DbProcessor>,
    dialect: Option<Dialect>,
    database_name: Option<String>,
    entry_events: UnboundedReceiver<EntryEvent>,
    sync_events: EventBus<SyncEvent>,
    connection_lost_reported: bool,
}

impl DbSynchronizer {
    /// Create a synchronizer owning the given local collaborators. No
    /// shared database is open yet; see
    /// [`open_shared_database`](Self::open_shared_database).
    pub fn new(mut local: LocalDatabase, metadata: MetadataStore) -> Self {
        let entry_events = local.subscribe();
        Self {
            local,
            metadata,
            processor: None,
            dialect: None,
            database_name: None,
            entry_events,
            sync_events: EventBus::new(),
            connection_lost_reported: false,
        }
    }

    /// The local database. Mutations made through
    /// [`local_database_mut`](Self::local_database_mut) queue events; call
    /// [`process_pending`](Self::process_pending) to push them.
    pub fn local_database(&self) -> &LocalDatabase {
        &self.local
    }

    pub fn local_database_mut(&mut self) -> &mut LocalDatabase {
        &mut self.local
    }

    /// The local metadata mirror
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Name of the currently open shared database
    pub fn database_name(&self) -> Option<&str> {
        self.database_name.as_deref()
    }

    /// Dialect of the currently open shared database
    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    /// Direct access to the processor of the current session
    pub fn processor_mut(&mut self) -> Option<&mut DbProcessor> {
        self.processor.as_mut()
    }

    /// Whether a shared database is currently open
    pub fn is_connected(&self) -> bool {
        self.processor.is_some()
    }

    /// Receive all future [`SyncEvent`]s of this synchronizer
    pub fn subscribe(&mut self) -> UnboundedReceiver<SyncEvent> {
        self.sync_events.subscribe()
    }

    /// Whether an event may trigger a push to the shared database
    pub fn is_event_source_accepted(event: &EntryEvent) -> bool {
        matches!(
            event.source(),
            EntryEventSource::Local | EntryEventSource::Undo
        )
    }

    /// Open the shared database described by `config` and bring both sides
    /// in sync
    pub async fn open_shared_database(&mut self, config: &ConnectionConfig) -> Result<()> {
        config.validate()?;
        self.close_shared_database().await;

        let connection = connector::connect(config).await?;
        self.processor = Some(DbProcessor::new(QueryGateway::new(
            connection,
            config.dialect,
        )));
        self.dialect = Some(config.dialect);
        self.database_name = Some(config.database.clone());
        self.connection_lost_reported = false;

        tracing::info!(database = %config.database, dialect = %config.dialect, "opened shared database");
        self.initialize_databases().await
    }

    /// Close the current session, if any
    pub async fn close_shared_database(&mut self) {
        if let Some(processor) = self.processor.take() {
            if let Err(err) = processor.into_gateway().close().await {
                tracing::warn!(error = %err, "closing the shared database connection failed");
            }
        }
        self.dialect = None;
        self.database_name = None;
    }

    /// Verify (and repair if needed) the shared table structure, then pull
    /// metadata and entries
    pub async fn initialize_databases(&mut self) -> Result<()> {
        let processor = self.processor.as_mut().ok_or(Error::NotConnected)?;
        if !processor.check_base_integrity().await? {
            tracing::info!("integrity check failed, setting up shared database structure");
            processor.set_up_shared_database().await?;
            if !processor.check_base_integrity().await? {
                return Err(Error::SchemaIntegrity(
                    "required tables are still missing after setup".into(),
                ));
            }
        }
        self.synchronize_local_metadata().await?;
        self.synchronize_local_database().await
    }

    /// Drain and dispatch all queued local mutation events
    pub async fn process_pending(&mut self) {
        loop {
            let event = match self.entry_events.try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            self.handle_event(event).await;
        }
    }

    /// Dispatch one local mutation event.
    ///
    /// Events from the synchronizer's own pull passes are ignored here;
    /// everything else is pushed and followed by a full pull to absorb
    /// concurrent changes made by other clients in the meantime.
    pub async fn handle_event(&mut self, event: EntryEvent) {
        if !Self::is_event_source_accepted(&event) {
            return;
        }
        if !self.check_current_connection().await {
            return;
        }

        let outcome = match event {
            EntryEvent::Added { entry, .. } => self.on_entry_added(entry.id()).await,
            EntryEvent::FieldChanged { entry, .. } => self.on_field_changed(entry.id()).await,
            EntryEvent::Removed { entry, .. } => self.on_entry_removed(entry).await,
        };

        if let Err(err) = outcome {
            tracing::error!(error = %err, "synchronizing a local change failed");
        }
    }

    async fn on_entry_added(&mut self, id: Uuid) -> Result<()> {
        // re-resolve the entry; it may have been edited or removed since the
        // event was queued
        let Some(mut entry) = self.local.entry(id).cloned() else {
            return Ok(());
        };

        let processor = self.processor.as_mut().ok_or(Error::NotConnected)?;
        processor.insert_entry(&mut entry).await?;
        self.local.assign_shared_id(id, entry.shared_id());
        self.local.set_entry_version(id, entry.version());

        self.synchronize_local_metadata().await?;
        self.synchronize_local_database().await
    }

    async fn on_field_changed(&mut self, id: Uuid) -> Result<()> {
        self.synchronize_local_metadata().await?;
        if self.synchronize_shared_entry(id).await? {
            self.synchronize_local_database().await?;
        }
        Ok(())
    }

    async fn on_entry_removed(&mut self, entry: BibEntry) -> Result<()> {
        let processor = self.processor.as_mut().ok_or(Error::NotConnected)?;
        processor.remove_entry(&entry).await?;

        self.synchronize_local_metadata().await?;
        self.synchronize_local_database().await
    }

    /// Push one local entry to the shared database.
    ///
    /// Returns whether the update was applied. A version conflict or a
    /// remotely deleted entry is reported as a [`SyncEvent`] and leaves the
    /// local copy untouched, so the caller can present a decision.
    pub async fn synchronize_shared_entry(&mut self, id: Uuid) -> Result<bool> {
        if !self.check_current_connection().await {
            return Ok(false);
        }
        let Some(mut entry) = self.local.entry(id).cloned() else {
            return Ok(false);
        };

        let processor = self.processor.as_mut().ok_or(Error::NotConnected)?;
        match processor.update_entry(&mut entry).await {
            Ok(()) => {
                self.local.set_entry_version(id, entry.version());
                Ok(true)
            }
            Err(Error::OfflineLock { local, shared }) => {
                self.sync_events.emit(SyncEvent::UpdateRefused {
                    local: *local,
                    shared: *shared,
                });
                Ok(false)
            }
            Err(Error::EntryNotPresent { entry }) => {
                self.sync_events
                    .emit(SyncEvent::EntryNotPresent { entry: *entry });
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Bring the local entries in line with the shared database: remove
    /// what vanished, insert what is missing, overwrite what is older. All
    /// resulting local mutations are tagged [`EntryEventSource::Shared`].
    pub async fn synchronize_local_database(&mut self) -> Result<()> {
        if !self.check_current_connection().await {
            return Ok(());
        }

        let mut processor = self.processor.take().ok_or(Error::NotConnected)?;
        let result = self.pull_entries(&mut processor).await;
        self.processor = Some(processor);
        result
    }

    async fn pull_entries(&mut self, processor: &mut DbProcessor) -> Result<()> {
        let mapping = processor.id_version_mapping().await?;

        // remove local entries which are no longer present on the shared side
        let vanished: Vec<Uuid> = self
            .local
            .entries()
            .iter()
            .filter(|entry| !mapping.contains_key(&entry.shared_id()))
            .map(BibEntry::id)
            .collect();
        for id in vanished {
            self.local.remove_entry(id, EntryEventSource::Shared);
        }

        for (&shared_id, &version) in &mapping {
            let known = self
                .local
                .entry_by_shared_id(shared_id)
                .map(|entry| (entry.id(), entry.version()));

            match known {
                None => {
                    if let Some(entry) = processor.shared_entry(shared_id).await? {
                        self.local.insert_entry(entry, EntryEventSource::Shared);
                    }
                }
                Some((id, local_version)) if version > local_version => {
                    if let Some(shared) = processor.shared_entry(shared_id).await? {
                        self.apply_shared_entry(id, &shared);
                    }
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Overwrite a local entry with its shared state, removing local fields
    /// absent on the shared side
    fn apply_shared_entry(&mut self, id: Uuid, shared: &BibEntry) {
        self.local
            .set_entry_type(id, shared.entry_type(), EntryEventSource::Shared);
        self.local.set_entry_version(id, shared.version());

        for (name, value) in shared.fields() {
            self.local
                .set_field(id, name, Some(value), EntryEventSource::Shared);
        }

        let redundant: Vec<String> = self
            .local
            .entry(id)
            .map(|entry| {
                entry
                    .field_names()
                    .filter(|name| shared.field(name).is_none())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        for name in redundant {
            self.local
                .set_field(id, &name, None, EntryEventSource::Shared);
        }
    }

    /// Replace the local metadata mirror with the shared metadata
    pub async fn synchronize_local_metadata(&mut self) -> Result<()> {
        if !self.check_current_connection().await {
            return Ok(());
        }

        let processor = self.processor.as_mut().ok_or(Error::NotConnected)?;
        let data = processor.shared_metadata().await?;
        if let Err(err) = self.metadata.set_data(data) {
            tracing::error!(error = %err, "shared metadata could not be applied locally");
        }
        Ok(())
    }

    /// Replace the shared metadata and mirror it locally
    pub async fn synchronize_shared_metadata(
        &mut self,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        if !self.check_current_connection().await {
            return Ok(());
        }

        let processor = self.processor.as_mut().ok_or(Error::NotConnected)?;
        processor.set_shared_metadata(data).await?;
        self.synchronize_local_metadata().await
    }

    /// Push every local entry, e.g. after a metadata change that affects
    /// how entries are stored
    pub async fn apply_metadata(&mut self) -> Result<()> {
        if !self.check_current_connection().await {
            return Ok(());
        }

        let ids: Vec<Uuid> = self.local.entries().iter().map(BibEntry::id).collect();
        for id in ids {
            self.synchronize_shared_entry(id).await?;
        }
        Ok(())
    }

    /// Pull entries and metadata; used after conflict resolution and on
    /// manual refresh
    pub async fn pull_changes(&mut self) -> Result<()> {
        if !self.check_current_connection().await {
            return Ok(());
        }

        self.synchronize_local_database().await?;
        self.synchronize_local_metadata().await
    }

    /// Check whether the current connection still answers.
    ///
    /// On failure a [`SyncEvent::ConnectionLost`] is emitted, once per
    /// outage, and `false` is returned so callers can short-circuit instead
    /// of attempting further remote calls.
    pub async fn check_current_connection(&mut self) -> bool {
        let Some(processor) = self.processor.as_mut() else {
            return false;
        };

        match processor.ping().await {
            Ok(()) => {
                self.connection_lost_reported = false;
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "connection to the shared database is gone");
                if !self.connection_lost_reported {
                    self.connection_lost_reported = true;
                    self.sync_events.emit(SyncEvent::ConnectionLost {
                        database: self.database_name.clone().unwrap_or_default(),
                    });
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_logging() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    fn memory_config() -> ConnectionConfig {
        ConnectionConfig::new(Dialect::Sqlite, ":memory:")
    }

    fn file_config(dir: &TempDir) -> ConnectionConfig {
        let path = dir.path().join("shared.db");
        ConnectionConfig::new(Dialect::Sqlite, path.to_string_lossy())
    }

    async fn open_synchronizer(config: &ConnectionConfig) -> DbSynchronizer {
        init_logging();
        let mut synchronizer = DbSynchronizer::new(LocalDatabase::new(), MetadataStore::new());
        synchronizer.open_shared_database(config).await.unwrap();
        synchronizer
    }

    #[tokio::test]
    async fn test_open_sets_up_schema() {
        let mut synchronizer = open_synchronizer(&memory_config()).await;
        assert!(synchronizer.is_connected());
        assert_eq!(synchronizer.dialect(), Some(Dialect::Sqlite));
        assert_eq!(synchronizer.database_name(), Some(":memory:"));

        let processor = synchronizer.processor_mut().unwrap();
        assert!(processor.check_base_integrity().await.unwrap());
    }

    #[tokio::test]
    async fn test_local_insert_and_edit_are_pushed() {
        let mut synchronizer = open_synchronizer(&memory_config()).await;

        let entry = BibEntry::new("article");
        let id = entry.id();
        synchronizer
            .local_database_mut()
            .insert_entry(entry, EntryEventSource::Local);
        synchronizer.local_database_mut().set_field(
            id,
            "author",
            Some("Knuth, Donald E."),
            EntryEventSource::Local,
        );
        synchronizer.process_pending().await;

        let local = synchronizer.local_database().entry(id).unwrap();
        assert_eq!(local.shared_id(), 1);

        let remote = synchronizer
            .processor_mut()
            .unwrap()
            .shared_entry(1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote.entry_type(), "article");
        assert_eq!(remote.field("author"), Some("Knuth, Donald E."));
    }

    #[tokio::test]
    async fn test_shared_tagged_events_are_not_pushed() {
        let mut synchronizer = open_synchronizer(&memory_config()).await;

        synchronizer
            .local_database_mut()
            .insert_entry(BibEntry::new("article"), EntryEventSource::Shared);
        synchronizer.process_pending().await;

        let entries = synchronizer
            .processor_mut()
            .unwrap()
            .shared_entries()
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_unpushed_entries_are_dropped_by_a_pull() {
        let mut synchronizer = open_synchronizer(&memory_config()).await;

        synchronizer
            .local_database_mut()
            .insert_entry(BibEntry::new("article"), EntryEventSource::Shared);
        synchronizer.pull_changes().await.unwrap();

        assert!(synchronizer.local_database().entries().is_empty());
    }

    #[tokio::test]
    async fn test_pull_absorbs_other_clients_changes() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        let mut first = open_synchronizer(&config).await;
        let mut second = open_synchronizer(&config).await;

        // first client creates and pushes an entry
        let entry = BibEntry::new("article");
        let first_id = entry.id();
        first
            .local_database_mut()
            .insert_entry(entry, EntryEventSource::Local);
        first
            .local_database_mut()
            .set_field(first_id, "year", Some("2020"), EntryEventSource::Local);
        first.process_pending().await;

        // second client pulls it
        second.pull_changes().await.unwrap();
        let pulled = second.local_database().entry_by_shared_id(1).unwrap();
        let second_id = pulled.id();
        assert_eq!(pulled.field("year"), Some("2020"));

        // second client edits; first client sees the edit on its next pull
        second
            .local_database_mut()
            .set_field(second_id, "year", Some("2021"), EntryEventSource::Local);
        second.process_pending().await;

        first.pull_changes().await.unwrap();
        let seen = first.local_database().entry(first_id).unwrap();
        assert_eq!(seen.field("year"), Some("2021"));
        assert_eq!(seen.version(), 3);

        // second client clears the field; the deletion reaches first too
        second
            .local_database_mut()
            .set_field(second_id, "year", None, EntryEventSource::Local);
        second.process_pending().await;

        first.pull_changes().await.unwrap();
        let seen = first.local_database().entry(first_id).unwrap();
        assert_eq!(seen.field("year"), None);
    }

    #[tokio::test]
    async fn test_conflicting_update_emits_update_refused() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        let mut first = open_synchronizer(&config).await;
        let mut second = open_synchronizer(&config).await;
        let mut refusals = second.subscribe();

        let entry = BibEntry::new("article");
        let first_id = entry.id();
        first
            .local_database_mut()
            .insert_entry(entry, EntryEventSource::Local);
        first.process_pending().await;

        second.pull_changes().await.unwrap();
        let second_id = second
            .local_database()
            .entry_by_shared_id(1)
            .unwrap()
            .id();

        // first commits an update, so second's copy becomes stale
        first
            .local_database_mut()
            .set_field(first_id, "year", Some("2020"), EntryEventSource::Local);
        first.process_pending().await;

        second
            .local_database_mut()
            .set_field(second_id, "year", Some("1999"), EntryEventSource::Local);
        second.process_pending().await;

        match refusals.try_recv().unwrap() {
            SyncEvent::UpdateRefused { local, shared } => {
                assert_eq!(local.field("year"), Some("1999"));
                assert_eq!(shared.field("year"), Some("2020"));
                assert_eq!(shared.version(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // the conflicting local state is kept for the merge decision
        let kept = second.local_database().entry(second_id).unwrap();
        assert_eq!(kept.field("year"), Some("1999"));

        // pulling resolves in favor of the shared side
        second.pull_changes().await.unwrap();
        let resolved = second.local_database().entry(second_id).unwrap();
        assert_eq!(resolved.field("year"), Some("2020"));
        assert_eq!(resolved.version(), 2);
    }

    #[tokio::test]
    async fn test_update_of_remotely_deleted_entry_emits_not_present() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        let mut first = open_synchronizer(&config).await;
        let mut second = open_synchronizer(&config).await;
        let mut notifications = second.subscribe();

        let entry = BibEntry::new("article");
        let first_id = entry.id();
        first
            .local_database_mut()
            .insert_entry(entry, EntryEventSource::Local);
        first.process_pending().await;

        second.pull_changes().await.unwrap();
        let second_id = second
            .local_database()
            .entry_by_shared_id(1)
            .unwrap()
            .id();

        // first deletes the entry on the shared side
        first
            .local_database_mut()
            .remove_entry(first_id, EntryEventSource::Local);
        first.process_pending().await;

        // second still edits its cached copy
        second
            .local_database_mut()
            .set_field(second_id, "year", Some("2022"), EntryEventSource::Local);
        second.process_pending().await;

        match notifications.try_recv().unwrap() {
            SyncEvent::EntryNotPresent { entry } => {
                assert_eq!(entry.shared_id(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // the local copy survives until the caller decides
        assert!(second.local_database().entry(second_id).is_some());
    }

    #[tokio::test]
    async fn test_pull_removes_vanished_entries() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        let mut first = open_synchronizer(&config).await;
        let mut second = open_synchronizer(&config).await;

        let entry = BibEntry::new("article");
        let first_id = entry.id();
        first
            .local_database_mut()
            .insert_entry(entry, EntryEventSource::Local);
        first.process_pending().await;

        second.pull_changes().await.unwrap();
        assert_eq!(second.local_database().entries().len(), 1);

        first
            .local_database_mut()
            .remove_entry(first_id, EntryEventSource::Local);
        first.process_pending().await;

        let mut removals = second.local_database_mut().subscribe();
        second.pull_changes().await.unwrap();
        assert!(second.local_database().entries().is_empty());

        match removals.try_recv().unwrap() {
            EntryEvent::Removed { source, .. } => {
                assert_eq!(source, EntryEventSource::Shared);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_metadata_reaches_other_clients() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        let mut first = open_synchronizer(&config).await;
        let mut second = open_synchronizer(&config).await;

        let mut data = BTreeMap::new();
        data.insert("databaseType".to_string(), "bibtex".to_string());
        first.synchronize_shared_metadata(&data).await.unwrap();
        assert_eq!(first.metadata().as_map(), &data);

        second.pull_changes().await.unwrap();
        assert_eq!(second.metadata().as_map(), &data);
    }

    #[tokio::test]
    async fn test_operations_without_open_database_short_circuit() {
        let mut synchronizer = DbSynchronizer::new(LocalDatabase::new(), MetadataStore::new());

        assert!(!synchronizer.is_connected());
        assert!(!synchronizer.check_current_connection().await);
        synchronizer.pull_changes().await.unwrap();

        synchronizer
            .local_database_mut()
            .insert_entry(BibEntry::new("article"), EntryEventSource::Local);
        synchronizer.process_pending().await;
        assert_eq!(synchronizer.local_database().entries().len(), 1);
    }
}
