//! Local Collaborators
//!
//! The in-memory side of a shared database session: the entry store the
//! host application edits, and the metadata store mirroring the shared
//! `METADATA` table. Every mutation of [`LocalDatabase`] is tagged with an
//! [`EntryEventSource`] and published to subscribers; the synchronizer is
//! one such subscriber and uses the tag to ignore its own writes.

use std::collections::BTreeMap;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::entry::BibEntry;
use crate::error::{Error, Result};
use crate::event::{EntryEvent, EntryEventSource, EventBus};

/// Pseudo-field name used to report entry type changes
pub const TYPE_FIELD: &str = "entrytype";

/// The local in-memory bibliographic database
#[derive(Debug, Default)]
pub struct LocalDatabase {
    entries: Vec<BibEntry>,
    events: EventBus<EntryEvent>,
}

impl LocalDatabase {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            events: EventBus::new(),
        }
    }

    /// Receive all future mutation events of this database
    pub fn subscribe(&mut self) -> UnboundedReceiver<EntryEvent> {
        self.events.subscribe()
    }

    /// All entries, in insertion order
    pub fn entries(&self) -> &[BibEntry] {
        &self.entries
    }

    /// Look up an entry by its local identity
    pub fn entry(&self, id: Uuid) -> Option<&BibEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    /// Look up an entry by its store-assigned id
    pub fn entry_by_shared_id(&self, shared_id: i64) -> Option<&BibEntry> {
        self.entries
            .iter()
            .find(|entry| entry.shared_id() == shared_id)
    }

    /// Insert an entry and notify subscribers
    pub fn insert_entry(&mut self, entry: BibEntry, source: EntryEventSource) {
        self.entries.push(entry.clone());
        self.events.emit(EntryEvent::Added { entry, source });
    }

    /// Remove an entry and notify subscribers. Returns the removed entry.
    pub fn remove_entry(&mut self, id: Uuid, source: EntryEventSource) -> Option<BibEntry> {
        let index = self.entries.iter().position(|entry| entry.id() == id)?;
        let entry = self.entries.remove(index);
        self.events.emit(EntryEvent::Removed {
            entry: entry.clone(),
            source,
        });
        Some(entry)
    }

    /// Set or clear (`value: None`) a field of an entry and notify
    /// subscribers. Returns `false` if no entry has the given identity.
    pub fn set_field(
        &mut self,
        id: Uuid,
        name: &str,
        value: Option<&str>,
        source: EntryEventSource,
    ) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id() == id) else {
            return false;
        };

        match value {
            Some(value) => entry.set_field(name, value),
            None => {
                entry.clear_field(name);
            }
        }

        let snapshot = entry.clone();
        self.events.emit(EntryEvent::FieldChanged {
            entry: snapshot,
            field: name.to_lowercase(),
            value: value.map(String::from),
            source,
        });
        true
    }

    /// Change the type of an entry and notify subscribers, reported as a
    /// change of the [`TYPE_FIELD`] pseudo-field
    pub fn set_entry_type(&mut self, id: Uuid, entry_type: &str, source: EntryEventSource) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id() == id) else {
            return false;
        };

        entry.set_entry_type(entry_type);
        let snapshot = entry.clone();
        self.events.emit(EntryEvent::FieldChanged {
            entry: snapshot,
            field: TYPE_FIELD.to_string(),
            value: Some(entry_type.to_string()),
            source,
        });
        true
    }

    /// Record the store-assigned id of an entry. Emits no event; identity
    /// assignment is bookkeeping, not an edit.
    pub fn assign_shared_id(&mut self, id: Uuid, shared_id: i64) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id() == id) {
            entry.set_shared_id(shared_id);
        }
    }

    /// Overwrite the version counter of an entry. Emits no event.
    pub fn set_entry_version(&mut self, id: Uuid, version: i64) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id() == id) {
            entry.set_version(version);
        }
    }
}

/// The local mirror of the shared metadata table
#[derive(Debug, Default)]
pub struct MetadataStore {
    data: BTreeMap<String, String>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }

    /// All metadata as a key-value map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Value of one metadata key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Replace the whole metadata map.
    ///
    /// Keys must be non-empty and free of whitespace; shared stores written
    /// by other clients can contain anything, so the content is validated
    /// before it replaces the local state.
    pub fn set_data(&mut self, data: BTreeMap<String, String>) -> Result<()> {
        for key in data.keys() {
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                return Err(Error::MetadataParse(format!("invalid metadata key {key:?}")));
            }
        }
        self.data = data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_emits_added_event() {
        let mut database = LocalDatabase::new();
        let mut events = database.subscribe();

        let entry = BibEntry::new("article");
        database.insert_entry(entry.clone(), EntryEventSource::Local);

        match events.try_recv().unwrap() {
            EntryEvent::Added {
                entry: seen,
                source,
            } => {
                assert_eq!(seen.id(), entry.id());
                assert_eq!(source, EntryEventSource::Local);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_field_change_carries_snapshot_after_mutation() {
        let mut database = LocalDatabase::new();
        let entry = BibEntry::new("article");
        let id = entry.id();
        database.insert_entry(entry, EntryEventSource::Local);

        let mut events = database.subscribe();
        assert!(database.set_field(id, "Year", Some("2020"), EntryEventSource::Undo));

        match events.try_recv().unwrap() {
            EntryEvent::FieldChanged {
                entry,
                field,
                value,
                source,
            } => {
                assert_eq!(field, "year");
                assert_eq!(value.as_deref(), Some("2020"));
                assert_eq!(entry.field("year"), Some("2020"));
                assert_eq!(source, EntryEventSource::Undo);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_remove_unknown_entry_is_silent() {
        let mut database = LocalDatabase::new();
        let mut events = database.subscribe();
        assert!(database.remove_entry(Uuid::new_v4(), EntryEventSource::Local).is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_identity_assignment_emits_no_event() {
        let mut database = LocalDatabase::new();
        let entry = BibEntry::new("book");
        let id = entry.id();
        database.insert_entry(entry, EntryEventSource::Local);

        let mut events = database.subscribe();
        database.assign_shared_id(id, 7);
        database.set_entry_version(id, 3);

        assert!(events.try_recv().is_err());
        let entry = database.entry(id).unwrap();
        assert_eq!(entry.shared_id(), 7);
        assert_eq!(entry.version(), 3);
        assert!(database.entry_by_shared_id(7).is_some());
    }

    #[test]
    fn test_metadata_rejects_malformed_keys() {
        let mut store = MetadataStore::new();

        let mut good = BTreeMap::new();
        good.insert("databaseType".to_string(), "bibtex".to_string());
        store.set_data(good).unwrap();
        assert_eq!(store.get("databaseType"), Some("bibtex"));

        let mut bad = BTreeMap::new();
        bad.insert("data baseType".to_string(), "bibtex".to_string());
        assert!(store.set_data(bad).is_err());
        // previous content is untouched on rejection
        assert_eq!(store.get("databaseType"), Some("bibtex"));
    }
}
