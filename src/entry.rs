//! Bibliographic Entry Model
//!
//! The projection of a bibliographic record that travels between the local
//! in-memory database and the shared store: an entry type, a version
//! counter, and a field map. Field names are case-insensitive and an absent
//! field is distinct from an empty value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared id of an entry the store has not assigned one to yet
pub const UNASSIGNED_SHARED_ID: i64 = -1;

/// A bibliographic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BibEntry {
    /// Local identity, stable across the entry's whole lifetime. Needed
    /// because the shared id only exists after the first successful push.
    id: Uuid,
    shared_id: i64,
    entry_type: String,
    version: i64,
    fields: BTreeMap<String, String>,
}

impl BibEntry {
    /// Create a new entry of the given type with no fields, not yet known to
    /// the shared store
    pub fn new(entry_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            shared_id: UNASSIGNED_SHARED_ID,
            entry_type: entry_type.into(),
            version: 1,
            fields: BTreeMap::new(),
        }
    }

    /// Local identity of this entry
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Store-assigned id, or [`UNASSIGNED_SHARED_ID`]
    pub fn shared_id(&self) -> i64 {
        self.shared_id
    }

    pub fn set_shared_id(&mut self, shared_id: i64) {
        self.shared_id = shared_id;
    }

    /// Whether the store has assigned this entry an id
    pub fn has_shared_id(&self) -> bool {
        self.shared_id != UNASSIGNED_SHARED_ID
    }

    pub fn entry_type(&self) -> &str {
        &self.entry_type
    }

    pub fn set_entry_type(&mut self, entry_type: impl Into<String>) {
        self.entry_type = entry_type.into();
    }

    /// Version counter; the sole conflict-detection token
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    /// Value of a field, or `None` if the field is not set
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(&normalize(name)).map(String::as_str)
    }

    /// Set a field. Names are normalized to lowercase.
    pub fn set_field(&mut self, name: &str, value: impl Into<String>) {
        self.fields.insert(normalize(name), value.into());
    }

    /// Remove a field, returning its previous value
    pub fn clear_field(&mut self, name: &str) -> Option<String> {
        self.fields.remove(&normalize(name))
    }

    /// Names of all populated fields, in sorted order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// All populated fields, in sorted name order
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
}
