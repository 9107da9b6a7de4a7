//! Mutation and Synchronization Events
//!
//! Two closed sets of messages: [`EntryEvent`] describes a mutation of the
//! local database and carries the tag saying where the mutation came from;
//! [`SyncEvent`] is what the synchronizer reports upward when something
//! needs a caller decision. Both are delivered over plain channels; there is
//! no reflective dispatch, every consumer matches on the variant.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::entry::BibEntry;

/// Origin of a local database mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryEventSource {
    /// A user edit
    Local,
    /// Applied by the synchronizer while pulling shared state; never
    /// propagated back to the shared database
    Shared,
    /// A user-triggered undo or redo
    Undo,
}

/// A mutation of the local database
///
/// Every variant carries a snapshot of the affected entry taken right after
/// the mutation, so consumers never have to re-query the database to act.
#[derive(Debug, Clone)]
pub enum EntryEvent {
    /// An entry was inserted
    Added {
        entry: BibEntry,
        source: EntryEventSource,
    },

    /// A field of an existing entry changed. A `value` of `None` means the
    /// field was cleared. The pseudo-field `entrytype` reports type changes.
    FieldChanged {
        entry: BibEntry,
        field: String,
        value: Option<String>,
        source: EntryEventSource,
    },

    /// An entry was removed
    Removed {
        entry: BibEntry,
        source: EntryEventSource,
    },
}

impl EntryEvent {
    /// Where the mutation originated
    pub fn source(&self) -> EntryEventSource {
        match self {
            EntryEvent::Added { source, .. }
            | EntryEvent::FieldChanged { source, .. }
            | EntryEvent::Removed { source, .. } => *source,
        }
    }

    /// Snapshot of the affected entry
    pub fn entry(&self) -> &BibEntry {
        match self {
            EntryEvent::Added { entry, .. }
            | EntryEvent::FieldChanged { entry, .. }
            | EntryEvent::Removed { entry, .. } => entry,
        }
    }
}

/// A condition the synchronizer cannot resolve on its own
///
/// All three require a decision point outside the engine: reconnect or work
/// offline, merge, keep or discard.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The connection to the shared database no longer answers
    ConnectionLost {
        /// Name of the affected shared database
        database: String,
    },

    /// An update was refused because the shared copy is newer. Both sides
    /// are carried in full so any caller can resolve the conflict without
    /// re-querying.
    UpdateRefused {
        local: BibEntry,
        shared: BibEntry,
    },

    /// The entry was deleted on the shared side while it was being edited
    /// locally
    EntryNotPresent { entry: BibEntry },
}

/// Fan-out of events to any number of subscribers
///
/// Subscribers that dropped their receiver are pruned on the next emit.
#[derive(Debug)]
pub(crate) struct EventBus<T> {
    senders: Vec<UnboundedSender<T>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    pub fn emit(&mut self, event: T)
    where
        T: Clone,
    {
        self.senders.retain(|sender| sender.send(event.clone()).is_ok());
    }
}
