//! Change-record dispatch
//!
//! The callback registry maps `(database, table)` to a user callback plus
//! an event-kind filter. Delivery happens synchronously on the replication
//! client's read path; a record only reaches a callback when the entry's
//! filter contains the record's kind.

use crate::error::{ReplicaError, Result};
use crate::event::{RowPair, RowsKind};
use crate::schema::TableDescriptor;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bitmask over the three row-event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKind(u8);

impl EventKind {
    pub const NONE: EventKind = EventKind(0);
    pub const INSERT: EventKind = EventKind(1);
    pub const UPDATE: EventKind = EventKind(2);
    pub const DELETE: EventKind = EventKind(4);
    pub const ALL: EventKind = EventKind(1 | 2 | 4);

    pub fn contains(self, other: EventKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn of_rows(kind: RowsKind) -> EventKind {
        match kind {
            RowsKind::Write => EventKind::INSERT,
            RowsKind::Update => EventKind::UPDATE,
            RowsKind::Delete => EventKind::DELETE,
        }
    }
}

impl std::ops::BitOr for EventKind {
    type Output = EventKind;
    fn bitor(self, rhs: EventKind) -> EventKind {
        EventKind(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for EventKind {
    type Output = EventKind;
    fn bitand(self, rhs: EventKind) -> EventKind {
        EventKind(self.0 & rhs.0)
    }
}

impl std::ops::Not for EventKind {
    type Output = EventKind;
    fn not(self) -> EventKind {
        EventKind(!self.0 & EventKind::ALL.0)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut parts = Vec::new();
        if self.contains(EventKind::INSERT) {
            parts.push("insert");
        }
        if self.contains(EventKind::UPDATE) {
            parts.push("update");
        }
        if self.contains(EventKind::DELETE) {
            parts.push("delete");
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// One row image: column name to decoded value, in table column order.
/// Columns absent from a minimal image are omitted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowImage {
    columns: Vec<(String, Value)>,
}

impl RowImage {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, Value)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn from_values(descriptor: &TableDescriptor, values: &[Option<Value>]) -> Self {
        let columns = values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                v.as_ref()
                    .map(|value| (descriptor.column_name(i).to_string(), value.clone()))
            })
            .collect();
        Self { columns }
    }
}

/// The record handed to user callbacks: INSERT carries only an after
/// image, DELETE only a before image, UPDATE both.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub database: String,
    pub table: String,
    pub kind: EventKind,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

impl ChangeRecord {
    /// Build a record from one decoded row of a rows event.
    pub fn from_row(descriptor: &TableDescriptor, kind: RowsKind, row: &RowPair) -> Self {
        let before = match kind {
            RowsKind::Update | RowsKind::Delete => row
                .before
                .as_ref()
                .map(|values| RowImage::from_values(descriptor, values)),
            RowsKind::Write => None,
        };
        let after = match kind {
            RowsKind::Write | RowsKind::Update => row
                .after
                .as_ref()
                .map(|values| RowImage::from_values(descriptor, values)),
            RowsKind::Delete => None,
        };

        Self {
            database: descriptor.database.clone(),
            table: descriptor.table.clone(),
            kind: EventKind::of_rows(kind),
            before,
            after,
        }
    }
}

/// User callback. Returning an error aborts the run loop without
/// checkpointing the in-progress transaction.
pub type Callback = Box<dyn FnMut(&ChangeRecord) -> Result<()> + Send>;

struct RegistryEntry {
    callback: Callback,
    filter: EventKind,
}

/// Per-(database, table) callback registry with event-kind filtering.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: HashMap<(String, String), RegistryEntry>,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("tables", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry for a table.
    pub fn register(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        filter: EventKind,
        callback: Callback,
    ) {
        self.entries
            .insert((database.into(), table.into()), RegistryEntry { callback, filter });
    }

    pub fn contains(&self, database: &str, table: &str) -> bool {
        self.entries
            .contains_key(&(database.to_string(), table.to_string()))
    }

    /// Registered `(database, table)` pairs.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .keys()
            .map(|(db, table)| (db.as_str(), table.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver a record to its table's callback if the filter admits the
    /// record's kind. Returns whether the callback ran.
    pub fn dispatch(&mut self, record: &ChangeRecord) -> Result<bool> {
        let key = (record.database.clone(), record.table.clone());
        let entry = match self.entries.get_mut(&key) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        if !entry.filter.contains(record.kind) {
            return Ok(false);
        }
        (entry.callback)(record).map_err(|e| match e {
            ReplicaError::Callback(_) => e,
            other => ReplicaError::callback(other.to_string()),
        })?;
        Ok(true)
    }
}
