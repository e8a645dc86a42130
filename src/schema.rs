//! Schema mirror: live table-id to column-layout tracking
//!
//! Binlog row events carry positions and wire types, never column names.
//! The mirror pairs each TABLE_MAP layout with the column definitions
//! resolved from `information_schema.columns` for the user's registered
//! tables, producing [`TableDescriptor`]s the row decoder and dispatcher
//! work from.

use crate::error::Result;
use crate::event::TableMapEvent;
use crate::value::{ColumnMeta, ColumnType};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// One column as resolved from `information_schema.columns` at `init()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// Full declaration, e.g. `int unsigned` or `set('a','b','c')`
    pub column_type: String,
    pub charset: Option<String>,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }

    /// Member list for `set(...)` / `enum(...)` declarations.
    pub fn members(&self) -> Vec<String> {
        parse_members(&self.column_type)
    }
}

/// A fully resolved column: TABLE_MAP wire layout merged with its spec.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_code: ColumnType,
    pub metadata: u16,
    pub nullable: bool,
    pub unsigned: bool,
    pub charset: Option<String>,
    /// SET/ENUM members in declaration order
    pub members: Vec<String>,
}

/// Value half of the schema mirror: everything needed to decode and label
/// one table's row images.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Build a descriptor from a TABLE_MAP layout and the column specs
    /// captured at registration. Missing specs get positional names so a
    /// mid-stream DDL cannot panic the decoder.
    pub fn from_parts(
        database: impl Into<String>,
        table: impl Into<String>,
        wire_columns: Vec<(ColumnType, u16, bool)>,
        specs: Vec<ColumnSpec>,
    ) -> Self {
        let columns = wire_columns
            .into_iter()
            .enumerate()
            .map(|(i, (type_code, metadata, nullable))| match specs.get(i) {
                Some(spec) => ColumnDescriptor {
                    name: spec.name.clone(),
                    type_code,
                    metadata,
                    nullable,
                    unsigned: spec.is_unsigned(),
                    charset: spec.charset.clone(),
                    members: spec.members(),
                },
                None => ColumnDescriptor {
                    name: format!("col{i}"),
                    type_code,
                    metadata,
                    nullable,
                    unsigned: false,
                    charset: None,
                    members: Vec::new(),
                },
            })
            .collect();

        Self {
            database: database.into(),
            table: table.into(),
            columns,
        }
    }

    pub fn from_table_map(map: &TableMapEvent, specs: &[ColumnSpec]) -> Self {
        let wire = (0..map.column_count)
            .map(|i| {
                (
                    map.column_types[i],
                    map.column_metadata[i],
                    map.nullable(i),
                )
            })
            .collect();
        Self::from_parts(&map.database, &map.table, wire, specs.to_vec())
    }

    pub fn column_meta(&self, idx: usize) -> ColumnMeta {
        let col = &self.columns[idx];
        ColumnMeta {
            type_code: col.type_code,
            metadata: col.metadata,
            unsigned: col.unsigned,
        }
    }

    pub fn column_name(&self, idx: usize) -> &str {
        &self.columns[idx].name
    }

    /// Resolve a SET bitmask into member names.
    pub fn set_members(&self, idx: usize, mask: u64) -> Vec<&str> {
        self.columns[idx]
            .members
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, m)| m.as_str())
            .collect()
    }
}

/// Outcome of feeding a TABLE_MAP into the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Unchanged,
    /// The same table id re-announced a different layout
    Replaced,
}

/// Mapping from live table id to descriptor, plus the registered column
/// specs the descriptors are built from. Table ids are not stable across
/// server restarts; the mirror is rebuilt from the stream.
#[derive(Debug, Default)]
pub struct SchemaMirror {
    tables: HashMap<u64, TableDescriptor>,
    specs: HashMap<(String, String), Vec<ColumnSpec>>,
    /// Table ids seen in TABLE_MAPs for tables outside the registered set
    ignored: HashSet<u64>,
}

impl SchemaMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the resolved column list for a registered table.
    pub fn set_column_specs(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        specs: Vec<ColumnSpec>,
    ) {
        self.specs.insert((database.into(), table.into()), specs);
    }

    pub fn column_specs(&self, database: &str, table: &str) -> Option<&[ColumnSpec]> {
        self.specs
            .get(&(database.to_string(), table.to_string()))
            .map(|v| v.as_slice())
    }

    /// Whether the cached specs still line up with a TABLE_MAP layout.
    /// A mismatch means DDL happened since `init()` and the column list
    /// must be re-read before decoding.
    pub fn specs_current(&self, map: &TableMapEvent) -> bool {
        self.column_specs(&map.database, &map.table)
            .map(|s| s.len() == map.column_count)
            .unwrap_or(false)
    }

    /// Install (or refresh) the descriptor for a table id.
    pub fn upsert(&mut self, map: &TableMapEvent) -> Result<UpsertOutcome> {
        let specs = self
            .column_specs(&map.database, &map.table)
            .unwrap_or(&[])
            .to_vec();
        let descriptor = TableDescriptor::from_table_map(map, &specs);

        let outcome = match self.tables.get(&map.table_id) {
            None => UpsertOutcome::Inserted,
            Some(existing) if *existing == descriptor => UpsertOutcome::Unchanged,
            Some(existing) => {
                warn!(
                    table_id = map.table_id,
                    table = %format!("{}.{}", map.database, map.table),
                    previous = %format!("{}.{}", existing.database, existing.table),
                    "table id reused with a different layout"
                );
                UpsertOutcome::Replaced
            }
        };

        // A registered table may land on an id previously seen as foreign
        self.ignored.remove(&map.table_id);

        if outcome != UpsertOutcome::Unchanged {
            debug!(
                table_id = map.table_id,
                table = %format!("{}.{}", map.database, map.table),
                columns = map.column_count,
                "schema mirror updated"
            );
            self.tables.insert(map.table_id, descriptor);
        }
        Ok(outcome)
    }

    pub fn lookup(&self, table_id: u64) -> Option<&TableDescriptor> {
        self.tables.get(&table_id)
    }

    /// Mark a table id as outside the registered set so its row events are
    /// skipped without a schema-miss diagnostic.
    pub fn ignore(&mut self, table_id: u64) {
        self.ignored.insert(table_id);
    }

    pub fn is_ignored(&self, table_id: u64) -> bool {
        self.ignored.contains(&table_id)
    }

    /// Drop cached layout and specs for one table after observed DDL; the
    /// next TABLE_MAP forces a fresh column resolution.
    pub fn invalidate_table(&mut self, database: &str, table: &str) {
        self.specs
            .remove(&(database.to_string(), table.to_string()));
        self.tables
            .retain(|_, d| !(d.database == database && d.table == table));
    }

    /// Full resynchronization: forget everything learned from the stream.
    pub fn drop_all(&mut self) {
        self.tables.clear();
        self.ignored.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Parse the member list out of a `set('a','b')` / `enum('x','y')`
/// declaration. Quoted commas and doubled quotes are honored.
fn parse_members(column_type: &str) -> Vec<String> {
    let lower = column_type.trim_start().to_ascii_lowercase();
    if !lower.starts_with("set(") && !lower.starts_with("enum(") {
        return Vec::new();
    }
    let open = match column_type.find('(') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let close = match column_type.rfind(')') {
        Some(i) if i > open => i,
        _ => return Vec::new(),
    };

    let mut members = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = column_type[open + 1..close].chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quote => {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    current.push('\'');
                } else {
                    in_quote = false;
                    members.push(std::mem::take(&mut current));
                }
            }
            '\'' => in_quote = true,
            _ if in_quote => current.push(c),
            _ => {}
        }
    }
    members
}
