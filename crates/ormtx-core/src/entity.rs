//! Entity descriptors.
//!
//! The mapping layer that turns Rust structs into rows lives outside this
//! workspace. The engine only needs to know, per entity, which table it is
//! stored in, which columns form its identity, which columns exist and which
//! of them are loaded lazily.

use crate::value::Value;

/// Static metadata for one mapped entity.
///
/// ```ignore
/// const ACCOUNT: Entity = Entity::new("Account", "accounts", &["id"], &["id", "owner", "balance", "notes"])
///     .with_lazy(&["notes"]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    /// Entity name, used in diagnostics
    pub name: &'static str,
    /// Table name
    pub table: &'static str,
    /// Primary key columns
    pub primary_key: &'static [&'static str],
    /// All columns, including the primary key
    pub columns: &'static [&'static str],
    /// Columns that are not fetched until first read
    pub lazy: &'static [&'static str],
}

impl Entity {
    /// Describe an entity with no lazy columns.
    pub const fn new(
        name: &'static str,
        table: &'static str,
        primary_key: &'static [&'static str],
        columns: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            table,
            primary_key,
            columns,
            lazy: &[],
        }
    }

    /// Mark columns as lazily loaded.
    pub const fn with_lazy(mut self, lazy: &'static [&'static str]) -> Self {
        self.lazy = lazy;
        self
    }

    /// Look up a column by name, returning its static name.
    pub fn column(&self, name: &str) -> Option<&'static str> {
        self.columns.iter().copied().find(|c| *c == name)
    }

    /// Is this column part of the primary key?
    pub fn is_key(&self, name: &str) -> bool {
        self.primary_key.contains(&name)
    }

    /// Is this column loaded lazily?
    pub fn is_lazy(&self, name: &str) -> bool {
        self.lazy.contains(&name)
    }

    /// Columns fetched when an object is loaded.
    pub fn eager_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .copied()
            .filter(|c| !self.is_lazy(c))
            .collect()
    }

    /// Pair key columns with key values, for statement filters.
    pub fn key_filter(&self, key: &[Value]) -> Vec<(String, Value)> {
        self.primary_key
            .iter()
            .zip(key.iter())
            .map(|(col, val)| ((*col).to_string(), val.clone()))
            .collect()
    }

    /// Human-readable identity of one object, e.g. `Account[1]`.
    pub fn describe(&self, key: &[Value]) -> String {
        let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
        format!("{}[{}]", self.name, parts.join(", "))
    }
}
