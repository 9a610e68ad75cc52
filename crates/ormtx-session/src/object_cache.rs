//! Session-scoped object cache.
//!
//! The cache holds one snapshot per loaded object, keyed by identity, so that
//! repeated `get` calls inside a session are served without a round-trip and
//! every part of a unit of work sees the same values.
//!
//! # Design
//!
//! A snapshot stores the *persisted* values of an object: the values last
//! read from or flushed to the database. Uncommitted writes live in the
//! [`AccessTracker`](crate::AccessTracker) until they are flushed. Lazy
//! columns are absent from a snapshot until first read.
//!
//! Iteration follows insertion order so that flushes issue statements in a
//! deterministic order.

use ormtx_core::{Entity, Error, QueryError, QueryErrorKind, Row, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Identity of a cached object: its table and a hash of its key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Table the object is stored in.
    table: &'static str,
    /// Hash of the primary key value(s).
    pk_hash: u64,
}

impl ObjectKey {
    /// Create an object key from an entity and its key values.
    pub fn new(entity: &Entity, key: &[Value]) -> Self {
        Self {
            table: entity.table,
            pk_hash: hash_values(key),
        }
    }

    /// Get the table name.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Get the primary key hash.
    pub fn pk_hash(&self) -> u64 {
        self.pk_hash
    }
}

/// Hash a slice of values for use as a primary key hash.
///
/// Integer widths hash alike, matching [`Value::same_as`].
fn hash_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    for v in values {
        hash_value(v, &mut hasher);
    }
    hasher.finish()
}

/// Hash a single value into the hasher.
fn hash_value(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i64::from(*i).hash(hasher);
        }
        Value::BigInt(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Double(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            6u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Timestamp(ts) => {
            7u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            8u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            9u8.hash(hasher);
            j.to_string().hash(hasher);
        }
    }
}

/// State of an object in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Created in this session, pending INSERT.
    New,
    /// Loaded from (or flushed to) the database.
    Persistent,
    /// Marked for deletion, pending DELETE.
    Deleted,
}

/// A cached object snapshot.
#[derive(Debug, Clone)]
pub struct CachedObject {
    entity: Entity,
    key: Vec<Value>,
    values: HashMap<&'static str, Value>,
    state: ObjectState,
    locked: bool,
}

impl CachedObject {
    /// The entity this object belongs to.
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Primary key values.
    pub fn key(&self) -> &[Value] {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Is the row locked by the current transaction?
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Persisted value of a column, if loaded.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Has this column been loaded?
    pub fn is_loaded(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Loaded columns and their values, in entity column order.
    pub fn loaded_values(&self) -> Vec<(&'static str, &Value)> {
        self.entity
            .columns
            .iter()
            .filter_map(|col| self.values.get(col).map(|v| (*col, v)))
            .collect()
    }

    /// Human-readable identity, e.g. `Account[1]`.
    pub fn describe(&self) -> String {
        self.entity.describe(&self.key)
    }

    pub(crate) fn set_value(&mut self, column: &'static str, value: Value) {
        self.values.insert(column, value);
    }

    pub(crate) fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }
}

/// Extract the key values and known columns of `entity` from a driver row.
pub(crate) fn split_row(
    entity: &Entity,
    row: &Row,
) -> Result<(Vec<Value>, HashMap<&'static str, Value>), Error> {
    let mut key = Vec::with_capacity(entity.primary_key.len());
    for col in entity.primary_key {
        let Some(value) = row.get_by_name(col) else {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::NotFound,
                sql: None,
                message: format!("row for {} lacks key column '{col}'", entity.name),
                source: None,
            }));
        };
        key.push(value.clone());
    }
    let values = row
        .iter()
        .filter_map(|(name, value)| entity.column(name).map(|col| (col, value.clone())))
        .collect();
    Ok((key, values))
}

/// Session-scoped store of loaded objects.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: HashMap<ObjectKey, CachedObject>,
    order: Vec<ObjectKey>,
}

impl ObjectCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Is this object cached?
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    /// Get a cached object.
    pub fn get(&self, key: &ObjectKey) -> Option<&CachedObject> {
        self.objects.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &ObjectKey) -> Option<&mut CachedObject> {
        self.objects.get_mut(key)
    }

    /// Keys of cached objects in insertion order.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.order.clone()
    }

    /// Keys of cached objects in `state`, in insertion order.
    pub fn keys_in_state(&self, state: ObjectState) -> Vec<ObjectKey> {
        self.order
            .iter()
            .filter(|key| self.objects.get(key).is_some_and(|o| o.state == state))
            .copied()
            .collect()
    }

    /// Insert an object, replacing any previous entry with the same identity.
    #[tracing::instrument(level = "trace", skip(self, key, values), fields(table = entity.table))]
    pub(crate) fn insert(
        &mut self,
        entity: Entity,
        key: Vec<Value>,
        values: HashMap<&'static str, Value>,
        state: ObjectState,
    ) -> ObjectKey {
        let object_key = ObjectKey::new(&entity, &key);
        tracing::trace!(pk_hash = object_key.pk_hash(), ?state, "Caching object");
        let previous = self.objects.insert(
            object_key,
            CachedObject {
                entity,
                key,
                values,
                state,
                locked: false,
            },
        );
        if previous.is_none() {
            self.order.push(object_key);
        }
        object_key
    }

    /// Remove an object.
    pub(crate) fn remove(&mut self, key: &ObjectKey) -> Option<CachedObject> {
        let removed = self.objects.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Drop every row lock flag.
    pub(crate) fn unlock_all(&mut self) {
        for object in self.objects.values_mut() {
            object.locked = false;
        }
    }

    /// Evict every object.
    pub(crate) fn clear(&mut self) {
        let evicted = self.objects.len();
        self.objects.clear();
        self.order.clear();
        if evicted > 0 {
            tracing::debug!(evicted, "Cleared object cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: Entity = Entity::new("Account", "accounts", &["id"], &["id", "owner", "balance"]);
    const AUDIT: Entity = Entity::new("Audit", "audits", &["id"], &["id", "note"]);

    fn values(pairs: &[(&'static str, Value)]) -> HashMap<&'static str, Value> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_object_key_hash_consistency() {
        let a = ObjectKey::new(&ACCOUNT, &[Value::BigInt(42)]);
        let b = ObjectKey::new(&ACCOUNT, &[Value::BigInt(42)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_object_key_integer_widths_match() {
        let a = ObjectKey::new(&ACCOUNT, &[Value::Int(7)]);
        let b = ObjectKey::new(&ACCOUNT, &[Value::BigInt(7)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_object_key_differs_by_table_and_value() {
        let a = ObjectKey::new(&ACCOUNT, &[Value::BigInt(1)]);
        assert_ne!(a, ObjectKey::new(&AUDIT, &[Value::BigInt(1)]));
        assert_ne!(a, ObjectKey::new(&ACCOUNT, &[Value::BigInt(2)]));
        assert_ne!(a, ObjectKey::new(&ACCOUNT, &[Value::Text("1".into())]));
    }

    #[test]
    fn test_insert_keeps_order_and_replaces() {
        let mut cache = ObjectCache::new();
        let k2 = cache.insert(ACCOUNT, vec![Value::BigInt(2)], values(&[]), ObjectState::Persistent);
        let k1 = cache.insert(ACCOUNT, vec![Value::BigInt(1)], values(&[]), ObjectState::New);
        let again = cache.insert(
            ACCOUNT,
            vec![Value::BigInt(2)],
            values(&[("balance", Value::BigInt(3))]),
            ObjectState::Persistent,
        );
        assert_eq!(again, k2);
        assert_eq!(cache.keys(), vec![k2, k1]);
        assert_eq!(cache.keys_in_state(ObjectState::New), vec![k1]);
        assert_eq!(
            cache.get(&k2).and_then(|o| o.value("balance")),
            Some(&Value::BigInt(3))
        );
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = ObjectCache::new();
        let k = cache.insert(ACCOUNT, vec![Value::BigInt(1)], values(&[]), ObjectState::Persistent);
        cache.insert(ACCOUNT, vec![Value::BigInt(2)], values(&[]), ObjectState::Persistent);
        assert!(cache.remove(&k).is_some());
        assert!(!cache.contains(&k));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_split_row_ignores_unknown_columns() {
        let row = Row::new(
            vec!["id".into(), "balance".into(), "extra".into()],
            vec![Value::BigInt(1), Value::BigInt(10), Value::Bool(true)],
        );
        let (key, vals) = split_row(&ACCOUNT, &row).unwrap();
        assert_eq!(key, vec![Value::BigInt(1)]);
        assert_eq!(vals.len(), 2);
        assert!(!vals.contains_key("owner"));

        let keyless = Row::new(vec!["balance".into()], vec![Value::BigInt(1)]);
        assert!(split_row(&ACCOUNT, &keyless).is_err());
    }

    #[test]
    fn test_loaded_values_follow_entity_order() {
        let mut cache = ObjectCache::new();
        let k = cache.insert(
            ACCOUNT,
            vec![Value::BigInt(1)],
            values(&[("balance", Value::BigInt(5)), ("id", Value::BigInt(1))]),
            ObjectState::Persistent,
        );
        let object = cache.get(&k).unwrap();
        let cols: Vec<&str> = object.loaded_values().iter().map(|(c, _)| *c).collect();
        assert_eq!(cols, vec!["id", "balance"]);
        assert!(!object.is_loaded("owner"));
        assert_eq!(object.describe(), "Account[1]");
    }
}
