//! Per-transaction attribute access tracking.
//!
//! The tracker records, for every object touched in the current transaction,
//! which attributes were read and which were written. It is the input of the
//! commit-time optimistic check (accessed or modified attributes are
//! compared against the database) and of the partial-column UPDATE (only
//! modified attributes are written).
//!
//! The tracker is cleared when a transaction ends; the object cache is not.

use crate::ObjectKey;
use ormtx_core::Value;
use std::collections::HashMap;

/// Tracking entry for one attribute of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedAttribute {
    /// Persisted value when the attribute was first touched in this transaction.
    pub original: Value,
    /// Value as seen by the unit of work.
    pub current: Value,
    /// Was the attribute read?
    pub accessed: bool,
    /// Was the attribute written?
    pub modified: bool,
}

impl TrackedAttribute {
    /// Does this attribute take part in the optimistic check?
    pub fn is_checked(&self) -> bool {
        self.accessed || self.modified
    }
}

/// Records attribute reads and writes for the current transaction.
#[derive(Debug, Default)]
pub struct AccessTracker {
    objects: HashMap<ObjectKey, HashMap<&'static str, TrackedAttribute>>,
    order: Vec<ObjectKey>,
}

impl AccessTracker {
    /// Create a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, key: ObjectKey) -> &mut HashMap<&'static str, TrackedAttribute> {
        if !self.objects.contains_key(&key) {
            self.order.push(key);
        }
        self.objects.entry(key).or_default()
    }

    /// Record a read of `attr`, whose persisted value is `persisted`.
    ///
    /// Returns the value the unit of work should see: the pending write if
    /// the attribute was already written, otherwise `persisted`.
    #[tracing::instrument(level = "trace", skip(self, key, persisted), fields(pk_hash = key.pk_hash()))]
    pub fn on_read(&mut self, key: ObjectKey, attr: &'static str, persisted: &Value) -> Value {
        let tracked = self
            .entry(key)
            .entry(attr)
            .or_insert_with(|| TrackedAttribute {
                original: persisted.clone(),
                current: persisted.clone(),
                accessed: false,
                modified: false,
            });
        tracked.accessed = true;
        tracked.current.clone()
    }

    /// Record a write of `value` to `attr`, whose persisted value is `persisted`.
    #[tracing::instrument(level = "trace", skip(self, key, persisted, value), fields(pk_hash = key.pk_hash()))]
    pub fn on_write(&mut self, key: ObjectKey, attr: &'static str, persisted: &Value, value: Value) {
        let tracked = self
            .entry(key)
            .entry(attr)
            .or_insert_with(|| TrackedAttribute {
                original: persisted.clone(),
                current: persisted.clone(),
                accessed: false,
                modified: false,
            });
        tracked.current = value;
        tracked.modified = true;
    }

    /// Tracking entry for one attribute.
    pub fn get(&self, key: &ObjectKey, attr: &str) -> Option<&TrackedAttribute> {
        self.objects.get(key).and_then(|attrs| attrs.get(attr))
    }

    /// Is anything tracked for this object?
    pub fn is_tracked(&self, key: &ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    /// Touched objects in first-touch order.
    pub fn objects(&self) -> &[ObjectKey] {
        &self.order
    }

    /// Attributes of `key` taking part in the optimistic check, with their originals.
    pub fn checked(&self, key: &ObjectKey) -> Vec<(&'static str, Value)> {
        let mut checked: Vec<(&'static str, Value)> = self
            .objects
            .get(key)
            .into_iter()
            .flatten()
            .filter(|(_, t)| t.is_checked())
            .map(|(attr, t)| (*attr, t.original.clone()))
            .collect();
        checked.sort_by_key(|(attr, _)| *attr);
        checked
    }

    /// Modified attributes of `key`, with their pending values.
    pub fn modified(&self, key: &ObjectKey) -> Vec<(&'static str, Value)> {
        let mut modified: Vec<(&'static str, Value)> = self
            .objects
            .get(key)
            .into_iter()
            .flatten()
            .filter(|(_, t)| t.modified)
            .map(|(attr, t)| (*attr, t.current.clone()))
            .collect();
        modified.sort_by_key(|(attr, _)| *attr);
        modified
    }

    /// Does any object have an unflushed write?
    pub fn has_modifications(&self) -> bool {
        self.objects
            .values()
            .any(|attrs| attrs.values().any(|t| t.modified))
    }

    /// Flushed writes become the new originals.
    pub(crate) fn mark_flushed(&mut self) {
        for tracked in self.objects.values_mut().flat_map(HashMap::values_mut) {
            if tracked.modified {
                tracked.original = tracked.current.clone();
                tracked.modified = false;
                tracked.accessed = true;
            }
        }
    }

    /// Stop tracking one object.
    pub(crate) fn forget(&mut self, key: &ObjectKey) {
        if self.objects.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    /// Number of tracked objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Is nothing tracked?
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Forget everything; called when a transaction ends.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.order.clear();
    }
}
