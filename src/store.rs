//! The record store: one schema, an ordered list of records, and the
//! "list changed" signal that keeps dependent caches honest.
//!
//! Every successful mutation bumps the store generation and notifies the
//! registered observers before the mutating call returns, so an observer never
//! sees a half-updated store.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::{MergeError, Result};
use crate::record::{FieldDef, FieldType, Record, RecordRef, Schema};

/// What kind of mutation produced a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Contents and schema replaced wholesale.
    Loaded,
    /// Records removed by a filter.
    Filtered,
    /// Records reordered.
    Sorted,
    /// A derived field appended or rewritten.
    FieldsChanged,
}

impl ChangeKind {
    /// Whether field ordinals may have moved, invalidating name lookups.
    pub fn alters_schema(&self) -> bool {
        matches!(self, ChangeKind::Loaded | ChangeKind::FieldsChanged)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Loaded => "loaded",
            ChangeKind::Filtered => "filtered",
            ChangeKind::Sorted => "sorted",
            ChangeKind::FieldsChanged => "fields changed",
        };
        f.write_str(name)
    }
}

/// Payload of the "list changed" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListChange {
    pub kind: ChangeKind,
    pub generation: u64,
    pub size: usize,
    pub loaded: bool,
}

/// Receiver of the "list changed" signal.
pub trait ListObserver: Send {
    fn list_changed(&mut self, change: &ListChange);
}

/// Shared handle under which observers are registered.
pub type ObserverHandle = Arc<Mutex<dyn ListObserver>>;

/// Ordered records sharing one schema.
#[derive(Default)]
pub struct RecordStore {
    schema: Arc<Schema>,
    records: Vec<Record>,
    loaded: bool,
    generation: u64,
    observers: Vec<Weak<Mutex<dyn ListObserver>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace schema and records atomically.
    ///
    /// On `SchemaMismatch` the previous contents are left untouched and no
    /// notification is sent.
    pub fn load(&mut self, schema: Schema, records: Vec<Record>) -> Result<()> {
        for (i, record) in records.iter().enumerate() {
            if !record.conforms_to(&schema) {
                return Err(MergeError::SchemaMismatch {
                    record: Some(i + 1),
                    reason: format!(
                        "expected {} value(s), found {}",
                        schema.len(),
                        record.len()
                    ),
                });
            }
        }
        self.loaded = !schema.is_empty();
        self.schema = Arc::new(schema);
        self.records = records;
        self.notify(ChangeKind::Loaded);
        Ok(())
    }

    /// Whether a valid schema with at least one field has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The schema instance every record is read through.
    pub fn shared_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    pub fn field_count(&self) -> usize {
        self.schema.len()
    }

    pub fn field_at(&self, index: usize) -> Result<&FieldDef> {
        self.schema.field(index).ok_or(MergeError::IndexOutOfRange {
            index,
            len: self.schema.len(),
        })
    }

    pub fn record_at(&self, index: usize) -> Result<RecordRef<'_>> {
        self.records
            .get(index)
            .map(|r| RecordRef::new(&self.schema, r))
            .ok_or(MergeError::IndexOutOfRange {
                index,
                len: self.records.len(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordRef<'_>> {
        self.records.iter().map(|r| RecordRef::new(&self.schema, r))
    }

    /// Name of the most recently appended derived field, if any.
    pub fn merge_field(&self) -> Option<&str> {
        self.schema
            .fields()
            .iter()
            .rev()
            .find(|f| f.derived)
            .map(|f| f.name.as_str())
    }

    /// Register an observer. The store keeps a weak reference; dropping
    /// the last strong handle unsubscribes it.
    pub fn subscribe(&mut self, observer: &ObserverHandle) {
        self.observers.push(Arc::downgrade(observer));
    }

    #[cfg(test)]
    fn observer_count(&self) -> usize {
        self.observers.iter().filter(|o| o.strong_count() > 0).count()
    }

    /// Keep only the records for which `keep` returns true, preserving order.
    /// Returns how many were removed.
    pub(crate) fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(RecordRef<'_>) -> bool,
    {
        let before = self.records.len();
        let schema = Arc::clone(&self.schema);
        self.records.retain(|r| keep(RecordRef::new(&schema, r)));
        let removed = before - self.records.len();
        if removed > 0 {
            self.notify(ChangeKind::Filtered);
        }
        removed
    }

    /// Reorder records by a permutation of their current indices.
    pub(crate) fn reorder(&mut self, order: &[usize]) -> Result<()> {
        if order.len() != self.records.len() {
            return Err(MergeError::IndexOutOfRange {
                index: order.len(),
                len: self.records.len(),
            });
        }
        let len = self.records.len();
        let mut seen = vec![false; len];
        for &i in order {
            if i >= len || std::mem::replace(&mut seen[i], true) {
                return Err(MergeError::IndexOutOfRange { index: i, len });
            }
        }
        let mut taken: Vec<Option<Record>> = self.records.drain(..).map(Some).collect();
        let reordered: Vec<Record> = order
            .iter()
            .filter_map(|&i| taken[i].take())
            .collect();
        self.records = reordered;
        self.notify(ChangeKind::Sorted);
        Ok(())
    }

    /// Set a derived field to `values`, one per record in store order.
    ///
    /// Appends the field if it does not exist yet. Rewriting a field that
    /// came from the source is refused.
    pub(crate) fn set_derived_field(
        &mut self,
        name: &str,
        kind: FieldType,
        values: Vec<String>,
    ) -> Result<()> {
        if values.len() != self.records.len() {
            return Err(MergeError::SchemaMismatch {
                record: None,
                reason: format!(
                    "{} derived value(s) for {} record(s)",
                    values.len(),
                    self.records.len()
                ),
            });
        }
        match self.schema.field_named(name) {
            Some(field) if !field.derived => {
                return Err(MergeError::SchemaMismatch {
                    record: None,
                    reason: format!("'{name}' is a source field and cannot be derived"),
                });
            }
            Some(field) => {
                let ordinal = field.ordinal;
                for (record, value) in self.records.iter_mut().zip(values) {
                    record.set(ordinal, value);
                }
            }
            None => {
                let schema = self.schema.with_derived(name, kind)?;
                for (record, value) in self.records.iter_mut().zip(values) {
                    record.push(value);
                }
                self.schema = Arc::new(schema);
            }
        }
        self.notify(ChangeKind::FieldsChanged);
        Ok(())
    }

    fn notify(&mut self, kind: ChangeKind) {
        self.generation += 1;
        let change = ListChange {
            kind,
            generation: self.generation,
            size: self.records.len(),
            loaded: self.loaded,
        };
        self.observers.retain(|o| o.strong_count() > 0);
        for observer in self.observers.iter().filter_map(Weak::upgrade) {
            observer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .list_changed(&change);
        }
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("fields", &self.schema.len())
            .field("records", &self.records.len())
            .field("loaded", &self.loaded)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Tally {
        changes: Vec<ListChange>,
    }

    impl ListObserver for Tally {
        fn list_changed(&mut self, change: &ListChange) {
            self.changes.push(*change);
        }
    }

    fn people() -> (Schema, Vec<Record>) {
        let schema = Schema::from_names(["name", "dept"]).unwrap();
        let records = vec![
            Record::from_values(&["Ann", "SALES"]),
            Record::from_values(&["Bob", "ENGINEER"]),
            Record::from_values(&["Cid", "SALES"]),
        ];
        (schema, records)
    }

    #[test]
    fn test_load_then_read_back() {
        let (schema, records) = people();
        let mut store = RecordStore::new();
        assert!(!store.is_loaded());
        store.load(schema.clone(), records).unwrap();
        assert!(store.is_loaded());
        assert_eq!(store.size(), 3);
        assert_eq!(store.field_count(), 2);
        for i in 0..store.size() {
            let record = store.record_at(i).unwrap();
            assert!(record.record().conforms_to(&schema));
        }
        assert_eq!(store.record_at(1).unwrap().get("name"), Some("Bob"));
        assert_eq!(store.field_at(1).unwrap().name, "dept");
    }

    #[test]
    fn test_mismatch_leaves_prior_state() {
        let (schema, records) = people();
        let mut store = RecordStore::new();
        store.load(schema, records).unwrap();
        let generation = store.generation();

        let bad_schema = Schema::from_names(["a", "b", "c"]).unwrap();
        let bad = vec![
            Record::from_values(&["1", "2", "3"]),
            Record::from_values(&["1", "2"]),
        ];
        let err = store.load(bad_schema, bad).unwrap_err();
        assert_eq!(
            err,
            MergeError::SchemaMismatch {
                record: Some(2),
                reason: "expected 3 value(s), found 2".to_string(),
            }
        );
        assert_eq!(store.size(), 3);
        assert_eq!(store.field_count(), 2);
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_out_of_range_accessors() {
        let store = RecordStore::new();
        assert_eq!(
            store.record_at(0).unwrap_err(),
            MergeError::IndexOutOfRange { index: 0, len: 0 }
        );
        assert!(store.field_at(0).is_err());
    }

    #[test]
    fn test_observers_notified_synchronously() {
        let (schema, records) = people();
        let tally = Arc::new(Mutex::new(Tally::default()));
        let handle: ObserverHandle = tally.clone();
        let mut store = RecordStore::new();
        store.subscribe(&handle);

        store.load(schema, records).unwrap();
        store.retain(|r| r.get("dept") == Some("SALES"));
        store.reorder(&[1, 0]).unwrap();

        let tally = tally.lock().unwrap();
        let kinds: Vec<_> = tally.changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Loaded, ChangeKind::Filtered, ChangeKind::Sorted]
        );
        assert_eq!(tally.changes[1].size, 2);
        assert_eq!(tally.changes[2].generation, 3);
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let mut store = RecordStore::new();
        {
            let handle: ObserverHandle = Arc::new(Mutex::new(Tally::default()));
            store.subscribe(&handle);
            assert_eq!(store.observer_count(), 1);
        }
        assert_eq!(store.observer_count(), 0);
        let (schema, records) = people();
        store.load(schema, records).unwrap();
    }

    #[test]
    fn test_retain_without_removal_is_silent() {
        let (schema, records) = people();
        let mut store = RecordStore::new();
        store.load(schema, records).unwrap();
        let generation = store.generation();
        assert_eq!(store.retain(|_| true), 0);
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_reorder_rejects_non_permutation() {
        let (schema, records) = people();
        let mut store = RecordStore::new();
        store.load(schema, records).unwrap();
        assert!(store.reorder(&[0, 0, 1]).is_err());
        assert_eq!(store.size(), 3);
    }

    #[test]
    fn test_derived_field_append_and_rewrite() {
        let (schema, records) = people();
        let mut store = RecordStore::new();
        store.load(schema, records).unwrap();

        let values = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        store
            .set_derived_field("merged", FieldType::Text, values)
            .unwrap();
        assert_eq!(store.field_count(), 3);
        assert_eq!(store.merge_field(), Some("merged"));
        assert_eq!(store.record_at(2).unwrap().get("merged"), Some("c"));

        let values = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        store
            .set_derived_field("merged", FieldType::Text, values)
            .unwrap();
        assert_eq!(store.field_count(), 3);
        assert_eq!(store.record_at(0).unwrap().get("merged"), Some("x"));

        let values = vec![String::new(); 3];
        assert!(store.set_derived_field("name", FieldType::Text, values).is_err());
    }
}
