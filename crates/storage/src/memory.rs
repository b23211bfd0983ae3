use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use snafu::OptionExt;

use super::DocumentStore;
use super::error::{
    ConflictSnafu, InvariantViolationSnafu, NotFoundSnafu, StorageResult, UnavailableSnafu,
};
use super::ids::DocumentId;
use super::types::{Document, Filter, StoredDocument, UniqueIndex, validate_name};

#[derive(Debug, Default)]
struct Collection {
    records: Vec<StoredDocument>,
    positions: HashMap<DocumentId, usize>,
    indexes: Vec<UniqueIndex>,
}

impl Collection {
    fn violated_index(&self, candidate: &Document, skip: Option<DocumentId>) -> Option<String> {
        self.indexes.iter().find_map(|index| {
            let key = index.key_of(candidate)?;
            let clashes = self
                .records
                .iter()
                .filter(|record| Some(record.id) != skip)
                .any(|record| index.key_of(&record.body).as_ref() == Some(&key));
            clashes.then(|| index.name.clone())
        })
    }

    fn position(&self, collection: &str, id: DocumentId, stage: &'static str) -> StorageResult<usize> {
        self.positions.get(&id).copied().context(NotFoundSnafu {
            stage,
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    /// Replaces the body at `position` unless that would break a unique index.
    fn replace_checked(
        &mut self,
        collection: &str,
        position: usize,
        body: Document,
        stage: &'static str,
    ) -> StorageResult<()> {
        let id = self.records[position].id;
        if let Some(constraint) = self.violated_index(&body, Some(id)) {
            return ConflictSnafu {
                stage,
                collection: collection.to_string(),
                constraint,
            }
            .fail();
        }

        self.records[position].body = body;
        Ok(())
    }
}

/// Process-local backend. Each call holds one lock for its whole duration, so
/// every operation is atomic per document, mirroring a real document store.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `collection`, placeholders included.
    pub fn len(&self, collection: &str) -> StorageResult<usize> {
        let collections = self.lock("memory-len")?;
        Ok(collections
            .get(collection)
            .map_or(0, |entries| entries.records.len()))
    }

    pub fn is_empty(&self, collection: &str) -> StorageResult<bool> {
        Ok(self.len(collection)? == 0)
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, HashMap<String, Collection>>> {
        self.collections.lock().map_err(|_| {
            UnavailableSnafu {
                stage,
                details: "memory store lock poisoned by a panicking writer".to_string(),
            }
            .build()
        })
    }

    fn scan(&self, collection: &str, filter: &Filter, stage: &'static str) -> StorageResult<Vec<StoredDocument>> {
        validate_name(collection, "collection", stage)?;
        let collections = self.lock(stage)?;
        Ok(collections
            .get(collection)
            .map(|entries| {
                entries
                    .records
                    .iter()
                    .filter(|record| filter.matches(&record.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn find_by_id(&self, collection: &str, id: DocumentId) -> StorageResult<Option<Document>> {
        validate_name(collection, "collection", "memory-find-by-id")?;
        let collections = self.lock("memory-find-by-id")?;
        Ok(collections.get(collection).and_then(|entries| {
            entries
                .positions
                .get(&id)
                .map(|position| entries.records[*position].body.clone())
        }))
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> StorageResult<Option<StoredDocument>> {
        Ok(self.scan(collection, filter, "memory-find-one")?.into_iter().next())
    }

    fn find_many(&self, collection: &str, filter: &Filter) -> StorageResult<Vec<StoredDocument>> {
        self.scan(collection, filter, "memory-find-many")
    }

    fn insert(&self, collection: &str, id: DocumentId, document: Document) -> StorageResult<()> {
        validate_name(collection, "collection", "memory-insert")?;
        let mut collections = self.lock("memory-insert")?;
        let entries = collections.entry(collection.to_string()).or_default();

        if entries.positions.contains_key(&id) {
            return ConflictSnafu {
                stage: "memory-insert-duplicate-id",
                collection: collection.to_string(),
                constraint: "id".to_string(),
            }
            .fail();
        }
        if let Some(constraint) = entries.violated_index(&document, None) {
            return ConflictSnafu {
                stage: "memory-insert-unique-index",
                collection: collection.to_string(),
                constraint,
            }
            .fail();
        }

        entries.positions.insert(id, entries.records.len());
        entries.records.push(StoredDocument { id, body: document });
        Ok(())
    }

    fn set_fields(&self, collection: &str, id: DocumentId, fields: Document) -> StorageResult<()> {
        validate_name(collection, "collection", "memory-set-fields")?;
        for field in fields.keys() {
            validate_name(field, "field", "memory-set-fields")?;
        }

        let mut collections = self.lock("memory-set-fields")?;
        let entries = collections.get_mut(collection).context(NotFoundSnafu {
            stage: "memory-set-fields-missing-collection",
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        let position = entries.position(collection, id, "memory-set-fields-missing")?;

        let mut body = entries.records[position].body.clone();
        body.extend(fields);
        entries.replace_checked(collection, position, body, "memory-set-fields-unique-index")
    }

    fn push_to_list(
        &self,
        collection: &str,
        id: DocumentId,
        field: &str,
        values: Vec<Value>,
    ) -> StorageResult<()> {
        validate_name(collection, "collection", "memory-push-to-list")?;
        validate_name(field, "field", "memory-push-to-list")?;

        let mut collections = self.lock("memory-push-to-list")?;
        let entries = collections.get_mut(collection).context(NotFoundSnafu {
            stage: "memory-push-to-list-missing-collection",
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        let position = entries.position(collection, id, "memory-push-to-list-missing")?;

        let mut body = entries.records[position].body.clone();
        match body.get_mut(field) {
            Some(Value::Array(existing)) => existing.extend(values),
            None | Some(Value::Null) => {
                body.insert(field.to_string(), Value::Array(values));
            }
            Some(other) => {
                return InvariantViolationSnafu {
                    stage: "memory-push-to-list-not-array",
                    details: format!("field '{field}' of '{id}' holds {other}, not an array"),
                }
                .fail();
            }
        }

        entries.replace_checked(collection, position, body, "memory-push-to-list-unique-index")
    }

    fn ensure_unique_index(&self, collection: &str, index: &UniqueIndex) -> StorageResult<()> {
        validate_name(collection, "collection", "memory-ensure-index")?;
        validate_name(&index.name, "index", "memory-ensure-index")?;
        for field in &index.fields {
            validate_name(field, "field", "memory-ensure-index")?;
        }

        let mut collections = self.lock("memory-ensure-index")?;
        let entries = collections.entry(collection.to_string()).or_default();

        if let Some(existing) = entries.indexes.iter().find(|existing| existing.name == index.name) {
            if existing.fields == index.fields {
                return Ok(());
            }
            return InvariantViolationSnafu {
                stage: "memory-ensure-index-redefined",
                details: format!("index '{}' already exists with other fields", index.name),
            }
            .fail();
        }

        let mut seen = Vec::new();
        for record in &entries.records {
            if let Some(key) = index.key_of(&record.body) {
                if seen.contains(&key) {
                    return ConflictSnafu {
                        stage: "memory-ensure-index-existing-duplicates",
                        collection: collection.to_string(),
                        constraint: index.name.clone(),
                    }
                    .fail();
                }
                seen.push(key);
            }
        }

        entries.indexes.push(index.clone());
        Ok(())
    }
}
