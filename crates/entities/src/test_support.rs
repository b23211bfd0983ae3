use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rapport_storage::{
    Document, DocumentId, DocumentStore, Filter, MemoryDocumentStore, StorageError, StorageResult,
    StoredDocument, UniqueIndex,
};
use serde_json::Value;

use crate::allocator::{AllocationSeed, IdentityAllocator, RandomSource};
use crate::entity::EntityContext;
use crate::ids::{PatientId, TherapistId};
use crate::party::{PATIENTS, Patient, THERAPISTS, Therapist};

/// Replays scripted draws, then counts upward from a high base.
#[derive(Debug)]
pub(crate) struct ScriptedRandom {
    script: Mutex<VecDeque<u64>>,
    fallback: AtomicU64,
}

impl ScriptedRandom {
    pub(crate) fn new(script: impl IntoIterator<Item = u64>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: AtomicU64::new(1 << 40),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

impl RandomSource for ScriptedRandom {
    fn draw(&self) -> u64 {
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.fetch_add(1, Ordering::SeqCst))
    }
}

/// Memory store with injectable failures for partial-write scenarios.
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    inner: MemoryDocumentStore,
    writes_before_failure: Mutex<Option<usize>>,
    forced_conflicts: AtomicUsize,
    insert_calls: AtomicUsize,
    blind_lookups: AtomicBool,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &MemoryDocumentStore {
        &self.inner
    }

    /// Lets `writes` more writes through, then fails every write.
    pub(crate) fn fail_writes_after(&self, writes: usize) {
        *self.writes_before_failure.lock().expect("fault lock") = Some(writes);
    }

    pub(crate) fn heal(&self) {
        *self.writes_before_failure.lock().expect("fault lock") = None;
    }

    /// Makes the next `count` inserts report a uniqueness conflict without writing.
    pub(crate) fn force_conflicts(&self, count: usize) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Makes `find_one` miss everything, as a racing reader would.
    pub(crate) fn blind_lookups(&self, blind: bool) {
        self.blind_lookups.store(blind, Ordering::SeqCst);
    }

    pub(crate) fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn gate_write(&self, stage: &'static str) -> StorageResult<()> {
        let mut remaining = self.writes_before_failure.lock().expect("fault lock");
        match remaining.as_mut() {
            Some(0) => Err(StorageError::Unavailable {
                stage,
                details: "injected write failure".to_string(),
            }),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl DocumentStore for FaultyStore {
    fn find_by_id(&self, collection: &str, id: DocumentId) -> StorageResult<Option<Document>> {
        self.inner.find_by_id(collection, id)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> StorageResult<Option<StoredDocument>> {
        if self.blind_lookups.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_one(collection, filter)
    }

    fn find_many(&self, collection: &str, filter: &Filter) -> StorageResult<Vec<StoredDocument>> {
        self.inner.find_many(collection, filter)
    }

    fn insert(&self, collection: &str, id: DocumentId, document: Document) -> StorageResult<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if forced {
            return Err(StorageError::Conflict {
                stage: "faulty-insert",
                collection: collection.to_string(),
                constraint: "id".to_string(),
            });
        }

        self.gate_write("faulty-insert")?;
        self.inner.insert(collection, id, document)
    }

    fn set_fields(&self, collection: &str, id: DocumentId, fields: Document) -> StorageResult<()> {
        self.gate_write("faulty-set-fields")?;
        self.inner.set_fields(collection, id, fields)
    }

    fn push_to_list(
        &self,
        collection: &str,
        id: DocumentId,
        field: &str,
        values: Vec<Value>,
    ) -> StorageResult<()> {
        self.gate_write("faulty-push-to-list")?;
        self.inner.push_to_list(collection, id, field, values)
    }

    fn ensure_unique_index(&self, collection: &str, index: &UniqueIndex) -> StorageResult<()> {
        self.inner.ensure_unique_index(collection, index)
    }
}

pub(crate) fn memory_context() -> (Arc<MemoryDocumentStore>, EntityContext) {
    let store = Arc::new(MemoryDocumentStore::new());
    let context = EntityContext::new(store.clone()).with_allocator(IdentityAllocator::seeded(7));
    (store, context)
}

pub(crate) fn faulty_context() -> (Arc<FaultyStore>, EntityContext) {
    let store = Arc::new(FaultyStore::new());
    let context = EntityContext::new(store.clone()).with_allocator(IdentityAllocator::seeded(11));
    (store, context)
}

fn seed_party(context: &EntityContext, collection: &str, email: &str, full_name: &str) -> DocumentId {
    let id = context
        .allocator()
        .allocate(context.store(), collection, &AllocationSeed::new(email))
        .expect("allocate party");
    let mut fields = Document::new();
    fields.insert("email".to_string(), Value::from(email));
    fields.insert("full_name".to_string(), Value::from(full_name));
    context
        .store()
        .set_fields(collection, id, fields)
        .expect("populate party");
    id
}

pub(crate) fn seed_patient(context: &EntityContext, email: &str, full_name: &str) -> Patient {
    let id = PatientId::from(seed_party(context, PATIENTS, email, full_name));
    Patient::load(context, id).expect("load seeded patient")
}

pub(crate) fn seed_therapist(context: &EntityContext, email: &str, full_name: &str) -> Therapist {
    let id = TherapistId::from(seed_party(context, THERAPISTS, email, full_name));
    Therapist::load(context, id).expect("load seeded therapist")
}
