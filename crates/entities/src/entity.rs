//! Shared persistence plumbing for every entity kind.

use std::fmt;
use std::sync::Arc;

use rapport_storage::{Document, DocumentId, DocumentStore, SqliteDocumentStore};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};

use crate::allocator::{AllocationSeed, IdentityAllocator};
use crate::error::{EntityResult, MalformedDocumentSnafu, NotFoundSnafu, StoreSnafu};
use crate::request::Request;
use crate::settings::RapportSettings;

/// Store handle plus allocator, cloned into every entity it produces.
#[derive(Clone)]
pub struct EntityContext {
    store: Arc<dyn DocumentStore>,
    allocator: IdentityAllocator,
}

impl fmt::Debug for EntityContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EntityContext")
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

impl EntityContext {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            allocator: IdentityAllocator::default(),
        }
    }

    pub fn with_allocator(mut self, allocator: IdentityAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Opens the configured SQLite store, installing the request pair index when enabled.
    pub async fn open_sqlite(settings: &RapportSettings) -> EntityResult<Self> {
        let store = SqliteDocumentStore::open_with(&settings.database_location, settings.sqlite_options())
            .await
            .context(StoreSnafu {
                stage: "open-sqlite-store",
            })?;

        let context = Self::new(Arc::new(store)).with_allocator(settings.allocator());
        if settings.enforce_request_pair_index {
            Request::install_pair_index(&context)?;
        }

        Ok(context)
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn allocator(&self) -> &IdentityAllocator {
        &self.allocator
    }

    pub(crate) fn allocate(&self, collection: &str, seed: &AllocationSeed) -> EntityResult<DocumentId> {
        self.allocator
            .allocate(self.store(), collection, seed)
            .context(StoreSnafu {
                stage: "allocate-identity",
            })
    }
}

/// When an entity reads its fields from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hydration {
    /// Fields are read once at reconstruction and served from memory afterwards.
    EagerSnapshot,
    /// Nothing is cached; each read is an explicit round trip.
    LiveRead,
}

/// An in-memory object bound to exactly one record of [`Self::COLLECTION`].
pub trait PersistentEntity {
    const COLLECTION: &'static str;
    const ENTITY: &'static str;
    const HYDRATION: Hydration;

    fn document_id(&self) -> DocumentId;

    fn context(&self) -> &EntityContext;

    /// Current stored record.
    fn get(&self) -> EntityResult<Document> {
        load_document(self.context(), Self::COLLECTION, Self::ENTITY, self.document_id())
    }

    /// Sets `fields` on the stored record. Re-running the same update is harmless.
    fn update(&self, fields: Document) -> EntityResult<()> {
        self.context()
            .store()
            .set_fields(Self::COLLECTION, self.document_id(), fields)
            .context(StoreSnafu {
                stage: "entity-update",
            })
    }

    fn exists(&self) -> EntityResult<bool> {
        let found = self
            .context()
            .store()
            .find_by_id(Self::COLLECTION, self.document_id())
            .context(StoreSnafu {
                stage: "entity-exists",
            })?;
        Ok(found.is_some())
    }
}

pub(crate) fn load_document(
    context: &EntityContext,
    collection: &str,
    entity: &'static str,
    id: DocumentId,
) -> EntityResult<Document> {
    context
        .store()
        .find_by_id(collection, id)
        .context(StoreSnafu {
            stage: "entity-load",
        })?
        .context(NotFoundSnafu {
            entity,
            id: id.to_string(),
        })
}

pub(crate) fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Document {
    pairs
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect()
}

/// Typed access to one stored record, reporting which field of which entity is off.
pub(crate) struct FieldReader<'a> {
    entity: &'static str,
    id: DocumentId,
    document: &'a Document,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(entity: &'static str, id: DocumentId, document: &'a Document) -> Self {
        Self {
            entity,
            id,
            document,
        }
    }

    fn present(&self, field: &str) -> Option<&'a Value> {
        self.document.get(field).filter(|value| !value.is_null())
    }

    fn malformed<T>(&self, field: &'static str, details: impl Into<String>) -> EntityResult<T> {
        MalformedDocumentSnafu {
            entity: self.entity,
            id: self.id.to_string(),
            field,
            details: details.into(),
        }
        .fail()
    }

    pub(crate) fn read_string(&self, field: &'static str) -> EntityResult<String> {
        match self.read_optional_string(field)? {
            Some(text) => Ok(text),
            None => self.malformed(field, "missing"),
        }
    }

    pub(crate) fn read_optional_string(&self, field: &'static str) -> EntityResult<Option<String>> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(other) => self.malformed(field, format!("expected a string, found {other}")),
        }
    }

    pub(crate) fn read_bool(&self, field: &'static str) -> EntityResult<bool> {
        match self.present(field) {
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(other) => self.malformed(field, format!("expected a boolean, found {other}")),
            None => self.malformed(field, "missing"),
        }
    }

    /// Unset flags read as `false`, which covers records still being populated.
    pub(crate) fn read_bool_or_false(&self, field: &'static str) -> EntityResult<bool> {
        match self.present(field) {
            None => Ok(false),
            Some(_) => self.read_bool(field),
        }
    }

    pub(crate) fn read_id<T: From<DocumentId>>(&self, field: &'static str) -> EntityResult<T> {
        let raw = self.read_string(field)?;
        match DocumentId::parse(&raw) {
            Ok(id) => Ok(T::from(id)),
            Err(error) => self.malformed(field, error.to_string()),
        }
    }

    pub(crate) fn read_id_list<T: From<DocumentId>>(&self, field: &'static str) -> EntityResult<Vec<T>> {
        let entries = match self.present(field) {
            None => return Ok(Vec::new()),
            Some(Value::Array(entries)) => entries,
            Some(other) => return self.malformed(field, format!("expected an array, found {other}")),
        };

        entries
            .iter()
            .map(|entry| match entry {
                Value::String(raw) => match DocumentId::parse(raw) {
                    Ok(id) => Ok(T::from(id)),
                    Err(error) => self.malformed(field, error.to_string()),
                },
                other => self.malformed(field, format!("expected id strings, found {other}")),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::error::EntityError;
    use crate::ids::MessageId;
    use crate::test_support::memory_context;

    fn reader_over(document: &Document) -> FieldReader<'_> {
        FieldReader::new("message", DocumentId::new(Uuid::from_u128(1)), document)
    }

    #[test]
    fn reader_distinguishes_missing_and_mistyped_fields() {
        let document = fields([
            ("content", json!("hello")),
            ("sender_is_patient", json!("yes")),
            ("summary", Value::Null),
        ]);
        let reader = reader_over(&document);

        assert_eq!(reader.read_string("content").expect("content"), "hello");
        assert_eq!(reader.read_optional_string("summary").expect("summary"), None);
        assert!(!reader.read_bool_or_false("patient_accepted").expect("unset flag"));

        let error = reader.read_bool("sender_is_patient").expect_err("mistyped");
        assert!(matches!(
            error,
            EntityError::MalformedDocument { field: "sender_is_patient", .. }
        ));
        let error = reader.read_string("patient_id").expect_err("missing");
        assert!(matches!(error, EntityError::MalformedDocument { field: "patient_id", .. }));
    }

    #[test]
    fn reader_parses_id_lists_in_order() {
        let first = DocumentId::new(Uuid::from_u128(10));
        let second = DocumentId::new(Uuid::from_u128(20));
        let document = fields([(
            "message_ids",
            json!([second.to_string(), first.to_string()]),
        )]);
        let reader = reader_over(&document);

        let ids = reader.read_id_list::<MessageId>("message_ids").expect("ids");
        assert_eq!(ids, vec![MessageId::from(second), MessageId::from(first)]);
        assert!(reader.read_id_list::<MessageId>("absent").expect("absent").is_empty());

        let broken = fields([("message_ids", json!(["not-an-id"]))]);
        assert!(reader_over(&broken).read_id_list::<MessageId>("message_ids").is_err());
    }

    #[test]
    fn load_document_reports_unknown_keys() {
        let (_store, context) = memory_context();
        let missing = DocumentId::new(Uuid::from_u128(99));

        let error = load_document(&context, "chats", "chat", missing).expect_err("unknown key");
        assert!(matches!(error, EntityError::NotFound { entity: "chat", .. }));
    }

    #[tokio::test]
    async fn sqlite_context_enforces_request_pairs() {
        use crate::party::Party;
        use crate::request::{Request, RequestStatus};
        use crate::test_support::{seed_patient, seed_therapist};

        let dir = tempfile::tempdir().expect("tempdir");
        let settings = RapportSettings {
            database_location: dir.path().join("rapport.db").to_string_lossy().into_owned(),
            ..RapportSettings::default()
        };
        let context = EntityContext::open_sqlite(&settings).await.expect("open");
        let patient = seed_patient(&context, "pat@example.com", "Pat");
        let therapist = seed_therapist(&context, "ther@example.com", "Ther");

        let request = Request::create(&context, &patient, &therapist, "anxiety support").expect("create");
        request.deny(Party::Therapist).expect("deny");
        assert_eq!(request.status().expect("status"), RequestStatus::Denied);

        let error = Request::create(&context, &patient, &therapist, "again").expect_err("duplicate");
        assert!(matches!(error, EntityError::DuplicateRequest { .. }));
        assert!(request.exists().expect("exists"));
    }
}
