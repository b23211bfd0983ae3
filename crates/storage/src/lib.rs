pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

use serde_json::Value;

pub use error::{StorageError, StorageResult};
pub use ids::DocumentId;
pub use memory::MemoryDocumentStore;
pub use sqlite::{SqliteDocumentStore, SqliteOptions};
pub use types::{Document, Filter, StoredDocument, UniqueIndex};

/// Capability contract every backend offers: keyed lookup, compound-equality
/// lookup, insert with uniqueness enforcement, partial update, list append.
///
/// Every call blocks until the backend answers. Uniqueness violations surface as
/// [`StorageError::Conflict`]; callers rely on that to tell a lost race apart from
/// any other failure.
pub trait DocumentStore: Send + Sync {
    fn find_by_id(&self, collection: &str, id: DocumentId) -> StorageResult<Option<Document>>;

    /// First match in insertion order.
    fn find_one(&self, collection: &str, filter: &Filter) -> StorageResult<Option<StoredDocument>>;

    /// All matches in insertion order. An empty filter matches everything.
    fn find_many(&self, collection: &str, filter: &Filter) -> StorageResult<Vec<StoredDocument>>;

    fn insert(&self, collection: &str, id: DocumentId, document: Document) -> StorageResult<()>;

    /// Sets each given field, leaving the others untouched.
    fn set_fields(&self, collection: &str, id: DocumentId, fields: Document) -> StorageResult<()>;

    /// Appends `values` to the array at `field`, creating it when missing.
    fn push_to_list(
        &self,
        collection: &str,
        id: DocumentId,
        field: &str,
        values: Vec<Value>,
    ) -> StorageResult<()>;

    /// Installs `index` on `collection`. Installing the same index twice is a no-op.
    fn ensure_unique_index(&self, collection: &str, index: &UniqueIndex) -> StorageResult<()>;
}
