use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::DocumentStore;
use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, DecodeDocumentSnafu, EncodeDocumentSnafu,
    InMemoryLocationSnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu,
    SqliteThreadSpawnSnafu, StorageError, StorageResult,
};
use super::ids::DocumentId;
use super::types::{Document, Filter, StoredDocument, UniqueIndex, validate_name};

/// Connection tuning shared by the bootstrap pool and every per-call connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Document store over a single `documents` table, one JSON body per row.
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    database_url: String,
    options: SqliteOptions,
}

impl SqliteDocumentStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with(database_location, SqliteOptions::default()).await
    }

    /// Opens (creating if needed) the database file at `database_location`.
    ///
    /// In-memory locations are rejected with `InMemoryLocation`: each store call
    /// runs on its own connection and would see a fresh, empty database.
    pub async fn open_with(database_location: &str, options: SqliteOptions) -> StorageResult<Self> {
        ensure!(
            !is_in_memory_location(database_location),
            InMemoryLocationSnafu {
                stage: "sqlite-open-check-location",
                location: database_location.to_string(),
            }
        );
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite document store");
        Ok(Self {
            pool,
            database_url,
            options,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }

    fn query_documents(
        &self,
        stage: &'static str,
        collection: &str,
        filter: &Filter,
        limit: Option<u32>,
    ) -> StorageResult<Vec<StoredDocument>> {
        validate_name(collection, "collection", stage)?;

        let mut sql = String::from("SELECT id, body FROM documents WHERE collection = ?");
        let mut params = Vec::with_capacity(filter.clauses().len() * 2);
        for (field, expected) in filter.clauses() {
            validate_name(field, "field", stage)?;
            let path = json_path(field);
            let literal_type = match expected {
                Value::Null => Some("null"),
                Value::Bool(true) => Some("true"),
                Value::Bool(false) => Some("false"),
                _ => None,
            };
            match literal_type {
                Some(json_type) => {
                    sql.push_str(&format!(" AND json_type(body, ?) = '{json_type}'"));
                    params.push(SqlParam::Text(path));
                }
                None => {
                    let (json_types, param) = scalar_param(expected, stage)?;
                    sql.push_str(&format!(
                        " AND json_type(body, ?) IN ({json_types}) AND json_extract(body, ?) = ?"
                    ));
                    params.push(SqlParam::Text(path.clone()));
                    params.push(SqlParam::Text(path));
                    params.push(param);
                }
            }
        }
        sql.push_str(" ORDER BY rowid ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let database_url = self.database_url.clone();
        let busy_timeout = self.options.busy_timeout;
        let collection = collection.to_string();
        self.run_db_call(stage, async move {
            let mut connection = connect_store_connection(&database_url, busy_timeout, stage).await?;
            let mut query = sqlx::query_as::<_, DocumentRow>(&sql).bind(collection);
            for param in params {
                query = match param {
                    SqlParam::Text(text) => query.bind(text),
                    SqlParam::Integer(integer) => query.bind(integer),
                    SqlParam::Real(real) => query.bind(real),
                };
            }

            let rows = query
                .fetch_all(&mut connection)
                .await
                .context(SqliteQuerySnafu { stage })?;

            rows.into_iter().map(document_row_to_stored).collect()
        })
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn find_by_id(&self, collection: &str, id: DocumentId) -> StorageResult<Option<Document>> {
        validate_name(collection, "collection", "document-find-by-id")?;

        let database_url = self.database_url.clone();
        let busy_timeout = self.options.busy_timeout;
        let collection = collection.to_string();
        self.run_db_call("document-find-by-id", async move {
            let mut connection =
                connect_store_connection(&database_url, busy_timeout, "document-find-by-id-connect")
                    .await?;
            let body = sqlx::query_scalar::<_, String>(
                "SELECT body FROM documents WHERE collection = ? AND id = ?",
            )
            .bind(collection)
            .bind(id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "document-find-by-id-query",
            })?;

            body.as_deref()
                .map(|text| decode_body(text, "document-find-by-id-decode"))
                .transpose()
        })
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> StorageResult<Option<StoredDocument>> {
        Ok(self
            .query_documents("document-find-one", collection, filter, Some(1))?
            .into_iter()
            .next())
    }

    fn find_many(&self, collection: &str, filter: &Filter) -> StorageResult<Vec<StoredDocument>> {
        self.query_documents("document-find-many", collection, filter, None)
    }

    fn insert(&self, collection: &str, id: DocumentId, document: Document) -> StorageResult<()> {
        validate_name(collection, "collection", "document-insert")?;
        let body = serde_json::to_string(&document).context(EncodeDocumentSnafu {
            stage: "document-insert-encode",
        })?;

        let database_url = self.database_url.clone();
        let busy_timeout = self.options.busy_timeout;
        let collection = collection.to_string();
        self.run_db_call("document-insert", async move {
            let mut connection =
                connect_store_connection(&database_url, busy_timeout, "document-insert-connect").await?;
            sqlx::query("INSERT INTO documents (collection, id, body, created_at) VALUES (?, ?, ?, ?)")
                .bind(collection.clone())
                .bind(id.to_string())
                .bind(body)
                .bind(unix_timestamp_seconds())
                .execute(&mut connection)
                .await
                .map_err(|source| map_write_error(source, "document-insert-apply", &collection))?;

            Ok(())
        })
    }

    fn set_fields(&self, collection: &str, id: DocumentId, fields: Document) -> StorageResult<()> {
        validate_name(collection, "collection", "document-set-fields")?;

        let mut assignments = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            validate_name(&field, "field", "document-set-fields")?;
            let encoded = serde_json::to_string(&value).context(EncodeDocumentSnafu {
                stage: "document-set-fields-encode",
            })?;
            assignments.push((json_path(&field), encoded));
        }

        let mut sql = String::from("UPDATE documents SET body = json_set(body");
        for _ in &assignments {
            sql.push_str(", ?, json(?)");
        }
        sql.push_str(") WHERE collection = ? AND id = ?");

        let database_url = self.database_url.clone();
        let busy_timeout = self.options.busy_timeout;
        let collection = collection.to_string();
        self.run_db_call("document-set-fields", async move {
            let mut connection =
                connect_store_connection(&database_url, busy_timeout, "document-set-fields-connect")
                    .await?;
            let mut query = sqlx::query(&sql);
            for (path, encoded) in assignments {
                query = query.bind(path).bind(encoded);
            }

            let result = query
                .bind(collection.clone())
                .bind(id.to_string())
                .execute(&mut connection)
                .await
                .map_err(|source| map_write_error(source, "document-set-fields-apply", &collection))?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "document-set-fields-missing",
                    collection,
                    id: id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }

    fn push_to_list(
        &self,
        collection: &str,
        id: DocumentId,
        field: &str,
        values: Vec<Value>,
    ) -> StorageResult<()> {
        validate_name(collection, "collection", "document-push-to-list")?;
        validate_name(field, "field", "document-push-to-list")?;

        let encoded = values
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context(EncodeDocumentSnafu {
                stage: "document-push-to-list-encode",
            })?;

        let database_url = self.database_url.clone();
        let busy_timeout = self.options.busy_timeout;
        let collection = collection.to_string();
        let path = json_path(field);
        let field = field.to_string();
        self.run_db_call("document-push-to-list", async move {
            let mut connection =
                connect_store_connection(&database_url, busy_timeout, "document-push-to-list-connect")
                    .await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "document-push-to-list-begin",
            })?;

            // Write first so the transaction takes the write lock up front instead of
            // upgrading a read snapshot, which WAL mode rejects without waiting.
            sqlx::query(
                "UPDATE documents SET body = json_set(body, ?, json('[]')) WHERE collection = ? AND id = ? AND COALESCE(json_type(body, ?), 'null') = 'null'",
            )
            .bind(path.clone())
            .bind(collection.clone())
            .bind(id.to_string())
            .bind(path.clone())
            .execute(&mut *tx)
            .await
            .map_err(|source| map_write_error(source, "document-push-to-list-init", &collection))?;

            let field_type = sqlx::query_scalar::<_, Option<String>>(
                "SELECT json_type(body, ?) FROM documents WHERE collection = ? AND id = ?",
            )
            .bind(path.clone())
            .bind(collection.clone())
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "document-push-to-list-inspect",
            })?
            .context(NotFoundSnafu {
                stage: "document-push-to-list-missing",
                collection: collection.clone(),
                id: id.to_string(),
            })?;

            if field_type.as_deref() != Some("array") {
                return InvariantViolationSnafu {
                    stage: "document-push-to-list-not-array",
                    details: format!(
                        "field '{field}' of '{id}' holds {}, not an array",
                        field_type.as_deref().unwrap_or("nothing")
                    ),
                }
                .fail();
            }

            let append_path = format!("{path}[#]");
            for value in encoded {
                sqlx::query(
                    "UPDATE documents SET body = json_insert(body, ?, json(?)) WHERE collection = ? AND id = ?",
                )
                .bind(append_path.clone())
                .bind(value)
                .bind(collection.clone())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|source| map_write_error(source, "document-push-to-list-append", &collection))?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "document-push-to-list-commit",
            })?;

            Ok(())
        })
    }

    fn ensure_unique_index(&self, collection: &str, index: &UniqueIndex) -> StorageResult<()> {
        validate_name(collection, "collection", "document-ensure-index")?;
        validate_name(&index.name, "index", "document-ensure-index")?;
        for field in &index.fields {
            validate_name(field, "field", "document-ensure-index")?;
        }

        // Identifiers cannot be bound, hence the validation above.
        let expressions = index
            .fields
            .iter()
            .map(|field| format!("json_extract(body, '{}')", json_path(field)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"{}\" ON documents ({expressions}) WHERE collection = '{collection}'",
            sqlite_index_name(collection, &index.name),
        );

        let database_url = self.database_url.clone();
        let busy_timeout = self.options.busy_timeout;
        let collection = collection.to_string();
        self.run_db_call("document-ensure-index", async move {
            let mut connection =
                connect_store_connection(&database_url, busy_timeout, "document-ensure-index-connect")
                    .await?;
            sqlx::query(&sql)
                .execute(&mut connection)
                .await
                .map_err(|source| map_write_error(source, "document-ensure-index-create", &collection))?;

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    body: String,
}

#[derive(Debug, Clone)]
enum SqlParam {
    Text(String),
    Integer(i64),
    Real(f64),
}

fn document_row_to_stored(row: DocumentRow) -> StorageResult<StoredDocument> {
    Ok(StoredDocument {
        id: DocumentId::parse(&row.id)?,
        body: decode_body(&row.body, "document-row-decode")?,
    })
}

fn decode_body(text: &str, stage: &'static str) -> StorageResult<Document> {
    serde_json::from_str::<Document>(text).context(DecodeDocumentSnafu { stage })
}

/// Bind value for a string or number clause, plus the `json_type` names it may
/// match. Without the type check `json_extract` would let `true` equal `1`.
fn scalar_param(value: &Value, stage: &'static str) -> StorageResult<(&'static str, SqlParam)> {
    match value {
        Value::String(text) => Ok(("'text'", SqlParam::Text(text.clone()))),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                return Ok(("'integer', 'real'", SqlParam::Integer(integer)));
            }
            number
                .as_f64()
                .map(|real| ("'integer', 'real'", SqlParam::Real(real)))
                .context(InvariantViolationSnafu {
                    stage,
                    details: format!("number {number} does not fit sqlite numeric types"),
                })
        }
        other => InvariantViolationSnafu {
            stage,
            details: format!("sqlite filters cannot compare {other} by value"),
        }
        .fail(),
    }
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

fn sqlite_index_name(collection: &str, index_name: &str) -> String {
    format!("{collection}__{index_name}")
}

fn map_write_error(source: sqlx::Error, stage: &'static str, collection: &str) -> StorageError {
    if let sqlx::Error::Database(database_error) = &source
        && (database_error.is_unique_violation()
            || matches!(database_error.code().as_deref(), Some("1555" | "2067")))
    {
        return ConflictSnafu {
            stage,
            collection: collection.to_string(),
            constraint: unique_constraint_name(database_error.message(), collection),
        }
        .build();
    }

    StorageError::SqliteQuery { stage, source }
}

/// SQLite names expression indexes as `index 'name'` and column constraints as
/// `table.column` lists; the latter can only be the primary key here.
fn unique_constraint_name(message: &str, collection: &str) -> String {
    let Some((_, rest)) = message.split_once("index '") else {
        return "id".to_string();
    };
    let name = rest.split('\'').next().unwrap_or(rest);
    let prefix = format!("{collection}__");
    name.strip_prefix(&prefix).unwrap_or(name).to_string()
}

async fn connect_store_connection(
    database_url: &str,
    busy_timeout: Duration,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    let pragma = format!("PRAGMA busy_timeout = {};", busy_timeout.as_millis());
    sqlx::query(&pragma)
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn is_in_memory_location(database_location: &str) -> bool {
    let location = database_location.trim();
    location.ends_with(":memory:")
        || location.starts_with("sqlite::memory:")
        || location.contains("mode=memory")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn body(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn id(seed: u128) -> DocumentId {
        DocumentId::new(Uuid::from_u128(seed))
    }

    async fn open_temp_store() -> (tempfile::TempDir, SqliteDocumentStore) {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("documents.sqlite");
        let store = SqliteDocumentStore::open(&path.display().to_string())
            .await
            .expect("open sqlite store");
        (directory, store)
    }

    #[test]
    fn unique_constraint_names_are_recovered() {
        assert_eq!(
            unique_constraint_name("UNIQUE constraint failed: index 'requests__request_pair'", "requests"),
            "request_pair"
        );
        assert_eq!(
            unique_constraint_name(
                "UNIQUE constraint failed: documents.collection, documents.id",
                "requests"
            ),
            "id"
        );
    }

    #[test]
    fn database_locations_normalize_to_urls() {
        assert_eq!(normalize_database_url("sqlite://x.db"), "sqlite://x.db");
        assert_eq!(normalize_database_url("data/x.db"), "sqlite://data/x.db");
    }

    #[tokio::test]
    async fn in_memory_locations_are_rejected() {
        for location in [":memory:", "sqlite::memory:", "sqlite:file:rapport?mode=memory&cache=shared"] {
            let error = SqliteDocumentStore::open(location)
                .await
                .expect_err("in-memory location");
            assert!(
                matches!(error, StorageError::InMemoryLocation { ref location, .. } if location.contains("memory")),
                "unexpected error for {location}: {error:?}"
            );
        }
        assert!(!is_in_memory_location("data/memory.db"));
    }

    #[tokio::test]
    async fn bool_filters_do_not_match_numbers() {
        let (_directory, store) = open_temp_store().await;
        let memory = crate::memory::MemoryDocumentStore::new();
        let records = [
            (id(1), body(json!({ "flag": true }))),
            (id(2), body(json!({ "flag": 1 }))),
            (id(3), body(json!({ "flag": false }))),
            (id(4), body(json!({ "flag": 0 }))),
            (id(5), body(json!({ "flag": "1" }))),
        ];
        for (key, record) in records {
            store.insert("flags", key, record.clone()).expect("sqlite insert");
            memory.insert("flags", key, record).expect("memory insert");
        }

        let cases = [
            (json!(true), vec![id(1)]),
            (json!(1), vec![id(2)]),
            (json!(false), vec![id(3)]),
            (json!(0), vec![id(4)]),
            (json!("1"), vec![id(5)]),
        ];
        for (expected, keys) in cases {
            let filter = Filter::new().eq("flag", expected.clone());
            let from_sqlite = store
                .find_many("flags", &filter)
                .expect("sqlite find")
                .into_iter()
                .map(|stored| stored.id)
                .collect::<Vec<_>>();
            let from_memory = memory
                .find_many("flags", &filter)
                .expect("memory find")
                .into_iter()
                .map(|stored| stored.id)
                .collect::<Vec<_>>();
            assert_eq!(from_sqlite, keys, "sqlite filter on {expected}");
            assert_eq!(from_memory, keys, "memory filter on {expected}");
        }
    }

    #[tokio::test]
    async fn insert_find_and_conflict() {
        let (_directory, store) = open_temp_store().await;

        store
            .insert("messages", id(1), body(json!({ "content": "hi", "sender_is_patient": true })))
            .expect("insert");
        let error = store
            .insert("messages", id(1), Document::new())
            .expect_err("duplicate id");
        assert!(error.is_conflict());
        assert_eq!(error.conflict_constraint(), Some("id"));

        let stored = store.find_by_id("messages", id(1)).expect("find").expect("present");
        assert_eq!(stored, body(json!({ "content": "hi", "sender_is_patient": true })));
        assert!(store.find_by_id("messages", id(2)).expect("find").is_none());
    }

    #[tokio::test]
    async fn set_fields_and_filters_round_trip() {
        let (_directory, store) = open_temp_store().await;
        store.insert("requests", id(1), Document::new()).expect("placeholder");
        store
            .set_fields(
                "requests",
                id(1),
                body(json!({ "patient_id": "p", "therapist_id": "t", "patient_accepted": false })),
            )
            .expect("set pair");
        store
            .set_fields("requests", id(1), body(json!({ "patient_accepted": true })))
            .expect("vote");

        let filter = Filter::new()
            .eq("patient_id", "p")
            .eq("therapist_id", "t")
            .eq("patient_accepted", true);
        let found = store.find_one("requests", &filter).expect("find one").expect("match");
        assert_eq!(found.id, id(1));

        let missing = store
            .set_fields("requests", id(9), body(json!({ "summary": "x" })))
            .expect_err("missing record");
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn push_to_list_appends_in_order() {
        let (_directory, store) = open_temp_store().await;
        store.insert("chats", id(1), Document::new()).expect("placeholder");

        store
            .push_to_list("chats", id(1), "message_ids", vec![json!("a"), json!("b")])
            .expect("first push");
        store
            .push_to_list("chats", id(1), "message_ids", vec![json!("c")])
            .expect("second push");

        let stored = store.find_by_id("chats", id(1)).expect("find").expect("present");
        assert_eq!(stored.get("message_ids"), Some(&json!(["a", "b", "c"])));

        let missing = store
            .push_to_list("chats", id(2), "message_ids", vec![json!("x")])
            .expect_err("missing chat");
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn unique_index_turns_pair_collision_into_conflict() {
        let (_directory, store) = open_temp_store().await;
        let index = UniqueIndex::new("request_pair", &["patient_id", "therapist_id"]);
        store.ensure_unique_index("requests", &index).expect("index");
        store.ensure_unique_index("requests", &index).expect("index again");

        store.insert("requests", id(1), Document::new()).expect("placeholder one");
        store.insert("requests", id(2), Document::new()).expect("placeholder two");

        let pair = body(json!({ "patient_id": "p", "therapist_id": "t" }));
        store.set_fields("requests", id(1), pair.clone()).expect("first pair");
        let error = store
            .set_fields("requests", id(2), pair)
            .expect_err("second pair");
        assert_eq!(error.conflict_constraint(), Some("request_pair"));
    }
}
