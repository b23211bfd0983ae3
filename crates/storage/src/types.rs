use serde_json::{Map, Value};

use super::error::{InvalidFieldSnafu, StorageResult};
use super::ids::DocumentId;

/// Body of a stored record. The primary key lives beside it, never inside it.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub body: Document,
}

/// Conjunction of field equalities.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// A missing field never equals anything, including `null`. Comparison is
    /// strict JSON equality, so `true` never matches `1`.
    pub fn matches(&self, document: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

/// Named uniqueness constraint over a tuple of fields of one collection.
///
/// Documents where any indexed field is absent or `null` are exempt, so freshly
/// allocated placeholders never collide with each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: String,
    pub fields: Vec<String>,
}

impl UniqueIndex {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|field| field.to_string()).collect(),
        }
    }

    /// Key tuple of `document` under this index, `None` when the document is exempt.
    pub fn key_of(&self, document: &Document) -> Option<Vec<Value>> {
        self.fields
            .iter()
            .map(|field| document.get(field).filter(|value| !value.is_null()).cloned())
            .collect()
    }
}

/// Collection, field and index names end up inside SQL text and JSON paths.
pub fn validate_name(name: &str, kind: &'static str, stage: &'static str) -> StorageResult<()> {
    let mut characters = name.chars();
    let valid_head = characters
        .next()
        .is_some_and(|head| head.is_ascii_alphabetic() || head == '_');
    let valid_tail = characters.all(|character| character.is_ascii_alphanumeric() || character == '_');

    if valid_head && valid_tail {
        return Ok(());
    }

    InvalidFieldSnafu {
        stage,
        kind,
        name: name.to_string(),
    }
    .fail()
}
