use std::fmt;
use std::str::FromStr;

use rapport_storage::{DocumentId, StorageError, StorageResult};
use serde_json::Value;
use uuid::Uuid;

// One `DocumentId` wrapper per entity kind.
macro_rules! define_entity_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub DocumentId);

        impl $name {
            pub fn new(raw: DocumentId) -> Self {
                Self(raw)
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                DocumentId::parse(raw).map(Self)
            }

            pub fn as_document_id(&self) -> DocumentId {
                self.0
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0.as_uuid()
            }

            /// Representation used when this id is stored inside another document.
            pub fn to_value(&self) -> Value {
                Value::String(self.0.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<DocumentId> for $name {
            fn from(value: DocumentId) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for DocumentId {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_entity_id!(PatientId);
define_entity_id!(TherapistId);
define_entity_id!(ChatId);
define_entity_id!(MessageId);
define_entity_id!(RequestId);
