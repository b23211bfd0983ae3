use rapport_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EntityError {
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound { entity: &'static str, id: String },
    #[snafu(display(
        "a request between patient '{patient_id}' and therapist '{therapist_id}' already exists"
    ))]
    DuplicateRequest {
        patient_id: String,
        therapist_id: String,
    },
    #[snafu(display("requested {requested} recent messages but the chat holds {available}"))]
    NotEnoughMessages { requested: usize, available: usize },
    #[snafu(display("chat '{id}' was already inserted into its collection"))]
    ChatAlreadyInserted { id: String },
    #[snafu(display("{entity} '{id}' belongs to {role} '{stored}', not '{supplied}'"))]
    PartyMismatch {
        entity: &'static str,
        id: String,
        role: &'static str,
        stored: String,
        supplied: String,
    },
    #[snafu(display("{entity} '{id}' has a malformed '{field}' field: {details}"))]
    MalformedDocument {
        entity: &'static str,
        id: String,
        field: &'static str,
        details: String,
    },
    #[snafu(display("document store failed at {stage}: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
}

impl EntityError {
    /// Underlying store failure, if this error came from the store.
    pub fn store_error(&self) -> Option<&StorageError> {
        match self {
            Self::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type EntityResult<T> = Result<T, EntityError>;
