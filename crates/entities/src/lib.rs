//! Patients, therapists and the requests, chats and messages between them,
//! persisted through any [`rapport_storage::DocumentStore`].

pub mod allocator;
pub mod chat;
pub mod entity;
pub mod error;
pub mod ids;
pub mod message;
pub mod party;
pub mod request;
pub mod settings;

#[cfg(test)]
mod test_support;

pub use allocator::{
    AllocationSeed, DEFAULT_CONFLICT_WARN_THRESHOLD, IdentityAllocator, RandomSource,
    SeededRandom, ThreadRandom, candidate_key,
};
pub use chat::{CHATS, Chat};
pub use entity::{EntityContext, Hydration, PersistentEntity};
pub use error::{EntityError, EntityResult};
pub use ids::{ChatId, MessageId, PatientId, RequestId, TherapistId};
pub use message::{MESSAGES, Message};
pub use party::{PATIENTS, Party, Patient, THERAPISTS, Therapist};
pub use request::{
    REQUEST_PAIR_INDEX, REQUESTS, Request, RequestSnapshot, RequestStatus, Votes,
};
pub use settings::{RapportSettings, SettingsError, SettingsStore};
