//! Connection proposals and their two-party vote.
//!
//! A request stores four independent votes. Status is projected from them at read
//! time and never stored. Nothing is cached on [`Request`]: every read goes
//! through [`Request::refresh`], which returns an immutable [`RequestSnapshot`].

use rapport_storage::{DocumentId, Filter, UniqueIndex};
use serde_json::Value;
use snafu::{ResultExt, ensure};

use crate::allocator::AllocationSeed;
use crate::entity::{EntityContext, FieldReader, Hydration, PersistentEntity, fields, load_document};
use crate::error::{DuplicateRequestSnafu, EntityError, EntityResult, StoreSnafu};
use crate::ids::{PatientId, RequestId, TherapistId};
use crate::party::{Party, Patient, Therapist};

pub const REQUESTS: &str = "requests";
pub const REQUEST_PAIR_INDEX: &str = "request_pair";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Pending,
    Accepted,
    Denied,
}

/// The four vote slots. Unset slots read as `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Votes {
    pub patient_accepted: bool,
    pub patient_denied: bool,
    pub therapist_accepted: bool,
    pub therapist_denied: bool,
}

impl Votes {
    pub fn is_accepted(&self) -> bool {
        self.patient_accepted && self.therapist_accepted
    }

    pub fn is_denied(&self) -> bool {
        self.patient_denied || self.therapist_denied
    }

    /// A deny vote outranks a complete accept pair.
    pub fn status(&self) -> RequestStatus {
        if self.is_denied() {
            RequestStatus::Denied
        } else if self.is_accepted() {
            RequestStatus::Accepted
        } else {
            RequestStatus::Pending
        }
    }
}

fn accept_field(party: Party) -> &'static str {
    match party {
        Party::Patient => "patient_accepted",
        Party::Therapist => "therapist_accepted",
    }
}

fn deny_field(party: Party) -> &'static str {
    match party {
        Party::Patient => "patient_denied",
        Party::Therapist => "therapist_denied",
    }
}

/// Point-in-time view of a stored request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    id: RequestId,
    patient_id: PatientId,
    therapist_id: TherapistId,
    summary: Option<String>,
    votes: Votes,
}

impl RequestSnapshot {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn patient_id(&self) -> PatientId {
        self.patient_id
    }

    pub fn therapist_id(&self) -> TherapistId {
        self.therapist_id
    }

    /// `None` while the record is still being populated.
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn votes(&self) -> Votes {
        self.votes
    }

    pub fn is_accepted(&self) -> bool {
        self.votes.is_accepted()
    }

    pub fn is_denied(&self) -> bool {
        self.votes.is_denied()
    }

    pub fn status(&self) -> RequestStatus {
        self.votes.status()
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    context: EntityContext,
    id: RequestId,
}

impl Request {
    /// Lets the store reject a second request for the same pair.
    pub fn install_pair_index(context: &EntityContext) -> EntityResult<()> {
        context
            .store()
            .ensure_unique_index(
                REQUESTS,
                &UniqueIndex::new(REQUEST_PAIR_INDEX, &["patient_id", "therapist_id"]),
            )
            .context(StoreSnafu {
                stage: "install-request-pair-index",
            })
    }

    /// Opens a pending request between `patient` and `therapist`.
    ///
    /// The pair is written before the summary and votes. A failure between the two
    /// writes leaves a request that reads as pending with no summary.
    pub fn create(
        context: &EntityContext,
        patient: &Patient,
        therapist: &Therapist,
        summary: impl Into<String>,
    ) -> EntityResult<Self> {
        Self::create_with_summary(context, patient, therapist, Some(summary.into()))
    }

    /// Like [`Self::create`], but the stored `summary` is `null`.
    pub fn create_without_summary(
        context: &EntityContext,
        patient: &Patient,
        therapist: &Therapist,
    ) -> EntityResult<Self> {
        Self::create_with_summary(context, patient, therapist, None)
    }

    fn create_with_summary(
        context: &EntityContext,
        patient: &Patient,
        therapist: &Therapist,
        summary: Option<String>,
    ) -> EntityResult<Self> {
        let existing = Self::find_id_for_pair(context, patient.id(), therapist.id())?;
        ensure!(
            existing.is_none(),
            DuplicateRequestSnafu {
                patient_id: patient.id().to_string(),
                therapist_id: therapist.id().to_string(),
            }
        );

        let seed = AllocationSeed::for_pair(patient.email(), therapist.email());
        let request = Self {
            context: context.clone(),
            id: RequestId::from(context.allocate(REQUESTS, &seed)?),
        };

        let pair = fields([
            ("patient_id", patient.id().to_value()),
            ("therapist_id", therapist.id().to_value()),
        ]);
        match request.update(pair) {
            Err(EntityError::Store { source, .. })
                if source.conflict_constraint() == Some(REQUEST_PAIR_INDEX) =>
            {
                tracing::warn!(
                    request_id = %request.id,
                    patient_id = %patient.id(),
                    therapist_id = %therapist.id(),
                    "lost request pair race; placeholder left behind"
                );
                return DuplicateRequestSnafu {
                    patient_id: patient.id().to_string(),
                    therapist_id: therapist.id().to_string(),
                }
                .fail();
            }
            other => other?,
        }

        request.update(fields([
            ("summary", summary.map_or(Value::Null, Value::String)),
            ("patient_accepted", Value::Bool(false)),
            ("patient_denied", Value::Bool(false)),
            ("therapist_accepted", Value::Bool(false)),
            ("therapist_denied", Value::Bool(false)),
        ]))?;

        tracing::info!(request_id = %request.id, patient_id = %patient.id(), therapist_id = %therapist.id(), "request created");
        Ok(request)
    }

    /// Binds to a stored request. Only existence is checked; nothing is cached.
    pub fn load(context: &EntityContext, id: RequestId) -> EntityResult<Self> {
        load_document(context, REQUESTS, Self::ENTITY, id.as_document_id())?;
        Ok(Self {
            context: context.clone(),
            id,
        })
    }

    pub fn find_for_pair(
        context: &EntityContext,
        patient_id: PatientId,
        therapist_id: TherapistId,
    ) -> EntityResult<Option<Self>> {
        Ok(Self::find_id_for_pair(context, patient_id, therapist_id)?.map(|id| Self {
            context: context.clone(),
            id,
        }))
    }

    fn find_id_for_pair(
        context: &EntityContext,
        patient_id: PatientId,
        therapist_id: TherapistId,
    ) -> EntityResult<Option<RequestId>> {
        let filter = Filter::new()
            .eq("patient_id", patient_id.to_value())
            .eq("therapist_id", therapist_id.to_value());
        let found = context
            .store()
            .find_one(REQUESTS, &filter)
            .context(StoreSnafu {
                stage: "find-request-for-pair",
            })?;
        Ok(found.map(|stored| RequestId::from(stored.id)))
    }

    /// Requests addressed to `therapist_id`, oldest first.
    pub fn ids_for_therapist(context: &EntityContext, therapist_id: TherapistId) -> EntityResult<Vec<RequestId>> {
        let found = context
            .store()
            .find_many(REQUESTS, &Filter::new().eq("therapist_id", therapist_id.to_value()))
            .context(StoreSnafu {
                stage: "list-therapist-requests",
            })?;
        Ok(found.into_iter().map(|stored| RequestId::from(stored.id)).collect())
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Records `party`'s accept vote. The other three slots are untouched.
    pub fn accept(&self, party: Party) -> EntityResult<()> {
        self.vote(accept_field(party), party, "accept")
    }

    /// Records `party`'s deny vote. An earlier accept vote is not cleared.
    pub fn deny(&self, party: Party) -> EntityResult<()> {
        self.vote(deny_field(party), party, "deny")
    }

    fn vote(&self, field: &'static str, party: Party, verdict: &'static str) -> EntityResult<()> {
        self.update(fields([(field, Value::Bool(true))]))?;
        tracing::info!(request_id = %self.id, party = %party, verdict, "request vote recorded");
        Ok(())
    }

    /// Reads the current stored state in one round trip.
    pub fn refresh(&self) -> EntityResult<RequestSnapshot> {
        let document = self.get()?;
        let reader = FieldReader::new(Self::ENTITY, self.document_id(), &document);
        Ok(RequestSnapshot {
            id: self.id,
            patient_id: reader.read_id("patient_id")?,
            therapist_id: reader.read_id("therapist_id")?,
            summary: reader.read_optional_string("summary")?,
            votes: Votes {
                patient_accepted: reader.read_bool_or_false("patient_accepted")?,
                patient_denied: reader.read_bool_or_false("patient_denied")?,
                therapist_accepted: reader.read_bool_or_false("therapist_accepted")?,
                therapist_denied: reader.read_bool_or_false("therapist_denied")?,
            },
        })
    }

    // The accessors below each cost one round trip. Use `refresh` to read several
    // values from one consistent state.

    pub fn summary(&self) -> EntityResult<Option<String>> {
        Ok(self.refresh()?.summary)
    }

    pub fn patient(&self) -> EntityResult<Patient> {
        Patient::load(&self.context, self.refresh()?.patient_id)
    }

    pub fn therapist(&self) -> EntityResult<Therapist> {
        Therapist::load(&self.context, self.refresh()?.therapist_id)
    }

    pub fn is_accepted(&self) -> EntityResult<bool> {
        Ok(self.refresh()?.is_accepted())
    }

    pub fn is_denied(&self) -> EntityResult<bool> {
        Ok(self.refresh()?.is_denied())
    }

    pub fn status(&self) -> EntityResult<RequestStatus> {
        Ok(self.refresh()?.status())
    }
}

impl PersistentEntity for Request {
    const COLLECTION: &'static str = REQUESTS;
    const ENTITY: &'static str = "request";
    const HYDRATION: Hydration = Hydration::LiveRead;

    fn document_id(&self) -> DocumentId {
        self.id.as_document_id()
    }

    fn context(&self) -> &EntityContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use rapport_storage::{DocumentStore, StorageError};

    use super::*;
    use crate::test_support::{faulty_context, memory_context, seed_patient, seed_therapist};

    fn pair(context: &EntityContext) -> (Patient, Therapist) {
        (
            seed_patient(context, "pat@example.com", "Pat"),
            seed_therapist(context, "ther@example.com", "Ther"),
        )
    }

    #[test]
    fn both_accept_votes_are_needed() {
        let (_store, context) = memory_context();
        let (patient, therapist) = pair(&context);

        let request = Request::create(&context, &patient, &therapist, "anxiety support").expect("create");
        assert!(!request.is_accepted().expect("read"));
        assert!(!request.is_denied().expect("read"));
        assert_eq!(request.status().expect("read"), RequestStatus::Pending);

        request.accept(Party::Therapist).expect("therapist accepts");
        assert!(!request.is_accepted().expect("read"));

        request.accept(Party::Patient).expect("patient accepts");
        assert!(request.is_accepted().expect("read"));
        assert_eq!(request.status().expect("read"), RequestStatus::Accepted);

        let snapshot = request.refresh().expect("refresh");
        assert_eq!(snapshot.summary(), Some("anxiety support"));
        assert_eq!(request.patient().expect("patient"), patient);
        assert_eq!(request.therapist().expect("therapist"), therapist);
    }

    #[test]
    fn any_deny_vote_denies() {
        let (_store, context) = memory_context();
        let (patient, therapist) = pair(&context);
        let request = Request::create(&context, &patient, &therapist, "grief").expect("create");

        request.accept(Party::Patient).expect("accept");
        request.accept(Party::Therapist).expect("accept");
        request.deny(Party::Patient).expect("deny");

        let snapshot = request.refresh().expect("refresh");
        assert!(snapshot.is_accepted());
        assert!(snapshot.is_denied());
        assert_eq!(snapshot.status(), RequestStatus::Denied);
        assert_eq!(
            snapshot.votes(),
            Votes {
                patient_accepted: true,
                patient_denied: true,
                therapist_accepted: true,
                therapist_denied: false,
            }
        );
    }

    #[test]
    fn votes_written_elsewhere_are_observed() {
        let (_store, context) = memory_context();
        let (patient, therapist) = pair(&context);
        let request = Request::create(&context, &patient, &therapist, "sleep").expect("create");
        let other_handle = Request::load(&context, request.id()).expect("load");

        let before = request.refresh().expect("before");
        other_handle.deny(Party::Therapist).expect("deny");

        assert_eq!(before.status(), RequestStatus::Pending);
        assert!(request.is_denied().expect("fresh read"));
    }

    #[test]
    fn second_request_for_pair_is_a_duplicate() {
        let (_store, context) = memory_context();
        let (patient, therapist) = pair(&context);
        let first = Request::create(&context, &patient, &therapist, "first").expect("create");

        let error = Request::create(&context, &patient, &therapist, "again").expect_err("duplicate");
        assert!(matches!(error, EntityError::DuplicateRequest { .. }));

        let found = Request::find_for_pair(&context, patient.id(), therapist.id())
            .expect("lookup")
            .expect("request exists");
        assert_eq!(found.id(), first.id());
        assert_eq!(Request::ids_for_therapist(&context, therapist.id()).expect("inbox"), [first.id()]);
    }

    #[test]
    fn pair_index_rejects_the_losing_writer() {
        let (store, context) = faulty_context();
        let (patient, therapist) = pair(&context);
        Request::install_pair_index(&context).expect("index");
        Request::install_pair_index(&context).expect("index twice");
        let winner = Request::create(&context, &patient, &therapist, "first").expect("create");

        // The loser's pre-check ran before the winner's pair write landed.
        store.blind_lookups(true);
        let error = Request::create(&context, &patient, &therapist, "second").expect_err("index conflict");
        assert!(matches!(error, EntityError::DuplicateRequest { .. }));

        store.blind_lookups(false);
        assert_eq!(Request::ids_for_therapist(&context, therapist.id()).expect("inbox"), [winner.id()]);
        assert_eq!(store.inner().len(REQUESTS).expect("len"), 2);
    }

    #[test]
    fn interrupted_creation_reads_as_pending_without_summary() {
        let (store, context) = faulty_context();
        let (patient, therapist) = pair(&context);

        // Placeholder and pair writes land, the summary write does not.
        store.fail_writes_after(2);
        let error = Request::create(&context, &patient, &therapist, "lost").expect_err("summary write");
        assert!(matches!(
            error.store_error(),
            Some(StorageError::Unavailable { .. })
        ));

        store.heal();
        let request = Request::find_for_pair(&context, patient.id(), therapist.id())
            .expect("lookup")
            .expect("half-written request");
        let snapshot = request.refresh().expect("refresh");
        assert_eq!(snapshot.status(), RequestStatus::Pending);
        assert_eq!(snapshot.summary(), None);
        assert_eq!(snapshot.votes(), Votes::default());
        assert_eq!(request.summary().expect("summary"), None);
    }

    #[test]
    fn request_without_summary_is_pending() {
        let (store, context) = memory_context();
        let (patient, therapist) = pair(&context);

        let request = Request::create_without_summary(&context, &patient, &therapist).expect("create");
        let snapshot = request.refresh().expect("refresh");
        assert_eq!(snapshot.summary(), None);
        assert_eq!(snapshot.status(), RequestStatus::Pending);
        assert_eq!(snapshot.votes(), Votes::default());

        let stored = store
            .find_by_id(REQUESTS, request.id().as_document_id())
            .expect("find")
            .expect("stored");
        assert_eq!(stored.get("summary"), Some(&Value::Null));

        let error = Request::create_without_summary(&context, &patient, &therapist).expect_err("duplicate");
        assert!(matches!(error, EntityError::DuplicateRequest { .. }));
    }

    #[test]
    fn unknown_request_is_not_found() {
        let (_store, context) = memory_context();
        let missing = RequestId::from(DocumentId::new(uuid::Uuid::from_u128(77)));

        let error = Request::load(&context, missing).expect_err("missing");
        assert!(matches!(error, EntityError::NotFound { entity: "request", .. }));
    }
}
