use rapport_storage::{Document, DocumentId};
use serde_json::Value;

use crate::allocator::AllocationSeed;
use crate::entity::{EntityContext, FieldReader, Hydration, PersistentEntity, fields, load_document};
use crate::error::EntityResult;
use crate::ids::{MessageId, PatientId, TherapistId};
use crate::party::{Party, Patient, Therapist};

pub const MESSAGES: &str = "messages";

/// One line of a conversation. Written once at creation and never changed.
#[derive(Debug, Clone)]
pub struct Message {
    context: EntityContext,
    id: MessageId,
    content: String,
    sender: Party,
    patient: Patient,
    therapist: Therapist,
}

impl Message {
    /// Allocates a key and stores the whole record in a single write.
    pub fn create(
        context: &EntityContext,
        patient: &Patient,
        therapist: &Therapist,
        sender: Party,
        content: impl Into<String>,
    ) -> EntityResult<Self> {
        let content = content.into();
        let seed = AllocationSeed::for_pair(patient.email(), therapist.email());
        let id = MessageId::from(context.allocate(MESSAGES, &seed)?);

        let message = Self {
            context: context.clone(),
            id,
            content,
            sender,
            patient: patient.clone(),
            therapist: therapist.clone(),
        };
        message.update(message.to_document())?;

        tracing::info!(message_id = %id, sender = %sender, "message created");
        Ok(message)
    }

    pub fn load(context: &EntityContext, id: MessageId) -> EntityResult<Self> {
        Self::hydrate(context, id, None, None)
    }

    /// Reconstructs a message, reusing `patient` and `therapist` when the record
    /// references them and loading whatever it references otherwise.
    pub fn load_with_parties(
        context: &EntityContext,
        id: MessageId,
        patient: &Patient,
        therapist: &Therapist,
    ) -> EntityResult<Self> {
        Self::hydrate(context, id, Some(patient), Some(therapist))
    }

    fn hydrate(
        context: &EntityContext,
        id: MessageId,
        known_patient: Option<&Patient>,
        known_therapist: Option<&Therapist>,
    ) -> EntityResult<Self> {
        let document = load_document(context, MESSAGES, Self::ENTITY, id.as_document_id())?;
        let reader = FieldReader::new(Self::ENTITY, id.as_document_id(), &document);

        let content = reader.read_string("content")?;
        let sender = Party::from_patient_flag(reader.read_bool("sender_is_patient")?);
        let patient_id: PatientId = reader.read_id("patient_id")?;
        let therapist_id: TherapistId = reader.read_id("therapist_id")?;

        let patient = match known_patient {
            Some(patient) if patient.id() == patient_id => patient.clone(),
            _ => Patient::load(context, patient_id)?,
        };
        let therapist = match known_therapist {
            Some(therapist) if therapist.id() == therapist_id => therapist.clone(),
            _ => Therapist::load(context, therapist_id)?,
        };

        Ok(Self {
            context: context.clone(),
            id,
            content,
            sender,
            patient,
            therapist,
        })
    }

    fn to_document(&self) -> Document {
        fields([
            ("content", Value::from(self.content.as_str())),
            ("sender_is_patient", Value::Bool(self.sender.is_patient())),
            ("patient_id", self.patient.id().to_value()),
            ("therapist_id", self.therapist.id().to_value()),
        ])
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sender(&self) -> Party {
        self.sender
    }

    pub fn sender_is_patient(&self) -> bool {
        self.sender.is_patient()
    }

    pub fn patient(&self) -> &Patient {
        &self.patient
    }

    pub fn therapist(&self) -> &Therapist {
        &self.therapist
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.content == other.content
            && self.sender == other.sender
            && self.patient == other.patient
            && self.therapist == other.therapist
    }
}

impl Eq for Message {}

impl PersistentEntity for Message {
    const COLLECTION: &'static str = MESSAGES;
    const ENTITY: &'static str = "message";
    const HYDRATION: Hydration = Hydration::EagerSnapshot;

    fn document_id(&self) -> DocumentId {
        self.id.as_document_id()
    }

    fn context(&self) -> &EntityContext {
        &self.context
    }
}
