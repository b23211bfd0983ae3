//! Ordered conversation between one patient and one therapist.
//!
//! [`Chat::create`] stores the header right away. New messages live only in
//! memory until [`Chat::update_collection`] runs, so callers can batch several
//! additions into one sync. Each sync appends just the ids this object has not
//! persisted yet.

use rapport_storage::{DocumentId, Filter};
use serde_json::Value;
use snafu::{ResultExt, ensure};

use crate::allocator::AllocationSeed;
use crate::entity::{EntityContext, FieldReader, Hydration, PersistentEntity, fields, load_document};
use crate::error::{
    ChatAlreadyInsertedSnafu, EntityResult, NotEnoughMessagesSnafu, PartyMismatchSnafu, StoreSnafu,
};
use crate::ids::{ChatId, MessageId, PatientId, TherapistId};
use crate::message::Message;
use crate::party::{Patient, Therapist};

pub const CHATS: &str = "chats";

const MESSAGE_IDS: &str = "message_ids";

#[derive(Debug, Clone)]
pub struct Chat {
    context: EntityContext,
    id: ChatId,
    patient: Patient,
    therapist: Therapist,
    messages: Vec<Message>,
    // Leading messages already recorded in the stored `message_ids`.
    persisted_messages: usize,
    header_written: bool,
}

impl Chat {
    /// Allocates a key and stores an empty chat under it, ready for
    /// [`Self::load`] and the pair lookups as soon as this returns.
    pub fn create(context: &EntityContext, patient: &Patient, therapist: &Therapist) -> EntityResult<Self> {
        let seed = AllocationSeed::for_pair(patient.email(), therapist.email());
        let id = ChatId::from(context.allocate(CHATS, &seed)?);

        let mut chat = Self {
            context: context.clone(),
            id,
            patient: patient.clone(),
            therapist: therapist.clone(),
            messages: Vec::new(),
            persisted_messages: 0,
            header_written: false,
        };
        chat.insert_into_collection()?;
        tracing::info!(chat_id = %id, patient_id = %patient.id(), therapist_id = %therapist.id(), "chat created");

        Ok(chat)
    }

    /// Reconstructs a chat together with the parties its header references.
    pub fn load(context: &EntityContext, id: ChatId) -> EntityResult<Self> {
        let header = ChatHeader::read(context, id)?;
        let patient = Patient::load(context, header.patient_id)?;
        let therapist = Therapist::load(context, header.therapist_id)?;
        Self::hydrate(context, id, header.message_ids, patient, therapist)
    }

    /// Reconstructs a chat for parties the caller already holds.
    ///
    /// Fails with `PartyMismatch` when the stored header names someone else.
    pub fn load_with_parties(
        context: &EntityContext,
        id: ChatId,
        patient: &Patient,
        therapist: &Therapist,
    ) -> EntityResult<Self> {
        let header = ChatHeader::read(context, id)?;
        ensure!(
            header.patient_id == patient.id(),
            PartyMismatchSnafu {
                entity: Self::ENTITY,
                id: id.to_string(),
                role: "patient",
                stored: header.patient_id.to_string(),
                supplied: patient.id().to_string(),
            }
        );
        ensure!(
            header.therapist_id == therapist.id(),
            PartyMismatchSnafu {
                entity: Self::ENTITY,
                id: id.to_string(),
                role: "therapist",
                stored: header.therapist_id.to_string(),
                supplied: therapist.id().to_string(),
            }
        );
        Self::hydrate(context, id, header.message_ids, patient.clone(), therapist.clone())
    }

    fn hydrate(
        context: &EntityContext,
        id: ChatId,
        message_ids: Vec<MessageId>,
        patient: Patient,
        therapist: Therapist,
    ) -> EntityResult<Self> {
        let messages = message_ids
            .into_iter()
            .map(|message_id| Message::load_with_parties(context, message_id, &patient, &therapist))
            .collect::<EntityResult<Vec<_>>>()?;
        tracing::debug!(chat_id = %id, messages = messages.len(), "chat hydrated");

        Ok(Self {
            context: context.clone(),
            id,
            patient,
            therapist,
            persisted_messages: messages.len(),
            messages,
            header_written: true,
        })
    }

    /// First stored chat between the pair, if any.
    pub fn find_for_pair(
        context: &EntityContext,
        patient_id: PatientId,
        therapist_id: TherapistId,
    ) -> EntityResult<Option<Self>> {
        let filter = Filter::new()
            .eq("patient_id", patient_id.to_value())
            .eq("therapist_id", therapist_id.to_value());
        let found = context
            .store()
            .find_one(CHATS, &filter)
            .context(StoreSnafu {
                stage: "find-chat-for-pair",
            })?;
        found
            .map(|stored| Self::load(context, ChatId::from(stored.id)))
            .transpose()
    }

    pub fn ids_for_therapist(context: &EntityContext, therapist_id: TherapistId) -> EntityResult<Vec<ChatId>> {
        Self::ids_where(context, "therapist_id", therapist_id.to_value())
    }

    pub fn ids_for_patient(context: &EntityContext, patient_id: PatientId) -> EntityResult<Vec<ChatId>> {
        Self::ids_where(context, "patient_id", patient_id.to_value())
    }

    fn ids_where(context: &EntityContext, field: &str, value: Value) -> EntityResult<Vec<ChatId>> {
        let found = context
            .store()
            .find_many(CHATS, &Filter::new().eq(field, value))
            .context(StoreSnafu {
                stage: "list-chats",
            })?;
        Ok(found.into_iter().map(|stored| ChatId::from(stored.id)).collect())
    }

    pub fn id(&self) -> ChatId {
        self.id
    }

    pub fn patient(&self) -> &Patient {
        &self.patient
    }

    pub fn therapist(&self) -> &Therapist {
        &self.therapist
    }

    /// Repoints the chat in memory; stored on the next [`Self::update_collection`].
    pub fn set_patient(&mut self, patient: Patient) {
        self.patient = patient;
    }

    pub fn set_therapist(&mut self, therapist: Therapist) {
        self.therapist = therapist;
    }

    /// Every message, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The `count` most recent messages, newest first.
    ///
    /// Asking for more messages than the chat holds is an error rather than a
    /// short result.
    pub fn recent_messages(&self, count: usize) -> EntityResult<Vec<&Message>> {
        ensure!(
            count <= self.messages.len(),
            NotEnoughMessagesSnafu {
                requested: count,
                available: self.messages.len(),
            }
        );
        Ok(self.messages.iter().rev().take(count).collect())
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Messages added since the last successful sync.
    pub fn pending_message_count(&self) -> usize {
        self.messages.len() - self.persisted_messages
    }

    /// Writes the header of a freshly allocated chat, then its pending message ids.
    ///
    /// [`Self::create`] already does this once; any later call fails with
    /// `ChatAlreadyInserted`.
    pub fn insert_into_collection(&mut self) -> EntityResult<()> {
        ensure!(
            !self.header_written,
            ChatAlreadyInsertedSnafu {
                id: self.id.to_string(),
            }
        );

        self.update(fields([
            ("patient_id", self.patient.id().to_value()),
            ("therapist_id", self.therapist.id().to_value()),
            (MESSAGE_IDS, Value::Array(Vec::new())),
        ]))?;
        self.header_written = true;

        self.push_pending_messages()
    }

    /// Rewrites the header and appends pending message ids.
    ///
    /// Store failures come back unchanged and nothing is retried. Pending ids stay
    /// pending until an append succeeds.
    pub fn update_collection(&mut self) -> EntityResult<()> {
        self.update(fields([
            ("patient_id", self.patient.id().to_value()),
            ("therapist_id", self.therapist.id().to_value()),
        ]))?;
        self.header_written = true;

        self.push_pending_messages()
    }

    fn push_pending_messages(&mut self) -> EntityResult<()> {
        let pending = self.messages[self.persisted_messages..]
            .iter()
            .map(|message| message.id().to_value())
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return Ok(());
        }

        let appended = pending.len();
        self.context
            .store()
            .push_to_list(CHATS, self.document_id(), MESSAGE_IDS, pending)
            .context(StoreSnafu {
                stage: "chat-append-message-ids",
            })?;
        self.persisted_messages = self.messages.len();

        tracing::debug!(chat_id = %self.id, appended, total = self.messages.len(), "chat messages synced");
        Ok(())
    }
}

impl PersistentEntity for Chat {
    const COLLECTION: &'static str = CHATS;
    const ENTITY: &'static str = "chat";
    const HYDRATION: Hydration = Hydration::EagerSnapshot;

    fn document_id(&self) -> DocumentId {
        self.id.as_document_id()
    }

    fn context(&self) -> &EntityContext {
        &self.context
    }
}

struct ChatHeader {
    patient_id: PatientId,
    therapist_id: TherapistId,
    message_ids: Vec<MessageId>,
}

impl ChatHeader {
    fn read(context: &EntityContext, id: ChatId) -> EntityResult<Self> {
        let document = load_document(context, CHATS, Chat::ENTITY, id.as_document_id())?;
        let reader = FieldReader::new(Chat::ENTITY, id.as_document_id(), &document);
        Ok(Self {
            patient_id: reader.read_id("patient_id")?,
            therapist_id: reader.read_id("therapist_id")?,
            message_ids: reader.read_id_list(MESSAGE_IDS)?,
        })
    }
}
