use std::fmt;

use rapport_storage::Filter;
use serde_json::Value;
use snafu::ResultExt;

use crate::entity::{EntityContext, FieldReader, load_document};
use crate::error::{EntityResult, StoreSnafu};
use crate::ids::{PatientId, TherapistId};

pub const PATIENTS: &str = "patients";
pub const THERAPISTS: &str = "therapists";

/// Which side of a patient/therapist pair acted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Patient,
    Therapist,
}

impl Party {
    /// Maps the stored `sender_is_patient` flag.
    pub fn from_patient_flag(is_patient: bool) -> Self {
        if is_patient {
            Self::Patient
        } else {
            Self::Therapist
        }
    }

    pub fn is_patient(self) -> bool {
        matches!(self, Self::Patient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Therapist => "therapist",
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

// Parties are registered elsewhere; this layer only reads them.
macro_rules! define_party {
    ($name:ident, $id:ident, $collection:ident, $entity:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            id: $id,
            email: String,
            full_name: String,
        }

        impl $name {
            pub fn load(context: &EntityContext, id: $id) -> EntityResult<Self> {
                let document = load_document(context, $collection, $entity, id.as_document_id())?;
                let reader = FieldReader::new($entity, id.as_document_id(), &document);
                Ok(Self {
                    id,
                    email: reader.read_string("email")?,
                    full_name: reader.read_string("full_name")?,
                })
            }

            pub fn find_by_email(context: &EntityContext, email: &str) -> EntityResult<Option<Self>> {
                let found = context
                    .store()
                    .find_one($collection, &Filter::new().eq("email", Value::from(email)))
                    .context(StoreSnafu {
                        stage: concat!("find-", $entity, "-by-email"),
                    })?;
                found
                    .map(|stored| Self::load(context, $id::from(stored.id)))
                    .transpose()
            }

            pub fn id(&self) -> $id {
                self.id
            }

            pub fn email(&self) -> &str {
                &self.email
            }

            pub fn full_name(&self) -> &str {
                &self.full_name
            }
        }
    };
}

define_party!(Patient, PatientId, PATIENTS, "patient");
define_party!(Therapist, TherapistId, THERAPISTS, "therapist");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EntityError;
    use crate::test_support::{memory_context, seed_patient, seed_therapist};

    #[test]
    fn parties_load_by_id_and_email() {
        let (_store, context) = memory_context();
        let patient = seed_patient(&context, "pat@example.com", "Pat Doe");
        seed_therapist(&context, "ther@example.com", "Dr. Ther");

        assert_eq!(patient.full_name(), "Pat Doe");
        assert_eq!(Patient::load(&context, patient.id()).expect("load"), patient);

        let found = Therapist::find_by_email(&context, "ther@example.com")
            .expect("lookup")
            .expect("therapist exists");
        assert_eq!(found.full_name(), "Dr. Ther");
        assert!(Patient::find_by_email(&context, "ther@example.com").expect("lookup").is_none());
    }

    #[test]
    fn incomplete_party_records_are_malformed() {
        let (_store, context) = memory_context();
        let id = context
            .allocate(PATIENTS, &crate::allocator::AllocationSeed::new("half"))
            .expect("allocate");

        let error = Patient::load(&context, PatientId::from(id)).expect_err("no email yet");
        assert!(matches!(error, EntityError::MalformedDocument { field: "email", .. }));
    }

    #[test]
    fn sender_flag_maps_to_party() {
        assert_eq!(Party::from_patient_flag(true), Party::Patient);
        assert!(!Party::from_patient_flag(false).is_patient());
        assert_eq!(Party::Therapist.to_string(), "therapist");
    }
}
