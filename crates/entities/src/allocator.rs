//! Collision-free key allocation by speculative insert.
//!
//! A candidate key is derived from a caller seed and a fresh random draw, then
//! claimed by inserting an empty placeholder. The store's uniqueness check is the
//! only arbiter, so any number of processes can allocate against the same
//! collection without coordinating.

use std::fmt;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rapport_storage::{Document, DocumentId, DocumentStore, StorageResult};
use sha2::{Digest, Sha256};

/// Consecutive conflicts after which allocation logs at error level.
pub const DEFAULT_CONFLICT_WARN_THRESHOLD: u32 = 16;

/// Source of the random component mixed into every candidate key.
pub trait RandomSource: Send + Sync + fmt::Debug {
    fn draw(&self) -> u64;
}

/// Thread-local OS-seeded generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn draw(&self) -> u64 {
        rand::rng().random()
    }
}

/// Deterministic generator for reproducible allocation sequences.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn draw(&self) -> u64 {
        // A poisoned generator is still a valid generator.
        match self.rng.lock() {
            Ok(mut rng) => rng.random(),
            Err(poisoned) => poisoned.into_inner().random(),
        }
    }
}

/// Caller-provided disambiguating input for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocationSeed(String);

impl AllocationSeed {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Seed for records scoped to one patient/therapist pair.
    pub fn for_pair(patient_email: &str, therapist_email: &str) -> Self {
        Self(format!("{patient_email}P{therapist_email}T"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Key the allocator tries for `seed` when the random source yields `random`.
pub fn candidate_key(seed: &AllocationSeed, random: u64) -> DocumentId {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_str().as_bytes());
    hasher.update(random.to_string().as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    DocumentId::from_digest(&digest)
}

#[derive(Clone)]
pub struct IdentityAllocator {
    random: Arc<dyn RandomSource>,
    conflict_warn_threshold: u32,
}

impl fmt::Debug for IdentityAllocator {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("IdentityAllocator")
            .field("random", &self.random)
            .field("conflict_warn_threshold", &self.conflict_warn_threshold)
            .finish()
    }
}

impl Default for IdentityAllocator {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRandom))
    }
}

impl IdentityAllocator {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self {
            random,
            conflict_warn_threshold: DEFAULT_CONFLICT_WARN_THRESHOLD,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(Arc::new(SeededRandom::new(seed)))
    }

    pub fn with_conflict_warn_threshold(mut self, threshold: u32) -> Self {
        self.conflict_warn_threshold = threshold.max(1);
        self
    }

    /// Reserves a fresh key in `collection` and returns it.
    ///
    /// On return an empty placeholder document exists at the key; the caller owns
    /// filling in the rest. Only [`rapport_storage::StorageError::Conflict`] is
    /// retried, with no upper bound. Every other store failure is returned as is.
    pub fn allocate(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
        seed: &AllocationSeed,
    ) -> StorageResult<DocumentId> {
        let mut conflicts: u32 = 0;

        loop {
            let candidate = candidate_key(seed, self.random.draw());
            match store.insert(collection, candidate, Document::new()) {
                Ok(()) => {
                    tracing::debug!(collection, id = %candidate, conflicts, "identity allocated");
                    return Ok(candidate);
                }
                Err(error) if error.is_conflict() => {
                    conflicts = conflicts.saturating_add(1);
                    if conflicts == self.conflict_warn_threshold {
                        tracing::error!(
                            collection,
                            conflicts,
                            "identity allocation keeps colliding; random source may be degenerate"
                        );
                    } else {
                        tracing::warn!(collection, id = %candidate, conflicts, "identity candidate taken, redrawing");
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}
