use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use cairn_core::Clock;

use crate::challenge::{Challenge, ChallengeKind, ChallengeOptions};
use crate::error::Error;

/// Bucket holding serialized challenge records, keyed by challenge id.
pub const CHALLENGE_BUCKET: &[u8] = b"acme_challenges";

/// Errors surfaced by a [`NoSqlStore`] backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key does not exist in the bucket.
    #[error("not found")]
    NotFound,
    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Result of a compare-and-swap attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOutcome {
    /// Value stored under the key when the swap was evaluated.
    pub current: Option<Vec<u8>>,
    /// Whether the new value was committed.
    pub swapped: bool,
}

/// Narrow key-value capability the validation core requires.
///
/// Every write is conditional: the store commits `new` only when the stored
/// bytes equal `old` (`None` meaning the key must not exist). This is the
/// only concurrency-control primitive the core relies on; implementations
/// must evaluate the swap atomically and must not require in-process locks
/// from their callers.
pub trait NoSqlStore: Send + Sync {
    /// Reads the value stored under `key` in `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent, or
    /// [`StoreError::Backend`] for infrastructure failures.
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Commits `new` under `key` iff the stored bytes equal `old`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] for infrastructure failures; a failed
    /// comparison is not an error and is reported through
    /// [`SwapOutcome::swapped`].
    fn cmp_and_swap(
        &self,
        bucket: &[u8],
        key: &[u8],
        old: Option<&[u8]>,
        new: &[u8],
    ) -> Result<SwapOutcome, StoreError>;
}

/// Linearizable in-memory backend.
///
/// Suitable as a test double and as the single-node default; the mutex
/// serializes swap evaluation, giving the atomicity the port demands.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    buckets: Arc<Mutex<HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NoSqlStore for MemoryStore {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let buckets = self
            .buckets
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_owned()))?;
        buckets
            .get(bucket)
            .and_then(|entries| entries.get(key))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn cmp_and_swap(
        &self,
        bucket: &[u8],
        key: &[u8],
        old: Option<&[u8]>,
        new: &[u8],
    ) -> Result<SwapOutcome, StoreError> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_owned()))?;
        let entries = buckets.entry(bucket.to_vec()).or_default();
        let current = entries.get(key).cloned();
        let matches = match (&current, old) {
            (None, None) => true,
            (Some(stored), Some(expected)) => stored.as_slice() == expected,
            _ => false,
        };
        if matches {
            entries.insert(key.to_vec(), new.to_vec());
            Ok(SwapOutcome {
                current: Some(new.to_vec()),
                swapped: true,
            })
        } else {
            Ok(SwapOutcome {
                current,
                swapped: false,
            })
        }
    }
}

/// Typed challenge port over a [`NoSqlStore`].
///
/// The engine and the adjacent account/order managers create, load and update
/// challenge records exclusively through this type, so every state transition
/// inherits the CAS discipline.
#[derive(Clone)]
pub struct ChallengeStore {
    db: Arc<dyn NoSqlStore>,
}

impl ChallengeStore {
    /// Wraps a backend.
    #[must_use]
    pub fn new(db: Arc<dyn NoSqlStore>) -> Self {
        Self { db }
    }

    /// Loads a challenge by id.
    ///
    /// # Errors
    ///
    /// An unknown id is the caller's fault and maps to `Malformed`; backend
    /// and decode failures map to `ServerInternal`.
    pub fn get(&self, id: &str) -> Result<Challenge, Error> {
        match self.db.get(CHALLENGE_BUCKET, id.as_bytes()) {
            Ok(bytes) => Challenge::from_bytes(&bytes),
            Err(StoreError::NotFound) => {
                Err(Error::malformed(format!("challenge {id} not found")))
            }
            Err(err) => Err(Error::server_internal(format!(
                "error loading challenge {id}: {err}"
            ))),
        }
    }

    /// Persists `new` conditionally on the previously read state.
    ///
    /// `old == None` asserts creation. A failed comparison means another
    /// worker transitioned the record since it was read; the caller reloads
    /// and retries at a higher layer, this port never retries.
    ///
    /// # Errors
    ///
    /// Backend failures and lost races map to `ServerInternal`.
    pub fn save(&self, new: &Challenge, old: Option<&Challenge>) -> Result<(), Error> {
        let new_bytes = new.to_bytes()?;
        let old_bytes = old.map(Challenge::to_bytes).transpose()?;
        let outcome = self
            .db
            .cmp_and_swap(
                CHALLENGE_BUCKET,
                new.id().as_bytes(),
                old_bytes.as_deref(),
                &new_bytes,
            )
            .map_err(|err| {
                Error::server_internal(format!("error saving acme challenge: {err}"))
            })?;
        if outcome.swapped {
            Ok(())
        } else {
            Err(Error::server_internal(
                "error saving acme challenge; acme challenge has changed since last read",
            ))
        }
    }

    /// Creates and persists a fresh `pending` challenge.
    ///
    /// # Errors
    ///
    /// Propagates [`ChallengeStore::save`] failures.
    pub fn create(
        &self,
        kind: ChallengeKind,
        options: ChallengeOptions,
        clock: &dyn Clock,
    ) -> Result<Challenge, Error> {
        let challenge = Challenge::new(kind, options, clock);
        self.save(&challenge, None)?;
        Ok(challenge)
    }

    /// Promotes a `pending` challenge to `processing` and persists the
    /// transition.
    ///
    /// # Errors
    ///
    /// Propagates promotion and [`ChallengeStore::save`] failures.
    pub fn begin_processing(&self, challenge: &Challenge) -> Result<Challenge, Error> {
        let processing = challenge.begin_processing()?;
        self.save(&processing, Some(challenge))?;
        Ok(processing)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    use cairn_core::FixedClock;

    use super::{ChallengeStore, MemoryStore, NoSqlStore, StoreError, SwapOutcome, CHALLENGE_BUCKET};
    use crate::challenge::{Challenge, ChallengeKind, ChallengeOptions, ChallengeStatus};
    use crate::error::ProblemType;

    fn test_clock() -> FixedClock {
        FixedClock::new(datetime!(2024-07-01 12:00:00 UTC))
    }

    fn test_options() -> ChallengeOptions {
        ChallengeOptions {
            account_id: "accID".to_owned(),
            authz_id: "authzID".to_owned(),
            value: "zap.internal".to_owned(),
        }
    }

    /// Backend double that fails or refuses swaps on demand.
    struct FlakyStore {
        get_error: Option<StoreError>,
        swap_error: Option<StoreError>,
        swapped: bool,
    }

    impl NoSqlStore for FlakyStore {
        fn get(&self, _bucket: &[u8], _key: &[u8]) -> Result<Vec<u8>, StoreError> {
            Err(self
                .get_error
                .clone()
                .unwrap_or(StoreError::NotFound))
        }

        fn cmp_and_swap(
            &self,
            _bucket: &[u8],
            _key: &[u8],
            _old: Option<&[u8]>,
            _new: &[u8],
        ) -> Result<SwapOutcome, StoreError> {
            match &self.swap_error {
                Some(err) => Err(err.clone()),
                None => Ok(SwapOutcome {
                    current: Some(b"foo".to_vec()),
                    swapped: self.swapped,
                }),
            }
        }
    }

    #[test]
    fn memory_store_cas_creates_and_updates() {
        let store = MemoryStore::new();
        let created = store
            .cmp_and_swap(CHALLENGE_BUCKET, b"id", None, b"v1")
            .expect("swap");
        assert!(created.swapped);

        // Creation against an existing key loses.
        let lost = store
            .cmp_and_swap(CHALLENGE_BUCKET, b"id", None, b"v2")
            .expect("swap");
        assert!(!lost.swapped);
        assert_eq!(lost.current, Some(b"v1".to_vec()));

        // Update with the correct old bytes wins exactly once.
        let won = store
            .cmp_and_swap(CHALLENGE_BUCKET, b"id", Some(b"v1"), b"v2")
            .expect("swap");
        assert!(won.swapped);
        let stale = store
            .cmp_and_swap(CHALLENGE_BUCKET, b"id", Some(b"v1"), b"v3")
            .expect("swap");
        assert!(!stale.swapped);
        assert_eq!(stale.current, Some(b"v2".to_vec()));

        assert_eq!(store.get(CHALLENGE_BUCKET, b"id"), Ok(b"v2".to_vec()));
        assert_eq!(
            store.get(CHALLENGE_BUCKET, b"missing"),
            Err(StoreError::NotFound)
        );
    }

    #[test]
    fn create_persists_a_pending_record() {
        let backend = MemoryStore::new();
        let store = ChallengeStore::new(Arc::new(backend.clone()));
        let ch = store
            .create(ChallengeKind::Http01, test_options(), &test_clock())
            .expect("create");
        assert_eq!(ch.status(), ChallengeStatus::Pending);

        let stored = backend
            .get(CHALLENGE_BUCKET, ch.id().as_bytes())
            .expect("stored bytes");
        assert_eq!(stored, ch.to_bytes().expect("serialize"));
        assert_eq!(store.get(ch.id()).expect("reload"), ch);
    }

    #[test]
    fn create_surfaces_backend_errors() {
        let store = ChallengeStore::new(Arc::new(FlakyStore {
            get_error: None,
            swap_error: Some(StoreError::Backend("force".to_owned())),
            swapped: false,
        }));
        let err = store
            .create(ChallengeKind::Dns01, test_options(), &test_clock())
            .expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
        assert_eq!(err.to_string(), "error saving acme challenge: force");
    }

    #[test]
    fn save_reports_lost_races_as_server_internal() {
        let store = ChallengeStore::new(Arc::new(FlakyStore {
            get_error: None,
            swap_error: None,
            swapped: false,
        }));
        let ch = Challenge::new(ChallengeKind::Http01, test_options(), &test_clock());
        let err = store.save(&ch, None).expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
        assert_eq!(
            err.to_string(),
            "error saving acme challenge; acme challenge has changed since last read"
        );
    }

    #[test]
    fn save_passes_previous_bytes_to_the_swap() {
        struct AssertingStore {
            expected_old: Vec<u8>,
        }
        impl NoSqlStore for AssertingStore {
            fn get(&self, _bucket: &[u8], _key: &[u8]) -> Result<Vec<u8>, StoreError> {
                Err(StoreError::NotFound)
            }
            fn cmp_and_swap(
                &self,
                bucket: &[u8],
                _key: &[u8],
                old: Option<&[u8]>,
                _new: &[u8],
            ) -> Result<SwapOutcome, StoreError> {
                assert_eq!(bucket, CHALLENGE_BUCKET);
                assert_eq!(old, Some(self.expected_old.as_slice()));
                Ok(SwapOutcome {
                    current: None,
                    swapped: true,
                })
            }
        }

        let old = Challenge::new(ChallengeKind::Http01, test_options(), &test_clock());
        let new = old.begin_processing().expect("promote");
        let store = ChallengeStore::new(Arc::new(AssertingStore {
            expected_old: old.to_bytes().expect("serialize"),
        }));
        store.save(&new, Some(&old)).expect("save");
    }

    #[test]
    fn get_maps_not_found_to_malformed() {
        let store = ChallengeStore::new(Arc::new(FlakyStore {
            get_error: Some(StoreError::NotFound),
            swap_error: None,
            swapped: true,
        }));
        let err = store.get("chID").expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::Malformed);
        assert_eq!(err.to_string(), "challenge chID not found");
    }

    #[test]
    fn get_maps_backend_errors_to_server_internal() {
        let store = ChallengeStore::new(Arc::new(FlakyStore {
            get_error: Some(StoreError::Backend("force".to_owned())),
            swap_error: None,
            swapped: true,
        }));
        let err = store.get("chID").expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
        assert_eq!(err.to_string(), "error loading challenge chID: force");
    }

    #[test]
    fn get_surfaces_decode_failures() {
        let backend = MemoryStore::new();
        backend
            .cmp_and_swap(CHALLENGE_BUCKET, b"chID", None, br#"{"type":"foo"}"#)
            .expect("seed");
        let store = ChallengeStore::new(Arc::new(backend));
        let err = store.get("chID").expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
    }

    #[test]
    fn begin_processing_persists_the_promotion() {
        let backend = MemoryStore::new();
        let store = ChallengeStore::new(Arc::new(backend));
        let pending = store
            .create(ChallengeKind::TlsAlpn01, test_options(), &test_clock())
            .expect("create");
        let processing = store.begin_processing(&pending).expect("promote");
        assert_eq!(processing.status(), ChallengeStatus::Processing);
        assert_eq!(store.get(pending.id()).expect("reload"), processing);

        // The promotion consumed the stored bytes; a second promotion from
        // the stale pending record loses the CAS.
        let err = store.begin_processing(&pending).expect_err("stale promote");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
    }
}
