use std::sync::Arc;

use tracing::{debug, info};

use cairn_core::Clock;

use crate::challenge::{Challenge, ChallengeKind, ChallengeStatus};
use crate::error::Error;
use crate::jwk::AccountJwk;
use crate::storage::ChallengeStore;
use crate::validation::{dns01, http01, tls_alpn01, ProbeOutcome, ProbeSet};

/// Drives challenges through the validation state machine.
///
/// The engine holds no locks; per-challenge serialization comes entirely from
/// the compare-and-swap discipline of the underlying store. Many workers may
/// validate distinct challenges concurrently, and two workers racing on the
/// same challenge resolve through exactly one committed write.
#[derive(Clone)]
pub struct ValidationEngine {
    store: ChallengeStore,
    clock: Arc<dyn Clock>,
    probes: ProbeSet,
}

impl ValidationEngine {
    /// Assembles an engine from its capabilities.
    #[must_use]
    pub fn new(store: ChallengeStore, clock: Arc<dyn Clock>, probes: ProbeSet) -> Self {
        Self {
            store,
            clock,
            probes,
        }
    }

    /// Runs one validation attempt and returns the updated, already persisted
    /// record.
    ///
    /// Terminal records pass through untouched without a storage call.
    /// `processing` records are probed; the outcome decides the transition:
    /// a match turns the record `valid`, a definitive mismatch turns it
    /// `invalid`, and an inconclusive probe records the problem while the
    /// record stays `processing` for the scheduler to retry.
    ///
    /// # Errors
    ///
    /// `pending` records, malformed account keys, storage faults and lost
    /// compare-and-swap races are CA-side faults and surface as
    /// `ServerInternal`; they are never persisted onto the record.
    pub async fn validate(
        &self,
        challenge: Challenge,
        jwk: &AccountJwk,
    ) -> Result<Challenge, Error> {
        match challenge.status() {
            ChallengeStatus::Valid | ChallengeStatus::Invalid => Ok(challenge),
            ChallengeStatus::Pending => Err(Error::server_internal(
                "pending challenges must first be moved to the processing state",
            )),
            ChallengeStatus::Processing => {
                let outcome = match challenge.kind() {
                    ChallengeKind::Http01 => {
                        http01::probe(&*self.probes.http, &challenge, jwk).await?
                    }
                    ChallengeKind::Dns01 => {
                        dns01::probe(&*self.probes.dns, &challenge, jwk).await?
                    }
                    ChallengeKind::TlsAlpn01 => {
                        tls_alpn01::probe(&*self.probes.tls, &challenge, jwk).await?
                    }
                };
                debug!(
                    challenge = %challenge.id(),
                    kind = %challenge.kind(),
                    value = %challenge.value(),
                    outcome = ?outcome,
                    "probe completed"
                );
                let updated = match outcome {
                    ProbeOutcome::Match => challenge.clone().into_valid(self.clock.now()),
                    ProbeOutcome::Mismatch(problem) => challenge.clone().into_invalid(problem),
                    ProbeOutcome::Transient(problem) => {
                        challenge.clone().with_transient_error(problem)
                    }
                };
                self.store.save(&updated, Some(&challenge))?;
                if updated.status() != challenge.status() {
                    info!(
                        challenge = %updated.id(),
                        kind = %updated.kind(),
                        status = %updated.status(),
                        "acme challenge transitioned"
                    );
                }
                Ok(updated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    use cairn_core::{Clock, FixedClock};

    use super::ValidationEngine;
    use crate::challenge::{Challenge, ChallengeKind, ChallengeOptions, ChallengeStatus};
    use crate::error::ProblemType;
    use crate::jwk::{key_authorization, AccountJwk};
    use crate::storage::{
        ChallengeStore, MemoryStore, NoSqlStore, StoreError, SwapOutcome,
    };
    use crate::validation::{
        DnsProbe, HttpProbe, HttpProbeResponse, ProbeSet, TlsProbe, TlsProbeConfig,
        TlsProbeSession,
    };

    const NOW: time::OffsetDateTime = datetime!(2024-07-01 12:00:00 UTC);

    fn test_clock() -> FixedClock {
        FixedClock::new(NOW)
    }

    fn test_jwk() -> AccountJwk {
        AccountJwk::ec(
            "P-256",
            "f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU",
            "x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0",
        )
    }

    struct StaticHttp {
        body: Option<String>,
    }

    #[async_trait]
    impl HttpProbe for StaticHttp {
        async fn get(&self, _url: &str) -> io::Result<HttpProbeResponse> {
            match &self.body {
                Some(body) => Ok(HttpProbeResponse {
                    status: 200,
                    body: Ok(body.clone()),
                }),
                None => Err(io::Error::new(io::ErrorKind::Other, "force")),
            }
        }
    }

    struct NoDns;

    #[async_trait]
    impl DnsProbe for NoDns {
        async fn lookup_txt(&self, _name: &str) -> io::Result<Vec<String>> {
            Err(io::Error::new(io::ErrorKind::Other, "unexpected dns probe"))
        }
    }

    struct NoTls;

    #[async_trait]
    impl TlsProbe for NoTls {
        async fn dial(
            &self,
            _network: &str,
            _addr: &str,
            _config: &TlsProbeConfig,
        ) -> io::Result<TlsProbeSession> {
            Err(io::Error::new(io::ErrorKind::Other, "unexpected tls probe"))
        }
    }

    fn probes_with_http(body: Option<String>) -> ProbeSet {
        ProbeSet {
            http: Arc::new(StaticHttp { body }),
            dns: Arc::new(NoDns),
            tls: Arc::new(NoTls),
        }
    }

    /// Backend counting every call, so no-op guarantees are observable.
    #[derive(Clone, Default)]
    struct CountingStore {
        inner: MemoryStore,
        calls: Arc<AtomicUsize>,
    }

    impl NoSqlStore for CountingStore {
        fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(bucket, key)
        }

        fn cmp_and_swap(
            &self,
            bucket: &[u8],
            key: &[u8],
            old: Option<&[u8]>,
            new: &[u8],
        ) -> Result<SwapOutcome, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.cmp_and_swap(bucket, key, old, new)
        }
    }

    /// Backend whose swaps always lose.
    struct LosingStore;

    impl NoSqlStore for LosingStore {
        fn get(&self, _bucket: &[u8], _key: &[u8]) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::NotFound)
        }

        fn cmp_and_swap(
            &self,
            _bucket: &[u8],
            _key: &[u8],
            _old: Option<&[u8]>,
            _new: &[u8],
        ) -> Result<SwapOutcome, StoreError> {
            Ok(SwapOutcome {
                current: Some(b"foo".to_vec()),
                swapped: false,
            })
        }
    }

    fn processing_challenge(store: &ChallengeStore, kind: ChallengeKind) -> Challenge {
        let pending = store
            .create(
                kind,
                ChallengeOptions {
                    account_id: "accID".to_owned(),
                    authz_id: "authzID".to_owned(),
                    value: "zap.internal".to_owned(),
                },
                &test_clock(),
            )
            .expect("create");
        store.begin_processing(&pending).expect("promote")
    }

    fn engine_over(backend: Arc<dyn NoSqlStore>, probes: ProbeSet) -> (ValidationEngine, ChallengeStore) {
        let store = ChallengeStore::new(backend);
        (
            ValidationEngine::new(store.clone(), Arc::new(test_clock()), probes),
            store,
        )
    }

    #[tokio::test]
    async fn terminal_records_are_untouched_noops() {
        let backend = CountingStore::default();
        let store = ChallengeStore::new(Arc::new(backend.clone()));
        let processing = processing_challenge(&store, ChallengeKind::Http01);
        let valid = processing
            .clone()
            .into_valid(test_clock().now());
        store.save(&valid, Some(&processing)).expect("persist valid");

        let calls_before = backend.calls.load(Ordering::SeqCst);
        let engine = ValidationEngine::new(
            store,
            Arc::new(test_clock()),
            probes_with_http(None),
        );
        let result = engine
            .validate(valid.clone(), &test_jwk())
            .await
            .expect("validate");
        assert_eq!(result, valid);
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls_before);

        let invalid = processing.into_invalid(crate::error::Problem::new(
            ProblemType::IncorrectResponse,
            "proof mismatch",
        ));
        let result = engine
            .validate(invalid.clone(), &test_jwk())
            .await
            .expect("validate");
        assert_eq!(result, invalid);
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn pending_records_are_rejected() {
        let (engine, store) = engine_over(
            Arc::new(MemoryStore::new()),
            probes_with_http(None),
        );
        let pending = store
            .create(
                ChallengeKind::Http01,
                ChallengeOptions {
                    account_id: "accID".to_owned(),
                    authz_id: "authzID".to_owned(),
                    value: "zap.internal".to_owned(),
                },
                &test_clock(),
            )
            .expect("create");
        let err = engine
            .validate(pending, &test_jwk())
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
        assert_eq!(
            err.to_string(),
            "pending challenges must first be moved to the processing state"
        );
    }

    #[tokio::test]
    async fn successful_probe_persists_a_valid_record() {
        let backend = Arc::new(MemoryStore::new());
        let store = ChallengeStore::new(backend.clone());
        let processing = processing_challenge(&store, ChallengeKind::Http01);
        let jwk = test_jwk();
        let body = key_authorization(processing.token(), &jwk).expect("key authorization");

        let (engine, store) = engine_over(backend, probes_with_http(Some(body)));
        let updated = engine
            .validate(processing.clone(), &jwk)
            .await
            .expect("validate");
        assert_eq!(updated.status(), ChallengeStatus::Valid);
        assert_eq!(updated.validated(), Some(NOW));
        assert_eq!(updated.error(), None);
        assert_eq!(updated.retry(), None);
        assert_eq!(store.get(processing.id()).expect("reload"), updated);
    }

    #[tokio::test]
    async fn mismatch_persists_a_terminal_invalid_record() {
        let backend = Arc::new(MemoryStore::new());
        let store = ChallengeStore::new(backend.clone());
        let processing = processing_challenge(&store, ChallengeKind::Http01);
        let jwk = test_jwk();

        let (engine, store) = engine_over(backend, probes_with_http(Some("foo".to_owned())));
        let updated = engine
            .validate(processing.clone(), &jwk)
            .await
            .expect("validate");
        assert_eq!(updated.status(), ChallengeStatus::Invalid);
        assert_eq!(updated.validated(), None);
        let problem = updated.error().expect("problem recorded");
        assert_eq!(problem.kind(), ProblemType::IncorrectResponse);
        assert_eq!(store.get(processing.id()).expect("reload"), updated);
    }

    #[tokio::test]
    async fn transient_failure_keeps_processing_with_the_problem() {
        let backend = Arc::new(MemoryStore::new());
        let store = ChallengeStore::new(backend.clone());
        let processing = processing_challenge(&store, ChallengeKind::Http01);
        let jwk = test_jwk();

        let (engine, store) = engine_over(backend, probes_with_http(None));
        let updated = engine
            .validate(processing.clone(), &jwk)
            .await
            .expect("validate");
        assert_eq!(updated.status(), ChallengeStatus::Processing);
        assert_eq!(updated.validated(), None);
        let problem = updated.error().expect("problem recorded");
        assert_eq!(problem.kind(), ProblemType::Connection);
        assert_eq!(store.get(processing.id()).expect("reload"), updated);
    }

    #[tokio::test]
    async fn lost_cas_race_is_server_internal() {
        let store = ChallengeStore::new(Arc::new(MemoryStore::new()));
        let processing = processing_challenge(&store, ChallengeKind::Http01);
        let jwk = test_jwk();
        let body = key_authorization(processing.token(), &jwk).expect("key authorization");

        let (engine, _) = engine_over(Arc::new(LosingStore), probes_with_http(Some(body)));
        let err = engine
            .validate(processing, &jwk)
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
        assert_eq!(
            err.to_string(),
            "error saving acme challenge; acme challenge has changed since last read"
        );
    }

    #[tokio::test]
    async fn bad_jwk_propagates_and_nothing_is_persisted() {
        let backend = Arc::new(MemoryStore::new());
        let store = ChallengeStore::new(backend.clone());
        let processing = processing_challenge(&store, ChallengeKind::Http01);
        let bad_jwk = AccountJwk {
            kty: "string".to_owned(),
            ..AccountJwk::default()
        };

        let (engine, store) = engine_over(backend, probes_with_http(Some("foo".to_owned())));
        let err = engine
            .validate(processing.clone(), &bad_jwk)
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProblemType::ServerInternal);
        assert!(err
            .to_string()
            .starts_with("error generating JWK thumbprint:"));
        // The record is exactly as the promotion left it.
        assert_eq!(store.get(processing.id()).expect("reload"), processing);
    }

    #[tokio::test]
    async fn dispatch_follows_the_challenge_kind() {
        let backend = Arc::new(MemoryStore::new());
        let store = ChallengeStore::new(backend.clone());
        let processing = processing_challenge(&store, ChallengeKind::Dns01);
        let jwk = test_jwk();

        // The DNS double fails, so a DNS-kind record must classify as a
        // transient DNS problem rather than touching the HTTP probe.
        let (engine, _) = engine_over(backend, probes_with_http(Some("unused".to_owned())));
        let updated = engine
            .validate(processing, &jwk)
            .await
            .expect("validate");
        assert_eq!(updated.status(), ChallengeStatus::Processing);
        assert_eq!(
            updated.error().expect("problem").kind(),
            ProblemType::Dns
        );
    }
}
