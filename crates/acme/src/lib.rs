#![forbid(unsafe_code)]
#![deny(warnings)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![doc = "ACME challenge doğrulama çekirdeği; HTTP-01, DNS-01 ve TLS-ALPN-01\
kanıtlarını deterministik durum makinesi ve CAS korumalı kalıcılık ile işler."]

mod challenge;
mod engine;
mod error;
mod jwk;
mod storage;
mod validation;
mod wire;

pub use challenge::{Challenge, ChallengeKind, ChallengeOptions, ChallengeStatus, Retry};
pub use engine::ValidationEngine;
pub use error::{Error, Problem, ProblemType};
pub use jwk::{key_authorization, AccountJwk, ThumbprintError};
pub use storage::{
    ChallengeStore, MemoryStore, NoSqlStore, StoreError, SwapOutcome, CHALLENGE_BUCKET,
};
pub use validation::{
    DnsProbe, HttpProbe, HttpProbeResponse, ProbeSet, TlsProbe, TlsProbeConfig, TlsProbeSession,
    ACME_TLS_ALPN_PROTOCOL, TLS_DIAL_TIMEOUT,
};
pub use wire::{to_acme, ChallengeResource, ProjectionContext, ProjectionError};
