use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use cairn_core::{url_safe_token, Clock};

use crate::error::{Error, Problem};

/// Number of random octets behind a challenge token or id.
const TOKEN_BYTES: usize = 32;

/// ACME challenge kinds supported by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
}

impl ChallengeKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "http-01" => Some(Self::Http01),
            "dns-01" => Some(Self::Dns01),
            "tls-alpn-01" => Some(Self::TlsAlpn01),
            _ => None,
        }
    }

    /// Returns the RFC 8555 type string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChallengeKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Challenge lifecycle states.
///
/// Legal transitions: `pending → processing`,
/// `processing → processing | valid | invalid`; `valid` and `invalid` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Returns the RFC 8555 status string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChallengeStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Pending retry advertised to clients while a challenge is `processing`.
///
/// The core exposes the contract; the scheduler that re-enqueues probes owns
/// the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retry {
    /// Instant of the next scheduled validation attempt.
    #[serde(rename = "nextAttempt", with = "time::serde::rfc3339")]
    pub next_attempt: OffsetDateTime,
}

/// Immutable creation parameters supplied by the authorization manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeOptions {
    /// Owning account.
    pub account_id: String,
    /// Parent authorization.
    pub authz_id: String,
    /// Identifier being proven; may start with `*.` for DNS-01.
    pub value: String,
}

/// One proof-of-control attempt for one identifier under one authorization.
///
/// The persistence store owns the canonical bytes; an in-memory `Challenge`
/// is exclusively owned by the caller running a validation attempt, and
/// concurrent writers are serialized by compare-and-swap at the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Challenge {
    id: String,
    #[serde(rename = "accountID")]
    account_id: String,
    #[serde(rename = "authzID")]
    authz_id: String,
    #[serde(rename = "type")]
    kind: ChallengeKind,
    value: String,
    token: String,
    status: ChallengeStatus,
    #[serde(with = "time::serde::rfc3339")]
    created: OffsetDateTime,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    validated: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Problem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry: Option<Retry>,
}

/// Stored document as read back from the persistence port. Unknown fields are
/// ignored for forward compatibility; `type` and `status` are validated after
/// parsing so garbage states surface with the historical messages.
#[derive(Deserialize)]
struct RawChallenge {
    id: String,
    #[serde(rename = "accountID")]
    account_id: String,
    #[serde(rename = "authzID")]
    authz_id: String,
    #[serde(rename = "type")]
    kind: String,
    value: String,
    token: String,
    status: String,
    #[serde(with = "time::serde::rfc3339")]
    created: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    validated: Option<OffsetDateTime>,
    #[serde(default)]
    error: Option<Problem>,
    #[serde(default)]
    retry: Option<Retry>,
}

impl Challenge {
    /// Creates a fresh `pending` challenge with a random id and token.
    #[must_use]
    pub fn new(kind: ChallengeKind, options: ChallengeOptions, clock: &dyn Clock) -> Self {
        Self {
            id: url_safe_token(TOKEN_BYTES),
            account_id: options.account_id,
            authz_id: options.authz_id,
            kind,
            value: options.value,
            token: url_safe_token(TOKEN_BYTES),
            status: ChallengeStatus::Pending,
            created: clock.now(),
            validated: None,
            error: None,
            retry: None,
        }
    }

    /// Serializes the record to its canonical stored form.
    ///
    /// # Errors
    ///
    /// Serialization failures map to `ServerInternal`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|err| Error::server_internal(format!("error marshaling challenge: {err}")))
    }

    /// Parses a stored record.
    ///
    /// # Errors
    ///
    /// Returns `ServerInternal` when the document cannot be parsed, names an
    /// unexpected challenge type, or carries an unknown state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: RawChallenge = serde_json::from_slice(bytes)
            .map_err(|err| Error::server_internal(format!("error unmarshaling challenge: {err}")))?;
        let kind = ChallengeKind::parse(&raw.kind)
            .ok_or_else(|| Error::server_internal(format!("unexpected challenge type {}", raw.kind)))?;
        let status = ChallengeStatus::parse(&raw.status)
            .ok_or_else(|| Error::server_internal(format!("unknown challenge state: {}", raw.status)))?;
        Ok(Self {
            id: raw.id,
            account_id: raw.account_id,
            authz_id: raw.authz_id,
            kind,
            value: raw.value,
            token: raw.token,
            status,
            created: raw.created,
            validated: raw.validated,
            error: raw.error,
            retry: raw.retry,
        })
    }

    /// Opaque record id; immutable after creation.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning account id.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Parent authorization id.
    #[must_use]
    pub fn authz_id(&self) -> &str {
        &self.authz_id
    }

    /// Challenge kind.
    #[must_use]
    pub const fn kind(&self) -> ChallengeKind {
        self.kind
    }

    /// Identifier being proven.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Random token bound into the key authorization.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> ChallengeStatus {
        self.status
    }

    /// Creation instant.
    #[must_use]
    pub const fn created(&self) -> OffsetDateTime {
        self.created
    }

    /// Instant the challenge became `valid`, when it did.
    #[must_use]
    pub const fn validated(&self) -> Option<OffsetDateTime> {
        self.validated
    }

    /// Last recorded probe failure.
    #[must_use]
    pub const fn error(&self) -> Option<&Problem> {
        self.error.as_ref()
    }

    /// Pending retry, when one is scheduled.
    #[must_use]
    pub const fn retry(&self) -> Option<&Retry> {
        self.retry.as_ref()
    }

    /// Copies the record into the `processing` state.
    ///
    /// This is the promotion the authorization manager performs before any
    /// probe may run; the validation engine refuses `pending` records.
    ///
    /// # Errors
    ///
    /// Returns `ServerInternal` when the record is not `pending`.
    pub fn begin_processing(&self) -> Result<Self, Error> {
        if self.status != ChallengeStatus::Pending {
            return Err(Error::server_internal(format!(
                "only pending challenges may be moved to the processing state; challenge {} is {}",
                self.id, self.status
            )));
        }
        let mut next = self.clone();
        next.status = ChallengeStatus::Processing;
        Ok(next)
    }

    /// Records a successful probe: terminal `valid` at `at`.
    pub(crate) fn into_valid(self, at: OffsetDateTime) -> Self {
        let mut next = self;
        next.status = ChallengeStatus::Valid;
        next.validated = Some(at);
        next.error = None;
        next.retry = None;
        next
    }

    /// Records a definitive proof failure: terminal `invalid`.
    pub(crate) fn into_invalid(self, problem: Problem) -> Self {
        let mut next = self;
        next.status = ChallengeStatus::Invalid;
        next.error = Some(problem);
        next.retry = None;
        next
    }

    /// Records an inconclusive probe: the record stays `processing` and the
    /// scheduler keeps ownership of `retry`.
    pub(crate) fn with_transient_error(self, problem: Problem) -> Self {
        let mut next = self;
        next.error = Some(problem);
        next
    }

    /// Attaches a retry instant; used by the scheduler that re-enqueues
    /// `processing` challenges.
    ///
    /// # Errors
    ///
    /// Returns `ServerInternal` when the record is not `processing`.
    pub fn with_retry(&self, retry: Retry) -> Result<Self, Error> {
        if self.status != ChallengeStatus::Processing {
            return Err(Error::server_internal(format!(
                "retries may only be scheduled for processing challenges; challenge {} is {}",
                self.id, self.status
            )));
        }
        let mut next = self.clone();
        next.retry = Some(retry);
        Ok(next)
    }
}
