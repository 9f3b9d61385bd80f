use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ACME problem classes used by the validation core.
///
/// Each class serializes as the full RFC 8555 problem URN and carries the
/// HTTP status a frontend should answer with when the problem is returned as
/// a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemType {
    /// Transport-level failure while reaching the identifier.
    #[serde(rename = "urn:ietf:params:acme:error:connection")]
    Connection,
    /// DNS resolution failure.
    #[serde(rename = "urn:ietf:params:acme:error:dns")]
    Dns,
    /// The prover responded but the proof does not match.
    #[serde(rename = "urn:ietf:params:acme:error:incorrectResponse")]
    IncorrectResponse,
    /// The caller passed a request the server cannot interpret, e.g. an
    /// unknown challenge id.
    #[serde(rename = "urn:ietf:params:acme:error:malformed")]
    Malformed,
    /// CA-side fault: violated preconditions, storage faults, lost CAS races.
    #[serde(rename = "urn:ietf:params:acme:error:serverInternal")]
    ServerInternal,
    /// TLS handshake or ALPN protocol failure.
    #[serde(rename = "urn:ietf:params:acme:error:tls")]
    Tls,
}

impl ProblemType {
    /// Returns the problem URN.
    #[must_use]
    pub const fn as_urn(self) -> &'static str {
        match self {
            Self::Connection => "urn:ietf:params:acme:error:connection",
            Self::Dns => "urn:ietf:params:acme:error:dns",
            Self::IncorrectResponse => "urn:ietf:params:acme:error:incorrectResponse",
            Self::Malformed => "urn:ietf:params:acme:error:malformed",
            Self::ServerInternal => "urn:ietf:params:acme:error:serverInternal",
            Self::Tls => "urn:ietf:params:acme:error:tls",
        }
    }

    /// Returns the HTTP status associated with the class.
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::Connection | Self::Dns | Self::Malformed | Self::Tls => 400,
            Self::IncorrectResponse => 403,
            Self::ServerInternal => 500,
        }
    }
}

impl std::fmt::Display for ProblemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_urn())
    }
}

/// Wire-format problem document recorded on a challenge and rendered in ACME
/// responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    kind: ProblemType,
    detail: String,
    status: u16,
}

impl Problem {
    /// Builds a problem document for `kind` with the given detail.
    #[must_use]
    pub fn new(kind: ProblemType, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status: kind.status_code(),
        }
    }

    /// Returns the problem class.
    #[must_use]
    pub const fn kind(&self) -> ProblemType {
        self.kind
    }

    /// Returns the human-readable detail.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Returns the HTTP status carried by the document.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }
}

/// Function-level error of the validation core.
///
/// Probe-derived failures never surface here; they are recorded on the
/// challenge as a [`Problem`]. What does surface is the CA's own fault
/// domain: unknown states, storage failures, lost compare-and-swap races and
/// malformed account keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct Error {
    kind: ProblemType,
    detail: String,
}

impl Error {
    /// Builds an error of the given class.
    #[must_use]
    pub fn new(kind: ProblemType, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Transport-level failure reaching the identifier.
    #[must_use]
    pub fn connection(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Connection, detail)
    }

    /// DNS resolution failure.
    #[must_use]
    pub fn dns(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Dns, detail)
    }

    /// Proof observed but not matching.
    #[must_use]
    pub fn incorrect_response(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::IncorrectResponse, detail)
    }

    /// Caller-side request fault.
    #[must_use]
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Malformed, detail)
    }

    /// CA-side fault.
    #[must_use]
    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::ServerInternal, detail)
    }

    /// TLS handshake or ALPN failure.
    #[must_use]
    pub fn tls(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::Tls, detail)
    }

    /// Returns the problem class.
    #[must_use]
    pub const fn kind(&self) -> ProblemType {
        self.kind
    }

    /// Returns the HTTP status associated with the class.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Renders the error as a wire-format problem document.
    #[must_use]
    pub fn to_problem(&self) -> Problem {
        Problem::new(self.kind, self.detail.clone())
    }
}
