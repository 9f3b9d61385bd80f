use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

use crate::challenge::{Challenge, ChallengeKind, ChallengeStatus};
use crate::error::{Error, Problem};

/// Errors building a [`ProjectionContext`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    /// The base URL cannot carry path segments (e.g. `data:` URLs).
    #[error("ACME base URL cannot be used as a base")]
    CannotBeABase,
}

/// Request-scoped link builder for challenge resources.
///
/// The frontend derives one per request from the advertised base URL and the
/// provisioner the order is running under; the provisioner name is treated as
/// an opaque label and escaped as a single path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionContext {
    challenge_base: Url,
}

impl ProjectionContext {
    /// Builds the context for `base_url` and `provisioner`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::CannotBeABase`] when the URL cannot carry
    /// path segments.
    pub fn new(base_url: Url, provisioner: &str) -> Result<Self, ProjectionError> {
        let mut challenge_base = base_url;
        challenge_base
            .path_segments_mut()
            .map_err(|()| ProjectionError::CannotBeABase)?
            .pop_if_empty()
            .extend(["acme", provisioner, "challenge"]);
        Ok(Self { challenge_base })
    }

    /// Returns the URL of the challenge resource with the given id.
    ///
    /// Challenge ids are URL-safe by construction, so plain concatenation is
    /// exact.
    #[must_use]
    pub fn challenge_url(&self, id: &str) -> String {
        format!("{}/{id}", self.challenge_base)
    }
}

/// RFC 8555 challenge object as rendered in HTTP responses.
///
/// Timestamps are RFC 3339; absent instants render as omitted fields, the
/// wire-compatible form of the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeResource {
    #[serde(rename = "type")]
    kind: ChallengeKind,
    status: ChallengeStatus,
    token: String,
    url: String,
    id: String,
    #[serde(rename = "authzID")]
    authz_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    validated: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "String::is_empty")]
    retry_after: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Problem>,
}

impl ChallengeResource {
    /// Challenge type tag.
    #[must_use]
    pub const fn kind(&self) -> ChallengeKind {
        self.kind
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn status(&self) -> ChallengeStatus {
        self.status
    }

    /// Key-authorization token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Resource URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Record id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parent authorization id.
    #[must_use]
    pub fn authz_id(&self) -> &str {
        &self.authz_id
    }

    /// Validation instant, or the empty string.
    #[must_use]
    pub fn validated(&self) -> &str {
        &self.validated
    }

    /// Advertised retry instant, or the empty string.
    #[must_use]
    pub fn retry_after(&self) -> &str {
        &self.retry_after
    }

    /// Recorded problem, when present.
    #[must_use]
    pub const fn error(&self) -> Option<&Problem> {
        self.error.as_ref()
    }
}

fn format_rfc3339(instant: OffsetDateTime) -> Result<String, Error> {
    instant
        .format(&Rfc3339)
        .map_err(|err| Error::server_internal(format!("error formatting RFC 3339 timestamp: {err}")))
}

/// Projects a challenge record to its ACME wire object.
///
/// Pure: reads the record and the request-scoped context, performs no I/O.
///
/// # Errors
///
/// Timestamp formatting failures map to `ServerInternal`.
pub fn to_acme(
    challenge: &Challenge,
    context: &ProjectionContext,
) -> Result<ChallengeResource, Error> {
    let validated = match challenge.validated() {
        Some(instant) if challenge.status() == ChallengeStatus::Valid => format_rfc3339(instant)?,
        _ => String::new(),
    };
    let retry_after = match challenge.retry() {
        Some(retry) => format_rfc3339(retry.next_attempt)?,
        None => String::new(),
    };
    Ok(ChallengeResource {
        kind: challenge.kind(),
        status: challenge.status(),
        token: challenge.token().to_owned(),
        url: context.challenge_url(challenge.id()),
        id: challenge.id().to_owned(),
        authz_id: challenge.authz_id().to_owned(),
        validated,
        retry_after,
        error: challenge.error().cloned(),
    })
}
