use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::challenge::Challenge;
use crate::error::{Error, Problem, ProblemType};
use crate::jwk::{key_authorization, AccountJwk};

use super::{DnsProbe, ProbeOutcome};

/// Runs one DNS-01 validation attempt.
///
/// Queries TXT records at `_acme-challenge.<value>` (wildcard prefix
/// stripped) and accepts the proof when any record equals the base64url
/// SHA-256 of the key authorization.
///
/// # Errors
///
/// Only a key-authorization derivation failure escapes; every observed
/// failure is classified into the returned outcome.
pub(crate) async fn probe(
    dns: &dyn DnsProbe,
    challenge: &Challenge,
    jwk: &AccountJwk,
) -> Result<ProbeOutcome, Error> {
    let domain = challenge
        .value()
        .strip_prefix("*.")
        .unwrap_or_else(|| challenge.value());
    let record = format!("_acme-challenge.{domain}");

    let txt_records = match dns.lookup_txt(&record).await {
        Ok(records) => records,
        Err(err) => {
            return Ok(ProbeOutcome::Transient(Problem::new(
                ProblemType::Dns,
                format!(
                    "error looking up TXT records for domain {}: {err}",
                    challenge.value()
                ),
            )));
        }
    };

    let expected_key_auth = key_authorization(challenge.token(), jwk)?;
    let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(expected_key_auth.as_bytes()));

    if txt_records.is_empty() {
        return Ok(ProbeOutcome::Transient(Problem::new(
            ProblemType::Dns,
            format!("no TXT record found at '{record}'"),
        )));
    }

    if txt_records.iter().any(|txt| txt.trim() == expected) {
        Ok(ProbeOutcome::Match)
    } else {
        Ok(ProbeOutcome::Mismatch(Problem::new(
            ProblemType::IncorrectResponse,
            format!(
                "keyAuthorization does not match; expected {expected_key_auth}, but got {txt_records:?}"
            ),
        )))
    }
}
