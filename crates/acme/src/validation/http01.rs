use crate::challenge::Challenge;
use crate::error::{Error, Problem, ProblemType};
use crate::jwk::{key_authorization, AccountJwk};

use super::{HttpProbe, ProbeOutcome};

/// Runs one HTTP-01 validation attempt.
///
/// Fetches `http://<value>/.well-known/acme-challenge/<token>` through the
/// injected performer and compares the trimmed body against the expected key
/// authorization.
///
/// # Errors
///
/// Only a key-authorization derivation failure escapes; every observed
/// failure is classified into the returned outcome.
pub(crate) async fn probe(
    http: &dyn HttpProbe,
    challenge: &Challenge,
    jwk: &AccountJwk,
) -> Result<ProbeOutcome, Error> {
    let url = format!(
        "http://{}/.well-known/acme-challenge/{}",
        challenge.value(),
        challenge.token()
    );

    let response = match http.get(&url).await {
        Ok(response) => response,
        Err(err) => {
            return Ok(ProbeOutcome::Transient(Problem::new(
                ProblemType::Connection,
                format!("error doing http GET for url {url}: {err}"),
            )));
        }
    };

    if response.status >= 400 {
        return Ok(ProbeOutcome::Transient(Problem::new(
            ProblemType::Connection,
            format!(
                "error doing http GET for url {url} with status code {}",
                response.status
            ),
        )));
    }

    let body = match response.body {
        Ok(body) => body,
        Err(err) => {
            return Ok(ProbeOutcome::Transient(Problem::new(
                ProblemType::ServerInternal,
                format!("error reading response body for url {url}: {err}"),
            )));
        }
    };

    let expected = key_authorization(challenge.token(), jwk)?;
    let received = body.trim();
    if received == expected {
        Ok(ProbeOutcome::Match)
    } else {
        Ok(ProbeOutcome::Mismatch(Problem::new(
            ProblemType::IncorrectResponse,
            format!("keyAuthorization does not match; expected {expected}, but got {received}"),
        )))
    }
}
