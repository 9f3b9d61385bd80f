use std::borrow::Cow;

use sha2::{Digest, Sha256};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::oid_registry::Oid;
use x509_parser::parse_x509_certificate;

use crate::challenge::Challenge;
use crate::error::{Error, Problem, ProblemType};
use crate::jwk::{key_authorization, AccountJwk};

use super::{ProbeOutcome, TlsProbe, TlsProbeConfig, ACME_TLS_ALPN_PROTOCOL, TLS_DIAL_TIMEOUT};

/// DER-encoded arcs of id-pe-acmeIdentifier, 1.3.6.1.5.5.7.1.31.
const ID_PE_ACME_IDENTIFIER: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x01, 0x1F];

/// DER-encoded arcs of the obsolete pre-standard id-pe-acmeIdentifierV1,
/// 1.3.6.1.5.5.7.1.30.1.
const ID_PE_ACME_IDENTIFIER_V1_OBSOLETE: &[u8] =
    &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x01, 0x1E, 0x01];

fn acme_identifier_oid() -> Oid<'static> {
    Oid::new(Cow::Borrowed(ID_PE_ACME_IDENTIFIER))
}

fn acme_identifier_v1_obsolete_oid() -> Oid<'static> {
    Oid::new(Cow::Borrowed(ID_PE_ACME_IDENTIFIER_V1_OBSOLETE))
}

/// Runs one TLS-ALPN-01 validation attempt.
///
/// Dials `<value>:443` offering only `acme-tls/1`, then inspects the
/// self-signed leaf the prover presents: a single DNS SAN equal to the
/// identifier and a critical acmeValidationV1 extension wrapping
/// SHA-256(keyAuthorization) as a DER OCTET STRING.
///
/// Only a wrong hash is terminal; every other certificate defect leaves the
/// challenge retryable.
///
/// # Errors
///
/// Only a key-authorization derivation failure escapes; every observed
/// failure is classified into the returned outcome.
pub(crate) async fn probe(
    tls: &dyn TlsProbe,
    challenge: &Challenge,
    jwk: &AccountJwk,
) -> Result<ProbeOutcome, Error> {
    let value = challenge.value();
    let config = TlsProbeConfig {
        server_name: value.to_owned(),
        alpn_protocols: vec![ACME_TLS_ALPN_PROTOCOL.to_owned()],
        insecure_skip_verify: true,
        handshake_timeout: TLS_DIAL_TIMEOUT,
    };
    let addr = format!("{value}:443");

    let session = match tls.dial("tcp", &addr, &config).await {
        Ok(session) => session,
        Err(err) => {
            return Ok(ProbeOutcome::Transient(Problem::new(
                ProblemType::Connection,
                format!("error doing TLS dial for {addr}: {err}"),
            )));
        }
    };

    let Some(leaf_der) = session.peer_certificates.first() else {
        return Ok(ProbeOutcome::Transient(Problem::new(
            ProblemType::Tls,
            format!("tls-alpn-01 challenge for {value} resulted in no certificates"),
        )));
    };

    if session.negotiated_protocol.as_deref() != Some(ACME_TLS_ALPN_PROTOCOL) {
        return Ok(ProbeOutcome::Transient(Problem::new(
            ProblemType::Tls,
            "cannot negotiate ALPN acme-tls/1 protocol for tls-alpn-01 challenge",
        )));
    }

    let leaf = match parse_x509_certificate(leaf_der) {
        Ok((_, leaf)) => leaf,
        Err(err) => {
            return Ok(ProbeOutcome::Transient(Problem::new(
                ProblemType::Tls,
                format!("error parsing leaf certificate for tls-alpn-01 challenge: {err}"),
            )));
        }
    };

    let mut dns_names = Vec::new();
    for ext in leaf.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push(*dns);
                }
            }
        }
    }
    if dns_names.len() != 1 || !dns_names[0].eq_ignore_ascii_case(value) {
        return Ok(ProbeOutcome::Transient(Problem::new(
            ProblemType::Tls,
            format!(
                "incorrect certificate for tls-alpn-01 challenge: leaf certificate must contain a single DNS name, {value}"
            ),
        )));
    }

    let expected_key_auth = key_authorization(challenge.token(), jwk)?;
    let expected_hash: [u8; 32] = Sha256::digest(expected_key_auth.as_bytes()).into();

    let acme_oid = acme_identifier_oid();
    let obsolete_oid = acme_identifier_v1_obsolete_oid();
    let mut found_obsolete = false;

    for ext in leaf.extensions() {
        if ext.oid == acme_oid {
            if !ext.critical {
                return Ok(ProbeOutcome::Transient(Problem::new(
                    ProblemType::IncorrectResponse,
                    "incorrect certificate for tls-alpn-01 challenge: acmeValidationV1 extension not critical",
                )));
            }
            let Some(ext_value) = parse_octet_string(ext.value) else {
                return Ok(ProbeOutcome::Transient(Problem::new(
                    ProblemType::IncorrectResponse,
                    "incorrect certificate for tls-alpn-01 challenge: malformed acmeValidationV1 extension value",
                )));
            };
            if ext_value.len() != expected_hash.len() {
                return Ok(ProbeOutcome::Transient(Problem::new(
                    ProblemType::IncorrectResponse,
                    "incorrect certificate for tls-alpn-01 challenge: malformed acmeValidationV1 extension value",
                )));
            }
            if ext_value == expected_hash.as_slice() {
                return Ok(ProbeOutcome::Match);
            }
            return Ok(ProbeOutcome::Mismatch(Problem::new(
                ProblemType::IncorrectResponse,
                format!(
                    "incorrect certificate for tls-alpn-01 challenge: expected acmeValidationV1 extension value {} for this challenge but got {}",
                    hex::encode(expected_hash),
                    hex::encode(ext_value)
                ),
            )));
        }
        if ext.oid == obsolete_oid {
            found_obsolete = true;
        }
    }

    if found_obsolete {
        return Ok(ProbeOutcome::Transient(Problem::new(
            ProblemType::IncorrectResponse,
            "incorrect certificate for tls-alpn-01 challenge: obsolete id-pe-acmeIdentifier in acmeValidationV1 extension",
        )));
    }

    Ok(ProbeOutcome::Transient(Problem::new(
        ProblemType::IncorrectResponse,
        "incorrect certificate for tls-alpn-01 challenge: missing acmeValidationV1 extension",
    )))
}

/// Minimal DER OCTET STRING decoder: tag, definite length, no trailing bytes.
fn parse_octet_string(input: &[u8]) -> Option<&[u8]> {
    let (&tag, rest) = input.split_first()?;
    if tag != 0x04 {
        return None;
    }
    let (&first_len, rest) = rest.split_first()?;
    let (len, rest) = if first_len < 0x80 {
        (usize::from(first_len), rest)
    } else {
        let octets = usize::from(first_len & 0x7F);
        if octets == 0 || octets > 2 || rest.len() < octets {
            return None;
        }
        let mut len = 0_usize;
        for &byte in &rest[..octets] {
            len = (len << 8) | usize::from(byte);
        }
        (len, &rest[octets..])
    };
    if rest.len() != len {
        return None;
    }
    Some(rest)
}
