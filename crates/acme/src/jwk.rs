use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::Error;

/// Errors produced while deriving an RFC 7638 thumbprint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThumbprintError {
    /// The `kty` member names a key type the core cannot canonicalize.
    #[error("unknown key type '{0}'")]
    UnknownKeyType(String),
    /// A member required for the key type is absent.
    #[error("missing JWK member '{member}' for key type '{kty}'")]
    MissingMember {
        /// Key type being canonicalized.
        kty: &'static str,
        /// Absent required member.
        member: &'static str,
    },
}

/// Public account key as delivered by the JOSE frontend.
///
/// Only the members that participate in the RFC 7638 thumbprint are modeled;
/// unknown members are dropped on deserialization, which is safe because the
/// thumbprint is defined over the required members alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccountJwk {
    /// Key type, e.g. `EC`, `RSA`, `OKP` or `oct`.
    pub kty: String,
    /// Curve name (`EC`, `OKP`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// X coordinate or raw public key (`EC`, `OKP`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// Y coordinate (`EC`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// Modulus (`RSA`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// Public exponent (`RSA`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// Symmetric key material (`oct`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

impl AccountJwk {
    /// Builds an EC public key.
    #[must_use]
    pub fn ec(crv: impl Into<String>, x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            kty: "EC".to_owned(),
            crv: Some(crv.into()),
            x: Some(x.into()),
            y: Some(y.into()),
            ..Self::default()
        }
    }

    /// Builds an RSA public key.
    #[must_use]
    pub fn rsa(n: impl Into<String>, e: impl Into<String>) -> Self {
        Self {
            kty: "RSA".to_owned(),
            n: Some(n.into()),
            e: Some(e.into()),
            ..Self::default()
        }
    }

    /// Builds an OKP public key.
    #[must_use]
    pub fn okp(crv: impl Into<String>, x: impl Into<String>) -> Self {
        Self {
            kty: "OKP".to_owned(),
            crv: Some(crv.into()),
            x: Some(x.into()),
            ..Self::default()
        }
    }

    /// Computes the RFC 7638 SHA-256 thumbprint over the canonical JSON of
    /// the required members.
    ///
    /// `serde_json`'s default map keeps keys in lexicographic order, which is
    /// exactly the member ordering the RFC demands.
    ///
    /// # Errors
    ///
    /// Returns [`ThumbprintError`] when the key type is unknown or a required
    /// member is missing.
    pub fn thumbprint(&self) -> Result<[u8; 32], ThumbprintError> {
        let canonical = self.canonical_json()?;
        Ok(Sha256::digest(canonical.as_bytes()).into())
    }

    fn canonical_json(&self) -> Result<String, ThumbprintError> {
        let mut members = Map::new();
        match self.kty.as_str() {
            "EC" => {
                members.insert("crv".to_owned(), self.required("EC", "crv", &self.crv)?);
                members.insert("kty".to_owned(), Value::String("EC".to_owned()));
                members.insert("x".to_owned(), self.required("EC", "x", &self.x)?);
                members.insert("y".to_owned(), self.required("EC", "y", &self.y)?);
            }
            "OKP" => {
                members.insert("crv".to_owned(), self.required("OKP", "crv", &self.crv)?);
                members.insert("kty".to_owned(), Value::String("OKP".to_owned()));
                members.insert("x".to_owned(), self.required("OKP", "x", &self.x)?);
            }
            "RSA" => {
                members.insert("e".to_owned(), self.required("RSA", "e", &self.e)?);
                members.insert("kty".to_owned(), Value::String("RSA".to_owned()));
                members.insert("n".to_owned(), self.required("RSA", "n", &self.n)?);
            }
            "oct" => {
                members.insert("k".to_owned(), self.required("oct", "k", &self.k)?);
                members.insert("kty".to_owned(), Value::String("oct".to_owned()));
            }
            other => return Err(ThumbprintError::UnknownKeyType(other.to_owned())),
        }
        Ok(Value::Object(members).to_string())
    }

    #[allow(clippy::unused_self)]
    fn required(
        &self,
        kty: &'static str,
        member: &'static str,
        value: &Option<String>,
    ) -> Result<Value, ThumbprintError> {
        value
            .as_ref()
            .map(|v| Value::String(v.clone()))
            .ok_or(ThumbprintError::MissingMember { kty, member })
    }
}

/// Derives the key authorization a prover must reveal for `token`.
///
/// The result is `token "." base64url(SHA-256(thumbprint))` per RFC 8555.
///
/// # Errors
///
/// A JWK that cannot produce a thumbprint maps to a `ServerInternal` error;
/// the account key was validated upstream, so failure here is a CA fault.
pub fn key_authorization(token: &str, jwk: &AccountJwk) -> Result<String, Error> {
    let thumbprint = jwk
        .thumbprint()
        .map_err(|err| Error::server_internal(format!("error generating JWK thumbprint: {err}")))?;
    Ok(format!("{token}.{}", URL_SAFE_NO_PAD.encode(thumbprint)))
}
