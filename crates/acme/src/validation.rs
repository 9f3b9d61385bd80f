//! Proof-of-control probes for ACME challenges.
//!
//! Each probe is a capability injected into the validation engine — never a
//! hardcoded network call — so tests substitute deterministic doubles. The
//! adapters in the submodules run one external attempt and normalize the wide
//! space of transport, protocol and cryptographic failures onto the ACME
//! problem taxonomy.

use std::io;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Problem;

pub(crate) mod dns01;
pub(crate) mod http01;
pub(crate) mod tls_alpn01;

/// ALPN protocol identifier for TLS-ALPN-01 validation.
pub const ACME_TLS_ALPN_PROTOCOL: &str = "acme-tls/1";

/// Handshake timeout the engine configures for TLS-ALPN-01 dials.
pub const TLS_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a single probe attempt.
///
/// A transport failure is never terminal and a semantically wrong proof is
/// never transient: `Mismatch` drives the record to `invalid`, `Transient`
/// leaves it `processing` with the problem recorded so the scheduler can
/// retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    /// Proof accepted.
    Match,
    /// Proof definitively wrong; terminal.
    Mismatch(Problem),
    /// Probe could not conclude; the challenge stays `processing`.
    Transient(Problem),
}

/// HTTP response observed by an [`HttpProbe`].
///
/// A transport-level failure is the probe's `Err`; a connection that was
/// established but whose body could not be read is `Ok` with `body: Err`, so
/// the two failure classes stay distinguishable.
#[derive(Debug)]
pub struct HttpProbeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, or the error hit while reading it.
    pub body: io::Result<String>,
}

/// Performs the HTTP-01 GET against the prover.
///
/// Redirect policy is the implementation's choice. Implementations must bound
/// the request with a finite timeout; cancellation surfaces as an `Err`,
/// which the adapter classifies as transient.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// Fetches `url` and reads the response body.
    async fn get(&self, url: &str) -> io::Result<HttpProbeResponse>;
}

/// Resolves TXT records for DNS-01 validation.
#[async_trait]
pub trait DnsProbe: Send + Sync {
    /// Looks up the TXT records published at `name`.
    async fn lookup_txt(&self, name: &str) -> io::Result<Vec<String>>;
}

/// TLS client parameters for a TLS-ALPN-01 dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsProbeConfig {
    /// SNI value; the identifier under validation.
    pub server_name: String,
    /// Offered ALPN protocols; the engine offers only `acme-tls/1`.
    pub alpn_protocols: Vec<String>,
    /// The prover presents a self-signed leaf, so chain verification is off.
    pub insecure_skip_verify: bool,
    /// Upper bound for the dial plus handshake.
    pub handshake_timeout: Duration,
}

/// Completed handshake as observed by a [`TlsProbe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsProbeSession {
    /// ALPN protocol the peer negotiated, if any.
    pub negotiated_protocol: Option<String>,
    /// Peer certificate chain, leaf first, DER-encoded.
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Dials the prover and completes a TLS handshake.
///
/// Implementations must honor [`TlsProbeConfig::handshake_timeout`]; an
/// expired deadline is an `Err` and classifies as transient.
#[async_trait]
pub trait TlsProbe: Send + Sync {
    /// Connects to `addr` over `network` and hands back the handshake state.
    async fn dial(
        &self,
        network: &str,
        addr: &str,
        config: &TlsProbeConfig,
    ) -> io::Result<TlsProbeSession>;
}

/// Bundle of the three injectable probes.
#[derive(Clone)]
pub struct ProbeSet {
    /// HTTP-01 performer.
    pub http: std::sync::Arc<dyn HttpProbe>,
    /// DNS-01 resolver.
    pub dns: std::sync::Arc<dyn DnsProbe>,
    /// TLS-ALPN-01 dialer.
    pub tls: std::sync::Arc<dyn TlsProbe>,
}
