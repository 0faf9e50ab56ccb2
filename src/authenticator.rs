//! Verification of relay-signed handshake metadata.
//!
//! A relay appends its metadata to the handshake's server address as six
//! NUL-delimited fields:
//!
//! ```text
//! timestamp \0 relay address \0 client address \0 hostname \0 base64(r) \0 base64(s)
//! ```
//!
//! The first four fields, rejoined with single NUL bytes, are the message the
//! relay signed with ECDSA P-256 / SHA-256. NUL bytes inside the hostname are
//! sent as `\n` so they cannot be confused with the delimiter.

use anyhow::{Context, Result, anyhow};
use base64::{
    Engine,
    engine::{
        DecodePaddingMode, GeneralPurpose,
        general_purpose::{PAD, STANDARD},
    },
};
use p256::{
    ecdsa::{
        Signature, SigningKey, VerifyingKey,
        signature::{Signer, Verifier},
    },
    pkcs8::DecodePublicKey,
};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Public key of the production relay network, as base64 X.509 SubjectPublicKeyInfo.
pub const DEFAULT_TRUST_ANCHOR: &str = "MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAErI/XQrUaWgwG/gAPa08O20ZL/is94JlRKfgZXRlUt6/YXoN17AdlDjILrk3QVmA7w5VVYKWhcHXN4JFXCAR6Zw==";

/// Payloads signed this many seconds ago or earlier are rejected.
pub const FRESHNESS_WINDOW_SECS: i64 = 3600;

/// Port assigned to every restored client address.
pub const CLIENT_PORT: u16 = 25565;

// Relays may strip the `=` padding from r and s.
const SIGNATURE_BASE64: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const FIELD_COUNT: usize = 6;
const SIGNED_FIELD_COUNT: usize = 4;

// Largest DER INTEGER content for a P-256 scalar: 32 bytes plus a sign pad.
const MAX_SCALAR_CONTENT: usize = 33;

const DER_SEQUENCE: u8 = 0x30;
const DER_INTEGER: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("no appended data found: {0}")]
    MalformedPayload(&'static str),
    #[error("signature is {age}s old")]
    StaleSignature { age: i64 },
    #[error("invalid ECDSA signature")]
    InvalidSignature,
    #[error("relay sent an invalid client address {0:?}")]
    AddressParse(String),
}

impl RejectReason {
    /// True when the payload was authentic but unusable, which points at a
    /// broken relay rather than a hostile client.
    #[must_use]
    pub const fn is_relay_fault(&self) -> bool {
        matches!(self, Self::AddressParse(_))
    }
}

/// The relay's verification key. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    key: VerifyingKey,
}

impl TrustAnchor {
    #[must_use]
    pub const fn from_verifying_key(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Parses a base64-encoded DER SubjectPublicKeyInfo holding a P-256 key.
    pub fn from_spki_base64(encoded: &str) -> Result<Self> {
        let der = STANDARD
            .decode(encoded.trim())
            .context("Trust anchor is not valid base64")?;
        let key = VerifyingKey::from_public_key_der(&der)
            .map_err(|e| anyhow!("Trust anchor is not a P-256 public key: {e}"))?;
        Ok(Self { key })
    }

    pub fn production() -> Result<Self> {
        Self::from_spki_base64(DEFAULT_TRUST_ANCHOR)
    }
}

/// Client identity recovered from an authenticated handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIdentity {
    client_addr: SocketAddr,
    hostname: String,
}

impl ValidatedIdentity {
    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn into_parts(self) -> (SocketAddr, String) {
        (self.client_addr, self.hostname)
    }
}

/// Checks a handshake server address carrying relay metadata.
///
/// `now` is the current time in seconds since the Unix epoch. Timestamps in
/// the future are accepted; only age is bounded.
pub fn authenticate(
    raw: &str,
    now: i64,
    anchor: &TrustAnchor,
) -> Result<ValidatedIdentity, RejectReason> {
    let mut fields: Vec<&str> = raw.split('\0').collect();
    while fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }
    if fields.len() < FIELD_COUNT {
        return Err(RejectReason::MalformedPayload("fewer than six fields"));
    }

    let timestamp: i64 = fields[0]
        .parse()
        .map_err(|_| RejectReason::MalformedPayload("timestamp is not an integer"))?;
    let age = now.saturating_sub(timestamp);
    if age >= FRESHNESS_WINDOW_SECS {
        return Err(RejectReason::StaleSignature { age });
    }

    let message = fields[..SIGNED_FIELD_COUNT].join("\0");
    let r = SIGNATURE_BASE64
        .decode(fields[4])
        .map_err(|_| RejectReason::InvalidSignature)?;
    let s = SIGNATURE_BASE64
        .decode(fields[5])
        .map_err(|_| RejectReason::InvalidSignature)?;
    let der = encode_der_signature(&r, &s).ok_or(RejectReason::InvalidSignature)?;
    let signature = Signature::from_der(&der).map_err(|_| RejectReason::InvalidSignature)?;
    anchor
        .key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| RejectReason::InvalidSignature)?;

    let ip: IpAddr = fields[2]
        .parse()
        .map_err(|_| RejectReason::AddressParse(fields[2].to_string()))?;

    Ok(ValidatedIdentity {
        client_addr: SocketAddr::new(ip, CLIENT_PORT),
        hostname: restore_hostname(fields[3]),
    })
}

/// Replaces NUL bytes with `\n` so the hostname fits in one payload field.
#[must_use]
pub fn escape_hostname(hostname: &str) -> String {
    hostname.replace('\0', "\n")
}

/// Inverse of [`escape_hostname`] for hostnames that contain no `\n`.
#[must_use]
pub fn restore_hostname(escaped: &str) -> String {
    escaped.replace('\n', "\0")
}

/// Relay-side view of the metadata, used to produce a signed payload.
#[derive(Debug, Clone, Copy)]
pub struct RelayPayload<'a> {
    pub timestamp: i64,
    pub relay_addr: &'a str,
    pub client_addr: &'a str,
    pub hostname: &'a str,
}

impl RelayPayload<'_> {
    /// Renders the six-field wire text, signed with `key`.
    #[must_use]
    pub fn sign(&self, key: &SigningKey) -> String {
        let message = format!(
            "{}\0{}\0{}\0{}",
            self.timestamp,
            self.relay_addr,
            self.client_addr,
            escape_hostname(self.hostname)
        );
        let signature: Signature = key.sign(message.as_bytes());
        let (r, s) = signature.split_bytes();
        format!("{message}\0{}\0{}", STANDARD.encode(r), STANDARD.encode(s))
    }
}

/// DER `SEQUENCE { INTEGER r, INTEGER s }` for unsigned big-endian r and s.
/// Returns `None` when either value cannot be a P-256 scalar.
fn encode_der_signature(r: &[u8], s: &[u8]) -> Option<Vec<u8>> {
    let mut body = Vec::with_capacity(2 * (2 + MAX_SCALAR_CONTENT));
    encode_der_integer(&mut body, r)?;
    encode_der_integer(&mut body, s)?;

    let mut der = Vec::with_capacity(body.len() + 2);
    der.push(DER_SEQUENCE);
    der.push(body.len() as u8);
    der.extend_from_slice(&body);
    Some(der)
}

fn encode_der_integer(out: &mut Vec<u8>, unsigned: &[u8]) -> Option<()> {
    let start = unsigned
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(unsigned.len());
    let magnitude = &unsigned[start..];
    let pad = magnitude.first().is_none_or(|&b| b & 0x80 != 0);
    let len = magnitude.len() + usize::from(pad);
    if len > MAX_SCALAR_CONTENT {
        return None;
    }

    out.push(DER_INTEGER);
    out.push(len as u8);
    if pad {
        out.push(0);
    }
    out.extend_from_slice(magnitude);
    Some(())
}
