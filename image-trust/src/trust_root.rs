// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Key material used to anchor a verification.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use lazy_static::lazy_static;
use log::debug;
use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use regex::Regex;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::signature::Verifier as _;
use rsa::RsaPublicKey;
use sha2::Sha256;

use crate::{Error, Result};

lazy_static! {
    static ref KEYLESS_REGEX: Regex =
        Regex::new(r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9.\-]+$")
            .expect("keyless regex is valid");
    static ref KMS_REGEX: Regex = Regex::new(
        r"^(awskms|gcpkms|azurekms|hashivault|k8s):/{2,3}[a-zA-Z0-9_.+/:-]+$"
    )
    .expect("kms regex is valid");
}

/// A trust anchor, classified once from its textual form.
///
/// Only the asymmetric variants can verify signatures. KMS references and
/// keyless identities are recognised so they can be configured and echoed
/// back, but a validator that needs raw key material rejects them.
#[derive(Clone, Debug)]
pub enum TrustRoot {
    /// P-256 public key, rendered as base64 SubjectPublicKeyInfo DER.
    Ecdsa { key: VerifyingKey, encoded: String },

    /// RSA public key, rendered as base64 PKCS#1 DER.
    Rsa { key: RsaPublicKey, encoded: String },

    Kms(String),

    /// An email-like signer identity.
    Keyless(String),
}

impl TrustRoot {
    pub fn parse(data: &str) -> Result<Self> {
        let trimmed = data.trim();
        if KEYLESS_REGEX.is_match(trimmed) {
            return Ok(Self::Keyless(trimmed.to_string()));
        }
        if KMS_REGEX.is_match(trimmed) {
            return Ok(Self::Kms(trimmed.to_string()));
        }
        if let Ok(key) = VerifyingKey::from_public_key_pem(trimmed) {
            return Self::ecdsa(key);
        }
        if let Some(key) = rsa_from_pem(trimmed) {
            return Self::rsa(key);
        }
        Err(Error::InvalidFormat("unable to load trust root".into()))
    }

    /// Load a key as it appears in TUF metadata: base64 of either a DER
    /// SubjectPublicKeyInfo or a PEM document, or a PEM document directly.
    pub fn from_tuf_key(public: &str) -> Result<Self> {
        if public.trim_start().starts_with("-----BEGIN") {
            return Self::parse(public);
        }

        let compact: String = public.split_whitespace().collect();
        let der = STANDARD
            .decode(compact)
            .map_err(|e| Error::InvalidFormat(format!("key is not valid base64: {e}")))?;

        if der.starts_with(b"-----BEGIN") {
            let pem = String::from_utf8(der)
                .map_err(|_| Error::InvalidFormat("key is not valid PEM".into()))?;
            return Self::parse(&pem);
        }
        if let Ok(key) = VerifyingKey::from_public_key_der(&der) {
            return Self::ecdsa(key);
        }
        if let Ok(key) = RsaPublicKey::from_public_key_der(&der) {
            return Self::rsa(key);
        }
        Err(Error::InvalidFormat(
            "key is neither an ECDSA nor an RSA public key".into(),
        ))
    }

    fn ecdsa(key: VerifyingKey) -> Result<Self> {
        let der = key
            .to_public_key_der()
            .map_err(|e| Error::InvalidFormat(format!("unable to encode ECDSA key: {e}")))?;
        Ok(Self::Ecdsa {
            key,
            encoded: STANDARD.encode(der.as_bytes()),
        })
    }

    fn rsa(key: RsaPublicKey) -> Result<Self> {
        let der = key
            .to_pkcs1_der()
            .map_err(|e| Error::InvalidFormat(format!("unable to encode RSA key: {e}")))?;
        Ok(Self::Rsa {
            key,
            encoded: STANDARD.encode(der.as_bytes()),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ecdsa { .. } => "ecdsa",
            Self::Rsa { .. } => "rsa",
            Self::Kms(_) => "kms",
            Self::Keyless(_) => "keyless",
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self, Self::Ecdsa { .. } | Self::Rsa { .. })
    }

    /// Verify `signature` over `message`.
    ///
    /// ECDSA signatures are raw `r || s` (DER is accepted too), digested with
    /// SHA-256. RSA signatures are RSASSA-PSS with SHA-256.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            Self::Ecdsa { key, .. } => {
                let signature = Signature::from_slice(signature)
                    .or_else(|_| Signature::from_der(signature))
                    .map_err(|e| Error::ValidationFailed(format!("malformed signature: {e}")))?;
                key.verify(message, &signature)
                    .map_err(|e| Error::ValidationFailed(format!("bad signature: {e}")))
            }
            Self::Rsa { key, .. } => {
                let verifier = rsa::pss::VerifyingKey::<Sha256>::new(key.clone());
                let signature = rsa::pss::Signature::try_from(signature)
                    .map_err(|e| Error::ValidationFailed(format!("malformed signature: {e}")))?;
                verifier
                    .verify(message, &signature)
                    .map_err(|e| Error::ValidationFailed(format!("bad signature: {e}")))
            }
            other => Err(Error::WrongKey(other.kind().to_string())),
        }
    }
}

fn rsa_from_pem(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| debug!("not an RSA public key: {e}"))
        .ok()
}

impl FromStr for TrustRoot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TrustRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ecdsa { encoded, .. } | Self::Rsa { encoded, .. } => f.write_str(encoded),
            Self::Kms(value) | Self::Keyless(value) => f.write_str(value),
        }
    }
}

impl PartialEq for TrustRoot {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.to_string() == other.to_string()
    }
}

impl Eq for TrustRoot {}
