// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Signed TUF metadata documents.
//!
//! Every document is a `{"signed": ..., "signatures": [...]}` envelope. The
//! `signed` payload is kept as received so that signatures and hashes are
//! computed over the same compact serialisation the signer produced.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::key_store::KeyStore;
use super::tuf_role::TufRole;
use crate::{Error, Result};

pub const SHA256: &str = "sha256";

/// A public key as listed in `root` or in a targets delegation.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TufKey {
    pub keytype: String,
    pub keyval: KeyVal,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct KeyVal {
    pub public: String,
}

/// Hash and size of another role's document, as listed in `snapshot` and
/// `timestamp`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct MetaEntry {
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub length: u64,
}

/// A signed image tag in a targets document.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub length: u64,
}

impl Target {
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get(SHA256).map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Delegations {
    #[serde(default)]
    pub keys: BTreeMap<String, TufKey>,
    #[serde(default)]
    pub roles: Vec<DelegationRole>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DelegationRole {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
struct SignatureEntry {
    keyid: String,
    sig: String,
}

#[derive(Debug, Deserialize)]
struct RootSigned {
    keys: BTreeMap<String, TufKey>,
}

#[derive(Debug, Deserialize)]
struct MetaSigned {
    meta: BTreeMap<String, MetaEntry>,
}

#[derive(Debug, Deserialize)]
struct TargetsSigned {
    #[serde(default)]
    targets: BTreeMap<String, Target>,
    #[serde(default)]
    delegations: Delegations,
}

#[derive(Debug, Deserialize)]
struct Expiry {
    expires: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    signed: Value,
    signatures: Vec<Value>,
}

/// Role specific part of a document, checked against its expected shape on
/// construction.
#[derive(Debug)]
enum RoleBody {
    Root(RootSigned),
    Snapshot(MetaSigned),
    Timestamp(MetaSigned),
    Targets(TargetsSigned),
}

#[derive(Debug)]
pub struct TrustData {
    role: TufRole,
    signed: Value,
    signatures: Vec<Value>,
    signature_entries: Vec<SignatureEntry>,
    expires: DateTime<Utc>,
    body: RoleBody,
}

impl TrustData {
    pub fn new(data: Value, role: TufRole) -> Result<Self> {
        let malformed =
            |e: serde_json::Error| Error::InvalidFormat(format!("trust data {role}: {e}"));

        let Envelope { signed, signatures } = serde_json::from_value(data).map_err(malformed)?;
        let signature_entries: Vec<SignatureEntry> =
            serde_json::from_value(Value::Array(signatures.clone())).map_err(malformed)?;
        if signature_entries.is_empty() {
            return Err(Error::InvalidFormat(format!(
                "trust data {role} carries no signatures"
            )));
        }

        let Expiry { expires } = parse_signed(&signed, &role)?;
        let expires = DateTime::parse_from_rfc3339(&expires)
            .map_err(|e| Error::InvalidFormat(format!("trust data {role} expiry: {e}")))?
            .with_timezone(&Utc);

        let body = match &role {
            TufRole::Root => RoleBody::Root(parse_signed(&signed, &role)?),
            TufRole::Snapshot => RoleBody::Snapshot(parse_signed(&signed, &role)?),
            TufRole::Timestamp => RoleBody::Timestamp(parse_signed(&signed, &role)?),
            TufRole::Targets | TufRole::Delegation(_) => {
                RoleBody::Targets(parse_signed(&signed, &role)?)
            }
        };

        Ok(Self {
            role,
            signed,
            signatures,
            signature_entries,
            expires,
            body,
        })
    }

    pub fn from_slice(data: &[u8], role: TufRole) -> Result<Self> {
        let value = serde_json::from_slice(data)
            .map_err(|e| Error::InvalidFormat(format!("trust data {role}: {e}")))?;
        Self::new(value, role)
    }

    /// Key ids of all signatures on the document.
    pub fn signature_key_ids(&self) -> impl Iterator<Item = &str> {
        self.signature_entries.iter().map(|s| s.keyid.as_str())
    }

    /// Check signature, expiry and hash.
    pub fn validate(&self, key_store: &KeyStore) -> Result<()> {
        self.validate_signature(key_store)?;
        self.validate_expiry()?;
        self.validate_hash(key_store)
    }

    /// Every signature must verify. `root` is always checked against the
    /// pinned key stored under the id `root`.
    pub fn validate_signature(&self, key_store: &KeyStore) -> Result<()> {
        let message = serde_json::to_vec(&self.signed)
            .map_err(|e| Error::InvalidFormat(format!("trust data {}: {e}", self.role)))?;

        for entry in &self.signature_entries {
            let key_id = match self.role {
                TufRole::Root => "root",
                _ => entry.keyid.as_str(),
            };
            let key = key_store.get_key(key_id)?;
            let signature = STANDARD.decode(&entry.sig).map_err(|e| {
                Error::ValidationFailed(format!(
                    "signature of trust data {} is not base64: {e}",
                    self.role
                ))
            })?;

            key.verify(&message, &signature).map_err(|e| {
                debug!("signature check of {} with key {key_id}: {e}", self.role);
                Error::ValidationFailed(format!(
                    "failed to verify signature of trust data {}",
                    self.role
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate_expiry(&self) -> Result<()> {
        if self.expires < Utc::now() {
            return Err(Error::ValidationFailed(format!(
                "trust data {} has expired",
                self.role
            )));
        }
        Ok(())
    }

    /// Compare the document against the hash and length recorded for its
    /// role. Timestamps are not referenced by any other role and pass.
    pub fn validate_hash(&self, key_store: &KeyStore) -> Result<()> {
        if self.role == TufRole::Timestamp {
            return Ok(());
        }

        let (expected_b64, expected_len) = key_store.get_hash(self.role.as_str())?;
        let expected = STANDARD.decode(expected_b64).map_err(|e| {
            Error::InvalidFormat(format!("hash of {} is not base64: {e}", self.role))
        })?;

        let (digest, length) = self.digest()?;
        if digest != expected || length != expected_len {
            return Err(Error::ValidationFailed(format!(
                "failed to validate hash of trust data {}",
                self.role
            )));
        }
        Ok(())
    }

    /// SHA-256 and byte length of the compact `{"signed", "signatures"}`
    /// serialisation.
    pub fn digest(&self) -> Result<(Vec<u8>, u64)> {
        let document = json!({
            "signed": self.signed,
            "signatures": self.signatures,
        });
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| Error::InvalidFormat(format!("trust data {}: {e}", self.role)))?;
        Ok((Sha256::digest(&bytes).to_vec(), bytes.len() as u64))
    }

    /// Keys this document vouches for: all keys of `root`, the delegation
    /// keys of a targets document that delegates, nothing otherwise.
    pub fn get_keys(&self) -> BTreeMap<&str, &TufKey> {
        match &self.body {
            RoleBody::Root(root) => root.keys.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            RoleBody::Targets(targets) if self.has_delegations() => targets
                .delegations
                .keys
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Hashes of other roles, listed by `snapshot` and `timestamp`.
    pub fn get_hashes(&self) -> BTreeMap<&str, &MetaEntry> {
        match &self.body {
            RoleBody::Snapshot(meta) | RoleBody::Timestamp(meta) => {
                meta.meta.iter().map(|(k, v)| (k.as_str(), v)).collect()
            }
            _ => BTreeMap::new(),
        }
    }

    /// A targets document delegates if it lists both keys and roles.
    pub fn has_delegations(&self) -> bool {
        match &self.body {
            RoleBody::Targets(targets) => {
                !targets.delegations.keys.is_empty() && !targets.delegations.roles.is_empty()
            }
            _ => false,
        }
    }

    pub fn get_delegations(&self) -> Vec<&str> {
        match &self.body {
            RoleBody::Targets(targets) => targets
                .delegations
                .roles
                .iter()
                .map(|r| r.name.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Signed tags, empty for anything but targets documents.
    pub fn targets(&self) -> &BTreeMap<String, Target> {
        static EMPTY: BTreeMap<String, Target> = BTreeMap::new();
        match &self.body {
            RoleBody::Targets(targets) => &targets.targets,
            _ => &EMPTY,
        }
    }

    pub fn get_tags(&self) -> impl Iterator<Item = &str> {
        self.targets().keys().map(String::as_str)
    }

    /// Base64 sha256 digest signed for `tag`.
    pub fn get_digest(&self, tag: &str) -> Result<&str> {
        self.targets()
            .get(tag)
            .and_then(Target::sha256)
            .ok_or_else(|| Error::NotFound(format!("unable to find digest for tag {tag}")))
    }
}

fn parse_signed<T: DeserializeOwned>(signed: &Value, role: &TufRole) -> Result<T> {
    T::deserialize(signed)
        .map_err(|e| Error::InvalidFormat(format!("trust data {role} has an invalid format: {e}")))
}
