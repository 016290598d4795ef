// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;

use super::trust_data::{TrustData, SHA256};
use crate::{Error, Result, TrustRoot};

/// Key id under which the pinned root key is stored.
pub const ROOT_KEY_ID: &str = "root";

/// Keys and role hashes collected while walking one trust chain.
///
/// Entries are only ever added, and the first value stored for an id or role
/// is kept.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: HashMap<String, TrustRoot>,
    hashes: HashMap<String, (String, u64)>,
}

impl KeyStore {
    pub fn new(root_key: TrustRoot) -> Self {
        Self {
            keys: HashMap::from([(ROOT_KEY_ID.to_string(), root_key)]),
            hashes: HashMap::new(),
        }
    }

    /// A store without a pinned key, used to read the hashes of a single
    /// document.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get_key(&self, key_id: &str) -> Result<&TrustRoot> {
        self.keys
            .get(key_id)
            .ok_or_else(|| Error::NotFound(format!("unable to find key {key_id} in keystore")))
    }

    /// Base64 sha256 and length recorded for `role`.
    pub fn get_hash(&self, role: &str) -> Result<(&str, u64)> {
        self.hashes
            .get(role)
            .map(|(hash, length)| (hash.as_str(), *length))
            .ok_or_else(|| Error::NotFound(format!("unable to find hash for {role} in keystore")))
    }

    /// Merge the keys and hashes `trust_data` vouches for.
    ///
    /// Keys that signed the document itself are skipped: `root` lists its own
    /// signing certificate, which is never trusted from its own payload.
    pub fn update(&mut self, trust_data: &TrustData) -> Result<()> {
        let signers: Vec<&str> = trust_data.signature_key_ids().collect();

        for (key_id, key) in trust_data.get_keys() {
            if signers.contains(&key_id) || self.keys.contains_key(key_id) {
                continue;
            }
            let root = TrustRoot::from_tuf_key(&key.keyval.public).map_err(|e| {
                Error::InvalidFormat(format!("key {key_id} has an invalid format: {e}"))
            })?;
            self.keys.insert(key_id.to_string(), root);
        }

        for (role, entry) in trust_data.get_hashes() {
            self.hashes.entry(role.to_string()).or_insert_with(|| {
                (
                    entry.hashes.get(SHA256).cloned().unwrap_or_default(),
                    entry.length,
                )
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_key(&mut self, key_id: &str, key: TrustRoot) {
        self.keys.entry(key_id.to_string()).or_insert(key);
    }
}
