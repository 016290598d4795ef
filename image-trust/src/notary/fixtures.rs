// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Signed trust data built on the fly for tests.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use p256::ecdsa::{signature::Signer as _, Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::TrustRoot;

pub const FAR_FUTURE: &str = "2099-01-01T00:00:00Z";

pub fn expired() -> String {
    (chrono::Utc::now() - chrono::Duration::days(1)).to_rfc3339()
}

/// Deterministic P-256 signer.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn new(seed: u8) -> Self {
        let key = SigningKey::from_slice(&[seed; 32]).expect("seed is a valid scalar");
        Self { key }
    }

    pub fn key_id(&self) -> String {
        hex::encode(Sha256::digest(self.public_b64().as_bytes()))
    }

    pub fn public_b64(&self) -> String {
        let der = self
            .key
            .verifying_key()
            .to_public_key_der()
            .expect("encodable key");
        STANDARD.encode(der.as_bytes())
    }

    pub fn tuf_key(&self) -> Value {
        json!({"keytype": "ecdsa", "keyval": {"private": null, "public": self.public_b64()}})
    }

    pub fn trust_root(&self) -> TrustRoot {
        TrustRoot::from_tuf_key(&self.public_b64()).expect("valid key")
    }

    pub fn envelope(&self, signed: Value) -> Value {
        let message = serde_json::to_vec(&signed).expect("serializable");
        let signature: Signature = self.key.sign(&message);
        json!({
            "signed": signed,
            "signatures": [{
                "keyid": self.key_id(),
                "method": "ecdsa",
                "sig": STANDARD.encode(signature.to_bytes()),
            }]
        })
    }
}

/// Snapshot/timestamp entry describing `document`.
pub fn meta_entry(document: &Value) -> Value {
    let bytes = serde_json::to_vec(&json!({
        "signed": document["signed"],
        "signatures": document["signatures"],
    }))
    .expect("serializable");
    json!({
        "hashes": {"sha256": STANDARD.encode(Sha256::digest(&bytes))},
        "length": bytes.len(),
    })
}

/// Targets entry for a hex sha256 digest.
pub fn target(digest: &str) -> Value {
    let raw = hex::decode(digest).expect("hex digest");
    json!({"hashes": {"sha256": STANDARD.encode(raw)}, "length": 1993})
}

struct Delegation {
    name: String,
    signer: Signer,
    targets: Option<Map<String, Value>>,
}

/// A complete, consistent trust chain for one repository.
pub struct Chain {
    pub root: Signer,
    pub targets: Signer,
    pub snapshot: Signer,
    pub timestamp: Signer,
    target_entries: Map<String, Value>,
    delegations: Vec<Delegation>,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            root: Signer::new(1),
            targets: Signer::new(2),
            snapshot: Signer::new(3),
            timestamp: Signer::new(4),
            target_entries: Map::new(),
            delegations: Vec::new(),
        }
    }

    /// Sign `tag` for `digest` directly in `targets`.
    pub fn target(mut self, tag: &str, digest: &str) -> Self {
        self.target_entries.insert(tag.to_string(), target(digest));
        self
    }

    /// Declare `targets/<name>` and publish its document with `tags`.
    pub fn delegation(mut self, name: &str, seed: u8, tags: &[(&str, &str)]) -> Self {
        let entries = tags
            .iter()
            .map(|(tag, digest)| (tag.to_string(), target(digest)))
            .collect();
        self.delegations.push(Delegation {
            name: format!("targets/{name}"),
            signer: Signer::new(seed),
            targets: Some(entries),
        });
        self
    }

    /// Declare `targets/<name>` without ever publishing its document.
    pub fn unpublished_delegation(mut self, name: &str, seed: u8) -> Self {
        self.delegations.push(Delegation {
            name: format!("targets/{name}"),
            signer: Signer::new(seed),
            targets: None,
        });
        self
    }

    /// Role name to document for every published role.
    pub fn build(&self) -> HashMap<String, Value> {
        self.build_with(|_, _| {})
    }

    /// Like `build`, letting `tamper` rewrite a role's `signed` payload before
    /// it is signed and hashed into the rest of the chain.
    pub fn build_with(&self, tamper: impl Fn(&str, &mut Value)) -> HashMap<String, Value> {
        let mut documents = HashMap::new();

        let mut root_keys = Map::new();
        root_keys.insert(
            self.root.key_id(),
            json!({"keytype": "ecdsa-x509", "keyval": {"private": null, "public": "Y2VydGlmaWNhdGU="}}),
        );
        for signer in [&self.targets, &self.snapshot, &self.timestamp] {
            root_keys.insert(signer.key_id(), signer.tuf_key());
        }
        let mut root = json!({
            "_type": "Root",
            "consistent_snapshot": false,
            "expires": FAR_FUTURE,
            "keys": root_keys,
            "roles": {
                "root": {"keyids": [self.root.key_id()], "threshold": 1},
                "snapshot": {"keyids": [self.snapshot.key_id()], "threshold": 1},
                "targets": {"keyids": [self.targets.key_id()], "threshold": 1},
                "timestamp": {"keyids": [self.timestamp.key_id()], "threshold": 1}
            },
            "version": 1
        });
        tamper("root", &mut root);
        let root = self.root.envelope(root);

        let mut delegation_keys = Map::new();
        let mut delegation_roles = Vec::new();
        for delegation in &self.delegations {
            delegation_keys.insert(delegation.signer.key_id(), delegation.signer.tuf_key());
            delegation_roles.push(json!({
                "keyids": [delegation.signer.key_id()],
                "name": delegation.name,
                "paths": [""],
                "threshold": 1
            }));
        }
        let mut targets = json!({
            "_type": "Targets",
            "delegations": {"keys": delegation_keys, "roles": delegation_roles},
            "expires": FAR_FUTURE,
            "targets": self.target_entries,
            "version": 2
        });
        tamper("targets", &mut targets);
        let targets = self.targets.envelope(targets);

        let mut meta = Map::new();
        meta.insert("root".into(), meta_entry(&root));
        meta.insert("targets".into(), meta_entry(&targets));

        for delegation in &self.delegations {
            let Some(entries) = &delegation.targets else {
                continue;
            };
            let mut signed = json!({
                "_type": "Targets",
                "delegations": {"keys": {}, "roles": []},
                "expires": FAR_FUTURE,
                "targets": entries,
                "version": 1
            });
            tamper(&delegation.name, &mut signed);
            let document = delegation.signer.envelope(signed);
            meta.insert(delegation.name.clone(), meta_entry(&document));
            documents.insert(delegation.name.clone(), document);
        }

        let mut snapshot = json!({
            "_type": "Snapshot",
            "expires": FAR_FUTURE,
            "meta": meta,
            "version": 2
        });
        tamper("snapshot", &mut snapshot);
        let snapshot = self.snapshot.envelope(snapshot);

        let mut timestamp = json!({
            "_type": "Timestamp",
            "expires": FAR_FUTURE,
            "meta": {"snapshot": meta_entry(&snapshot)},
            "version": 2
        });
        tamper("timestamp", &mut timestamp);
        let timestamp = self.timestamp.envelope(timestamp);

        documents.insert("root".into(), root);
        documents.insert("targets".into(), targets);
        documents.insert("snapshot".into(), snapshot);
        documents.insert("timestamp".into(), timestamp);
        documents
    }
}
