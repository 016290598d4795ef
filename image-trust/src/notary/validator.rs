// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Validation of a notary v1 (TUF) trust chain for one image.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::future::join_all;
use log::{debug, info};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::client::{Notary, NotaryConfig, TrustDataFetcher};
use super::key_store::KeyStore;
use super::trust_data::{Target, TrustData};
use super::tuf_role::TufRole;
use crate::validator::Validator;
use crate::{Error, ImageReference, Result, TrustRoot};

/// Rule arguments understood by the notary backend.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotaryArgs {
    #[serde(default, alias = "key")]
    trust_root: Option<String>,

    #[serde(default)]
    delegations: Vec<String>,
}

/// Walks root, timestamp, snapshot, targets and delegations of one image and
/// resolves the digest they sign.
pub struct TrustChainValidator<'a> {
    fetcher: &'a dyn TrustDataFetcher,
}

impl<'a> TrustChainValidator<'a> {
    pub fn new(fetcher: &'a dyn TrustDataFetcher) -> Self {
        Self { fetcher }
    }

    /// Return the hex sha256 digest `image` is signed for.
    ///
    /// With `required` delegations every one of them has to sign the image,
    /// and all of them have to agree on the digest.
    pub async fn validate(
        &self,
        image: &ImageReference,
        root_key: TrustRoot,
        required: &[TufRole],
    ) -> Result<String> {
        let mut trust_data = self.process_chain_of_trust(image, root_key, required).await?;
        let image_targets = select_image_targets(&mut trust_data, required, image)?;

        let digests = image_targets
            .iter()
            .map(|targets| search_image_targets(targets, image))
            .collect::<Result<Vec<_>>>()?;

        if !required.is_empty() && digests.iter().any(Option::is_none) {
            return Err(Error::InsufficientTrustData(image.to_string()));
        }

        let digests: BTreeSet<String> = digests.into_iter().flatten().collect();
        let mut digests = digests.into_iter();
        match (digests.next(), digests.next()) {
            (None, _) => Err(Error::NotFound(format!(
                "unable to find signed digest for image {image}"
            ))),
            (Some(digest), None) => Ok(digest),
            (Some(_), Some(_)) => Err(Error::AmbiguousDigest(image.to_string())),
        }
    }

    async fn process_chain_of_trust(
        &self,
        image: &ImageReference,
        root_key: TrustRoot,
        required: &[TufRole],
    ) -> Result<ChainData> {
        let mut key_store = KeyStore::new(root_key);

        let start = Instant::now();
        let (root, snapshot, timestamp, targets) = futures::try_join!(
            self.fetcher.get_trust_data(image, &TufRole::Root),
            self.fetcher.get_trust_data(image, &TufRole::Snapshot),
            self.fetcher.get_trust_data(image, &TufRole::Timestamp),
            self.fetcher.get_trust_data(image, &TufRole::Targets),
        )?;
        debug!(
            "pulled trust data for image {image} in {:?}",
            start.elapsed()
        );

        // signature and expiry only; the hash of root is checked once
        // snapshot is trusted
        root.validate_signature(&key_store)?;
        root.validate_expiry()?;
        key_store.update(&root)?;

        timestamp.validate(&key_store)?;

        snapshot.validate_signature(&key_store)?;
        let mut timestamp_key_store = KeyStore::empty();
        timestamp_key_store.update(&timestamp)?;
        snapshot.validate_hash(&timestamp_key_store)?;
        snapshot.validate_expiry()?;

        let mut snapshot_key_store = KeyStore::empty();
        snapshot_key_store.update(&snapshot)?;
        root.validate_hash(&snapshot_key_store)?;

        key_store.update(&snapshot)?;
        targets.validate(&key_store)?;
        key_store.update(&targets)?;

        let mut delegations = HashMap::new();
        let mut uses_delegations = false;
        if targets.has_delegations() || !required.is_empty() {
            uses_delegations = true;
            let required = default_delegations(required);
            validate_all_required_delegations_present(&required, &targets.get_delegations())?;

            let fetched = join_all(
                required
                    .iter()
                    .map(|role| self.fetcher.get_delegation_trust_data(image, role)),
            )
            .await;
            for (role, delegation) in required.iter().zip(fetched) {
                if let Some(delegation) = delegation? {
                    delegation.validate(&key_store)?;
                    delegations.insert(role.clone(), delegation);
                }
            }
        }

        Ok(ChainData {
            targets,
            delegations,
            uses_delegations,
        })
    }
}

/// Validated targets documents of one chain.
struct ChainData {
    targets: TrustData,
    delegations: HashMap<TufRole, TrustData>,
    uses_delegations: bool,
}

fn releases() -> TufRole {
    TufRole::Delegation("targets/releases".to_string())
}

fn default_delegations(required: &[TufRole]) -> Vec<TufRole> {
    match required.is_empty() {
        true => vec![releases()],
        false => required.to_vec(),
    }
}

fn validate_all_required_delegations_present(
    required: &[TufRole],
    present: &[&str],
) -> Result<()> {
    if present.is_empty() {
        return Err(Error::NotFound(
            "unable to find any delegations in trust data".into(),
        ));
    }

    let missing: Vec<&str> = required
        .iter()
        .map(TufRole::as_str)
        .filter(|role| !present.contains(role))
        .collect();
    if !missing.is_empty() {
        return Err(Error::NotFound(format!(
            "unable to find delegation roles {missing:?} in trust data"
        )));
    }
    Ok(())
}

/// Pick the target maps to search. Delegations that were declared but never
/// signed with leave no document behind; for the default `targets/releases`
/// the targets document itself is used instead.
fn select_image_targets<'c>(
    chain: &'c mut ChainData,
    required: &[TufRole],
    image: &ImageReference,
) -> Result<Vec<&'c BTreeMap<String, Target>>> {
    let image_targets = if chain.uses_delegations {
        let mut roles = default_delegations(required);
        if roles == [releases()] && !chain.delegations.contains_key(&releases()) {
            roles = vec![TufRole::Targets];
        } else {
            let missing: Vec<&str> = roles
                .iter()
                .filter(|role| !chain.delegations.contains_key(role))
                .map(TufRole::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(Error::NotFound(format!(
                    "unable to find trust data for delegation roles {missing:?} and image {image}"
                )));
            }
        }

        roles
            .iter()
            .map(|role| match chain.delegations.get(role) {
                Some(delegation) => delegation.targets(),
                None => chain.targets.targets(),
            })
            .collect()
    } else {
        vec![chain.targets.targets()]
    };

    if image_targets.iter().all(|targets| targets.is_empty()) {
        return Err(Error::NotFound(
            "unable to find any image digests in trust data".into(),
        ));
    }
    Ok(image_targets)
}

/// Look the image up in one target map, by tag if it has one, by digest
/// otherwise.
fn search_image_targets(
    targets: &BTreeMap<String, Target>,
    image: &ImageReference,
) -> Result<Option<String>> {
    if let Some(tag) = image.tag() {
        let Some(signed) = targets.get(tag).and_then(Target::sha256) else {
            return Ok(None);
        };
        let digest = STANDARD
            .decode(signed)
            .map(hex::encode)
            .map_err(|e| Error::InvalidFormat(format!("digest of tag {tag}: {e}")))?;

        return match image.digest() {
            Some(requested) if requested != digest => Err(Error::ValidationFailed(format!(
                "image tag and digest do not match: tag {tag} is signed for {digest}, {requested} was requested"
            ))),
            _ => Ok(Some(digest)),
        };
    }

    if let Some(requested) = image.digest() {
        let raw = hex::decode(requested)
            .map_err(|e| Error::InvalidFormat(format!("digest {requested}: {e}")))?;
        let encoded = STANDARD.encode(raw);
        if targets.values().any(|t| t.sha256() == Some(encoded.as_str())) {
            return Ok(Some(requested.to_string()));
        }
    }
    Ok(None)
}

/// Validator backend of type `notaryv1`.
#[derive(Debug)]
pub struct NotaryV1Validator {
    notary: Notary,
}

impl NotaryV1Validator {
    pub fn new(name: &str, config: NotaryConfig) -> Result<Self> {
        Ok(Self {
            notary: Notary::new(name, config)?,
        })
    }
}

#[async_trait]
impl Validator for NotaryV1Validator {
    fn name(&self) -> &str {
        self.notary.name()
    }

    async fn validate(
        &self,
        image: &ImageReference,
        args: &Map<String, Value>,
    ) -> Result<Option<String>> {
        let args: NotaryArgs = serde_json::from_value(Value::Object(args.clone()))
            .map_err(|e| Error::InvalidFormat(format!("notary rule arguments: {e}")))?;

        let root_key = TrustRoot::parse(self.notary.get_key(args.trust_root.as_deref())?)?;
        if !root_key.is_key() {
            return Err(Error::WrongKey(root_key.kind().to_string()));
        }

        let required = args
            .delegations
            .iter()
            .map(|delegation| TufRole::delegation(delegation))
            .collect::<Result<Vec<_>>>()?;

        let digest = TrustChainValidator::new(&self.notary)
            .validate(image, root_key, &required)
            .await?;
        info!(
            "notary {} resolved {image} to sha256:{digest}",
            self.notary.host()
        );
        Ok(Some(digest))
    }

    async fn healthy(&self) -> bool {
        self.notary.healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notary::fixtures::{expired, Chain};
    use rstest::rstest;
    use serde_json::json;

    const D1: &str = "1388abc7a12532836c3a81bdb0087409b15208f5aeba7a87aedcfd56d637c145";
    const D2: &str = "859b5aada817b3eb53410222e8fc232cf126c9e598390ae61895eb96f52ae46d";

    struct MockFetcher {
        documents: HashMap<String, Value>,
    }

    #[async_trait]
    impl TrustDataFetcher for MockFetcher {
        async fn get_trust_data(
            &self,
            _image: &ImageReference,
            role: &TufRole,
        ) -> Result<TrustData> {
            let document = self
                .documents
                .get(role.as_str())
                .ok_or_else(|| Error::NotFound(format!("unable to get {role} trust data")))?;
            TrustData::new(document.clone(), role.clone())
        }
    }

    async fn validate(
        chain: &Chain,
        documents: HashMap<String, Value>,
        image: &str,
        delegations: &[&str],
    ) -> Result<String> {
        let fetcher = MockFetcher { documents };
        let image = ImageReference::parse(image).expect("valid image");
        let required = delegations
            .iter()
            .map(|d| TufRole::delegation(d))
            .collect::<Result<Vec<_>>>()
            .expect("valid delegations");
        TrustChainValidator::new(&fetcher)
            .validate(&image, chain.root.trust_root(), &required)
            .await
    }

    #[tokio::test]
    async fn tag_from_targets() {
        let chain = Chain::new().target("v1", D1).target("v2", D2);
        let digest = validate(&chain, chain.build(), "docker.io/library/image:v1", &[])
            .await
            .expect("signed");
        assert_eq!(digest, D1);
    }

    #[tokio::test]
    async fn digest_from_targets() {
        let chain = Chain::new().target("v1", D1);
        let image = format!("image@sha256:{D1}");
        let digest = validate(&chain, chain.build(), &image, &[]).await.expect("signed");
        assert_eq!(digest, D1);

        let image = format!("image@sha256:{D2}");
        let err = validate(&chain, chain.build(), &image, &[]).await.expect_err("unsigned");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn tag_and_digest_must_agree() {
        let chain = Chain::new().target("v1", D1);
        let image = format!("image:v1@sha256:{D1}");
        assert_eq!(
            validate(&chain, chain.build(), &image, &[]).await.expect("signed"),
            D1
        );

        let image = format!("image:v1@sha256:{D2}");
        assert!(matches!(
            validate(&chain, chain.build(), &image, &[]).await,
            Err(Error::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn unsigned_tag() {
        let chain = Chain::new().target("v1", D1);
        let err = validate(&chain, chain.build(), "image:v3", &[])
            .await
            .expect_err("unsigned");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn releases_delegation_by_default() {
        let chain = Chain::new()
            .target("v1", D2)
            .delegation("releases", 5, &[("v1", D1)]);
        let digest = validate(&chain, chain.build(), "image:v1", &[])
            .await
            .expect("signed");
        assert_eq!(digest, D1);
    }

    #[tokio::test]
    async fn unused_releases_delegation_falls_back_to_targets() {
        let chain = Chain::new()
            .target("v1", D1)
            .unpublished_delegation("releases", 5);
        let digest = validate(&chain, chain.build(), "image:v1", &[])
            .await
            .expect("signed");
        assert_eq!(digest, D1);
    }

    #[tokio::test]
    async fn required_delegations_agree() {
        let chain = Chain::new()
            .delegation("phbelitz", 5, &[("v1", D1)])
            .delegation("chamsen", 6, &[("v1", D1), ("v2", D2)]);
        let digest = validate(&chain, chain.build(), "image:v1", &["phbelitz", "targets/chamsen"])
            .await
            .expect("signed by both");
        assert_eq!(digest, D1);
    }

    #[tokio::test]
    async fn conflicting_delegations_are_ambiguous() {
        let chain = Chain::new()
            .delegation("phbelitz", 5, &[("v1", D1)])
            .delegation("chamsen", 6, &[("v1", D2)]);
        assert!(matches!(
            validate(&chain, chain.build(), "image:v1", &["phbelitz", "chamsen"]).await,
            Err(Error::AmbiguousDigest(_))
        ));
    }

    #[tokio::test]
    async fn every_required_delegation_must_sign() {
        let chain = Chain::new()
            .delegation("phbelitz", 5, &[("v1", D1)])
            .delegation("chamsen", 6, &[("v2", D2)]);
        assert!(matches!(
            validate(&chain, chain.build(), "image:v1", &["phbelitz", "chamsen"]).await,
            Err(Error::InsufficientTrustData(_))
        ));
    }

    #[tokio::test]
    async fn missing_required_delegation_is_named() {
        let chain = Chain::new().delegation("phbelitz", 5, &[("v1", D1)]);
        let err = validate(&chain, chain.build(), "image:v1", &["daugustin"])
            .await
            .expect_err("not delegated");
        assert!(err.is_not_found());
        let message = err.to_string();
        assert!(message.contains("targets/daugustin"), "{message}");
        assert!(!message.contains("targets/phbelitz"), "{message}");
    }

    #[tokio::test]
    async fn required_delegation_without_any_delegations() {
        let chain = Chain::new().target("v1", D1);
        let err = validate(&chain, chain.build(), "image:v1", &["phbelitz"])
            .await
            .expect_err("nothing delegated");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn required_delegation_never_published() {
        let chain = Chain::new()
            .delegation("phbelitz", 5, &[("v1", D1)])
            .unpublished_delegation("chamsen", 6);
        let err = validate(&chain, chain.build(), "image:v1", &["phbelitz", "chamsen"])
            .await
            .expect_err("chamsen has no trust data");
        assert!(err.to_string().contains("targets/chamsen"));
    }

    #[rstest]
    #[case("root")]
    #[case("snapshot")]
    #[case("timestamp")]
    #[case("targets")]
    #[case("targets/releases")]
    #[tokio::test]
    async fn mutated_payload_fails_signature(#[case] role: &str) {
        let chain = Chain::new().delegation("releases", 5, &[("v1", D1)]);
        let mut documents = chain.build();
        documents
            .get_mut(role)
            .expect("role is published")["signed"]["version"] = json!(99);
        assert!(matches!(
            validate(&chain, documents, "image:v1", &[]).await,
            Err(Error::ValidationFailed(_))
        ));
    }

    #[rstest]
    #[case("root")]
    #[case("snapshot")]
    #[case("timestamp")]
    #[case("targets")]
    #[case("targets/releases")]
    #[tokio::test]
    async fn expired_role_fails(#[case] role: &str) {
        let chain = Chain::new().delegation("releases", 5, &[("v1", D1)]);
        let documents = chain.build_with(|name, signed| {
            if name == role {
                signed["expires"] = json!(expired());
            }
        });
        let err = validate(&chain, documents, "image:v1", &[])
            .await
            .expect_err("expired");
        assert!(err.to_string().contains("expired"), "{err}");
    }

    #[tokio::test]
    async fn rolled_back_root_fails_hash_check() {
        let chain = Chain::new().target("v1", D1);
        let mut documents = chain.build();
        let stale = chain.build_with(|name, signed| {
            if name == "root" {
                signed["version"] = json!(0);
            }
        });
        documents.insert("root".into(), stale["root"].clone());

        let err = validate(&chain, documents, "image:v1", &[])
            .await
            .expect_err("root does not match snapshot");
        assert!(err.to_string().contains("hash of trust data root"), "{err}");
    }

    #[tokio::test]
    async fn rolled_back_snapshot_fails_hash_check() {
        let chain = Chain::new().target("v1", D1);
        let mut documents = chain.build();
        let stale = chain.build_with(|name, signed| {
            if name == "snapshot" {
                signed["version"] = json!(1);
            }
        });
        documents.insert("snapshot".into(), stale["snapshot"].clone());

        let err = validate(&chain, documents, "image:v1", &[])
            .await
            .expect_err("snapshot does not match timestamp");
        assert!(err.to_string().contains("hash of trust data snapshot"), "{err}");
    }

    #[tokio::test]
    async fn foreign_root_key() {
        let chain = Chain::new().target("v1", D1);
        let fetcher = MockFetcher {
            documents: chain.build(),
        };
        let image = ImageReference::parse("image:v1").expect("valid image");
        let foreign = crate::notary::fixtures::Signer::new(42).trust_root();
        assert!(matches!(
            TrustChainValidator::new(&fetcher)
                .validate(&image, foreign, &[])
                .await,
            Err(Error::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn missing_role_is_not_found() {
        let chain = Chain::new().target("v1", D1);
        let mut documents = chain.build();
        documents.remove("timestamp");
        let err = validate(&chain, documents, "image:v1", &[])
            .await
            .expect_err("timestamp missing");
        assert!(err.is_not_found());
    }

    fn notary_validator(key: &str) -> NotaryV1Validator {
        let config = NotaryConfig {
            host: "notary.example.com".into(),
            trust_roots: vec![crate::notary::client::NamedTrustRoot {
                name: "default".into(),
                key: key.into(),
            }],
            auth: None,
            cert: None,
            is_acr: false,
        };
        NotaryV1Validator::new("example", config).expect("valid validator")
    }

    #[tokio::test]
    async fn non_key_trust_root_is_wrong_key() {
        let validator = notary_validator("awskms:///1234abcd-12ab-34cd-56ef-1234567890ab");
        let image = ImageReference::parse("image:v1").expect("valid image");
        assert!(matches!(
            validator.validate(&image, &Map::new()).await,
            Err(Error::WrongKey(kind)) if kind == "kms"
        ));
    }

    #[tokio::test]
    async fn unknown_trust_root_is_not_found() {
        let validator = notary_validator("mail@example.com");
        let image = ImageReference::parse("image:v1").expect("valid image");
        let args = json!({"trustRoot": "missing"});
        let err = validator
            .validate(&image, args.as_object().expect("object"))
            .await
            .expect_err("no such trust root");
        assert!(err.is_not_found());
        assert_eq!(validator.name(), "example");
    }
}
