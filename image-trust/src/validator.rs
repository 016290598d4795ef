// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::notary::{NotaryConfig, NotaryV1Validator};
use crate::policy::DEFAULT_VALIDATOR;
use crate::{Error, ImageReference, Result};

/// Verifies that an image is trusted and resolves the digest it is signed
/// for.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(Some(digest))` pins the image to the hex sha256 digest,
    /// `Ok(None)` admits it unchanged.
    async fn validate(
        &self,
        image: &ImageReference,
        args: &Map<String, Value>,
    ) -> Result<Option<String>>;

    async fn healthy(&self) -> bool;
}

/// Backend types a validator entry may name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display)]
pub enum ValidatorType {
    #[strum(serialize = "notaryv1")]
    NotaryV1,

    #[strum(serialize = "static")]
    Static,
}

/// One entry of the `validators` list.
///
/// Everything besides `name` and `type` configures the backend.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ValidatorConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub validator_type: String,

    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ValidatorConfig {
    pub fn build(&self) -> Result<Arc<dyn Validator>> {
        let validator_type = ValidatorType::from_str(&self.validator_type)
            .map_err(|_| Error::UnsupportedValidator(self.validator_type.clone()))?;
        debug!("building {validator_type} validator {}", self.name);

        let settings = Value::Object(self.settings.clone());
        let invalid = |e: serde_json::Error| {
            Error::InvalidFormat(format!("configuration of validator {}: {e}", self.name))
        };
        let validator: Arc<dyn Validator> = match validator_type {
            ValidatorType::NotaryV1 => {
                let config: NotaryConfig = serde_json::from_value(settings).map_err(invalid)?;
                Arc::new(NotaryV1Validator::new(&self.name, config)?)
            }
            ValidatorType::Static => {
                let config: StaticConfig = serde_json::from_value(settings).map_err(invalid)?;
                Arc::new(StaticValidator::new(&self.name, config.approve))
            }
        };
        Ok(validator)
    }
}

#[derive(Debug, Deserialize)]
struct StaticConfig {
    approve: bool,
}

/// Admits or denies every image without looking at it.
#[derive(Debug)]
pub struct StaticValidator {
    name: String,
    approve: bool,
}

impl StaticValidator {
    pub fn new(name: &str, approve: bool) -> Self {
        Self {
            name: name.to_string(),
            approve,
        }
    }
}

#[async_trait]
impl Validator for StaticValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(
        &self,
        _image: &ImageReference,
        _args: &Map<String, Value>,
    ) -> Result<Option<String>> {
        match self.approve {
            true => Ok(None),
            false => Err(Error::ValidationFailed("static deny".into())),
        }
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// The configured validators, by name.
#[derive(Clone, Default)]
pub struct Validators {
    validators: BTreeMap<String, Arc<dyn Validator>>,
}

impl Validators {
    pub fn new(configs: &[ValidatorConfig]) -> Result<Self> {
        let validators = configs
            .iter()
            .map(ValidatorConfig::build)
            .collect::<Result<Vec<_>>>()?;
        Self::from_validators(validators)
    }

    /// Names must be unique, which also allows a single `default`.
    pub fn from_validators(validators: Vec<Arc<dyn Validator>>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for validator in validators {
            let name = validator.name().to_string();
            if by_name.insert(name.clone(), validator).is_some() {
                return Err(Error::InvalidFormat(format!(
                    "validator name {name} is used more than once"
                )));
            }
        }
        Ok(Self {
            validators: by_name,
        })
    }

    /// Look a validator up by the name a policy rule gives, `default` when
    /// the rule gives none.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn Validator>> {
        let name = name.unwrap_or(DEFAULT_VALIDATOR);
        self.validators
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unable to find validator {name}")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.validators.keys().map(String::as_str)
    }

    /// `true` when every validator reports healthy.
    pub async fn healthy(&self) -> bool {
        let checks = join_all(self.validators.values().map(|v| v.healthy())).await;
        let mut healthy = true;
        for (name, ok) in self.validators.keys().zip(checks) {
            if !ok {
                warn!("validator {name} is not healthy");
                healthy = false;
            }
        }
        healthy
    }
}
