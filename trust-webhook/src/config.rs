// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use config::{Config, Environment, File};
use image_trust::notary::client::NOTARY_REQ_TIMEOUT_SEC;
use image_trust::policy::DEFAULT_VALIDATOR;
use image_trust::validator::ValidatorType;
use image_trust::{PolicyMatcher, PolicyRule, ValidatorConfig, Validators};
use log::info;
use serde::Deserialize;

use crate::pipeline::PipelineSettings;
use crate::{Error, Result};

pub const DEFAULT_BIND: &str = "0.0.0.0:5000";
pub const DEFAULT_VALIDATION_CONFIG: &str = "/etc/trust-webhook/validation.yaml";

/// Environment variables overriding settings start with this prefix, e.g.
/// `TRUST_WEBHOOK_DETECTION_MODE=true`.
pub const ENV_PREFIX: &str = "TRUST_WEBHOOK";

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address (IP:port) to listen on.
    pub bind: String,

    /// Path of the YAML file listing validators and policy rules.
    pub validation_config: String,

    /// Admit denied workloads with a warning instead.
    pub detection_mode: bool,

    /// Admit images that the owner of a workload already runs.
    pub automatic_child_approval: bool,

    /// Admit images an UPDATE leaves unchanged.
    pub automatic_unchanged_approval: bool,

    pub request_timeout_seconds: u64,

    /// Kubernetes API server, the in-cluster service address when unset.
    #[serde(default)]
    pub kube_api_url: Option<String>,
}

impl ServerConfig {
    /// Load defaults, then `config_path` if given, then the environment.
    /// Supported file formats are all formats supported by the `config`
    /// crate.
    pub fn new(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .set_default("bind", DEFAULT_BIND)?
            .set_default("validation_config", DEFAULT_VALIDATION_CONFIG)?
            .set_default("detection_mode", false)?
            .set_default("automatic_child_approval", true)?
            .set_default("automatic_unchanged_approval", false)?
            .set_default("request_timeout_seconds", NOTARY_REQ_TIMEOUT_SEC)?;

        if let Some(path) = config_path {
            info!("Use configuration file {path}");
            if !Path::new(path).exists() {
                bail!("Config file {path} not found.")
            }
            builder = builder.add_source(File::with_name(path));
        }

        let c = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        c.try_deserialize().context("invalid config")
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            detection_mode: self.detection_mode,
            automatic_child_approval: self.automatic_child_approval,
            automatic_unchanged_approval: self.automatic_unchanged_approval,
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
        }
    }
}

/// Validators and the policy selecting between them.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ValidationConfig {
    pub validators: Vec<ValidatorConfig>,
    pub policy: Vec<PolicyRule>,
}

impl ValidationConfig {
    pub async fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read validation config {path}"))?;
        Ok(Self::from_yaml(&content)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        let defaults = self
            .validators
            .iter()
            .filter(|v| v.name == DEFAULT_VALIDATOR)
            .count();
        if defaults > 1 {
            return Err(Error::Config(format!(
                "only one validator may be named {DEFAULT_VALIDATOR}"
            )));
        }

        if let Some(validator) = self
            .validators
            .iter()
            .find(|v| ValidatorType::from_str(&v.validator_type).is_err())
        {
            return Err(Error::Trust(image_trust::Error::UnsupportedValidator(
                validator.validator_type.clone(),
            )));
        }

        if self.policy.iter().any(|rule| rule.pattern.is_empty()) {
            return Err(Error::Config("policy rule with an empty pattern".into()));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<(Validators, PolicyMatcher)> {
        let validators = Validators::new(&self.validators)?;
        let policy = PolicyMatcher::new(self.policy.clone())?;
        Ok((validators, policy))
    }
}
