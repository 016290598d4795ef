// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! HTTP access to a notary server.

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use reqwest::{header::WWW_AUTHENTICATE, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::trust_data::TrustData;
use super::tuf_role::TufRole;
use crate::{Error, ImageReference, Result};

/// Stay below the 30 seconds the API server grants an admission webhook.
pub const NOTARY_REQ_TIMEOUT_SEC: u64 = 29;

/// Trust root selected when a rule names none.
pub const DEFAULT_TRUST_ROOT: &str = "default";

lazy_static! {
    static ref AUTH_TYPE_REGEX: Regex = Regex::new(
        r"(Basic|Bearer|Digest|HOBA|Mutual|Negotiate|OAuth|SCRAM-SHA-1|SCRAM-SHA-256|vapid) realm"
    )
    .expect("auth type regex is valid");
    static ref AUTH_PARAMS_REGEX: Regex =
        Regex::new(r#"(\w+)="?([\w./:\-_]+)"?"#).expect("auth params regex is valid");
    static ref TOKEN_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9_=\-]+\.[A-Za-z0-9_=\-]+\.?[A-Za-z0-9_.+/=\-]*$")
            .expect("token regex is valid");
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NamedTrustRoot {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Backend settings of a `notaryv1` validator.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotaryConfig {
    pub host: String,

    #[serde(default, alias = "trust_roots")]
    pub trust_roots: Vec<NamedTrustRoot>,

    #[serde(default)]
    pub auth: Option<BasicAuth>,

    /// PEM CA certificate for the notary and its token realm.
    #[serde(default)]
    pub cert: Option<String>,

    /// Azure container registry: tokens come as `access_token` and there is
    /// no health endpoint.
    #[serde(default, alias = "is_acr")]
    pub is_acr: bool,
}

/// Source of TUF documents for an image.
#[async_trait]
pub trait TrustDataFetcher: Send + Sync {
    async fn get_trust_data(&self, image: &ImageReference, role: &TufRole) -> Result<TrustData>;

    /// Fetch a delegation role. A delegation that was declared but never used
    /// for signing has no document yet, so failures read as absent unless
    /// debug logging is enabled.
    async fn get_delegation_trust_data(
        &self,
        image: &ImageReference,
        role: &TufRole,
    ) -> Result<Option<TrustData>> {
        let fetched = self.get_trust_data(image, role).await;
        delegation_or_absent(fetched, image, role, log::log_enabled!(log::Level::Debug))
    }
}

/// Read a failed delegation fetch as an absent document, unless `strict`.
fn delegation_or_absent(
    fetched: Result<TrustData>,
    image: &ImageReference,
    role: &TufRole,
    strict: bool,
) -> Result<Option<TrustData>> {
    match fetched {
        Ok(trust_data) => Ok(Some(trust_data)),
        Err(e) if strict => Err(e),
        Err(e) => {
            warn!("no trust data for delegation {role} of {image}: {e}");
            Ok(None)
        }
    }
}

#[derive(Debug)]
pub struct Notary {
    name: String,
    host: String,
    trust_roots: Vec<NamedTrustRoot>,
    auth: Option<BasicAuth>,
    is_acr: bool,
    scheme: &'static str,
    client: reqwest::Client,
}

impl Notary {
    pub fn new(name: &str, config: NotaryConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(format!("image-trust/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(NOTARY_REQ_TIMEOUT_SEC));

        if let Some(cert) = &config.cert {
            let cert = reqwest::Certificate::from_pem(cert.as_bytes()).map_err(|e| {
                Error::InvalidFormat(format!("certificate of notary {name}: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| Error::InvalidFormat(format!("http client of notary {name}: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            host: config.host,
            trust_roots: config.trust_roots,
            auth: config.auth,
            is_acr: config.is_acr,
            scheme: "https",
            client,
        })
    }

    /// Talk plain HTTP to a local test server.
    #[cfg(test)]
    fn plain_http(mut self) -> Self {
        self.scheme = "http";
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Key material of the named trust root, `default` if unnamed.
    pub fn get_key(&self, name: Option<&str>) -> Result<&str> {
        let name = name.unwrap_or(DEFAULT_TRUST_ROOT);
        self.trust_roots
            .iter()
            .find(|root| root.name == name)
            .map(|root| root.key.as_str())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "trust root \"{name}\" not configured for validator \"{}\"",
                    self.name
                ))
            })
    }

    pub async fn healthy(&self) -> bool {
        if self.is_acr {
            return true;
        }

        let url = format!("{}://{}/_notary_server/health", self.scheme, self.host);
        match self.client.get(&url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("health check of notary {} failed: {e}", self.name);
                false
            }
        }
    }

    fn trust_data_url(&self, image: &ImageReference, role: &TufRole) -> String {
        let repository = match image.repository() {
            "" => String::new(),
            repository => format!("{repository}/"),
        };
        format!(
            "{}://{}/v2/{}/{}{}/_trust/tuf/{}.json",
            self.scheme,
            self.host,
            image.registry(),
            repository,
            image.name(),
            role
        )
    }

    async fn send(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })
    }

    /// Turn a `WWW-Authenticate` challenge into the URL a token is requested
    /// from.
    pub fn parse_auth(&self, header: &str) -> Result<String> {
        let auth_type = AUTH_TYPE_REGEX
            .captures(header)
            .map(|captures| captures[1].to_string());
        if auth_type.as_deref() != Some("Bearer") {
            return Err(Error::UnknownType(
                auth_type.unwrap_or_else(|| header.to_string()),
            ));
        }

        let mut params: Vec<(&str, &str)> = Vec::new();
        for captures in AUTH_PARAMS_REGEX.captures_iter(header) {
            let (Some(key), Some(value)) = (captures.get(1), captures.get(2)) else {
                continue;
            };
            match params.iter_mut().find(|(k, _)| *k == key.as_str()) {
                Some(param) => param.1 = value.as_str(),
                None => params.push((key.as_str(), value.as_str())),
            }
        }

        let realm_index = params
            .iter()
            .position(|(k, _)| *k == "realm")
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "unable to find authentication realm in auth header for notary {}",
                    self.name
                ))
            })?;
        let (_, realm) = params.remove(realm_index);

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{realm}?{query}");

        if !url.starts_with(self.scheme) {
            return Err(Error::InvalidFormat(format!(
                "authentication through insecure channel for notary {} is prohibited",
                self.name
            )));
        }
        if url.contains("..") || url.matches("//").count() > 1 {
            return Err(Error::PathTraversal(url));
        }
        Ok(url)
    }

    async fn get_auth_token(&self, url: &str) -> Result<String> {
        let mut request = self.client.get(url);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let response = request.send().await.map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::NotFound(format!(
                "unable to get authentication token from {url}"
            )));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized(format!(
                "notary {} was refused a token by {url}",
                self.name
            )));
        }
        let response = response.error_for_status().map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })?;
        let body = response.bytes().await.map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })?;

        extract_token(&body, self.is_acr, url)
    }
}

/// Read and sanity check the token of a token endpoint response.
fn extract_token(body: &[u8], is_acr: bool, url: &str) -> Result<String> {
    let missing = || {
        Error::NotFound(format!(
            "unable to retrieve authentication token from {url} response"
        ))
    };

    let field = if is_acr { "access_token" } else { "token" };
    let response: Value = serde_json::from_slice(body).map_err(|_| missing())?;
    let token = response
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(missing)?;

    if !TOKEN_REGEX.is_match(token) {
        return Err(Error::InvalidFormat(
            "authentication token has an invalid format".into(),
        ));
    }
    Ok(token.to_string())
}

#[async_trait]
impl TrustDataFetcher for Notary {
    async fn get_trust_data(&self, image: &ImageReference, role: &TufRole) -> Result<TrustData> {
        let url = self.trust_data_url(image, role);
        let mut response = self.send(&url, None).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(challenge) = response.headers().get(WWW_AUTHENTICATE) {
                let challenge = challenge.to_str().map_err(|_| {
                    Error::InvalidFormat("auth header is not valid ASCII".into())
                })?;
                let auth_url = self.parse_auth(challenge)?;
                let token = self.get_auth_token(&auth_url).await?;
                response = self.send(&url, Some(&token)).await?;
            }
        }

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!(
                "unable to get {role} trust data from {}",
                self.name
            )));
        }

        let response = response.error_for_status().map_err(|source| Error::Http {
            url: url.clone(),
            source,
        })?;
        let body = response.bytes().await.map_err(|source| Error::Http {
            url: url.clone(),
            source,
        })?;
        TrustData::from_slice(&body, role.clone())
    }
}
