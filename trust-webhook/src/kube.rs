// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use log::debug;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;

use crate::{Error, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const KUBE_REQ_TIMEOUT_SEC: u64 = 10;

/// Read access to objects of the cluster the webhook serves.
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// GET `path` relative to the API server root, e.g.
    /// `apis/apps/v1/namespaces/default/deployments/web`.
    async fn get(&self, path: &str) -> Result<Value>;
}

/// Client authenticating with the pod's service account.
#[derive(Debug)]
pub struct InClusterKubeApi {
    base_url: String,
    token_path: PathBuf,
    client: reqwest::Client,
}

impl InClusterKubeApi {
    /// `base_url` defaults to the service address injected into every pod.
    pub fn new(base_url: Option<&str>) -> anyhow::Result<Self> {
        let base_url = match base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = env::var("KUBERNETES_SERVICE_HOST")
                    .context("KUBERNETES_SERVICE_HOST is not set")?;
                let port = env::var("KUBERNETES_SERVICE_PORT")
                    .context("KUBERNETES_SERVICE_PORT is not set")?;
                format!("https://{host}:{port}")
            }
        };

        let account = Path::new(SERVICE_ACCOUNT_DIR);
        let mut builder = reqwest::Client::builder()
            .user_agent(format!("trust-webhook/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(KUBE_REQ_TIMEOUT_SEC));

        let ca_path = account.join("ca.crt");
        if ca_path.exists() {
            let pem = std::fs::read(&ca_path)
                .with_context(|| format!("read {}", ca_path.display()))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem).context("parse cluster CA")?,
            );
        }

        Ok(Self {
            base_url,
            token_path: account.join("token"),
            client: builder.build().context("build kubernetes API client")?,
        })
    }

    async fn request(&self, path: &str) -> anyhow::Result<Value> {
        // tokens are rotated by the kubelet, read it for every request
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .with_context(|| format!("read {}", self.token_path.display()))?;

        let url = format!("{}/{path}", self.base_url);
        debug!("kubernetes API request to {url}");
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token.trim()))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("kubernetes API responded with {status}"));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl KubeApi for InClusterKubeApi {
    async fn get(&self, path: &str) -> Result<Value> {
        self.request(path).await.map_err(|source| Error::KubeApi {
            path: path.to_string(),
            source,
        })
    }
}
