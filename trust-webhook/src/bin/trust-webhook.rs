// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Server};
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use trust_webhook::config::{ServerConfig, ValidationConfig};
use trust_webhook::kube::InClusterKubeApi;
use trust_webhook::router::Router;
use trust_webhook::AdmissionPipeline;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the settings file. Supported formats: TOML, YAML, JSON and
    /// other formats supported by the `config` crate.
    ///
    /// `--config /etc/trust-webhook/settings.yaml`
    #[arg(short, long, env = "TRUST_WEBHOOK_CONFIG")]
    config: Option<String>,

    /// Socket address to listen on, overrides the settings file.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    let mut config = ServerConfig::new(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let validation = ValidationConfig::from_file(&config.validation_config).await?;
    let (validators, policy) = validation.build().context("load validators and policy")?;
    info!(
        "loaded validators {:?} and {} policy rules",
        validators.names().collect::<Vec<_>>(),
        policy.rules().count()
    );

    let kube = InClusterKubeApi::new(config.kube_api_url.as_deref())?;
    let pipeline = AdmissionPipeline::new(
        policy,
        validators,
        Arc::new(kube),
        config.pipeline_settings(),
    );
    let router = Arc::new(Router::new(Arc::new(pipeline)));

    let address: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;

    let service = make_service_fn(move |_conn: &AddrStream| {
        let router = router.clone();
        async move {
            Ok::<_, anyhow::Error>(service_fn(move |req: Request<Body>| {
                let router = router.clone();
                async move { router.route(req).await }
            }))
        }
    });

    let server = Server::try_bind(&address)
        .with_context(|| format!("bind {address}"))?
        .serve(service);
    info!("trust webhook listening on http://{address}");

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => info!("SIGINT received, gracefully shutdown."),
        _ = terminate.recv() => info!("SIGTERM received, gracefully shutdown."),
        res = server => {
            if let Err(e) = res {
                error!("server error: {e}");
            }
        }
    }

    Ok(())
}
