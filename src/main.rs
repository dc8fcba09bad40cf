#![warn(clippy::dbg_macro, clippy::todo)]

mod certs;
mod cluster;
mod config;
mod reconciler;
mod secret_cache;
mod tls;
mod webhook;

use std::sync::Arc;

use cluster::KubeCluster;
use config::Config;
use kube::core::admission::SerializePatchError;
use log::{error, info, warn};
use reconciler::{Outcome, Reconciler};
use secret_cache::SecretCache;
use tls::CacheCertResolver;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },
    #[error("Invalid configuration: {0}")]
    UserInputError(String),
    #[error("Failed to generate certificate: {0}")]
    CertError(#[from] rcgen::Error),
    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] SerializePatchError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to watch certificate mirror: {0}")]
    WatchError(#[from] notify::Error),
    #[error("TLS error: {0}")]
    TlsError(#[from] tokio_rustls::rustls::Error),
    #[error("No serving certificate: {0}")]
    MissingCertificate(String),
}

impl Error {
    /// True when a write lost against a concurrent writer (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::KubeError {
                source: kube::Error::Api(e)
            } if e.code == 409
        )
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().filter_or(config::LOG_LEVEL_ENV, "info"))
        .init();

    let config = match Config::from_env() {
        Ok(x) => x,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "managing secret {}/{} for webhook {} (service {})",
        config.namespace, config.secret_name, config.webhook_name, config.service_name
    );

    let client = match cluster::connect(&config).await {
        Ok(x) => x,
        Err(e) => {
            error!("failed to create kubernetes client: {e}");
            std::process::exit(1);
        }
    };

    let cache = Arc::new(SecretCache::new());
    if let Err(e) = cache.watch(config.cert_dir.clone()).await {
        // the reconciler's pushes still reach the cache without the mirror
        warn!(
            "certificate mirror {} unavailable: {e}",
            config.cert_dir.display()
        );
    }

    let cluster = Arc::new(KubeCluster::new(client, &config));
    let (reconciler, triggers) = Reconciler::new(cluster.clone(), cache.clone(), config.clone());
    let reconciler = Arc::new(reconciler);

    match reconciler.reconcile_current().await {
        Ok(Outcome::Unchanged) => info!("webhook certificate is up to date"),
        Ok(Outcome::Issued(reason)) => info!("issued webhook certificate ({reason})"),
        Err(e) => {
            error!("failed to reconcile webhook certificate: {e}");
            std::process::exit(1);
        }
    }
    if let Some(at) = reconciler.next_wake() {
        info!("next certificate renewal at {at}");
    }

    tokio::spawn(reconciler.clone().run_worker(triggers));
    tokio::spawn(reconciler.clone().run_secret_watch(cluster.watch_secret()));
    tokio::spawn(webhook::run_health(config.health_bind));

    let listener = match tokio::net::TcpListener::bind(config.webhook_bind).await {
        Ok(x) => x,
        Err(e) => {
            error!("failed to bind {}: {e}", config.webhook_bind);
            std::process::exit(1);
        }
    };
    let resolver = Arc::new(CacheCertResolver::new(cache, &config));
    if let Err(e) = tls::serve_tls(listener, resolver, webhook::routes()).await {
        error!("webhook failed to run: {e}");
        std::process::exit(1);
    }
}
