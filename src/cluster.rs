use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::{
    admissionregistration::v1::MutatingWebhookConfiguration, core::v1::Secret,
};
use std::path::Path;

use kube::{
    api::PostParams,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{watcher, WatchStreamExt},
    Api, Client,
};
use log::info;

use crate::{config::Config, Error};

async fn kubeconfig_from(path: &Path) -> Result<kube::Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::UserInputError(format!("failed to read kubeconfig {}: {e}", path.display()))
    })?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::UserInputError(format!("failed to load kubeconfig {}: {e}", path.display()))
        })
}

/// Builds the cluster client from the configured kubeconfig, or the in-cluster/default
/// configuration when none is set.
pub async fn connect(config: &Config) -> Result<Client, Error> {
    match &config.kubeconfig {
        Some(path) => {
            info!("using kubeconfig {}", path.display());
            Ok(Client::try_from(kubeconfig_from(path).await?)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// The cluster objects the reconciler reads and writes: one Secret and one webhook registration.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_secret(&self) -> Result<Option<Secret>, Error>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Fails with a conflict if `secret` carries a stale resourceVersion.
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    async fn get_webhook(&self) -> Result<MutatingWebhookConfiguration, Error>;

    /// Fails with a conflict if `webhook` carries a stale resourceVersion.
    async fn replace_webhook(
        &self,
        webhook: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, Error>;
}

pub struct KubeCluster {
    secrets: Api<Secret>,
    webhooks: Api<MutatingWebhookConfiguration>,
    secret_name: String,
    webhook_name: String,
}

impl KubeCluster {
    pub fn new(client: Client, config: &Config) -> Self {
        KubeCluster {
            secrets: Api::namespaced(client.clone(), &config.namespace),
            webhooks: Api::all(client),
            secret_name: config.secret_name.clone(),
            webhook_name: config.webhook_name.clone(),
        }
    }

    pub fn watch_secret(
        &self,
    ) -> impl Stream<Item = Result<watcher::Event<Secret>, watcher::Error>> + Send {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.secret_name));
        watcher(self.secrets.clone(), config).default_backoff()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_secret(&self) -> Result<Option<Secret>, Error> {
        Ok(self.secrets.get_opt(&self.secret_name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        Ok(self.secrets.create(&PostParams::default(), secret).await?)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        Ok(self
            .secrets
            .replace(&self.secret_name, &PostParams::default(), secret)
            .await?)
    }

    async fn get_webhook(&self) -> Result<MutatingWebhookConfiguration, Error> {
        Ok(self.webhooks.get(&self.webhook_name).await?)
    }

    async fn replace_webhook(
        &self,
        webhook: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, Error> {
        Ok(self
            .webhooks
            .replace(&self.webhook_name, &PostParams::default(), webhook)
            .await?)
    }
}
