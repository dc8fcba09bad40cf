use std::{collections::BTreeMap, fmt, net::IpAddr, sync::Arc};

use chrono::{DateTime, SubsecRound, Utc};
use futures::{Stream, StreamExt};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{core::ObjectMeta, runtime::watcher};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::{
    certs::{self, parse_leaf, secret_field, LeafError, CA_CERT, TLS_CERT, TLS_KEY},
    cluster::ClusterApi,
    config::Config,
    secret_cache::SecretCache,
    Error,
};

const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    SecretEvent,
    Timer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueReason {
    MissingField(&'static str),
    InvalidPem,
    InvalidCertificate,
    NotYetValid,
    RenewalDue,
    MissingHostname(String),
}

impl fmt::Display for IssueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueReason::MissingField(field) => write!(f, "{field} not found in secret"),
            IssueReason::InvalidPem => write!(f, "{TLS_CERT} is not valid PEM"),
            IssueReason::InvalidCertificate => write!(f, "{TLS_CERT} is not a valid certificate"),
            IssueReason::NotYetValid => write!(f, "{TLS_CERT} is not valid yet"),
            IssueReason::RenewalDue => write!(f, "{TLS_CERT} is expired or due for renewal"),
            IssueReason::MissingHostname(host) => write!(f, "{TLS_CERT} is not valid for {host}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Valid { next_wake: DateTime<Utc> },
    Issue(IssueReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Issued(IssueReason),
}

/// Decides whether the certificate held in `secret` can keep being served at `now`.
///
/// Only DNS hostnames are checked for coverage; IP literals in `hostnames` are skipped.
pub fn evaluate(
    secret: &Secret,
    hostnames: &[String],
    renew_early: chrono::Duration,
    now: DateTime<Utc>,
) -> Decision {
    for field in [TLS_CERT, TLS_KEY, CA_CERT] {
        if secret_field(secret, field).is_none() {
            return Decision::Issue(IssueReason::MissingField(field));
        }
    }
    let cert = secret_field(secret, TLS_CERT).unwrap_or_default();
    let leaf = match parse_leaf(cert) {
        Ok(leaf) => leaf,
        Err(LeafError::InvalidPem) => return Decision::Issue(IssueReason::InvalidPem),
        Err(LeafError::InvalidCertificate) => {
            return Decision::Issue(IssueReason::InvalidCertificate)
        }
    };

    if now < leaf.not_before {
        return Decision::Issue(IssueReason::NotYetValid);
    }
    // a window reaching past the earliest representable instant covers any `now`
    let Some(renew_at) = leaf.not_after.checked_sub_signed(renew_early) else {
        return Decision::Issue(IssueReason::RenewalDue);
    };
    if now > renew_at {
        return Decision::Issue(IssueReason::RenewalDue);
    }

    for host in hostnames {
        if host.parse::<IpAddr>().is_ok() {
            continue;
        }
        if !leaf.dns_names.iter().any(|name| name == host) {
            return Decision::Issue(IssueReason::MissingHostname(host.clone()));
        }
    }

    Decision::Valid { next_wake: renew_at }
}

fn to_chrono(duration: std::time::Duration) -> Result<chrono::Duration, Error> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::UserInputError(format!("duration out of range: {e}")))
}

fn out_of_range(what: &str) -> Error {
    Error::UserInputError(format!("{what} is outside the representable time range"))
}

/// Keeps the webhook Secret, the registration's trust bundle and the serving cache in step.
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<SecretCache>,
    config: Config,
    triggers: mpsc::UnboundedSender<Trigger>,
    inflight: Mutex<()>,
    next_wake: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        cache: Arc<SecretCache>,
        config: Config,
    ) -> (Reconciler, mpsc::UnboundedReceiver<Trigger>) {
        let (triggers, receiver) = mpsc::unbounded_channel();
        let reconciler = Reconciler {
            cluster,
            cache,
            config,
            triggers,
            inflight: Mutex::new(()),
            next_wake: std::sync::Mutex::new(None),
        };
        (reconciler, receiver)
    }

    pub fn trigger(&self, trigger: Trigger) {
        if self.triggers.send(trigger).is_err() {
            warn!("reconcile worker is gone, dropping {trigger:?} trigger");
        }
    }

    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        *self.next_wake.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arms the renewal timer for `at` unless it is already armed for that instant.
    fn schedule(&self, at: DateTime<Utc>) {
        {
            let mut next_wake = self.next_wake.lock().unwrap_or_else(|e| e.into_inner());
            // an instant already in the past means the timer for it has fired
            if *next_wake == Some(at) && at > Utc::now() {
                return;
            }
            *next_wake = Some(at);
        }

        info!("scheduled reconcile for {at}");
        let triggers = self.triggers.clone();
        tokio::spawn(async move {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            info!("scheduled reconcile for {at} fired");
            let _ = triggers.send(Trigger::Timer);
        });
    }

    /// Reconciles the Secret as currently stored. Write conflicts are retried from a fresh read.
    pub async fn reconcile_current(&self) -> Result<Outcome, Error> {
        let _inflight = self.inflight.lock().await;
        let mut attempt = 1;
        loop {
            let secret = self.read_secret().await?;
            match self.reconcile_locked(secret, Utc::now()).await {
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    warn!("secret changed while reconciling, retrying: {e}");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn reconcile(&self, secret: Secret) -> Result<Outcome, Error> {
        self.reconcile_at(secret, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        secret: Secret,
        now: DateTime<Utc>,
    ) -> Result<Outcome, Error> {
        let _inflight = self.inflight.lock().await;
        self.reconcile_locked(secret, now).await
    }

    async fn read_secret(&self) -> Result<Secret, Error> {
        Ok(self.cluster.get_secret().await?.unwrap_or_else(|| Secret {
            metadata: ObjectMeta {
                name: Some(self.config.secret_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    async fn reconcile_locked(
        &self,
        secret: Secret,
        now: DateTime<Utc>,
    ) -> Result<Outcome, Error> {
        let renew_early = to_chrono(self.config.renew_early)?;
        match evaluate(&secret, &self.config.hostnames(), renew_early, now) {
            Decision::Valid { next_wake } => {
                self.schedule(next_wake);
                debug!("secret {} is up to date, nothing to reconcile", self.config.secret_name);
                Ok(Outcome::Unchanged)
            }
            Decision::Issue(reason) => {
                info!("{reason}, issuing a new certificate");
                self.issue(secret, now).await?;
                Ok(Outcome::Issued(reason))
            }
        }
    }

    async fn issue(&self, mut secret: Secret, now: DateTime<Utc>) -> Result<(), Error> {
        // certificate validity has second precision
        let now = now.trunc_subsecs(0);
        let valid_for = to_chrono(self.config.valid_for)?;
        let renew_early = to_chrono(self.config.renew_early)?;
        let valid_to = now
            .checked_add_signed(valid_for)
            .ok_or_else(|| out_of_range("certificate expiry"))?;
        let renew_at = valid_to
            .checked_sub_signed(renew_early)
            .ok_or_else(|| out_of_range("certificate renewal time"))?;
        let material = certs::synthesize(&self.config.hostnames(), now, valid_to)?;

        self.update_trust_bundle(material.ca_cert.as_bytes()).await?;

        let fields: BTreeMap<String, ByteString> = material.clone().into();
        secret.data.get_or_insert_with(Default::default).extend(fields);
        if secret.metadata.resource_version.is_some() {
            self.cluster.replace_secret(&secret).await?;
        } else {
            self.cluster.create_secret(&secret).await?;
        }
        info!("secret {} updated", self.config.secret_name);

        for (name, value) in material.files() {
            self.cache.put_override(self.config.cert_path(name), value);
        }

        self.schedule(renew_at);
        Ok(())
    }

    /// Appends `ca_cert` to the registration's trust bundle, keeping the CAs already there.
    async fn update_trust_bundle(&self, ca_cert: &[u8]) -> Result<(), Error> {
        let mut attempt = 1;
        loop {
            let mut webhook = self.cluster.get_webhook().await?;
            let entry = webhook
                .webhooks
                .as_mut()
                .and_then(|x| x.first_mut())
                .ok_or_else(|| {
                    Error::UserInputError(format!(
                        "webhook configuration {} has no webhooks",
                        self.config.webhook_name
                    ))
                })?;

            let mut bundle = entry
                .client_config
                .ca_bundle
                .take()
                .map(|x| x.0)
                .unwrap_or_default();
            if !bundle.is_empty() && !bundle.ends_with(b"\n") {
                bundle.push(b'\n');
            }
            bundle.extend_from_slice(ca_cert);
            entry.client_config.ca_bundle = Some(ByteString(bundle));

            match self.cluster.replace_webhook(&webhook).await {
                Ok(_) => {
                    info!("webhook configuration {} updated", self.config.webhook_name);
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    warn!("webhook configuration changed while updating, retrying: {e}");
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "failed to update webhook configuration {}: {e}",
                        self.config.webhook_name
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Consumes triggers one at a time; a burst of queued triggers collapses into one reconcile.
    pub async fn run_worker(self: Arc<Self>, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
        while let Some(trigger) = triggers.recv().await {
            while triggers.try_recv().is_ok() {}
            debug!("reconcile triggered by {trigger:?}");
            match self.reconcile_current().await {
                Ok(Outcome::Unchanged) => {}
                Ok(Outcome::Issued(reason)) => {
                    info!("reconcile issued a new certificate ({reason})");
                }
                Err(e) => {
                    error!("reconcile failed: {e}");
                }
            }
        }
    }

    /// Turns every Secret watch event into a reconcile trigger.
    pub async fn run_secret_watch<S>(self: Arc<Self>, events: S)
    where
        S: Stream<Item = Result<watcher::Event<Secret>, watcher::Error>>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(_) => self.trigger(Trigger::SecretEvent),
                Err(e) => warn!("secret watch error: {e}"),
            }
        }
        error!("secret watch terminated");
    }
}
