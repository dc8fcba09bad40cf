use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::Error;

const ENV_PREFIX: &str = "AKS_SPOT_INSTANCE_TOLERATOR_";

pub const LOG_LEVEL_ENV: &str = "AKS_SPOT_INSTANCE_TOLERATOR_LOG_LEVEL";

#[derive(Clone, Debug)]
pub struct Config {
    pub namespace: String,
    pub service_name: String,
    pub secret_name: String,
    pub webhook_name: String,
    pub cert_dir: PathBuf,
    /// Kubeconfig to build the client from instead of the in-cluster or default one.
    pub kubeconfig: Option<PathBuf>,
    pub webhook_bind: SocketAddr,
    pub health_bind: SocketAddr,
    pub valid_for: Duration,
    pub renew_early: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: "default".to_string(),
            service_name: "aks-spot-instance-tolerator-webhook-svc".to_string(),
            secret_name: "aks-spot-instance-tolerator-webhook-tls".to_string(),
            webhook_name: "aks-spot-instance-tolerator-webhook".to_string(),
            cert_dir: PathBuf::from("/etc/webhook/certs"),
            kubeconfig: None,
            webhook_bind: SocketAddr::from(([0, 0, 0, 0], 8443)),
            health_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            valid_for: Duration::from_secs(60 * 60 * 24 * 10),
            renew_early: Duration::from_secs(60 * 60 * 24 * 5),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    let value = std::env::var(name).unwrap_or_default();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn prefixed(name: &str) -> Option<String> {
    env_value(&format!("{ENV_PREFIX}{name}"))
}

fn parse_port(name: &str, value: &str) -> Result<SocketAddr, Error> {
    let port: u16 = value
        .parse()
        .map_err(|e| Error::UserInputError(format!("invalid {ENV_PREFIX}{name} ({value}): {e}")))?;
    Ok(SocketAddr::from(([0, 0, 0, 0], port)))
}

fn parse_seconds(name: &str, value: &str) -> Result<Duration, Error> {
    let secs: u64 = value
        .parse()
        .map_err(|e| Error::UserInputError(format!("invalid {ENV_PREFIX}{name} ({value}): {e}")))?;
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn from_env() -> Result<Config, Error> {
        let mut config = Config::default();
        if let Some(namespace) = env_value("POD_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(name) = prefixed("SVC_NAME") {
            config.service_name = name;
        }
        if let Some(name) = prefixed("SECRET_NAME") {
            config.secret_name = name;
        }
        if let Some(name) = prefixed("WEBHOOK_NAME") {
            config.webhook_name = name;
        }
        if let Some(path) = prefixed("CERT_DIR_PATH") {
            config.cert_dir = PathBuf::from(path);
        }
        if let Some(path) = prefixed("KUBECONFIG") {
            config.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(port) = prefixed("WEBHOOK_PORT") {
            config.webhook_bind = parse_port("WEBHOOK_PORT", &port)?;
        }
        if let Some(port) = prefixed("HEALTH_PORT") {
            config.health_bind = parse_port("HEALTH_PORT", &port)?;
        }
        if let Some(secs) = prefixed("TLS_VALID_FOR_SECONDS") {
            config.valid_for = parse_seconds("TLS_VALID_FOR_SECONDS", &secs)?;
        }
        if let Some(secs) = prefixed("TLS_RENEW_EARLY_SECONDS") {
            config.renew_early = parse_seconds("TLS_RENEW_EARLY_SECONDS", &secs)?;
        }
        Ok(config)
    }

    /// Service hostnames the leaf certificate must cover, most qualified first.
    pub fn hostnames(&self) -> Vec<String> {
        let svc = &self.service_name;
        let ns = &self.namespace;
        vec![
            format!("{svc}.{ns}.svc.cluster.local"),
            format!("{svc}.{ns}.svc"),
            svc.clone(),
        ]
    }

    /// Logical cache key of a certificate file under the mirror directory.
    pub fn cert_path(&self, name: &str) -> String {
        cache_key(&self.cert_dir, name)
    }
}

pub fn cache_key(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostnames() {
        let config = Config {
            service_name: "svc".to_string(),
            namespace: "ns".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.hostnames(),
            vec!["svc.ns.svc.cluster.local", "svc.ns.svc", "svc"]
        );
    }

    #[test]
    fn test_cert_path() {
        let config = Config {
            cert_dir: PathBuf::from("/etc/webhook/certs"),
            ..Default::default()
        };
        assert_eq!(config.cert_path("tls.cert"), "/etc/webhook/certs/tls.cert");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_port("WEBHOOK_PORT", "not-a-port").is_err());
        assert_eq!(
            parse_port("WEBHOOK_PORT", "9443").unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 9443))
        );
        assert_eq!(
            parse_seconds("TLS_VALID_FOR_SECONDS", "10").unwrap(),
            Duration::from_secs(10)
        );
        assert!(parse_seconds("TLS_VALID_FOR_SECONDS", "-1").is_err());
    }
}
