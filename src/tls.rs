use std::{sync::Arc, time::Duration};

use hyper::server::conn::Http;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio_rustls::{
    rustls::{
        self,
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
        ServerConfig,
    },
    TlsAcceptor,
};
use warp::{filters::BoxedFilter, reply::Response};

use crate::{
    certs::{TLS_CERT, TLS_KEY},
    config::Config,
    secret_cache::SecretCache,
    Error,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Picks the serving certificate out of the [`SecretCache`] on every handshake.
#[derive(Debug)]
pub struct CacheCertResolver {
    cache: Arc<SecretCache>,
    cert_path: String,
    key_path: String,
}

impl CacheCertResolver {
    pub fn new(cache: Arc<SecretCache>, config: &Config) -> Self {
        CacheCertResolver {
            cache,
            cert_path: config.cert_path(TLS_CERT),
            key_path: config.cert_path(TLS_KEY),
        }
    }

    pub fn certified_key(&self) -> Result<CertifiedKey, Error> {
        let cert = self
            .cache
            .get(&self.cert_path)
            .ok_or_else(|| Error::MissingCertificate(format!("{} not loaded", self.cert_path)))?;
        let key = self
            .cache
            .get(&self.key_path)
            .ok_or_else(|| Error::MissingCertificate(format!("{} not loaded", self.key_path)))?;

        let chain = rustls_pemfile::certs(&mut cert.as_bytes()).collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(Error::MissingCertificate(format!(
                "no certificate in {}",
                self.cert_path
            )));
        }
        let key = rustls_pemfile::private_key(&mut key.as_bytes())?.ok_or_else(|| {
            Error::MissingCertificate(format!("no private key in {}", self.key_path))
        })?;
        let key = rustls::crypto::ring::sign::any_supported_type(&key)?;

        Ok(CertifiedKey::new(chain, key))
    }
}

impl ResolvesServerCert for CacheCertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match self.certified_key() {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                warn!("refusing TLS handshake: {e}");
                None
            }
        }
    }
}

pub fn server_config(resolver: Arc<CacheCertResolver>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

/// Serves `routes` over TLS. The listening socket stays up across certificate rotations.
pub async fn serve_tls(
    listener: TcpListener,
    resolver: Arc<CacheCertResolver>,
    routes: BoxedFilter<(Response,)>,
) -> Result<(), Error> {
    let acceptor = TlsAcceptor::from(Arc::new(server_config(resolver)));
    let service = warp::service(routes);
    info!("webhook listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("failed to accept connection: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("TLS handshake with {peer} failed: {e}");
                    return;
                }
                Err(_) => {
                    warn!("TLS handshake with {peer} timed out");
                    return;
                }
            };
            if let Err(e) = Http::new().serve_connection(stream, service).await {
                debug!("connection with {peer} closed: {e}");
            }
        });
    }
}
