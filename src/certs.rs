use std::{collections::BTreeMap, net::IpAddr};

use chrono::{DateTime, Utc};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::OffsetDateTime;
use x509_parser::{extensions::GeneralName, pem::parse_x509_pem};

use crate::Error;

pub const TLS_CERT: &str = "tls.cert";
pub const TLS_KEY: &str = "tls.key";
pub const CA_CERT: &str = "ca.cert";

const ORGANIZATION: &str = "aks-spot-instance-tolerator";

/// PEM encoded webhook identity: a fresh root and the leaf it signed.
#[derive(Clone, Debug)]
pub struct CertificateMaterial {
    pub ca_cert: String,
    pub cert: String,
    pub key: String,
}

impl From<CertificateMaterial> for BTreeMap<String, ByteString> {
    fn from(value: CertificateMaterial) -> Self {
        let mut out: BTreeMap<String, ByteString> = Default::default();
        out.insert(TLS_CERT.to_string(), ByteString(value.cert.into_bytes()));
        out.insert(TLS_KEY.to_string(), ByteString(value.key.into_bytes()));
        out.insert(CA_CERT.to_string(), ByteString(value.ca_cert.into_bytes()));
        out
    }
}

impl CertificateMaterial {
    /// Entries as they are mirrored on disk, keyed by file name.
    pub fn files(&self) -> [(&'static str, &str); 3] {
        [
            (TLS_CERT, &self.cert),
            (TLS_KEY, &self.key),
            (CA_CERT, &self.ca_cert),
        ]
    }
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::UserInputError(format!("invalid certificate timestamp {at}: {e}")))
}

fn random_serial() -> SerialNumber {
    let mut serial: [u8; 16] = rand::random();
    // DER integers are signed
    serial[0] &= 0x7f;
    SerialNumber::from_slice(&serial)
}

fn push_hosts(params: &mut CertificateParams, hosts: &[String]) -> Result<(), Error> {
    for host in hosts {
        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.as_str().try_into()?),
        };
        params.subject_alt_names.push(san);
    }
    Ok(())
}

/// Issues a self-signed root and a leaf for `hosts`, both valid over the same window.
pub fn synthesize(
    hosts: &[String],
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
) -> Result<CertificateMaterial, Error> {
    let not_before = to_offset(valid_from)?;
    let not_after = to_offset(valid_to)?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::OrganizationName, ORGANIZATION);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{ORGANIZATION} root"));
    params.serial_number = Some(random_serial());
    params.not_before = not_before;
    params.not_after = not_after;
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    push_hosts(&mut params, hosts)?;

    let ca_key_pair = KeyPair::generate()?;
    let ca = params.self_signed(&ca_key_pair)?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::ExplicitNoCa;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::OrganizationName, ORGANIZATION);
    if let Some(host) = hosts.first() {
        params.distinguished_name.push(DnType::CommonName, host.as_str());
    }
    params.serial_number = Some(random_serial());
    params.not_before = not_before;
    params.not_after = not_after;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    push_hosts(&mut params, hosts)?;

    let cert_key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&cert_key_pair, &ca, &ca_key_pair)?;

    Ok(CertificateMaterial {
        ca_cert: ca.pem(),
        cert: cert.pem(),
        key: cert_key_pair.serialize_pem(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafError {
    InvalidPem,
    InvalidCertificate,
}

/// The parts of a served leaf certificate that decide whether it needs rotation.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
}

pub fn parse_leaf(pem: &[u8]) -> Result<LeafInfo, LeafError> {
    let (_, pem) = parse_x509_pem(pem).map_err(|_| LeafError::InvalidPem)?;
    let cert = pem
        .parse_x509()
        .map_err(|_| LeafError::InvalidCertificate)?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or(LeafError::InvalidCertificate)?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or(LeafError::InvalidCertificate)?;

    let dns_names = cert
        .subject_alternative_name()
        .map_err(|_| LeafError::InvalidCertificate)?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(LeafInfo {
        not_before,
        not_after,
        dns_names,
    })
}

/// Borrows a named field out of a Secret's data map.
pub fn secret_field<'a>(secret: &'a Secret, name: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(name))
        .map(|value| value.0.as_slice())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use tokio_rustls::rustls::{
        client::{danger::ServerCertVerifier, WebPkiServerVerifier},
        pki_types::{ServerName, UnixTime},
        RootCertStore,
    };
    use x509_parser::prelude::*;

    use super::*;

    fn hosts() -> Vec<String> {
        vec![
            "svc.ns.svc.cluster.local".to_string(),
            "svc.ns.svc".to_string(),
            "svc".to_string(),
            "10.0.0.1".to_string(),
        ]
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now() - Duration::seconds(1);
        (now, now + Duration::hours(1))
    }

    #[test]
    fn test_leaf_verifies_for_configured_hosts_only() {
        let (from, to) = window();
        let material = synthesize(&hosts(), from, to).unwrap();

        let ca = rustls_pemfile::certs(&mut material.ca_cert.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let leaf = rustls_pemfile::certs(&mut material.cert.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(ca).unwrap();
        let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .unwrap();

        for host in hosts() {
            let name = ServerName::try_from(host.as_str()).unwrap();
            verifier
                .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
                .unwrap_or_else(|e| panic!("leaf should verify for {host}: {e}"));
        }

        let name = ServerName::try_from("other.ns.svc").unwrap();
        assert!(verifier
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_leaf_is_signed_by_root() {
        let (from, to) = window();
        let material = synthesize(&hosts(), from, to).unwrap();

        let (_, ca_pem) = parse_x509_pem(material.ca_cert.as_bytes()).unwrap();
        let ca = ca_pem.parse_x509().unwrap();
        let (_, leaf_pem) = parse_x509_pem(material.cert.as_bytes()).unwrap();
        let leaf = leaf_pem.parse_x509().unwrap();

        assert!(ca.is_ca());
        assert!(!leaf.is_ca());
        assert!(leaf.verify_signature(Some(ca.public_key())).is_ok());
        assert!(ca.verify_signature(None).is_ok());
        assert_ne!(ca.raw_serial(), leaf.raw_serial());
        assert_eq!(ca.validity().not_before, leaf.validity().not_before);
        assert_eq!(ca.validity().not_after, leaf.validity().not_after);
        assert_eq!(leaf.validity().not_before.timestamp(), from.timestamp());
        assert_eq!(leaf.validity().not_after.timestamp(), to.timestamp());

        let usage = leaf.key_usage().unwrap().unwrap().value;
        assert!(usage.digital_signature());
        assert!(usage.key_encipherment());
        assert!(!usage.key_cert_sign());
        let ext_usage = leaf.extended_key_usage().unwrap().unwrap().value;
        assert!(ext_usage.server_auth);
        assert!(!ext_usage.client_auth);

        let usage = ca.key_usage().unwrap().unwrap().value;
        assert!(usage.key_cert_sign());
        assert!(usage.key_encipherment());
        let ext_usage = ca.extended_key_usage().unwrap().unwrap().value;
        assert!(ext_usage.server_auth);
        assert!(ext_usage.client_auth);
    }

    #[test]
    fn test_hosts_split_into_dns_and_ip_names() {
        let (from, to) = window();
        let material = synthesize(&hosts(), from, to).unwrap();

        let (_, leaf_pem) = parse_x509_pem(material.cert.as_bytes()).unwrap();
        let leaf = leaf_pem.parse_x509().unwrap();
        let names = &leaf
            .subject_alternative_name()
            .unwrap()
            .unwrap()
            .value
            .general_names;
        assert!(names.contains(&GeneralName::DNSName("svc")));
        assert!(names.contains(&GeneralName::IPAddress(&[10, 0, 0, 1])));
        assert!(!names.contains(&GeneralName::DNSName("10.0.0.1")));

        let info = parse_leaf(material.cert.as_bytes()).unwrap();
        assert_eq!(
            info.dns_names,
            vec!["svc.ns.svc.cluster.local", "svc.ns.svc", "svc"]
        );
        assert_eq!(info.not_before.timestamp(), from.timestamp());
        assert_eq!(info.not_after.timestamp(), to.timestamp());
    }

    #[test]
    fn test_rotation_uses_fresh_keys() {
        let (from, to) = window();
        let first = synthesize(&hosts(), from, to).unwrap();
        let second = synthesize(&hosts(), from, to).unwrap();
        assert_ne!(first.key, second.key);
        assert_ne!(first.ca_cert, second.ca_cert);
    }

    #[test]
    fn test_parse_leaf_rejects_garbage() {
        let (from, to) = window();
        let material = synthesize(&hosts(), from, to).unwrap();
        let truncated = &material.cert.as_bytes()[..material.cert.len() / 2];
        assert_eq!(
            parse_leaf(truncated).unwrap_err(),
            LeafError::InvalidPem
        );
        assert_eq!(
            parse_leaf(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n")
                .unwrap_err(),
            LeafError::InvalidCertificate
        );
    }

    #[test]
    fn test_secret_data_layout() {
        let (from, to) = window();
        let material = synthesize(&hosts(), from, to).unwrap();
        let secret = Secret {
            data: Some(material.clone().into()),
            ..Default::default()
        };
        assert_eq!(
            secret_field(&secret, TLS_CERT),
            Some(material.cert.as_bytes())
        );
        assert_eq!(secret_field(&secret, TLS_KEY), Some(material.key.as_bytes()));
        assert_eq!(
            secret_field(&secret, CA_CERT),
            Some(material.ca_cert.as_bytes())
        );
    }
}
