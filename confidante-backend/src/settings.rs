use std::sync::Arc;
use std::{fs::File, io::BufReader};

use anyhow::{Error, anyhow};
use rustls_native_certs::load_native_certs;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::{Deserialize, Deserializer};
use tokio_rustls::rustls::pki_types::PrivateKeyDer::Pkcs8;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

use confidante_core::xmpp::jid::Jid;

#[derive(Debug, Deserialize)]

struct TlsConfig {
    #[serde(deserialize_with = "load_certificate_chain")]
    certificate_chain: Vec<CertificateDer<'static>>,
    #[serde(deserialize_with = "load_private_key")]
    private_key: PrivateKeyDer<'static>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub required_for_clients: bool,
    pub required_for_servers: bool,
    #[serde(deserialize_with = "init_tls_server_config")]
    pub server_config: Arc<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindSettings {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BindSettings {
    fn default() -> Self {
        BindSettings {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    5222
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaslSettings {
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<String>,
    #[serde(default = "default_true")]
    pub plain_over_tls_only: bool,
}

impl Default for SaslSettings {
    fn default() -> Self {
        SaslSettings {
            mechanisms: default_mechanisms(),
            plain_over_tls_only: true,
        }
    }
}

fn default_mechanisms() -> Vec<String> {
    vec![
        "SCRAM-SHA-256".to_string(),
        "SCRAM-SHA-1".to_string(),
        "PLAIN".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

/// `spec.md` §6's per-connection ceilings. Not all are enforced inside
/// `confidante-inbound` yet (`inbound_mailbox` sizes the stanza channel,
/// `idle_seconds` gates the per-connection idle timeout); `stanza_bytes`
/// and `outbound_bytes` are read by the XML codec and writer.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSettings {
    #[serde(default = "default_stanza_bytes")]
    pub stanza_bytes: usize,
    #[serde(default = "default_inbound_mailbox")]
    pub inbound_mailbox: usize,
    #[serde(default = "default_outbound_bytes")]
    pub outbound_bytes: usize,
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        LimitsSettings {
            stanza_bytes: default_stanza_bytes(),
            inbound_mailbox: default_inbound_mailbox(),
            outbound_bytes: default_outbound_bytes(),
            idle_seconds: default_idle_seconds(),
        }
    }
}

fn default_stanza_bytes() -> usize {
    65536
}

fn default_inbound_mailbox() -> usize {
    1024
}

fn default_outbound_bytes() -> usize {
    262144
}

fn default_idle_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisionSettings {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_reset_minutes")]
    pub reset_minutes: u64,
    #[serde(default = "default_health_check_seconds")]
    pub health_check_seconds: u64,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        SupervisionSettings {
            max_failures: default_max_failures(),
            reset_minutes: default_reset_minutes(),
            health_check_seconds: default_health_check_seconds(),
        }
    }
}

fn default_max_failures() -> u32 {
    3
}

fn default_reset_minutes() -> u64 {
    5
}

fn default_health_check_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    #[serde(deserialize_with = "deserialize_jid")]
    pub domain: Jid,
    pub tls: TlsSettings,
    #[serde(default)]
    pub bind: BindSettings,
    #[serde(default)]
    pub sasl: SaslSettings,
    #[serde(default)]
    pub limits: LimitsSettings,
    #[serde(default)]
    pub supervision: SupervisionSettings,
}

impl Settings {
    pub fn init() -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/defaults"))
            .add_source(config::File::with_name("config/overrides"))
            .add_source(config::Environment::with_prefix("CONFIDANTE").separator("__"))
            .build()?;

        let settings = settings.try_deserialize().map_err(|e| anyhow!(e))?;

        Ok(settings)
    }
}

fn load_certificate_chain<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<Vec<CertificateDer<'static>>, D::Error> {
    let cert_path = String::deserialize(deserializer)?;
    let cert_file = &mut BufReader::new(File::open(cert_path).map_err(serde::de::Error::custom)?);
    let cert_chain = certs(cert_file).map(|result| result.unwrap()).collect();

    Ok(cert_chain)
}

fn load_private_key<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<PrivateKeyDer<'static>, D::Error> {
    let key_path = String::deserialize(deserializer)?;
    let key_file = &mut BufReader::new(File::open(key_path).map_err(serde::de::Error::custom)?);
    let key_der = pkcs8_private_keys(key_file)
        .map(|result| result.unwrap())
        .collect::<Vec<_>>()
        .remove(0);

    Ok(Pkcs8(key_der))
}

fn init_tls_server_config<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<Arc<ServerConfig>, D::Error> {
    let config = TlsConfig::deserialize(deserializer)?;

    let mut root_cert_store = RootCertStore::empty();
    for cert in load_native_certs().certs {
        root_cert_store
            .add(cert)
            .map_err(serde::de::Error::custom)?;
    }
    let client_cert_verifier = WebPkiClientVerifier::builder(Arc::new(root_cert_store))
        .allow_unauthenticated()
        .build()
        .map_err(serde::de::Error::custom)?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(config.certificate_chain, config.private_key)
        .map_err(serde::de::Error::custom)?;

    Ok(Arc::new(config))
}

fn deserialize_jid<'d, D: Deserializer<'d>>(
    deserializer: D,
) -> Result<Jid, D::Error> {
    let raw_jid = String::deserialize(deserializer)?;
    raw_jid
        .parse::<Jid>()
        .map_err(serde::de::Error::custom)
}
