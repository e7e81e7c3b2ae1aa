//! The certificate presented to the browser.
//!
//! One self-signed identity is generated per process, on first use, and reused to
//! terminate inbound TLS for every origin. The browser is expected to trust it out of
//! band, e.g. by pinning [`EphemeralServerIdentity::cert_der`].
use crate::errors::{Error, Result};
use once_cell::sync::OnceCell;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

static IDENTITY: OnceCell<EphemeralServerIdentity> = OnceCell::new();

/// Self-signed certificate and key shared by all inbound TLS sessions.
#[derive(Debug)]
pub struct EphemeralServerIdentity {
  cert_der: CertificateDer<'static>,
  cert_pem: String,
  server_config: Arc<ServerConfig>,
}

impl EphemeralServerIdentity {
  /// The process-wide identity, generated on first call.
  ///
  /// Concurrent first calls generate once; later calls never regenerate.
  pub fn get() -> Result<&'static EphemeralServerIdentity> {
    IDENTITY.get_or_try_init(Self::generate)
  }

  fn generate() -> Result<Self> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
      .map_err(|e| Error::Other(format!("invalid subject name: {}", e)))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair =
      KeyPair::generate().map_err(|e| Error::Other(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::Other(format!("failed to self-sign identity: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|e| Error::Other(format!("failed to serialize identity key: {}", e)))?;
    let server_config = ServerConfig::builder_with_provider(crate::tls::provider())
      .with_protocol_versions(tokio_rustls::rustls::ALL_VERSIONS)?
      .with_no_client_auth()
      .with_single_cert(vec![cert_der.clone()], key_der)?;
    tracing::debug!("generated ephemeral server identity");
    Ok(Self {
      cert_der,
      cert_pem: cert.pem(),
      server_config: Arc::new(server_config),
    })
  }

  /// DER encoded certificate.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// PEM encoded certificate.
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Server TLS config offering exactly `alpn`.
  pub(crate) fn server_config(&self, alpn: Vec<Vec<u8>>) -> Arc<ServerConfig> {
    let mut config = (*self.server_config).clone();
    config.alpn_protocols = alpn;
    Arc::new(config)
  }
}
