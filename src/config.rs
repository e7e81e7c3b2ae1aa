//! Proxy configuration.
//!
//! Everything here is plain data, consumed once by
//! [`ClientCertificatesProxy::create`](crate::ClientCertificatesProxy::create).
use crate::upstream::ProxySettings;
use std::fmt;
use std::time::Duration;

/// One client credential for an origin.
#[derive(Clone)]
pub enum Credential {
  /// PEM certificate chain and PEM private key.
  CertKey {
    /// PEM encoded certificate chain, leaf first
    cert: Vec<u8>,
    /// PEM encoded private key, optionally encrypted
    key: Vec<u8>,
    /// passphrase of an encrypted key
    passphrase: Option<String>,
  },
  /// PKCS#12 archive.
  Pfx {
    /// DER encoded PKCS#12 blob
    pfx: Vec<u8>,
    /// archive passphrase
    passphrase: Option<String>,
  },
}

impl fmt::Debug for Credential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Credential::CertKey {
        cert, passphrase, ..
      } => f
        .debug_struct("CertKey")
        .field("cert_len", &cert.len())
        .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
        .finish_non_exhaustive(),
      Credential::Pfx { pfx, passphrase } => f
        .debug_struct("Pfx")
        .field("pfx_len", &pfx.len())
        .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
        .finish_non_exhaustive(),
    }
  }
}

/// Client certificates to present to destinations matching `origin`.
///
/// `origin` is either a URL (`https://example.com`, `https://example.com:8443`) or a
/// glob such as `https://*.example.com`.
///
/// ```
/// let entry = certproxy::ClientCertEntry::new("https://corp.example")
///   .cert_key(b"cert".to_vec(), b"key".to_vec(), None);
/// assert_eq!(entry.credentials().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ClientCertEntry {
  origin: String,
  credentials: Vec<Credential>,
}

impl ClientCertEntry {
  /// Entry for `origin` without credentials.
  pub fn new<S: Into<String>>(origin: S) -> Self {
    Self {
      origin: origin.into(),
      credentials: Vec::new(),
    }
  }
  /// Add a PEM certificate/key pair.
  pub fn cert_key(mut self, cert: Vec<u8>, key: Vec<u8>, passphrase: Option<String>) -> Self {
    self.credentials.push(Credential::CertKey {
      cert,
      key,
      passphrase,
    });
    self
  }
  /// Add a PKCS#12 archive.
  pub fn pfx(mut self, pfx: Vec<u8>, passphrase: Option<String>) -> Self {
    self.credentials.push(Credential::Pfx { pfx, passphrase });
    self
  }
  /// Add an already built credential.
  pub fn credential(mut self, credential: Credential) -> Self {
    self.credentials.push(credential);
    self
  }
  /// The origin pattern as configured.
  pub fn origin(&self) -> &str {
    &self.origin
  }
  /// Credentials in the order they were added.
  pub fn credentials(&self) -> &[Credential] {
    &self.credentials
  }
}

/// Immutable configuration of a [`ClientCertificatesProxy`](crate::ClientCertificatesProxy).
#[derive(Debug, Clone)]
pub struct ProxyConfiguration {
  pub(crate) client_certificates: Vec<ClientCertEntry>,
  pub(crate) ignore_upstream_cert_errors: bool,
  pub(crate) upstream_proxy: Option<ProxySettings>,
  pub(crate) ca: Vec<Vec<u8>>,
  pub(crate) connect_timeout: Option<Duration>,
  pub(crate) nodelay: bool,
}

impl Default for ProxyConfiguration {
  fn default() -> Self {
    ProxyConfigurationBuilder::default().build()
  }
}

impl ProxyConfiguration {
  /// Start building a configuration.
  pub fn builder() -> ProxyConfigurationBuilder {
    ProxyConfigurationBuilder::default()
  }
  /// Configured client certificate entries.
  pub fn client_certificates(&self) -> &[ClientCertEntry] {
    &self.client_certificates
  }
  /// Whether destination certificates are accepted without verification.
  pub fn ignore_upstream_cert_errors(&self) -> bool {
    self.ignore_upstream_cert_errors
  }
  /// Proxy outbound connections are chained through, if any.
  pub fn upstream_proxy(&self) -> Option<&ProxySettings> {
    self.upstream_proxy.as_ref()
  }
}

/// Builder for [`ProxyConfiguration`].
#[derive(Debug, Clone)]
pub struct ProxyConfigurationBuilder {
  client_certificates: Vec<ClientCertEntry>,
  ignore_upstream_cert_errors: bool,
  upstream_proxy: Option<ProxySettings>,
  ca: Vec<Vec<u8>>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
}

impl Default for ProxyConfigurationBuilder {
  fn default() -> Self {
    Self {
      client_certificates: Vec::new(),
      ignore_upstream_cert_errors: false,
      upstream_proxy: None,
      ca: Vec::new(),
      connect_timeout: None,
      nodelay: true,
    }
  }
}

impl ProxyConfigurationBuilder {
  /// Add a client certificate entry.
  ///
  /// Entries for the same origin are merged.
  pub fn client_certificate(mut self, entry: ClientCertEntry) -> Self {
    self.client_certificates.push(entry);
    self
  }
  /// Accept any destination certificate.
  ///
  /// Default is `false`.
  ///
  /// # Warning
  ///
  /// Destination identity is not checked at all when this is enabled.
  pub fn ignore_upstream_cert_errors(mut self, value: bool) -> Self {
    self.ignore_upstream_cert_errors = value;
    self
  }
  /// Chain outbound connections through another proxy.
  pub fn upstream_proxy(mut self, proxy: ProxySettings) -> Self {
    self.upstream_proxy = Some(proxy);
    self
  }
  /// Trust an extra PEM encoded CA bundle when verifying destinations.
  pub fn ca(mut self, pem: Vec<u8>) -> Self {
    self.ca.push(pem);
    self
  }
  /// Timeout of the outbound TCP connect.
  ///
  /// Default is no timeout.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.connect_timeout = timeout;
    self
  }
  /// Set `TCP_NODELAY` on outbound sockets.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> Self {
    self.nodelay = value;
    self
  }
  /// Finish the configuration.
  pub fn build(self) -> ProxyConfiguration {
    ProxyConfiguration {
      client_certificates: self.client_certificates,
      ignore_upstream_cert_errors: self.ignore_upstream_cert_errors,
      upstream_proxy: self.upstream_proxy,
      ca: self.ca,
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
    }
  }
}
