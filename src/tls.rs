//! Outbound TLS contexts.
//!
//! [`SecureContextCache`] compiles the configured client certificates once, grouped by
//! origin, into ready-to-use [`rustls::ClientConfig`]s. A handshake only clones one of
//! them and sets ALPN.
use crate::config::{ClientCertEntry, Credential, ProxyConfiguration};
use crate::errors::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::ResolvesClientCert;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, SignatureScheme,
};
use url::Url;
use x509_parser::der_parser::ber::ber_read_element_header;
use x509_parser::parse_x509_certificate;

pub(crate) fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Serialized origin (`scheme://host[:port]`) of a URL, with default ports elided.
///
/// `None` for strings that are not URLs or have an opaque origin.
///
/// ```
/// assert_eq!(
///   certproxy::tls::normalize_origin("https://example.com:443/path").as_deref(),
///   Some("https://example.com")
/// );
/// ```
pub fn normalize_origin(input: &str) -> Option<String> {
  let url = Url::parse(input).ok()?;
  let origin = url.origin();
  if origin.is_tuple() {
    Some(origin.ascii_serialization())
  } else {
    None
  }
}

/// Origin of an outbound TLS connection to `host:port`.
pub(crate) fn destination_origin(host: &str, port: u16) -> String {
  let raw = format!("https://{}", crate::upstream::authority(host, port));
  normalize_origin(&raw).unwrap_or(raw)
}

fn is_glob(pattern: &str) -> bool {
  pattern.contains(['*', '?', '{'])
}

/// Compile an origin glob to an anchored regular expression.
///
/// `**` matches anything, `*` and `?` stay within one path segment and `{a,b}`
/// is an alternation.
pub(crate) fn glob_to_regex(glob: &str) -> std::result::Result<Regex, regex::Error> {
  let mut pattern = String::from("^");
  let mut chars = glob.chars().peekable();
  let mut in_group = false;
  while let Some(c) = chars.next() {
    match c {
      '*' if chars.peek() == Some(&'*') => {
        chars.next();
        pattern.push_str(".*");
      }
      '*' => pattern.push_str("[^/]*"),
      '?' => pattern.push_str("[^/]"),
      '{' => {
        in_group = true;
        pattern.push_str("(?:");
      }
      '}' if in_group => {
        in_group = false;
        pattern.push(')');
      }
      ',' if in_group => pattern.push('|'),
      c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
    }
  }
  pattern.push('$');
  Regex::new(&pattern)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OriginKey {
  Normalized(String),
  Opaque(String),
  Glob(String),
}

impl OriginKey {
  fn classify(pattern: &str) -> Self {
    if is_glob(pattern) {
      return OriginKey::Glob(pattern.to_string());
    }
    match normalize_origin(pattern) {
      Some(origin) => OriginKey::Normalized(origin),
      None => OriginKey::Opaque(pattern.to_string()),
    }
  }
}

/// Client TLS contexts keyed by origin.
///
/// Read-only after [`SecureContextCache::build`]; shared by every connection.
#[derive(Debug)]
pub struct SecureContextCache {
  normalized: HashMap<String, Arc<ClientConfig>>,
  opaque: HashMap<String, Arc<ClientConfig>>,
  globs: Vec<(Regex, Arc<ClientConfig>)>,
  default: Arc<ClientConfig>,
}

impl SecureContextCache {
  /// Compile every configured entry.
  ///
  /// Fails on the first entry that cannot be compiled, naming its origin. Nothing is
  /// registered in that case.
  pub fn build(config: &ProxyConfiguration) -> Result<Self> {
    let base = ContextBuilder::new(config)?;

    let mut order: Vec<(OriginKey, String, Vec<&Credential>)> = Vec::new();
    let mut index: HashMap<OriginKey, usize> = HashMap::new();
    for entry in &config.client_certificates {
      let key = OriginKey::classify(entry.origin());
      let slot = *index.entry(key.clone()).or_insert_with(|| {
        order.push((key, entry.origin().to_string(), Vec::new()));
        order.len() - 1
      });
      order[slot].2.extend(entry.credentials());
    }

    let mut cache = SecureContextCache {
      normalized: HashMap::new(),
      opaque: HashMap::new(),
      globs: Vec::new(),
      default: base.compile(Vec::new())?,
    };
    for (key, origin, credentials) in order {
      let keys = credentials
        .into_iter()
        .map(|credential| load_credential(credential, &base.provider))
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(|message| Error::configuration(origin.as_str(), message))?;
      let context = base
        .compile(keys)
        .map_err(|e| Error::configuration(origin.as_str(), e))?;
      tracing::debug!(%origin, "compiled client certificate context");
      match key {
        OriginKey::Normalized(origin) => {
          cache.normalized.insert(origin, context);
        }
        OriginKey::Opaque(raw) => {
          cache.opaque.insert(raw, context);
        }
        OriginKey::Glob(glob) => {
          let regex = glob_to_regex(&glob).map_err(|e| Error::configuration(glob.as_str(), e))?;
          cache.globs.push((regex, context));
        }
      }
    }
    Ok(cache)
  }

  /// Context registered for `origin`, if any.
  ///
  /// Tries the normalized origin, then the raw string, then glob patterns in
  /// configuration order. `None` means "connect without client certificate".
  pub fn get(&self, origin: &str) -> Option<Arc<ClientConfig>> {
    let normalized = normalize_origin(origin);
    if let Some(context) = normalized.as_ref().and_then(|o| self.normalized.get(o)) {
      return Some(context.clone());
    }
    if let Some(context) = self.opaque.get(origin) {
      return Some(context.clone());
    }
    let subject = normalized.as_deref().unwrap_or(origin);
    self
      .globs
      .iter()
      .find(|(regex, _)| regex.is_match(subject))
      .map(|(_, context)| context.clone())
  }

  /// Context for a TLS connection to `host:port`, falling back to the context without
  /// client certificate.
  pub fn for_destination(&self, host: &str, port: u16) -> Arc<ClientConfig> {
    self
      .get(&destination_origin(host, port))
      .unwrap_or_else(|| self.default.clone())
  }

  /// Number of origins with client certificates.
  pub fn len(&self) -> usize {
    self.normalized.len() + self.opaque.len() + self.globs.len()
  }

  /// Whether no origin has client certificates.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

struct ContextBuilder {
  provider: Arc<CryptoProvider>,
  roots: Option<Arc<RootCertStore>>,
}

impl ContextBuilder {
  fn new(config: &ProxyConfiguration) -> Result<Self> {
    let roots = if config.ignore_upstream_cert_errors {
      None
    } else {
      Some(Arc::new(root_store(&config.ca)?))
    };
    Ok(Self {
      provider: provider(),
      roots,
    })
  }

  fn compile(&self, keys: Vec<Arc<CertifiedKey>>) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(self.provider.clone())
      .with_protocol_versions(rustls::ALL_VERSIONS)?;
    let builder = match &self.roots {
      Some(roots) => builder.with_root_certificates(roots.clone()),
      None => builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier::new(&self.provider))),
    };
    let config = if keys.is_empty() {
      builder.with_no_client_auth()
    } else {
      builder.with_client_cert_resolver(Arc::new(ClientCertResolver::new(keys)))
    };
    Ok(Arc::new(config))
  }
}

/// System trust roots plus the configured PEM bundles.
fn root_store(extra: &[Vec<u8>]) -> Result<RootCertStore> {
  let mut roots = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for error in &native.errors {
    tracing::warn!("failed to load system certificate: {}", error);
  }
  let (added, ignored) = roots.add_parsable_certificates(native.certs);
  tracing::debug!(added, ignored, "loaded system trust roots");
  for pem in extra {
    for cert in read_pem_certs(pem).map_err(|e| Error::configuration("ca", e))? {
      roots.add(cert)?;
    }
  }
  Ok(roots)
}

fn read_pem_certs(pem: &[u8]) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
  let certs = rustls_pemfile::certs(&mut Cursor::new(pem))
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| format!("invalid certificate encoding: {}", e))?;
  if certs.is_empty() {
    return Err("no certificate found".to_string());
  }
  Ok(certs)
}

fn load_credential(
  credential: &Credential,
  provider: &CryptoProvider,
) -> std::result::Result<Arc<CertifiedKey>, String> {
  let (chain, key) = match credential {
    Credential::CertKey {
      cert,
      key,
      passphrase,
    } => (read_pem_certs(cert)?, read_private_key(key, passphrase.as_deref())?),
    Credential::Pfx { pfx, passphrase } => pkcs12::parse(pfx, passphrase.as_deref())?,
  };
  let signing_key = provider
    .key_provider
    .load_private_key(key)
    .map_err(|e| e.to_string())?;
  Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

fn read_private_key(
  pem: &[u8],
  passphrase: Option<&str>,
) -> std::result::Result<PrivateKeyDer<'static>, String> {
  let encrypted = pem
    .windows(b"ENCRYPTED".len())
    .any(|w| w == b"ENCRYPTED");
  if encrypted {
    return pkcs12::decrypt_pem_key(pem, passphrase.unwrap_or_default());
  }
  rustls_pemfile::private_key(&mut Cursor::new(pem))
    .map_err(|e| format!("invalid private key encoding: {}", e))?
    .ok_or_else(|| "no private key found".to_string())
}

#[cfg(feature = "pkcs12")]
mod pkcs12 {
  use openssl::pkcs12::Pkcs12;
  use openssl::pkey::{PKey, Private};
  use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

  fn to_pkcs8(key: &PKey<Private>) -> Result<PrivateKeyDer<'static>, String> {
    let der = key.private_key_to_pkcs8().map_err(|e| e.to_string())?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)))
  }

  pub(super) fn decrypt_pem_key(pem: &[u8], passphrase: &str) -> Result<PrivateKeyDer<'static>, String> {
    let key = PKey::private_key_from_pem_passphrase(pem, passphrase.as_bytes())
      .map_err(|e| format!("cannot decrypt private key: {}", e))?;
    to_pkcs8(&key)
  }

  pub(super) fn parse(
    der: &[u8],
    passphrase: Option<&str>,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), String> {
    let parsed = Pkcs12::from_der(der)
      .and_then(|archive| archive.parse2(passphrase.unwrap_or_default()))
      .map_err(|e| format!("cannot read PKCS#12 archive: {}", e))?;
    let key = parsed
      .pkey
      .ok_or_else(|| "PKCS#12 archive has no private key".to_string())?;
    let leaf = parsed
      .cert
      .ok_or_else(|| "PKCS#12 archive has no certificate".to_string())?;
    let mut chain = vec![CertificateDer::from(leaf.to_der().map_err(|e| e.to_string())?)];
    if let Some(ca) = parsed.ca {
      for cert in ca.iter() {
        chain.push(CertificateDer::from(cert.to_der().map_err(|e| e.to_string())?));
      }
    }
    Ok((chain, to_pkcs8(&key)?))
  }
}

#[cfg(not(feature = "pkcs12"))]
mod pkcs12 {
  use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

  const UNSUPPORTED: &str = "built without the `pkcs12` feature";

  pub(super) fn decrypt_pem_key(_pem: &[u8], _passphrase: &str) -> Result<PrivateKeyDer<'static>, String> {
    Err(format!("encrypted private keys are not supported: {}", UNSUPPORTED))
  }

  pub(super) fn parse(
    _der: &[u8],
    _passphrase: Option<&str>,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), String> {
    Err(format!("PKCS#12 archives are not supported: {}", UNSUPPORTED))
  }
}

/// Offers the first credential usable with the server's signature schemes, preferring
/// one issued by a CA the server named.
#[derive(Debug)]
struct ClientCertResolver {
  keys: Vec<(Arc<CertifiedKey>, Vec<Vec<u8>>)>,
}

impl ClientCertResolver {
  fn new(keys: Vec<Arc<CertifiedKey>>) -> Self {
    let keys = keys
      .into_iter()
      .map(|key| {
        let issuers = key
          .cert
          .iter()
          .filter_map(|cert| parse_x509_certificate(cert.as_ref()).ok())
          .map(|(_, cert)| cert.tbs_certificate.issuer.as_raw().to_vec())
          .collect();
        (key, issuers)
      })
      .collect();
    Self { keys }
  }
}

impl ResolvesClientCert for ClientCertResolver {
  fn resolve(
    &self,
    root_hint_subjects: &[&[u8]],
    sigschemes: &[SignatureScheme],
  ) -> Option<Arc<CertifiedKey>> {
    let usable = self
      .keys
      .iter()
      .filter(|(key, _)| key.key.choose_scheme(sigschemes).is_some());
    let hinted = usable.clone().find(|(_, issuers)| {
      issuers
        .iter()
        .any(|issuer| root_hint_subjects.iter().any(|hint| hint_matches(hint, issuer)))
    });
    hinted.or_else(|| usable.clone().next()).map(|(key, _)| key.clone())
  }

  fn has_certs(&self) -> bool {
    !self.keys.is_empty()
  }
}

// hints may or may not carry the outer SEQUENCE header
fn hint_matches(hint: &[u8], issuer: &[u8]) -> bool {
  hint == issuer
    || ber_read_element_header(issuer).is_ok_and(|(content, _)| content == hint)
}

/// Accepts any server certificate.
#[derive(Debug)]
pub(crate) struct NoVerifier {
  schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
  pub(crate) fn new(provider: &CryptoProvider) -> Self {
    Self {
      schemes: provider
        .signature_verification_algorithms
        .supported_schemes(),
    }
  }
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.schemes.clone()
  }
}

impl ClientCertEntry {
  /// Whether this entry's pattern selects `origin`.
  pub fn matches(&self, origin: &str) -> bool {
    match OriginKey::classify(self.origin()) {
      OriginKey::Normalized(expected) => normalize_origin(origin).as_deref() == Some(&expected),
      OriginKey::Opaque(raw) => raw == origin,
      OriginKey::Glob(glob) => glob_to_regex(&glob).is_ok_and(|regex| {
        regex.is_match(normalize_origin(origin).as_deref().unwrap_or(origin))
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  };

  fn self_signed(name: &str) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec![name.to_string()])
      .unwrap()
      .self_signed(&key)
      .unwrap();
    (cert.pem(), key.serialize_pem())
  }

  fn ca(name: &str) -> (Issuer<'static, KeyPair>, Vec<u8>) {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (Issuer::new(params, key), cert.der().to_vec())
  }

  fn leaf(issuer: &Issuer<'static, KeyPair>) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec!["client".to_string()])
      .unwrap()
      .signed_by(&key, issuer)
      .unwrap();
    (cert.pem(), key.serialize_pem())
  }

  fn config_with(entries: Vec<ClientCertEntry>) -> ProxyConfiguration {
    let mut builder = ProxyConfiguration::builder().ignore_upstream_cert_errors(true);
    for entry in entries {
      builder = builder.client_certificate(entry);
    }
    builder.build()
  }

  fn entry(origin: &str) -> ClientCertEntry {
    let (cert, key) = self_signed("client");
    ClientCertEntry::new(origin).cert_key(cert.into_bytes(), key.into_bytes(), None)
  }

  #[test]
  fn default_port_is_elided() {
    assert_eq!(
      normalize_origin("https://example.com:443"),
      normalize_origin("https://example.com")
    );
    assert_eq!(
      normalize_origin("https://example.com:8443").as_deref(),
      Some("https://example.com:8443")
    );
    assert_eq!(normalize_origin("not a url"), None);
    assert_eq!(destination_origin("example.com", 443), "https://example.com");
    assert_eq!(destination_origin("::1", 8443), "https://[::1]:8443");
  }

  #[test]
  fn origin_lookup_matches_default_port() {
    let cache = SecureContextCache::build(&config_with(vec![entry("https://example.com")])).unwrap();
    assert_eq!(cache.len(), 1);
    assert!(cache.get("https://example.com:443").is_some());
    assert!(cache.get("https://example.com").is_some());
    assert!(cache.get("https://example.org").is_none());
    assert!(cache.get("https://example.com:8443").is_none());
  }

  #[test]
  fn entries_for_one_origin_are_merged() {
    let cache = SecureContextCache::build(&config_with(vec![
      entry("https://example.com"),
      entry("https://example.com:443/"),
    ]))
    .unwrap();
    assert_eq!(cache.len(), 1);
    let context = cache.get("https://example.com").unwrap();
    assert!(context.client_auth_cert_resolver.has_certs());
  }

  #[test]
  fn destination_without_entry_gets_default_context() {
    let cache = SecureContextCache::build(&config_with(vec![entry("https://corp.example")])).unwrap();
    let default = cache.for_destination("other.example", 443);
    assert!(!default.client_auth_cert_resolver.has_certs());
    let corp = cache.for_destination("corp.example", 443);
    assert!(corp.client_auth_cert_resolver.has_certs());
  }

  #[test]
  fn opaque_and_glob_patterns() {
    let cache = SecureContextCache::build(&config_with(vec![
      entry("corp-intranet"),
      entry("https://*.corp.example"),
      entry("https://{a,b}.example"),
    ]))
    .unwrap();
    assert!(cache.get("corp-intranet").is_some());
    assert!(cache.get("https://api.corp.example").is_some());
    assert!(cache.get("https://api.corp.example:443").is_some());
    assert!(cache.get("https://api.other.example").is_none());
    assert!(cache.get("https://a.example").is_some());
    assert!(cache.get("https://c.example").is_none());
  }

  #[test]
  fn glob_translation() {
    let regex = glob_to_regex("https://**.example.com").unwrap();
    assert!(regex.is_match("https://a.b.example.com"));
    let regex = glob_to_regex("https://*.example.com").unwrap();
    assert!(!regex.is_match("https://a/b.example.com"));
    assert!(!regex.is_match("https://aexample.com"));
    let regex = glob_to_regex("http?://x.test").unwrap();
    assert!(regex.is_match("https://x.test"));
  }

  #[test]
  fn entry_matching() {
    let entry = ClientCertEntry::new("https://example.com");
    assert!(entry.matches("https://example.com:443"));
    assert!(!entry.matches("https://example.org"));
  }

  #[test]
  fn broken_credential_names_origin() {
    let broken = ClientCertEntry::new("https://broken.example").cert_key(
      b"not a certificate".to_vec(),
      b"not a key".to_vec(),
      None,
    );
    let error = SecureContextCache::build(&config_with(vec![entry("https://ok.example"), broken]))
      .unwrap_err();
    match error {
      Error::Configuration { origin, .. } => assert_eq!(origin, "https://broken.example"),
      other => panic!("unexpected error {:?}", other),
    }
  }

  #[test]
  fn missing_key_is_a_configuration_error() {
    let (cert, _) = self_signed("client");
    let entry = ClientCertEntry::new("https://example.com").cert_key(cert.into_bytes(), Vec::new(), None);
    assert!(matches!(
      SecureContextCache::build(&config_with(vec![entry])),
      Err(Error::Configuration { .. })
    ));
  }

  fn configuration_error(config: &ProxyConfiguration) -> (String, String) {
    match SecureContextCache::build(config) {
      Err(Error::Configuration { origin, message }) => (origin, message),
      Err(other) => panic!("unexpected error {:?}", other),
      Ok(_) => panic!("credential compiled with a wrong passphrase"),
    }
  }

  #[cfg(feature = "pkcs12")]
  fn openssl_identity() -> (openssl::pkey::PKey<openssl::pkey::Private>, openssl::x509::X509) {
    let (cert, key) = self_signed("client");
    (
      openssl::pkey::PKey::private_key_from_pem(key.as_bytes()).unwrap(),
      openssl::x509::X509::from_pem(cert.as_bytes()).unwrap(),
    )
  }

  #[cfg(feature = "pkcs12")]
  #[test]
  fn pfx_credential_is_decrypted() {
    let (key, cert) = openssl_identity();
    let pfx = openssl::pkcs12::Pkcs12::builder()
      .name("client")
      .pkey(&key)
      .cert(&cert)
      .build2("secret")
      .unwrap()
      .to_der()
      .unwrap();

    let entry = ClientCertEntry::new("https://pfx.example").pfx(pfx.clone(), Some("secret".into()));
    let cache = SecureContextCache::build(&config_with(vec![entry])).unwrap();
    let context = cache.get("https://pfx.example").unwrap();
    assert!(context.client_auth_cert_resolver.has_certs());

    let entry = ClientCertEntry::new("https://pfx.example").pfx(pfx, Some("wrong".into()));
    let (origin, message) = configuration_error(&config_with(vec![entry]));
    assert_eq!(origin, "https://pfx.example");
    assert!(message.contains("PKCS#12"), "{}", message);
  }

  #[cfg(feature = "pkcs12")]
  #[test]
  fn encrypted_pem_key_is_decrypted() {
    let (key, cert) = openssl_identity();
    let cert = cert.to_pem().unwrap();
    let encrypted = key
      .private_key_to_pem_pkcs8_passphrase(openssl::symm::Cipher::aes_256_cbc(), b"secret")
      .unwrap();
    assert!(String::from_utf8_lossy(&encrypted).contains("ENCRYPTED PRIVATE KEY"));

    let entry = ClientCertEntry::new("https://pem.example").cert_key(
      cert.clone(),
      encrypted.clone(),
      Some("secret".into()),
    );
    let cache = SecureContextCache::build(&config_with(vec![entry])).unwrap();
    assert!(cache
      .get("https://pem.example")
      .unwrap()
      .client_auth_cert_resolver
      .has_certs());

    let entry =
      ClientCertEntry::new("https://pem.example").cert_key(cert, encrypted, Some("wrong".into()));
    let (origin, message) = configuration_error(&config_with(vec![entry]));
    assert_eq!(origin, "https://pem.example");
    assert!(message.contains("cannot decrypt private key"), "{}", message);
  }

  #[cfg(not(feature = "pkcs12"))]
  #[test]
  fn pfx_requires_pkcs12_feature() {
    let entry = ClientCertEntry::new("https://pfx.example").pfx(b"blob".to_vec(), None);
    let (origin, message) = configuration_error(&config_with(vec![entry]));
    assert_eq!(origin, "https://pfx.example");
    assert!(message.contains("pkcs12"), "{}", message);
  }

  #[test]
  fn hints_match_with_or_without_sequence_header() {
    let (issuer, ca_der) = ca("Test Client CA");
    let (leaf_pem, _) = leaf(&issuer);
    let leaf_der = read_pem_certs(leaf_pem.as_bytes()).unwrap().remove(0);
    let (_, leaf) = parse_x509_certificate(leaf_der.as_ref()).unwrap();
    let (_, ca) = parse_x509_certificate(&ca_der).unwrap();
    let issued_by = leaf.tbs_certificate.issuer.as_raw();
    let subject = ca.tbs_certificate.subject.as_raw();
    assert_eq!(issued_by, subject);
    let (content, _) = ber_read_element_header(subject).unwrap();
    assert!(hint_matches(subject, issued_by));
    assert!(hint_matches(content, issued_by));
    assert!(!hint_matches(&content[1..], issued_by));
  }

  #[test]
  fn resolver_prefers_hinted_issuer() {
    let provider = provider();
    let (first_ca, _) = ca("First CA");
    let (second_ca, second_der) = ca("Second CA");
    let load = |issuer: &Issuer<'static, KeyPair>| {
      let (cert, key) = leaf(issuer);
      load_credential(
        &Credential::CertKey {
          cert: cert.into_bytes(),
          key: key.into_bytes(),
          passphrase: None,
        },
        &provider,
      )
      .unwrap()
    };
    let first = load(&first_ca);
    let second = load(&second_ca);
    let resolver = ClientCertResolver::new(vec![first.clone(), second.clone()]);
    let schemes = [SignatureScheme::ECDSA_NISTP256_SHA256];

    let picked = resolver.resolve(&[], &schemes).unwrap();
    assert!(Arc::ptr_eq(&picked, &first));
    let (_, second_cert) = parse_x509_certificate(&second_der).unwrap();
    let hint = second_cert.tbs_certificate.subject.as_raw();
    let picked = resolver.resolve(&[hint], &schemes).unwrap();
    assert!(Arc::ptr_eq(&picked, &second));
    assert!(resolver.resolve(&[], &[SignatureScheme::ED448]).is_none());
  }
}
