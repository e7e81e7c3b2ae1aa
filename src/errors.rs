//! proxy error
use std::fmt;
use std::io::ErrorKind;
use thiserror::Error as ThisError;
use tokio_rustls::rustls;
use tokio_rustls::rustls::AlertDescription;

/// A `Result` alias where the `Err` case is `certproxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur inside the proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// A client certificate entry could not be compiled into a TLS context.
  #[error("failed to load client certificate for {origin}: {message}")]
  Configuration {
    /// origin the failing entry was registered for
    origin: String,
    /// underlying cause
    message: String,
  },
  /// The outbound TCP connection could not be established.
  #[error("failed to connect to {host}:{port}: {source}")]
  Connect {
    /// destination host
    host: String,
    /// destination port
    port: u16,
    /// io error
    #[source]
    source: std::io::Error,
  },
  /// The outbound TLS handshake failed.
  #[error(transparent)]
  Handshake(#[from] HandshakeFailure),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
  /// h2::Error
  #[error(transparent)]
  H2(#[from] h2::Error),
  /// Upstream proxy ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Upstream proxy negotiation failed
  #[error("proxy error: {0}")]
  Proxy(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a configuration error and log it
  pub fn configuration(origin: impl Into<String>, message: impl fmt::Display) -> Self {
    let origin = origin.into();
    let message = message.to_string();
    tracing::error!(%origin, "client certificate error: {}", message);
    Error::Configuration { origin, message }
  }

  /// Create an upstream proxy error and log it
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Errno-style code describing why the destination could not be reached.
  pub fn code(&self) -> ErrorCode {
    match self {
      Error::Connect { source, .. } | Error::IO(source) => ErrorCode::from_io(source),
      Error::ReplyError(reply) => ErrorCode::from(reply),
      Error::Proxy(_) => ErrorCode::ProxyFailure,
      _ => ErrorCode::Io,
    }
  }
}

#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum ReplyError {
  #[error("Succeeded")]
  Succeeded,
  #[error("General failure")]
  GeneralFailure,
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  #[error("Network unreachable")]
  NetworkUnreachable,
  #[error("Host unreachable")]
  HostUnreachable,
  #[error("Connection refused")]
  ConnectionRefused,
  #[error("TTL expired")]
  TtlExpired,
  #[error("Command not supported")]
  CommandNotSupported,
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  #[error("Unknown reply code {0:#04x}")]
  Unknown(u8),
}

/// What went wrong during an outbound TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureKind {
  /// The peer certificate was rejected, or the peer rejected ours.
  Certificate,
  /// Any other TLS protocol failure (version, cipher, ALPN).
  Protocol,
  /// The transport broke while handshaking.
  Transport,
}

impl TlsFailureKind {
  /// Classify an io error surfaced by a tokio-rustls stream.
  pub fn classify(error: &std::io::Error) -> Self {
    match error
      .get_ref()
      .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
      Some(tls) => Self::from_tls(tls),
      None => TlsFailureKind::Transport,
    }
  }

  fn from_tls(error: &rustls::Error) -> Self {
    match error {
      rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
        TlsFailureKind::Certificate
      }
      rustls::Error::AlertReceived(alert) => match alert {
        AlertDescription::CertificateRequired
        | AlertDescription::BadCertificate
        | AlertDescription::UnsupportedCertificate
        | AlertDescription::CertificateRevoked
        | AlertDescription::CertificateExpired
        | AlertDescription::CertificateUnknown
        | AlertDescription::UnknownCA
        | AlertDescription::AccessDenied => TlsFailureKind::Certificate,
        _ => TlsFailureKind::Protocol,
      },
      _ => TlsFailureKind::Protocol,
    }
  }
}

/// Failure of the outbound TLS handshake, carrying what the error page needs.
#[derive(ThisError, Debug, Clone)]
#[error("TLS handshake with {host}:{port} failed: {message}")]
pub struct HandshakeFailure {
  /// destination host
  pub host: String,
  /// destination port
  pub port: u16,
  /// classification of the failure
  pub kind: TlsFailureKind,
  /// human readable cause
  pub message: String,
}

impl HandshakeFailure {
  pub(crate) fn new(host: &str, port: u16, error: &std::io::Error) -> Self {
    let message = match error
      .get_ref()
      .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
      Some(tls) => tls.to_string(),
      None => error.to_string(),
    };
    Self {
      host: host.to_string(),
      port,
      kind: TlsFailureKind::classify(error),
      message,
    }
  }
}

/// Errno-style code reported with `failed(uid, code)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
  /// ECONNREFUSED
  ConnectionRefused,
  /// ECONNRESET
  ConnectionReset,
  /// EHOSTUNREACH
  HostUnreachable,
  /// ENETUNREACH
  NetworkUnreachable,
  /// ETIMEDOUT
  TimedOut,
  /// ENOTFOUND
  NotFound,
  /// EPROXY
  ProxyFailure,
  /// EIO
  Io,
}

impl ErrorCode {
  /// Map an io error from connect() to a code.
  pub fn from_io(error: &std::io::Error) -> Self {
    match error.kind() {
      ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
      ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => ErrorCode::ConnectionReset,
      ErrorKind::HostUnreachable => ErrorCode::HostUnreachable,
      ErrorKind::NetworkUnreachable => ErrorCode::NetworkUnreachable,
      ErrorKind::TimedOut => ErrorCode::TimedOut,
      ErrorKind::NotFound | ErrorKind::AddrNotAvailable => ErrorCode::NotFound,
      _ => ErrorCode::Io,
    }
  }

  /// The errno name, e.g. `ECONNREFUSED`.
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorCode::ConnectionRefused => "ECONNREFUSED",
      ErrorCode::ConnectionReset => "ECONNRESET",
      ErrorCode::HostUnreachable => "EHOSTUNREACH",
      ErrorCode::NetworkUnreachable => "ENETUNREACH",
      ErrorCode::TimedOut => "ETIMEDOUT",
      ErrorCode::NotFound => "ENOTFOUND",
      ErrorCode::ProxyFailure => "EPROXY",
      ErrorCode::Io => "EIO",
    }
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<&ReplyError> for ErrorCode {
  fn from(value: &ReplyError) -> Self {
    match value {
      ReplyError::ConnectionRefused => ErrorCode::ConnectionRefused,
      ReplyError::HostUnreachable => ErrorCode::HostUnreachable,
      ReplyError::NetworkUnreachable => ErrorCode::NetworkUnreachable,
      ReplyError::TtlExpired => ErrorCode::TimedOut,
      _ => ErrorCode::ProxyFailure,
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_errors_map_to_errno_codes() {
    let refused = std::io::Error::from(ErrorKind::ConnectionRefused);
    assert_eq!(ErrorCode::from_io(&refused).as_str(), "ECONNREFUSED");
    let timed_out = std::io::Error::from(ErrorKind::TimedOut);
    assert_eq!(ErrorCode::from_io(&timed_out), ErrorCode::TimedOut);
    let other = std::io::Error::other("boom");
    assert_eq!(ErrorCode::from_io(&other), ErrorCode::Io);
  }

  #[test]
  fn connect_error_reports_code_of_source() {
    let error = Error::Connect {
      host: "example.com".to_string(),
      port: 443,
      source: std::io::Error::from(ErrorKind::ConnectionRefused),
    };
    assert_eq!(error.code(), ErrorCode::ConnectionRefused);
    assert_eq!(
      Error::ReplyError(ReplyError::HostUnreachable).code(),
      ErrorCode::HostUnreachable
    );
  }

  #[test]
  fn certificate_alerts_classify_as_certificate_failures() {
    let required = std::io::Error::new(
      ErrorKind::InvalidData,
      rustls::Error::AlertReceived(AlertDescription::CertificateRequired),
    );
    assert_eq!(
      TlsFailureKind::classify(&required),
      TlsFailureKind::Certificate
    );
    let unknown_issuer = std::io::Error::new(
      ErrorKind::InvalidData,
      rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
    );
    assert_eq!(
      TlsFailureKind::classify(&unknown_issuer),
      TlsFailureKind::Certificate
    );
    let version = std::io::Error::new(
      ErrorKind::InvalidData,
      rustls::Error::AlertReceived(AlertDescription::ProtocolVersion),
    );
    assert_eq!(TlsFailureKind::classify(&version), TlsFailureKind::Protocol);
    let reset = std::io::Error::from(ErrorKind::ConnectionReset);
    assert_eq!(TlsFailureKind::classify(&reset), TlsFailureKind::Transport);
  }

  #[test]
  fn handshake_failure_keeps_tls_message() {
    let error = std::io::Error::new(
      ErrorKind::InvalidData,
      rustls::Error::AlertReceived(AlertDescription::CertificateRequired),
    );
    let failure = HandshakeFailure::new("corp.example", 443, &error);
    assert_eq!(failure.kind, TlsFailureKind::Certificate);
    assert!(failure.message.contains("CertificateRequired"));
    assert!(failure.to_string().contains("corp.example:443"));
  }
}
