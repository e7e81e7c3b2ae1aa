use crate::errors::{Error, Result};
use crate::upstream::ProxySettings;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  proxy: Option<ProxySettings>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: None,
      nodelay: true,
      keepalive: false,
      proxy: None,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Set a timeout for each connect attempt.
  ///
  /// Default is no timeout.
  ///
  /// # Note
  ///
  /// This **requires** the futures be executed in a tokio runtime with
  /// a tokio timer enabled.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Tunnel every connection through `proxy`.
  pub fn proxy(mut self, proxy: Option<ProxySettings>) -> ConnectorBuilder {
    self.proxy = proxy;
    self
  }
  /// Create a `Connector`.
  pub fn build(&self) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      proxy: self.proxy.clone(),
    }
  }
}

/// Opens outbound TCP connections to destinations, directly or through the
/// configured upstream proxy.
#[derive(Clone, Debug)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  proxy: Option<ProxySettings>,
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}

impl Connector {
  /// Connect to `host:port`.
  ///
  /// Resolved addresses are tried in order; the error of the last attempt is
  /// returned when all of them fail.
  pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    match &self.proxy {
      None => self
        .connect_host(host, port)
        .await
        .map_err(|source| Error::Connect {
          host: host.to_string(),
          port,
          source,
        }),
      Some(proxy) => {
        let mut stream = self
          .connect_host(proxy.host(), proxy.port())
          .await
          .map_err(|source| Error::Connect {
            host: proxy.host().to_string(),
            port: proxy.port(),
            source,
          })?;
        proxy.tunnel(&mut stream, host, port).await?;
        tracing::debug!(%host, port, proxy = %proxy.uri(), "tunnel established");
        Ok(stream)
      }
    }
  }

  async fn connect_host(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
    let addrs = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| std::io::Error::new(ErrorKind::NotFound, e))?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => {
          tracing::debug!(%host, %addr, "connect attempt failed: {}", e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      std::io::Error::new(ErrorKind::NotFound, format!("no address for {}", host))
    }))
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> std::io::Result<TcpStream> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    match self.connect_timeout {
      None => socket.connect(addr).await,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| std::io::Error::new(ErrorKind::TimedOut, x.to_string()))?,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::ErrorCode;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn connects_to_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connector = ConnectorBuilder::default().build();
    let stream = connector.connect("127.0.0.1", port).await.unwrap();
    assert!(stream.nodelay().unwrap());
    assert_eq!(stream.peer_addr().unwrap().port(), port);
  }

  #[tokio::test]
  async fn refused_connect_reports_errno() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let error = Connector::default()
      .connect("127.0.0.1", port)
      .await
      .unwrap_err();
    assert_eq!(error.code(), ErrorCode::ConnectionRefused);
  }
}
