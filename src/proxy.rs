//! The client certificates proxy and its uid → connection table.
use crate::config::ProxyConfiguration;
use crate::connection::{LogicalConnection, Shared};
use crate::connector::ConnectorBuilder;
use crate::errors::Result;
use crate::events::{EventReceiver, EventSender, SocksEvent, Uid};
use crate::socks5::Socks5Server;
use crate::tls::SecureContextCache;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct Handle {
  tx: mpsc::UnboundedSender<Bytes>,
  closed: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl Handle {
  fn is_live(&self) -> bool {
    !self.task.is_finished()
  }

  fn close(self) {
    self.closed.send_replace(true);
    // dropping `tx` ends the connection's inbox
  }
}

/// Live logical connections keyed by uid.
///
/// The table is mutated only through `&mut self`, so whoever owns it (the proxy's
/// dispatcher task) serializes `requested`/`closed` handling. A `requested` event for
/// a uid whose connection is still running is ignored; one for a uid whose connection
/// already finished replaces the stale entry.
///
/// ```no_run
/// # async fn run() -> certproxy::Result<()> {
/// use certproxy::events::SocksEvent;
/// let config = certproxy::ProxyConfiguration::default();
/// let (mut table, mut events) = certproxy::ConnectionTable::new(&config)?;
/// table.dispatch(SocksEvent::Requested { uid: "1".into(), host: "example.com".into(), port: 80 });
/// let connected = events.recv().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionTable {
  shared: Arc<Shared>,
  events: EventSender,
  connections: HashMap<Uid, Handle>,
}

impl ConnectionTable {
  /// Compile the secure contexts of `config` and create an empty table.
  ///
  /// Fails when any client certificate entry cannot be compiled.
  pub fn new(config: &ProxyConfiguration) -> Result<(Self, EventReceiver)> {
    let (events, rx) = mpsc::unbounded_channel();
    let cache = SecureContextCache::build(config)?;
    let connector = ConnectorBuilder::default()
      .connect_timeout(config.connect_timeout)
      .nodelay(config.nodelay)
      .proxy(config.upstream_proxy.clone())
      .build();
    let table = Self {
      shared: Arc::new(Shared {
        cache: Arc::new(cache),
        connector,
      }),
      events,
      connections: HashMap::new(),
    };
    Ok((table, rx))
  }

  /// Apply one event from the SOCKS side. Never fails; per-connection problems are
  /// reported as connection events.
  pub fn dispatch(&mut self, event: SocksEvent) {
    match event {
      SocksEvent::Requested { uid, host, port } => self.requested(uid, host, port),
      SocksEvent::Data { uid, data } => match self.connections.get(&uid) {
        Some(handle) => {
          if handle.tx.send(data).is_err() {
            tracing::trace!(%uid, "data after connection finished");
          }
        }
        None => tracing::trace!(%uid, "data for unknown connection"),
      },
      SocksEvent::Closed { uid } => {
        if let Some(handle) = self.connections.remove(&uid) {
          tracing::debug!(%uid, "connection closed by browser");
          handle.close();
        }
      }
    }
  }

  fn requested(&mut self, uid: Uid, host: String, port: u16) {
    if self.connections.get(&uid).is_some_and(Handle::is_live) {
      tracing::warn!(%uid, %host, port, "duplicate request for live connection ignored");
      return;
    }
    tracing::debug!(%uid, %host, port, "connection requested");
    let (tx, inbox) = mpsc::unbounded_channel();
    let (closed, signal) = watch::channel(false);
    let connection = LogicalConnection::new(
      uid.clone(),
      host,
      port,
      self.events.clone(),
      inbox,
      signal,
      self.shared.clone(),
    );
    let task = tokio::spawn(connection.run());
    if let Some(stale) = self.connections.insert(uid, Handle { tx, closed, task }) {
      stale.close();
    }
  }

  /// Number of uids in the table, including connections that already ended but
  /// whose `closed` event has not arrived.
  pub fn len(&self) -> usize {
    self.connections.len()
  }

  /// Whether the table holds no connection.
  pub fn is_empty(&self) -> bool {
    self.connections.is_empty()
  }

  /// Tear down every connection immediately.
  pub fn close_all(&mut self) {
    for (_, handle) in self.connections.drain() {
      handle.task.abort();
      handle.close();
    }
  }
}

impl Drop for ConnectionTable {
  fn drop(&mut self) {
    self.close_all();
  }
}

/// A loopback SOCKS5 proxy that injects client certificates into the TLS connections
/// it forwards.
///
/// ```no_run
/// # async fn run() -> certproxy::Result<()> {
/// use certproxy::{ClientCertEntry, ClientCertificatesProxy, ProxyConfiguration};
/// let cert = std::fs::read("client.pem")?;
/// let key = std::fs::read("client.key")?;
/// let config = ProxyConfiguration::builder()
///   .client_certificate(ClientCertEntry::new("https://corp.example").cert_key(cert, key, None))
///   .build();
/// let mut proxy = ClientCertificatesProxy::create(config).await?;
/// println!("browser proxy: {}", proxy.proxy_settings());
/// proxy.close();
/// # Ok(())
/// # }
/// ```
pub struct ClientCertificatesProxy {
  port: u16,
  tasks: Vec<JoinHandle<()>>,
}

impl ClientCertificatesProxy {
  /// Compile all client certificates and start listening on `127.0.0.1:<ephemeral>`.
  ///
  /// Nothing is bound when compilation fails.
  pub async fn create(config: ProxyConfiguration) -> Result<Self> {
    let (table, events) = ConnectionTable::new(&config)?;
    let (requests, incoming) = mpsc::unbounded_channel();
    let server = Socks5Server::bind(requests).await?;
    let port = server.local_addr()?.port();
    tracing::debug!(port, "client certificates proxy listening");
    let tasks = vec![
      tokio::spawn(server.run(events)),
      tokio::spawn(dispatch_loop(table, incoming)),
    ];
    Ok(Self { port, tasks })
  }

  /// Port of the loopback SOCKS5 listener.
  pub fn port(&self) -> u16 {
    self.port
  }

  /// Proxy server address to hand to the browser, `socks5://127.0.0.1:<port>`.
  pub fn proxy_settings(&self) -> String {
    format!("socks5://127.0.0.1:{}", self.port)
  }

  /// Stop listening and tear down all live connections. Calling it again does nothing.
  pub fn close(&mut self) {
    if self.tasks.is_empty() {
      return;
    }
    tracing::debug!(port = self.port, "closing client certificates proxy");
    for task in self.tasks.drain(..) {
      task.abort();
    }
  }
}

impl Drop for ClientCertificatesProxy {
  fn drop(&mut self) {
    self.close();
  }
}

async fn dispatch_loop(mut table: ConnectionTable, mut incoming: mpsc::UnboundedReceiver<SocksEvent>) {
  while let Some(event) = incoming.recv().await {
    table.dispatch(event);
  }
}
