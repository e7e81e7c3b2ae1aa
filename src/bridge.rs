//! TLS bridge between the browser and the destination.
//!
//! The browser's ciphertext arrives as `data` frames; it is written into one end of an
//! in-memory duplex pipe while a rustls server session, using the
//! [`EphemeralServerIdentity`], runs on the other end. A rustls client session runs on
//! the outbound socket. Plaintext is spliced between the two sessions.
//!
//! ```text
//!  browser frames ─▶ feed ─▶ ┌────────┐        ┌─────────┐
//!                            │ duplex │◀─TLS─▶ │ inbound │◀──plaintext──▶ outbound ─TLS─▶ destination
//!  data events   ◀─ pump ◀── └────────┘        └─────────┘
//! ```
use crate::client_hello;
use crate::connection::wait_closed;
use crate::errors::{HandshakeFailure, Result, TlsFailureKind};
use crate::events::Emitter;
use crate::identity::EphemeralServerIdentity;
use crate::tls::SecureContextCache;
use bytes::Bytes;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{
  AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

const DUPLEX_CAPACITY: usize = 64 * 1024;
/// Browser plaintext kept for replay while the destination has not answered yet.
const REPLAY_LIMIT: usize = 64 * 1024;
const COPY_BUF_LEN: usize = 16 * 1024;
const HTTP_1_1: &str = "http/1.1";
const H2: &[u8] = b"h2";

/// Run the bridge for one connection until either side is done.
///
/// `client_hello` is the first browser frame; later frames come from `inbox`. Once
/// `closed` fires both sessions and the outbound socket are dropped, whatever phase the
/// bridge is in.
pub(crate) async fn run(
  emitter: &Emitter,
  cache: &SecureContextCache,
  host: &str,
  port: u16,
  socket: TcpStream,
  client_hello: Bytes,
  inbox: mpsc::UnboundedReceiver<Bytes>,
  mut closed: watch::Receiver<bool>,
) {
  let offered =
    client_hello::parse_alpn(&client_hello).unwrap_or_else(|| vec![HTTP_1_1.to_string()]);
  tracing::debug!(uid = emitter.uid(), %host, port, alpn = ?offered, "bridging TLS");

  let (browser_wire, tls_io) = tokio::io::duplex(DUPLEX_CAPACITY);
  let (wire_rd, wire_wr) = tokio::io::split(browser_wire);
  let feeder = tokio::spawn(feed(wire_wr, client_hello, inbox));
  let pump = tokio::spawn(pump(wire_rd, emitter.clone()));

  let result = tokio::select! {
    biased;
    _ = wait_closed(&mut closed) => {
      tracing::debug!(uid = emitter.uid(), %host, port, "bridge closed");
      Ok(())
    }
    result = bridge(tls_io, socket, &offered, cache, host, port) => result,
  };
  // everything the inbound session wrote is delivered before the outcome
  let _ = pump.await;
  feeder.abort();
  if let Err(e) = result {
    tracing::warn!(uid = emitter.uid(), %host, port, "TLS bridge failed: {}", e);
    emitter.error(e.to_string());
  }
}

async fn feed(
  mut wire: WriteHalf<DuplexStream>,
  first: Bytes,
  mut inbox: mpsc::UnboundedReceiver<Bytes>,
) {
  if wire.write_all(&first).await.is_err() {
    return;
  }
  while let Some(frame) = inbox.recv().await {
    if wire.write_all(&frame).await.is_err() {
      return;
    }
  }
  let _ = wire.shutdown().await;
}

async fn pump(mut wire: ReadHalf<DuplexStream>, emitter: Emitter) {
  let mut buf = vec![0u8; COPY_BUF_LEN];
  loop {
    match wire.read(&mut buf).await {
      Ok(0) | Err(_) => break,
      Ok(n) => emitter.data(Bytes::copy_from_slice(&buf[..n])),
    }
  }
}

async fn bridge(
  tls_io: DuplexStream,
  socket: TcpStream,
  offered: &[String],
  cache: &SecureContextCache,
  host: &str,
  port: u16,
) -> Result<()> {
  let identity = EphemeralServerIdentity::get()?;
  let mut config = (*cache.for_destination(host, port)).clone();
  config.alpn_protocols = offered.iter().map(|p| p.as_bytes().to_vec()).collect();

  match connect_upstream(socket, Arc::new(config), host, port).await {
    Ok(outbound) => {
      let negotiated = outbound.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
      // the browser may only pick what the destination picked
      let acceptor = TlsAcceptor::from(identity.server_config(negotiated.iter().cloned().collect()));
      let inbound = acceptor.accept(tls_io).await?;
      tracing::debug!(
        %host,
        port,
        alpn = ?negotiated.as_deref().map(String::from_utf8_lossy),
        "TLS bridge established"
      );
      BridgeState {
        inbound,
        outbound,
        negotiated_alpn: negotiated,
      }
      .splice(host, port)
      .await
    }
    Err(failure) => {
      tracing::warn!(%host, port, kind = ?failure.kind, "upstream handshake failed: {}", failure.message);
      let alpn = fallback_alpn(offered, None);
      let acceptor = TlsAcceptor::from(
        identity.server_config(alpn.into_iter().map(String::into_bytes).collect()),
      );
      let inbound = acceptor.accept(tls_io).await?;
      let negotiated = inbound.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
      respond_with_error(inbound, negotiated.as_deref(), &failure).await
    }
  }
}

/// Outbound TLS handshake; the error carries what the error page needs.
async fn connect_upstream(
  socket: TcpStream,
  config: Arc<tokio_rustls::rustls::ClientConfig>,
  host: &str,
  port: u16,
) -> std::result::Result<client::TlsStream<TcpStream>, HandshakeFailure> {
  let server_name = ServerName::try_from(host.to_string()).map_err(|e| HandshakeFailure {
    host: host.to_string(),
    port,
    kind: TlsFailureKind::Protocol,
    message: e.to_string(),
  })?;
  TlsConnector::from(config)
    .connect(server_name, socket)
    .await
    .map_err(|e| HandshakeFailure::new(host, port, &e))
}

/// ALPN offered to the browser when the destination handshake failed.
///
/// The destination's protocol if the browser offered it, else `http/1.1` if offered,
/// else the browser's first choice.
pub(crate) fn fallback_alpn(offered: &[String], negotiated: Option<&str>) -> Option<String> {
  if let Some(protocol) = negotiated.filter(|p| offered.iter().any(|o| o == p)) {
    return Some(protocol.to_string());
  }
  if offered.iter().any(|o| o == HTTP_1_1) {
    return Some(HTTP_1_1.to_string());
  }
  offered.first().cloned()
}

/// Both live sessions of a bridged connection.
struct BridgeState {
  inbound: server::TlsStream<DuplexStream>,
  outbound: client::TlsStream<TcpStream>,
  negotiated_alpn: Option<Vec<u8>>,
}

enum SpliceEnd {
  Closed,
  Failed(std::io::Error),
  /// The destination rejected our certificate after the handshake (TLS 1.3).
  Rejected {
    failure: HandshakeFailure,
    replay: Vec<u8>,
  },
}

impl BridgeState {
  async fn splice(self, host: &str, port: u16) -> Result<()> {
    let alpn = self.negotiated_alpn;
    let (mut in_rd, mut in_wr) = tokio::io::split(self.inbound);
    let (mut out_rd, mut out_wr) = tokio::io::split(self.outbound);
    let mut in_buf = vec![0u8; COPY_BUF_LEN];
    let mut out_buf = vec![0u8; COPY_BUF_LEN];
    let mut replay = Some(Vec::new());
    let mut inbound_open = true;
    let mut write_error = None;

    let end = loop {
      tokio::select! {
        read = in_rd.read(&mut in_buf), if inbound_open => match read {
          Ok(0) => break SpliceEnd::Closed,
          Ok(n) => {
            if let Some(buffered) = replay.as_mut() {
              if buffered.len() + n <= REPLAY_LIMIT {
                buffered.extend_from_slice(&in_buf[..n]);
              } else {
                replay = None;
              }
            }
            if let Err(e) = write_flush(&mut out_wr, &in_buf[..n]).await {
              // the read side reports why the destination went away
              write_error = Some(e);
              inbound_open = false;
            }
          }
          Err(e) if e.kind() == ErrorKind::UnexpectedEof => break SpliceEnd::Closed,
          Err(e) => break SpliceEnd::Failed(e),
        },
        read = out_rd.read(&mut out_buf) => match read {
          Ok(0) => break write_error.take().map_or(SpliceEnd::Closed, SpliceEnd::Failed),
          Ok(n) => {
            replay = None;
            if let Err(e) = write_flush(&mut in_wr, &out_buf[..n]).await {
              break SpliceEnd::Failed(e);
            }
          }
          Err(e) if e.kind() == ErrorKind::UnexpectedEof => break SpliceEnd::Closed,
          Err(e) => {
            let certificate = TlsFailureKind::classify(&e) == TlsFailureKind::Certificate;
            match replay.take() {
              Some(replay) if certificate => {
                break SpliceEnd::Rejected {
                  failure: HandshakeFailure::new(host, port, &e),
                  replay,
                }
              }
              _ => break SpliceEnd::Failed(e),
            }
          }
        },
      }
    };

    let _ = out_wr.shutdown().await;
    match end {
      SpliceEnd::Closed => {
        let _ = in_wr.shutdown().await;
        Ok(())
      }
      SpliceEnd::Failed(e) => {
        let _ = in_wr.shutdown().await;
        Err(e.into())
      }
      SpliceEnd::Rejected { failure, replay } => {
        tracing::warn!(%host, port, "destination rejected client certificate: {}", failure.message);
        let inbound = Rewind::new(Bytes::from(replay), in_rd.unsplit(in_wr));
        respond_with_error(inbound, alpn.as_deref(), &failure).await
      }
    }
  }
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
  writer.write_all(data).await?;
  writer.flush().await
}

/// Escape text for an HTML body; newlines become `<br>`.
pub(crate) fn escape_html(text: &str) -> String {
  let mut escaped = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '&' => escaped.push_str("&amp;"),
      '<' => escaped.push_str("&lt;"),
      '>' => escaped.push_str("&gt;"),
      '"' => escaped.push_str("&quot;"),
      '\'' => escaped.push_str("&#39;"),
      '\n' => escaped.push_str("<br>"),
      '\r' => {}
      c => escaped.push(c),
    }
  }
  escaped
}

pub(crate) fn error_body(failure: &HandshakeFailure) -> String {
  format!("Client certificate error: {}", escape_html(&failure.message))
}

/// Answer the browser with a 503 page over whichever protocol it negotiated, then close.
async fn respond_with_error<S>(io: S, alpn: Option<&[u8]>, failure: &HandshakeFailure) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let body = error_body(failure);
  if alpn == Some(H2) {
    respond_h2(io, body).await
  } else {
    respond_http1(io, body).await
  }
}

async fn respond_http1<S>(mut io: S, body: String) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let head = format!(
    "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    body.len()
  );
  io.write_all(head.as_bytes()).await?;
  io.write_all(body.as_bytes()).await?;
  io.flush().await?;
  io.shutdown().await?;
  Ok(())
}

async fn respond_h2<S>(io: S, body: String) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut connection = h2::server::handshake(io).await?;
  if let Some(request) = connection.accept().await {
    let (_request, mut respond) = request?;
    let response = http::Response::builder()
      .status(http::StatusCode::SERVICE_UNAVAILABLE)
      .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
      .header(http::header::CONTENT_LENGTH, body.len())
      .body(())?;
    let mut send = respond.send_response(response, false)?;
    send.send_data(Bytes::from(body), true)?;
  }
  connection.graceful_shutdown();
  while let Some(request) = connection.accept().await {
    let (_request, mut respond) = request?;
    respond.send_reset(h2::Reason::REFUSED_STREAM);
  }
  Ok(())
}

/// Stream that yields `prefix` before reading from `inner`.
struct Rewind<T> {
  prefix: Bytes,
  inner: T,
}

impl<T> Rewind<T> {
  fn new(prefix: Bytes, inner: T) -> Self {
    Self { prefix, inner }
  }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = self.prefix.len().min(buf.remaining());
      let chunk = self.prefix.split_to(n);
      buf.put_slice(&chunk);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
