//! One forwarded browser connection, from `requested` to `end`.
//!
//! ```text
//! Connecting ──ok──▶ Sniffing ──0x16──▶ TlsBridging ──▶ Closed
//!     │                 └──other──▶ RawRelay ─────────▶ Closed
//!     └──err (failed)──────────────────────────────────▶ Closed
//! ```
use crate::bridge;
use crate::client_hello::CONTENT_TYPE_HANDSHAKE;
use crate::connector::Connector;
use crate::errors::ErrorCode;
use crate::events::{Emitter, Uid};
use crate::tls::SecureContextCache;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

const RELAY_BUF_LEN: usize = 16 * 1024;

/// Protocol spoken by the browser, decided from its first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  /// TLS handshake record; the connection gets bridged.
  Tls,
  /// Anything else is relayed verbatim.
  Raw,
}

/// Classify the first browser frame.
pub fn detect_protocol(first: &[u8]) -> Protocol {
  match first.first() {
    Some(&CONTENT_TYPE_HANDSHAKE) => Protocol::Tls,
    _ => Protocol::Raw,
  }
}

/// Resolves once the connection's uid is closed, or its table is gone.
pub(crate) async fn wait_closed(signal: &mut watch::Receiver<bool>) {
  let _ = signal.wait_for(|closed| *closed).await;
}

/// Read-only state shared by every connection of a proxy.
#[derive(Debug)]
pub(crate) struct Shared {
  pub(crate) cache: Arc<SecureContextCache>,
  pub(crate) connector: Connector,
}

enum Phase {
  Connecting,
  Sniffing(TcpStream),
  RawRelay { socket: TcpStream, first: Bytes },
  TlsBridging { socket: TcpStream, client_hello: Bytes },
  Closed,
}

pub(crate) struct LogicalConnection {
  emitter: Emitter,
  host: String,
  port: u16,
  inbox: mpsc::UnboundedReceiver<Bytes>,
  /// Flipped by the table on `closed`.
  closed: watch::Receiver<bool>,
  shared: Arc<Shared>,
}

impl LogicalConnection {
  pub(crate) fn new(
    uid: Uid,
    host: String,
    port: u16,
    events: crate::events::EventSender,
    inbox: mpsc::UnboundedReceiver<Bytes>,
    closed: watch::Receiver<bool>,
    shared: Arc<Shared>,
  ) -> Self {
    Self {
      emitter: Emitter::new(uid, events),
      host,
      port,
      inbox,
      closed,
      shared,
    }
  }

  pub(crate) async fn run(mut self) {
    let mut phase = Phase::Connecting;
    loop {
      phase = match phase {
        Phase::Connecting => self.connect().await,
        Phase::Sniffing(socket) => self.sniff(socket).await,
        Phase::RawRelay { socket, first } => {
          tracing::debug!(uid = self.emitter.uid(), host = %self.host, port = self.port, "raw relay");
          self.relay(socket, first).await;
          self.emitter.end();
          Phase::Closed
        }
        Phase::TlsBridging {
          socket,
          client_hello,
        } => {
          bridge::run(
            &self.emitter,
            &self.shared.cache,
            &self.host,
            self.port,
            socket,
            client_hello,
            self.inbox,
            self.closed,
          )
          .await;
          self.emitter.end();
          return;
        }
        Phase::Closed => return,
      }
    }
  }

  async fn connect(&self) -> Phase {
    let mut closed = self.closed.clone();
    let connected = tokio::select! {
      biased;
      _ = wait_closed(&mut closed) => {
        tracing::debug!(uid = self.emitter.uid(), "closed before connect finished");
        return Phase::Closed;
      }
      connected = self.shared.connector.connect(&self.host, self.port) => connected,
    };
    let socket = match connected {
      Ok(socket) => socket,
      Err(e) => {
        tracing::warn!(uid = self.emitter.uid(), host = %self.host, port = self.port, "connect failed: {}", e);
        self.emitter.failed(e.code());
        return Phase::Closed;
      }
    };
    match socket.local_addr() {
      Ok(local) => {
        self.emitter.connected(local.ip().to_string(), local.port());
        Phase::Sniffing(socket)
      }
      Err(e) => {
        self.emitter.failed(ErrorCode::from_io(&e));
        Phase::Closed
      }
    }
  }

  async fn sniff(&mut self, socket: TcpStream) -> Phase {
    let mut probe = [0u8; 1];
    loop {
      tokio::select! {
        frame = self.inbox.recv() => match frame {
          None => {
            self.emitter.end();
            return Phase::Closed;
          }
          Some(frame) if frame.is_empty() => continue,
          Some(frame) => {
            return match detect_protocol(&frame) {
              Protocol::Tls => Phase::TlsBridging { socket, client_hello: frame },
              Protocol::Raw => Phase::RawRelay { socket, first: frame },
            };
          }
        },
        // server speaks first, or went away before the browser said anything
        peeked = socket.peek(&mut probe) => match peeked {
          Ok(0) => {
            self.emitter.end();
            return Phase::Closed;
          }
          Ok(_) => return Phase::RawRelay { socket, first: Bytes::new() },
          Err(e) => {
            self.emitter.error(e.to_string());
            self.emitter.end();
            return Phase::Closed;
          }
        },
      }
    }
  }

  async fn relay(&mut self, socket: TcpStream, first: Bytes) {
    let (mut rd, mut wr) = socket.into_split();
    if let Err(e) = self.pipe(&mut rd, &mut wr, first).await {
      tracing::warn!(uid = self.emitter.uid(), host = %self.host, port = self.port, "relay failed: {}", e);
      self.emitter.error(e.to_string());
    }
    let _ = wr.shutdown().await;
  }

  async fn pipe(
    &mut self,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    first: Bytes,
  ) -> std::io::Result<()> {
    if !first.is_empty() {
      wr.write_all(&first).await?;
    }
    let mut buf = vec![0u8; RELAY_BUF_LEN];
    loop {
      tokio::select! {
        frame = self.inbox.recv() => match frame {
          Some(frame) => wr.write_all(&frame).await?,
          None => return Ok(()),
        },
        read = rd.read(&mut buf) => match read? {
          0 => return Ok(()),
          n => self.emitter.data(Bytes::copy_from_slice(&buf[..n])),
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn first_byte_decides_protocol() {
    assert_eq!(detect_protocol(&[0x16, 0x03, 0x01]), Protocol::Tls);
    assert_eq!(detect_protocol(b"GET / HTTP/1.1\r\n"), Protocol::Raw);
    assert_eq!(detect_protocol(&[0x17, 0x03, 0x03]), Protocol::Raw);
    assert_eq!(detect_protocol(&[]), Protocol::Raw);
  }
}
