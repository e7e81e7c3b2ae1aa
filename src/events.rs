//! Events exchanged with the SOCKS-facing server, keyed by connection uid.
use crate::errors::ErrorCode;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Identifier correlating all events of one forwarded connection.
pub type Uid = String;

/// Events produced by the SOCKS server and consumed by the proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum SocksEvent {
  /// The browser asked for a connection to `host:port`.
  Requested {
    /// connection id
    uid: Uid,
    /// destination host
    host: String,
    /// destination port
    port: u16,
  },
  /// Bytes sent by the browser.
  Data {
    /// connection id
    uid: Uid,
    /// payload
    data: Bytes,
  },
  /// The browser side went away.
  Closed {
    /// connection id
    uid: Uid,
  },
}

impl SocksEvent {
  /// uid the event belongs to
  pub fn uid(&self) -> &str {
    match self {
      SocksEvent::Requested { uid, .. } | SocksEvent::Data { uid, .. } | SocksEvent::Closed { uid } => {
        uid
      }
    }
  }
}

/// Events produced by the proxy for the SOCKS server.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
  /// Outbound connection established from `host:port`.
  Connected {
    /// connection id
    uid: Uid,
    /// local address of the outbound socket
    host: String,
    /// local port of the outbound socket
    port: u16,
  },
  /// Bytes for the browser.
  Data {
    /// connection id
    uid: Uid,
    /// payload
    data: Bytes,
  },
  /// The connection broke after being established.
  Error {
    /// connection id
    uid: Uid,
    /// human readable cause
    message: String,
  },
  /// The connection finished; no more events follow for this uid.
  End {
    /// connection id
    uid: Uid,
  },
  /// The outbound connection could not be established at all.
  Failed {
    /// connection id
    uid: Uid,
    /// errno-style cause
    code: ErrorCode,
  },
}

impl ConnectionEvent {
  /// uid the event belongs to
  pub fn uid(&self) -> &str {
    match self {
      ConnectionEvent::Connected { uid, .. }
      | ConnectionEvent::Data { uid, .. }
      | ConnectionEvent::Error { uid, .. }
      | ConnectionEvent::End { uid }
      | ConnectionEvent::Failed { uid, .. } => uid,
    }
  }
}

/// Sending half of the proxy's outgoing event stream.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;
/// Receiving half of the proxy's outgoing event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Per-connection handle for emitting events.
///
/// Sends never fail: when the consumer is gone the events are dropped.
#[derive(Clone, Debug)]
pub(crate) struct Emitter {
  uid: Uid,
  tx: EventSender,
}

impl Emitter {
  pub(crate) fn new(uid: Uid, tx: EventSender) -> Self {
    Self { uid, tx }
  }

  pub(crate) fn uid(&self) -> &str {
    &self.uid
  }

  fn send(&self, event: ConnectionEvent) {
    if self.tx.send(event).is_err() {
      tracing::trace!(uid = %self.uid, "event consumer gone");
    }
  }

  pub(crate) fn connected(&self, host: String, port: u16) {
    self.send(ConnectionEvent::Connected {
      uid: self.uid.clone(),
      host,
      port,
    });
  }

  pub(crate) fn data(&self, data: Bytes) {
    self.send(ConnectionEvent::Data {
      uid: self.uid.clone(),
      data,
    });
  }

  pub(crate) fn error(&self, message: impl Into<String>) {
    self.send(ConnectionEvent::Error {
      uid: self.uid.clone(),
      message: message.into(),
    });
  }

  pub(crate) fn end(&self) {
    self.send(ConnectionEvent::End {
      uid: self.uid.clone(),
    });
  }

  pub(crate) fn failed(&self, code: ErrorCode) {
    self.send(ConnectionEvent::Failed {
      uid: self.uid.clone(),
      code,
    });
  }
}
