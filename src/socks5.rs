//! Loopback SOCKS5 front end.
//!
//! Every accepted browser connection becomes a uid. Its CONNECT request, payload and
//! close are published as [`SocksEvent`]s; the proxy's [`ConnectionEvent`]s are routed
//! back to the browser socket by uid.
use crate::errors::{Error, ErrorCode, Result};
use crate::events::{ConnectionEvent, EventReceiver, SocksEvent, Uid};
use crate::upstream::{consts, read_address, TargetAddr};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const SESSION_BUF_LEN: usize = 16 * 1024;

type Route = (Uid, mpsc::UnboundedSender<ConnectionEvent>);

pub(crate) struct Socks5Server {
  listener: TcpListener,
  requests: mpsc::UnboundedSender<SocksEvent>,
}

impl Socks5Server {
  /// Bind on an ephemeral loopback port.
  pub(crate) async fn bind(requests: mpsc::UnboundedSender<SocksEvent>) -> Result<Self> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(Self { listener, requests })
  }

  pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept browsers until the future is dropped; dropping it aborts every session.
  pub(crate) async fn run(self, events: EventReceiver) {
    let (routes, registrations) = mpsc::unbounded_channel();
    let mut sessions = JoinSet::new();
    sessions.spawn(route(registrations, events));
    let mut next_uid: u64 = 0;
    loop {
      tokio::select! {
        accepted = self.listener.accept() => match accepted {
          Ok((stream, peer)) => {
            next_uid += 1;
            let uid = next_uid.to_string();
            let _ = stream.set_nodelay(true);
            let requests = self.requests.clone();
            let routes = routes.clone();
            sessions.spawn(async move {
              if let Err(e) = session(stream, uid.clone(), requests, routes).await {
                tracing::debug!(%uid, %peer, "SOCKS session ended: {}", e);
              }
            });
          }
          Err(e) => tracing::error!("failed to accept SOCKS connection: {}", e),
        },
        Some(_) = sessions.join_next() => {}
      }
    }
  }
}

/// Deliver proxy events to the session owning the uid.
async fn route(mut registrations: mpsc::UnboundedReceiver<Route>, mut events: EventReceiver) {
  let mut routes: HashMap<Uid, mpsc::UnboundedSender<ConnectionEvent>> = HashMap::new();
  loop {
    tokio::select! {
      // a session registers before its request is published
      biased;
      Some((uid, tx)) = registrations.recv() => {
        routes.insert(uid, tx);
      }
      event = events.recv() => {
        let Some(event) = event else { break };
        let uid = event.uid().to_string();
        let last = matches!(event, ConnectionEvent::End { .. } | ConnectionEvent::Failed { .. });
        let delivered = routes.get(&uid).is_some_and(|tx| tx.send(event).is_ok());
        if last || !delivered {
          routes.remove(&uid);
        }
      }
    }
  }
}

async fn session<S>(
  mut stream: S,
  uid: Uid,
  requests: mpsc::UnboundedSender<SocksEvent>,
  routes: mpsc::UnboundedSender<Route>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let target = handshake(&mut stream).await?;
  tracing::debug!(%uid, host = %target.host(), port = target.port(), "SOCKS CONNECT");
  let (tx, mut rx) = mpsc::unbounded_channel();
  routes
    .send((uid.clone(), tx))
    .map_err(|_| Error::proxy_error("proxy is closed"))?;
  requests
    .send(SocksEvent::Requested {
      uid: uid.clone(),
      host: target.host(),
      port: target.port(),
    })
    .map_err(|_| Error::proxy_error("proxy is closed"))?;
  let result = attach(&mut stream, &uid, &requests, &mut rx).await;
  let _ = requests.send(SocksEvent::Closed { uid });
  result
}

/// Answer the CONNECT request from the first proxy event, then shuttle bytes.
async fn attach<S>(
  stream: &mut S,
  uid: &str,
  requests: &mpsc::UnboundedSender<SocksEvent>,
  events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  match events.recv().await {
    Some(ConnectionEvent::Connected { host, port, .. }) => {
      let ip = host.parse::<IpAddr>().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
      let reply = TargetAddr::Ip(SocketAddr::new(ip, port)).to_be_bytes(consts::SOCKS5_REPLY_SUCCEEDED)?;
      stream.write_all(&reply).await?;
    }
    Some(ConnectionEvent::Failed { code, .. }) => {
      send_reply(stream, reply_code(code)).await?;
      return Ok(());
    }
    _ => {
      send_reply(stream, consts::SOCKS5_REPLY_GENERAL_FAILURE).await?;
      return Ok(());
    }
  }

  let mut buf = vec![0u8; SESSION_BUF_LEN];
  loop {
    tokio::select! {
      read = stream.read(&mut buf) => match read? {
        0 => break,
        n => requests
          .send(SocksEvent::Data {
            uid: uid.to_string(),
            data: Bytes::copy_from_slice(&buf[..n]),
          })
          .map_err(|_| Error::proxy_error("proxy is closed"))?,
      },
      event = events.recv() => match event {
        Some(ConnectionEvent::Data { data, .. }) => stream.write_all(&data).await?,
        Some(ConnectionEvent::Error { message, .. }) => {
          tracing::debug!(%uid, "connection error: {}", message);
        }
        Some(ConnectionEvent::End { .. }) | None => break,
        Some(_) => {}
      },
    }
  }
  stream.shutdown().await?;
  Ok(())
}

/// Server side of the SOCKS5 greeting and CONNECT request (no authentication).
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<TargetAddr>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let version = stream.read_u8().await?;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::proxy_error(format!(
      "unsupported SOCKS version: {}",
      version
    )));
  }
  let nmethods = stream.read_u8().await?;
  let mut methods = vec![0u8; nmethods as usize];
  stream.read_exact(&mut methods).await?;
  let selected = if methods.contains(&consts::SOCKS5_AUTH_METHOD_NONE) {
    consts::SOCKS5_AUTH_METHOD_NONE
  } else {
    consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE
  };
  stream.write_all(&[consts::SOCKS5_VERSION, selected]).await?;
  if selected == consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE {
    return Err(Error::proxy_error("no acceptable authentication method"));
  }

  let mut head = [0u8; 4];
  stream.read_exact(&mut head).await?;
  let [version, cmd, _reserved, addr_type] = head;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::proxy_error(format!(
      "invalid SOCKS version in request: {}",
      version
    )));
  }
  if cmd != consts::SOCKS5_CMD_TCP_CONNECT {
    send_reply(stream, consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED).await?;
    return Err(Error::proxy_error(format!("unsupported command: {}", cmd)));
  }
  match read_address(stream, addr_type).await {
    Ok(target) => Ok(target),
    Err(e) => {
      send_reply(stream, consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
      Err(e)
    }
  }
}

async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: u8) -> Result<()> {
  let unbound = TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
  stream.write_all(&unbound.to_be_bytes(reply)?).await?;
  Ok(())
}

/// SOCKS5 reply code for a failed outbound connect.
pub(crate) fn reply_code(code: ErrorCode) -> u8 {
  match code {
    ErrorCode::ConnectionRefused => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
    ErrorCode::HostUnreachable | ErrorCode::NotFound => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
    ErrorCode::NetworkUnreachable => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
    ErrorCode::TimedOut => consts::SOCKS5_REPLY_TTL_EXPIRED,
    _ => consts::SOCKS5_REPLY_GENERAL_FAILURE,
  }
}
