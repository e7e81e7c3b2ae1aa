//! TLS ClientHello inspection.
//!
//! Only the ALPN extension is recovered. The parser works on the raw bytes of the
//! first record sent by the browser and never fails: anything it does not
//! understand, including truncated input, yields `None`.
//!
//! ```text
//!   [0]       content_type (0x16 handshake)
//!   [1..3]    record version
//!   [3..5]    record length
//!   [5]       handshake_type (0x01 client_hello)
//!   [6..9]    handshake length
//!   [9..11]   client_version
//!   [11..43]  random
//!   [43]      session_id_length
//!   ...       session_id
//!   ...       cipher_suites_length (2 bytes) + cipher_suites
//!   ...       compression_methods_length (1 byte) + compression_methods
//!   ...       extensions_length (2 bytes) + extensions
//! ```

/// TLS record content type of a handshake message.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_ALPN: u16 = 0x0010;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const CLIENT_VERSION_LEN: usize = 2;
const RANDOM_LEN: usize = 32;

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
  data: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  fn new(data: &'a [u8]) -> Self {
    Self { data, pos: 0 }
  }

  fn skip(&mut self, n: usize) -> Option<()> {
    let end = self.pos.checked_add(n)?;
    if end > self.data.len() {
      return None;
    }
    self.pos = end;
    Some(())
  }

  fn take(&mut self, n: usize) -> Option<&'a [u8]> {
    let start = self.pos;
    self.skip(n)?;
    self.data.get(start..self.pos)
  }

  fn u8(&mut self) -> Option<u8> {
    self.take(1).map(|b| b[0])
  }

  fn u16(&mut self) -> Option<u16> {
    self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
  }
}

/// Return the ALPN protocols offered by a TLS ClientHello.
///
/// `None` means the bytes are not a ClientHello, are truncated, or carry no
/// (or an empty) ALPN extension.
///
/// ```
/// assert_eq!(certproxy::client_hello::parse_alpn(b"GET / HTTP/1.1\r\n"), None);
/// ```
pub fn parse_alpn(data: &[u8]) -> Option<Vec<String>> {
  if data.len() < 6 || data[0] != CONTENT_TYPE_HANDSHAKE {
    return None;
  }
  let mut reader = Reader::new(data);
  reader.skip(RECORD_HEADER_LEN)?;
  if reader.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
    return None;
  }
  // handshake length (3 bytes left of the 4 byte header)
  reader.skip(HANDSHAKE_HEADER_LEN - 1)?;
  reader.skip(CLIENT_VERSION_LEN + RANDOM_LEN)?;

  let session_id_len = reader.u8()? as usize;
  reader.skip(session_id_len)?;
  let cipher_suites_len = reader.u16()? as usize;
  reader.skip(cipher_suites_len)?;
  let compression_len = reader.u8()? as usize;
  reader.skip(compression_len)?;

  let extensions_len = reader.u16()? as usize;
  let mut extensions = Reader::new(reader.take(extensions_len)?);
  while extensions.pos < extensions.data.len() {
    let ext_type = extensions.u16()?;
    let ext_len = extensions.u16()? as usize;
    let payload = extensions.take(ext_len)?;
    if ext_type == EXTENSION_ALPN {
      return parse_alpn_extension(payload);
    }
  }
  None
}

fn parse_alpn_extension(payload: &[u8]) -> Option<Vec<String>> {
  let mut reader = Reader::new(payload);
  let list_len = reader.u16()? as usize;
  let mut list = Reader::new(reader.take(list_len)?);
  let mut protocols = Vec::new();
  while list.pos < list.data.len() {
    let len = list.u8()? as usize;
    let name = list.take(len)?;
    protocols.push(String::from_utf8_lossy(name).into_owned());
  }
  if protocols.is_empty() {
    None
  } else {
    Some(protocols)
  }
}

/// Serialize a minimal ClientHello record offering `alpn`; used by tests and fuzz seeds.
#[doc(hidden)]
pub fn build_client_hello(alpn: Option<&[&str]>) -> Vec<u8> {
  let mut extensions = Vec::new();
  // server_name extension, empty, so ALPN is not the first extension
  extensions.extend_from_slice(&0x0000u16.to_be_bytes());
  extensions.extend_from_slice(&0x0000u16.to_be_bytes());
  if let Some(protocols) = alpn {
    let mut list = Vec::new();
    for protocol in protocols {
      list.push(protocol.len() as u8);
      list.extend_from_slice(protocol.as_bytes());
    }
    extensions.extend_from_slice(&EXTENSION_ALPN.to_be_bytes());
    extensions.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
    extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&list);
  }

  let mut body = vec![0x03, 0x03];
  body.extend_from_slice(&[0x42; RANDOM_LEN]);
  body.push(0x00);
  let cipher_suites: [u16; 3] = [0x1301, 0x1302, 0xc02f];
  body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
  for suite in cipher_suites {
    body.extend_from_slice(&suite.to_be_bytes());
  }
  body.extend_from_slice(&[0x01, 0x00]);
  body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
  body.extend_from_slice(&extensions);

  let mut handshake = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
  handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
  handshake.extend_from_slice(&body);

  let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
  record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
  record.extend_from_slice(&handshake);
  record
}
