#![no_main]

use certproxy::client_hello::parse_alpn;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
  if let Some(protocols) = parse_alpn(data) {
    assert!(!protocols.is_empty());
  }

  // the same bytes behind a ClientHello record header
  if data.len() < 4096 {
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(data.len() as u16).to_be_bytes());
    record.extend_from_slice(data);
    let _ = parse_alpn(&record);
  }
});
