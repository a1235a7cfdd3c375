//! Protocol detection on the first four bytes of a connection
//!
//! Only four HTTP method prefixes are recognised; everything else is assumed
//! to be an obfuscated MTProto handshake.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes needed before a decision is made
pub const SNIFF_LEN: usize = 4;

const HTTP_POST: u32 = 0x504f_5354;
const HTTP_GET: u32 = 0x4745_5420;
const HTTP_HEAD: u32 = 0x4845_4144;
const HTTP_OPTIONS: u32 = 0x4f50_5449;

/// Detected protocol of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Plain HTTP request, tunneled raw to the backend
    Http,
    /// Obfuscated2 handshake
    Obfuscated,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Obfuscated => write!(f, "obfuscated2"),
        }
    }
}

/// Classify a connection from its first bytes without consuming them
///
/// Returns `None` while fewer than [`SNIFF_LEN`] bytes are available.
pub fn classify(buf: &[u8]) -> Option<Protocol> {
    if buf.len() < SNIFF_LEN {
        return None;
    }

    match u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) {
        HTTP_POST | HTTP_GET | HTTP_HEAD | HTTP_OPTIONS => Some(Protocol::Http),
        _ => Some(Protocol::Obfuscated),
    }
}

/// Read from `stream` into `buf` until the protocol can be classified
///
/// Bytes stay in `buf` for the next stage. Returns `Ok(None)` when the peer
/// closes before four bytes arrive.
pub async fn sniff<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    read_size: usize,
) -> std::io::Result<Option<Protocol>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(protocol) = classify(buf) {
            return Ok(Some(protocol));
        }

        buf.reserve(read_size.max(SNIFF_LEN));
        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_classify_http_methods() {
        for request in [
            &b"POST /api HTTP/1.1\r\n"[..],
            b"GET / HTTP/1.1\r\n",
            b"HEAD / HTTP/1.0\r\n",
            b"OPTIONS * HTTP/1.1\r\n",
        ] {
            assert_eq!(classify(request), Some(Protocol::Http));
        }
    }

    #[test]
    fn test_classify_other_prefixes_as_obfuscated() {
        for prefix in [
            &b"PUT "[..],
            b"GETX",
            b"get ",
            b"post",
            b"\xef\xef\xef\xef",
            b"\x00\x00\x00\x00",
        ] {
            assert_eq!(classify(prefix), Some(Protocol::Obfuscated));
        }
    }

    #[test]
    fn test_classify_needs_four_bytes() {
        assert_eq!(classify(b""), None);
        assert_eq!(classify(b"POS"), None);
        assert_eq!(classify(b"POST"), Some(Protocol::Http));
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Http.to_string(), "http");
        assert_eq!(Protocol::Obfuscated.to_string(), "obfuscated2");
    }

    #[tokio::test]
    async fn test_sniff_waits_for_split_prefix() {
        let (mut near, mut far) = tokio::io::duplex(64);
        tokio::spawn(async move {
            far.write_all(b"PO").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            far.write_all(b"ST /x").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let mut buf = BytesMut::new();
        let protocol = sniff(&mut near, &mut buf, 16).await.unwrap();
        assert_eq!(protocol, Some(Protocol::Http));
        // Nothing consumed
        assert!(buf.starts_with(b"POST"));
    }

    #[tokio::test]
    async fn test_sniff_early_close() {
        let (mut near, mut far) = tokio::io::duplex(64);
        far.write_all(b"GE").await.unwrap();
        drop(far);

        let mut buf = BytesMut::new();
        assert_eq!(sniff(&mut near, &mut buf, 16).await.unwrap(), None);
        assert_eq!(&buf[..], b"GE");
    }

    #[tokio::test]
    async fn test_sniff_uses_existing_bytes() {
        let (mut near, _far) = tokio::io::duplex(64);
        let mut buf = BytesMut::from(&b"HEAD"[..]);
        assert_eq!(
            sniff(&mut near, &mut buf, 16).await.unwrap(),
            Some(Protocol::Http)
        );
    }
}
