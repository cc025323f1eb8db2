//! SNI extraction from a buffered TLS ClientHello.
//!
//! This is a targeted scan, not a TLS parser: it walks the first handshake
//! record far enough to find the server_name extension and stops. Every
//! length field is bounds-checked; any over-read is an error. The peeked
//! bytes are preserved and replayed by [`PrefixedStream`] so the downstream
//! consumer sees a byte-identical handshake.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Peek window: one maximum-size TLS record.
pub const MAX_PEEK: usize = 16 * 1024;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum SniError {
    #[error("not a TLS handshake record")]
    NotHandshake,
    #[error("not a ClientHello")]
    NotClientHello,
    #[error("truncated ClientHello")]
    Truncated,
    #[error("no server_name in ClientHello")]
    NoServerName,
    #[error("ClientHello exceeds the {MAX_PEEK}-byte peek window")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read from `stream` until the first record's ClientHello can be scanned,
/// and return the extracted SNI hostname together with every byte consumed.
///
/// The caller applies the peek deadline; on any error the stream must be
/// closed without contacting a backend.
pub async fn peek_sni<S>(stream: &mut S) -> Result<(String, Bytes), SniError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(name) = scan_client_hello(&buf)? {
            return Ok((name, buf.freeze()));
        }
        if buf.len() >= MAX_PEEK {
            return Err(SniError::TooLarge);
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            // Peer hung up mid-record.
            return Err(SniError::Truncated);
        }
    }
}

/// Scan an accumulating buffer. `Ok(None)` means the first record has not
/// fully arrived yet; every malformation is a hard error.
fn scan_client_hello(buf: &[u8]) -> Result<Option<String>, SniError> {
    if buf.len() < 5 {
        if !buf.is_empty() && buf[0] != RECORD_HANDSHAKE {
            return Err(SniError::NotHandshake);
        }
        return Ok(None);
    }
    if buf[0] != RECORD_HANDSHAKE {
        return Err(SniError::NotHandshake);
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if 5 + record_len > MAX_PEEK {
        return Err(SniError::TooLarge);
    }
    if buf.len() < 5 + record_len {
        return Ok(None);
    }

    // The full first record is in hand; from here every overrun is a
    // malformed hello, not a short read.
    let mut rec = Cursor::new(&buf[5..5 + record_len]);

    if rec.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }
    let hs_len = rec.u24()?;
    let mut hello = Cursor::new(rec.take(hs_len)?);

    hello.take(2)?; // legacy_version
    hello.take(32)?; // random
    let session_id_len = hello.u8()? as usize;
    hello.take(session_id_len)?;
    let cipher_len = hello.u16()? as usize;
    hello.take(cipher_len)?;
    let compression_len = hello.u8()? as usize;
    hello.take(compression_len)?;

    if hello.remaining() == 0 {
        // Legal pre-extension ClientHello; it just cannot name a host.
        return Err(SniError::NoServerName);
    }
    let ext_total = hello.u16()? as usize;
    let mut exts = Cursor::new(hello.take(ext_total)?);

    while exts.remaining() > 0 {
        let ext_type = exts.u16()?;
        let ext_len = exts.u16()? as usize;
        let ext_data = exts.take(ext_len)?;
        if ext_type != EXT_SERVER_NAME {
            continue;
        }
        let mut names = Cursor::new(ext_data);
        let list_len = names.u16()? as usize;
        let mut list = Cursor::new(names.take(list_len)?);
        while list.remaining() > 0 {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == NAME_TYPE_HOST {
                return match std::str::from_utf8(name) {
                    Ok(s) if !s.is_empty() => Ok(Some(s.to_string())),
                    _ => Err(SniError::NoServerName),
                };
            }
        }
        return Err(SniError::NoServerName);
    }

    Err(SniError::NoServerName)
}

/// Bounds-checked reader over a byte slice. Any read past the end is a
/// truncation error.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if self.remaining() < n {
            return Err(SniError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, SniError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

/// A stream that serves previously peeked bytes before reading the inner
/// stream again; writes pass straight through.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
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

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
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

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Build a minimal but structurally valid ClientHello record carrying
    /// the given SNI (or none).
    pub(crate) fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let mut server_name = Vec::new();
            server_name.extend_from_slice(&((name.len() as u16 + 3).to_be_bytes())); // list len
            server_name.push(NAME_TYPE_HOST);
            server_name.extend_from_slice(&(name.len() as u16).to_be_bytes());
            server_name.extend_from_slice(name.as_bytes());

            extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&server_name);
        }
        // An unrelated extension (supported_versions-ish) after server_name.
        extensions.extend_from_slice(&0x002bu16.to_be_bytes());
        extensions.extend_from_slice(&3u16.to_be_bytes());
        extensions.extend_from_slice(&[0x02, 0x03, 0x04]);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // u24
        handshake.extend_from_slice(&body);

        let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[tokio::test]
    async fn extracts_sni_from_valid_hello() {
        let hello = client_hello(Some("api.alice.example.id"));
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&hello).await.unwrap();

        let (name, peeked) = peek_sni(&mut rx).await.unwrap();
        assert_eq!(name, "api.alice.example.id");
        assert_eq!(&peeked[..], &hello[..]);
    }

    #[tokio::test]
    async fn hello_split_across_segments_is_reassembled() {
        let hello = client_hello(Some("a.example"));
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let mid = hello.len() / 2;

        let first = hello[..mid].to_vec();
        let second = hello[mid..].to_vec();
        let writer = tokio::spawn(async move {
            tx.write_all(&first).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            tx.write_all(&second).await.unwrap();
            tx
        });

        let (name, peeked) = peek_sni(&mut rx).await.unwrap();
        assert_eq!(name, "a.example");
        assert_eq!(peeked.len(), hello.len());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn non_handshake_record_is_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        assert!(matches!(peek_sni(&mut rx).await, Err(SniError::NotHandshake)));
    }

    #[tokio::test]
    async fn missing_sni_extension_is_rejected() {
        let hello = client_hello(None);
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&hello).await.unwrap();
        assert!(matches!(peek_sni(&mut rx).await, Err(SniError::NoServerName)));
    }

    #[tokio::test]
    async fn truncated_hello_is_rejected_on_eof() {
        let hello = client_hello(Some("a.example"));
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&hello[..hello.len() / 2]).await.unwrap();
        drop(tx);
        assert!(matches!(peek_sni(&mut rx).await, Err(SniError::Truncated)));
    }

    #[tokio::test]
    async fn record_with_corrupt_inner_lengths_is_rejected() {
        let mut hello = client_hello(Some("a.example"));
        // Blow up the cipher-suite length field (offset: 5 record + 4
        // handshake header + 2 version + 32 random + 1 session id).
        hello[44] = 0xff;
        hello[45] = 0xff;
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&hello).await.unwrap();
        assert!(matches!(peek_sni(&mut rx).await, Err(SniError::Truncated)));
    }

    #[tokio::test]
    async fn prefixed_stream_replays_peeked_bytes_exactly() {
        let hello = client_hello(Some("a.example"));
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&hello).await.unwrap();
        tx.write_all(b"tail-bytes").await.unwrap();

        let (_, peeked) = peek_sni(&mut rx).await.unwrap();
        let mut replayed = PrefixedStream::new(peeked, rx);

        let mut out = vec![0u8; hello.len() + b"tail-bytes".len()];
        replayed.read_exact(&mut out).await.unwrap();
        assert_eq!(&out[..hello.len()], &hello[..]);
        assert_eq!(&out[hello.len()..], b"tail-bytes");
    }
}
