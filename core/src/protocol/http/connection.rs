/*
 * connection.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fetchpool, an HTTP request orchestration library.
 *
 * Fetchpool is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fetchpool is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fetchpool.  If not, see <http://www.gnu.org/licenses/>.
 */

//! HTTP connections: one TCP or TLS stream, established directly, through an
//! HTTP proxy, or through a CONNECT tunnel, plus the idle keep-alive pool.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as TokioTlsStream;
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Host, Url};

use crate::error::NetError;
use crate::net::{handshake_error, server_name};
use crate::protocol::http::h1::{H1ResponseHandler, ParseState, ResponseParser};
use crate::proxy::{ProxyScheme, ProxyServer};
use crate::timing::LoadTimingInfo;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_IDLE_PER_ORIGIN: usize = 6;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const READ_RESERVE: usize = 16 * 1024;

/// Unified stream: plain TCP or TLS. Implements AsyncRead + AsyncWrite.
pub(crate) enum HttpStream {
    Plain(TcpStream),
    Tls(Box<TokioTlsStream<TcpStream>>),
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Where a connection goes: the origin, the proxy in front of it, and the trust mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OriginKey {
    pub secure: bool,
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxyServer>,
    pub any_authority: bool,
}

impl OriginKey {
    pub fn new(url: &Url, proxy: Option<&ProxyServer>, any_authority: bool) -> Result<Self, NetError> {
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Err(NetError::InvalidUrl),
        };
        let host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(a)) => a.to_string(),
            Some(Host::Ipv6(a)) => a.to_string(),
            None => return Err(NetError::InvalidUrl),
        };
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        Ok(Self {
            secure,
            host,
            port,
            proxy: proxy.cloned(),
            any_authority,
        })
    }

    /// Plain HTTP through an HTTP proxy sends absolute-form targets.
    pub fn absolute_form(&self) -> bool {
        !self.secure && self.proxy.is_some()
    }

    /// `host:port` as written in a CONNECT request.
    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// An established connection with its read buffer.
pub(crate) struct Connection {
    stream: HttpStream,
    pub read_buf: BytesMut,
    pub socket_id: u32,
    pub negotiated_protocol: Option<String>,
    idle_since: Instant,
}

impl Connection {
    fn new(stream: HttpStream, socket_id: u32) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_RESERVE),
            socket_id,
            negotiated_protocol: None,
            idle_since: Instant::now(),
        }
    }

    /// Read more bytes into the buffer. Returns 0 at end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(READ_RESERVE);
        self.stream.read_buf(&mut self.read_buf).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    async fn into_tls(self, config: Arc<ClientConfig>, host: &str) -> Result<Self, NetError> {
        let name = server_name(host)?;
        let tcp = match self.stream {
            HttpStream::Plain(tcp) => tcp,
            HttpStream::Tls(_) => return Err(NetError::NotImplemented),
        };
        let tls = TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .map_err(|e| handshake_error(&e))?;
        let negotiated = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        let mut conn = Connection::new(HttpStream::Tls(Box::new(tls)), self.socket_id);
        conn.negotiated_protocol = negotiated;
        Ok(conn)
    }
}

/// Open a new connection for `key`, recording DNS, connect and TLS phases.
pub(crate) async fn connect(
    key: &OriginKey,
    tls: Arc<ClientConfig>,
    socket_id: u32,
    timing: &mut LoadTimingInfo,
) -> Result<Connection, NetError> {
    let (host, port) = match &key.proxy {
        Some(p) if p.scheme == ProxyScheme::Http => (p.host.as_str(), p.port),
        Some(p) => {
            debug!("[http] {:?} proxies are not supported", p.scheme);
            return Err(NetError::NotImplemented);
        }
        None => (key.host.as_str(), key.port),
    };

    timing.dns.begin();
    let addrs: Vec<SocketAddr> = lookup_host((host.trim_matches(|c| c == '[' || c == ']'), port))
        .await
        .map_err(|_| NetError::NameNotResolved)?
        .collect();
    timing.dns.finish();
    if addrs.is_empty() {
        return Err(NetError::NameNotResolved);
    }

    timing.connect.begin();
    let tcp = connect_any(&addrs).await?;
    let _ = tcp.set_nodelay(true);
    let mut conn = Connection::new(HttpStream::Plain(tcp), socket_id);
    if key.proxy.is_some() && key.secure {
        tunnel(&mut conn, key).await?;
    }
    if key.secure {
        timing.ssl.begin();
        conn = conn.into_tls(tls, &key.host).await?;
        timing.ssl.finish();
    }
    timing.connect.finish();
    debug!("[http] socket {} connected to {}", socket_id, key.authority());
    Ok(conn)
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, NetError> {
    let mut last = NetError::ConnectionRefused;
    for addr in addrs {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => return Ok(tcp),
            Ok(Err(e)) => last = NetError::from_io(&e),
            Err(_) => last = NetError::TimedOut,
        }
    }
    Err(last)
}

#[derive(Default)]
struct TunnelStatus {
    code: u16,
}

impl H1ResponseHandler for TunnelStatus {
    fn status(&mut self, _version: &str, code: u16, _reason: &str) {
        self.code = code;
    }
    fn header(&mut self, _name: &str, _value: &str) {}
    fn body_chunk(&mut self, _data: Bytes) {}
    fn complete(&mut self) {}
}

/// Ask the proxy to open a tunnel to the origin.
async fn tunnel(conn: &mut Connection, key: &OriginKey) -> Result<(), NetError> {
    let authority = key.authority();
    let head = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    conn.write_all(head.as_bytes()).await?;
    conn.flush().await?;

    let mut parser = ResponseParser::new();
    let mut status = TunnelStatus::default();
    loop {
        parser.receive(&mut conn.read_buf, &mut status)?;
        if parser.state() == ParseState::HeadersComplete {
            break;
        }
        if conn.fill().await? == 0 {
            return Err(NetError::TunnelConnectionFailed);
        }
    }
    if !(200..300).contains(&status.code) {
        debug!("[http] proxy refused tunnel to {}: {}", authority, status.code);
        return Err(NetError::TunnelConnectionFailed);
    }
    conn.read_buf.clear();
    Ok(())
}

/// Keep-alive connections waiting for reuse, keyed by origin.
#[derive(Default)]
pub(crate) struct IdleSockets {
    inner: Mutex<HashMap<OriginKey, Vec<Connection>>>,
}

impl IdleSockets {
    fn lock(&self) -> MutexGuard<'_, HashMap<OriginKey, Vec<Connection>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Most recently parked connection for `key` that has not idled out.
    pub fn take(&self, key: &OriginKey) -> Option<Connection> {
        let mut map = self.lock();
        let list = map.get_mut(key)?;
        list.retain(|c| c.idle_since.elapsed() < IDLE_TIMEOUT);
        let conn = list.pop();
        if list.is_empty() {
            map.remove(key);
        }
        conn
    }

    /// Park a connection. Dropped when the origin already has enough idle connections.
    pub fn put(&self, key: OriginKey, mut conn: Connection) {
        if !conn.read_buf.is_empty() {
            // Unsolicited bytes after a response; the connection is not reusable.
            return;
        }
        conn.idle_since = Instant::now();
        let mut map = self.lock();
        let list = map.entry(key).or_default();
        if list.len() < MAX_IDLE_PER_ORIGIN {
            list.push(conn);
        }
    }

    pub fn count(&self, key: &OriginKey) -> usize {
        self.lock().get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// Close every parked connection. Returns how many were closed.
    pub fn clear(&self) -> usize {
        let mut map = self.lock();
        let closed = map.values().map(|l| l.len()).sum();
        map.clear();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn key(url: &str) -> OriginKey {
        OriginKey::new(&Url::parse(url).unwrap(), None, false).unwrap()
    }

    #[test]
    fn origin_keys() {
        let k = key("https://example.com/x");
        assert!(k.secure);
        assert_eq!(k.port, 443);
        assert_eq!(k.authority(), "example.com:443");
        let k = key("http://[::1]:8080/");
        assert_eq!(k.host, "::1");
        assert_eq!(k.authority(), "[::1]:8080");
        assert!(!k.absolute_form());
        assert!(OriginKey::new(&Url::parse("ftp://h/").unwrap(), None, false).is_err());

        let proxy = ProxyServer::parse("p:3128", ProxyScheme::Http).unwrap();
        let k = OriginKey::new(&Url::parse("http://h/").unwrap(), Some(&proxy), false).unwrap();
        assert!(k.absolute_form());
        let k = OriginKey::new(&Url::parse("https://h/").unwrap(), Some(&proxy), false).unwrap();
        assert!(!k.absolute_form());
    }

    #[tokio::test]
    async fn connect_records_phases_and_pools() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let k = key(&format!("http://127.0.0.1:{}/", port));
        let mut timing = LoadTimingInfo::default();
        let config = crate::net::TlsConfigs::new(&Default::default()).verified;
        let conn = connect(&k, config, 9, &mut timing).await.unwrap();
        assert_eq!(conn.socket_id, 9);
        assert!(timing.dns.start.is_some() && timing.dns.end.is_some());
        assert!(timing.connect.end.is_some());
        assert!(timing.ssl.start.is_none());

        let idle = IdleSockets::default();
        idle.put(k.clone(), conn);
        assert_eq!(idle.count(&k), 1);
        let conn = idle.take(&k).unwrap();
        assert!(idle.take(&k).is_none());

        idle.put(k.clone(), conn);
        assert_eq!(idle.clear(), 1);
        assert_eq!(idle.count(&k), 0);
        assert_eq!(idle.clear(), 0);
    }

    #[tokio::test]
    async fn socks_proxy_not_implemented() {
        let proxy = ProxyServer::parse("socks5://127.0.0.1:1", ProxyScheme::Http).unwrap();
        let k = OriginKey::new(&Url::parse("http://h/").unwrap(), Some(&proxy), false).unwrap();
        let config = crate::net::TlsConfigs::new(&Default::default()).verified;
        let err = connect(&k, config, 1, &mut LoadTimingInfo::default()).await;
        assert_eq!(err.err(), Some(NetError::NotImplemented));
    }
}
