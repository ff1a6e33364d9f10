/*
 * exchange.rs
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

//! One request on the built-in engine.
//!
//! [`HttpRequest`] is the object the fetch talks to; it spawns an I/O task on
//! the network runtime when started. Both sides share an [`Exchange`]: the
//! task pushes body chunks into it, and reads drain it. When a read finds the
//! queue empty it is parked, and the task completes it through the delegate
//! as soon as data, end of body, or an error arrives.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use super::connection::{connect, Connection, OriginKey};
use super::h1::{H1ResponseHandler, ParseState, ResponseParser};
use super::request::RequestHead;
use super::ContextShared;
use crate::engine::{
    EngineRequest, LoadFlags, ReadResult, RedirectInfo, RequestDelegate, RequestStatus,
    UploadData, UploadElement, UploadProgress,
};
use crate::error::NetError;
use crate::net::TlsConfigs;
use crate::proxy::ProxyServer;
use crate::response::{ResponseHeaders, ResponseInfo};
use crate::timing::{LoadTimingInfo, Phase};

const MAX_REDIRECTS: u32 = 20;
const UPLOAD_CHUNK: usize = 64 * 1024;
const PROTOCOL: &str = "http/1.1";

/// State shared by a request object and its I/O task.
struct Exchange {
    status: RequestStatus,
    response_code: i32,
    headers: Option<ResponseHeaders>,
    headers_delivered: bool,
    expected_size: Option<u64>,
    body: VecDeque<Bytes>,
    /// Size of a read that returned `Pending`, waiting for data.
    read_pending: Option<usize>,
    received_bytes: u64,
    upload: UploadProgress,
    timing: LoadTimingInfo,
    url: Url,
    info: ResponseInfo,
    /// Resumes the task parked at a redirect.
    follow: Option<oneshot::Sender<()>>,
}

impl Exchange {
    fn new(url: Url, timing: LoadTimingInfo) -> Self {
        Self {
            status: RequestStatus::InProgress,
            response_code: -1,
            headers: None,
            headers_delivered: false,
            expected_size: None,
            body: VecDeque::new(),
            read_pending: None,
            received_bytes: 0,
            upload: UploadProgress::default(),
            timing,
            url,
            info: ResponseInfo::default(),
            follow: None,
        }
    }

    /// A finished transfer whose body has not been read out is still cancellable.
    fn cancel(&mut self, error: NetError) {
        let unread = self.status == RequestStatus::Success && !self.body.is_empty();
        if self.status == RequestStatus::InProgress || unread {
            self.status = RequestStatus::Cancelled(error);
            self.body.clear();
        }
        self.follow = None;
        self.read_pending = None;
    }
}

type Shared = Arc<Mutex<Exchange>>;

fn lock(shared: &Shared) -> MutexGuard<'_, Exchange> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A request on the built-in engine.
pub(crate) struct HttpRequest {
    head: RequestHead,
    flags: LoadFlags,
    upload: Option<UploadData>,
    proxy: Option<ProxyServer>,
    tls: TlsConfigs,
    context: Arc<ContextShared>,
    delegate: RequestDelegate,
    shared: Shared,
    task: Option<JoinHandle<()>>,
    started: bool,
}

impl HttpRequest {
    pub fn new(
        url: Url,
        proxy: Option<ProxyServer>,
        proxy_resolve: Phase,
        tls: TlsConfigs,
        context: Arc<ContextShared>,
        delegate: RequestDelegate,
    ) -> Self {
        let timing = LoadTimingInfo {
            proxy_resolve,
            ..Default::default()
        };
        let exchange = Exchange::new(url, timing);
        Self {
            head: RequestHead::new(),
            flags: LoadFlags::NORMAL,
            upload: None,
            proxy,
            tls,
            context,
            delegate,
            shared: Arc::new(Mutex::new(exchange)),
            task: None,
            started: false,
        }
    }
}

impl EngineRequest for HttpRequest {
    fn set_load_flags(&mut self, flags: LoadFlags) {
        self.flags = flags;
    }

    fn set_method(&mut self, method: &str) {
        self.head.method = method.to_ascii_uppercase();
    }

    fn set_header(&mut self, name: &str, value: &str, overwrite: bool) {
        self.head.set(name, value, overwrite);
    }

    fn set_upload(&mut self, upload: UploadData) {
        self.upload = Some(upload);
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                lock(&self.shared).status = RequestStatus::Failed(NetError::Failed);
                self.delegate.response_started();
                return;
            }
        };
        let any_authority = self.flags.contains(LoadFlags::IGNORE_CERT_AUTHORITY_INVALID)
            && cfg!(debug_assertions);
        let url = lock(&self.shared).url.clone();
        let task = Transaction {
            url,
            head: self.head.clone(),
            flags: self.flags,
            upload: self.upload.take(),
            proxy: self.proxy.clone(),
            tls: self.tls.select(any_authority),
            any_authority,
            context: self.context.clone(),
            delegate: self.delegate.clone(),
            shared: self.shared.clone(),
        };
        self.task = Some(runtime.spawn(task.run()));
    }

    fn follow_redirect(&mut self) {
        if let Some(tx) = lock(&self.shared).follow.take() {
            let _ = tx.send(());
        }
    }

    fn cancel_with_error(&mut self, error: NetError) {
        lock(&self.shared).cancel(error);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn read(&mut self, max_bytes: usize) -> ReadResult {
        let max_bytes = max_bytes.max(1);
        let mut ex = lock(&self.shared);
        if let Some(front) = ex.body.front_mut() {
            if front.len() > max_bytes {
                return ReadResult::Data(front.split_to(max_bytes));
            }
            if let Some(chunk) = ex.body.pop_front() {
                return ReadResult::Data(chunk);
            }
        }
        let status = ex.status;
        match status {
            RequestStatus::Success => ReadResult::Eof,
            RequestStatus::Failed(e) | RequestStatus::Cancelled(e) => ReadResult::Failed(e),
            RequestStatus::InProgress => {
                ex.read_pending = Some(max_bytes);
                ReadResult::Pending
            }
        }
    }

    fn upload_progress(&self) -> UploadProgress {
        lock(&self.shared).upload
    }

    fn total_received_bytes(&self) -> u64 {
        lock(&self.shared).received_bytes
    }

    fn expected_content_size(&self) -> Option<u64> {
        lock(&self.shared).expected_size
    }

    fn status(&self) -> RequestStatus {
        lock(&self.shared).status
    }

    fn response_code(&self) -> i32 {
        lock(&self.shared).response_code
    }

    fn response_headers(&self) -> Option<ResponseHeaders> {
        lock(&self.shared).headers.clone()
    }

    fn response_info(&self) -> ResponseInfo {
        lock(&self.shared).info.clone()
    }

    fn load_timing(&self) -> LoadTimingInfo {
        lock(&self.shared).timing.clone()
    }

    fn url(&self) -> Url {
        lock(&self.shared).url.clone()
    }
}

impl Drop for HttpRequest {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Response status line and headers, collected while parsing the head.
#[derive(Default)]
struct HeadCollector {
    version: String,
    code: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

impl HeadCollector {
    fn to_headers(&self) -> ResponseHeaders {
        let line = if self.reason.is_empty() {
            format!("{} {}", self.version, self.code)
        } else {
            format!("{} {} {}", self.version, self.code, self.reason)
        };
        let mut headers = ResponseHeaders::new(line);
        for (k, v) in &self.headers {
            headers.push(k.clone(), v.clone());
        }
        headers
    }
}

impl H1ResponseHandler for HeadCollector {
    fn status(&mut self, version: &str, code: u16, reason: &str) {
        self.version = version.to_string();
        self.code = code;
        self.reason = reason.to_string();
    }
    fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }
    fn body_chunk(&mut self, _data: Bytes) {}
    fn complete(&mut self) {}
}

/// Hands body chunks to the exchange, completing a parked read if there is one.
struct BodySink<'a> {
    shared: &'a Shared,
    delegate: &'a RequestDelegate,
}

impl H1ResponseHandler for BodySink<'_> {
    fn status(&mut self, _version: &str, _code: u16, _reason: &str) {}
    fn header(&mut self, _name: &str, _value: &str) {}

    fn body_chunk(&mut self, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut ex = lock(self.shared);
        match ex.read_pending.take() {
            Some(max) => {
                if data.len() > max {
                    let rest = data.split_off(max);
                    ex.body.push_back(rest);
                }
                drop(ex);
                self.delegate.read_completed(ReadResult::Data(data));
            }
            None => ex.body.push_back(data),
        }
    }

    fn complete(&mut self) {}
}

/// The I/O side of a request: connect, send, receive, follow redirects.
struct Transaction {
    url: Url,
    head: RequestHead,
    flags: LoadFlags,
    upload: Option<UploadData>,
    proxy: Option<ProxyServer>,
    tls: Arc<tokio_rustls::rustls::ClientConfig>,
    any_authority: bool,
    context: Arc<ContextShared>,
    delegate: RequestDelegate,
    shared: Shared,
}

struct ResponseHead {
    parser: ResponseParser,
    collected: HeadCollector,
}

impl Transaction {
    async fn run(mut self) {
        if self.flags.contains(LoadFlags::ONLY_FROM_CACHE) {
            // There is no disk cache to answer from.
            self.fail(NetError::CacheMiss);
            return;
        }
        lock(&self.shared).timing.request_start_time = Some(Utc::now());
        self.delegate.before_network_start();

        let mut redirects = 0;
        loop {
            match self.transact().await {
                Ok(None) => return,
                Ok(Some(redirect)) => {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        self.fail(NetError::TooManyRedirects);
                        return;
                    }
                    let (tx, rx) = oneshot::channel();
                    {
                        let mut ex = lock(&self.shared);
                        if ex.status != RequestStatus::InProgress {
                            return;
                        }
                        ex.follow = Some(tx);
                    }
                    self.delegate.received_redirect(redirect.clone());
                    if rx.await.is_err() {
                        return;
                    }
                    self.apply_redirect(redirect);
                }
                Err(e) => {
                    debug!("[http] {} failed: {}", self.url, e);
                    self.fail(e);
                    return;
                }
            }
        }
    }

    /// One request/response on one connection. Returns the redirect to follow, if any.
    async fn transact(&mut self) -> Result<Option<RedirectInfo>, NetError> {
        let key = OriginKey::new(&self.url, self.proxy.as_ref(), self.any_authority)?;
        let body_len = match &self.upload {
            Some(upload) => Some(upload_len(upload).await?),
            None => None,
        };
        lock(&self.shared).upload = UploadProgress {
            position: 0,
            size: body_len.unwrap_or(0),
        };

        let mut retried = false;
        let (mut conn, mut head) = loop {
            let (mut conn, reused) = match self.context.idle.take(&key) {
                Some(conn) => (conn, true),
                None => (self.open(&key).await?, false),
            };
            {
                let mut ex = lock(&self.shared);
                ex.timing.socket_reused = reused;
                ex.timing.socket_log_id = conn.socket_id;
            }
            match self.send_and_read_head(&mut conn, &key, body_len).await {
                Ok(head) => break (conn, head),
                // The server may have closed an idle connection while it was parked.
                Err(NetError::ConnectionClosed | NetError::ConnectionReset) if reused && !retried => {
                    debug!("[http] socket {} went stale, retrying", conn.socket_id);
                    retried = true;
                    lock(&self.shared).upload.position = 0;
                }
                Err(e) => return Err(e),
            }
        };

        let code = head.collected.code as i32;
        let headers = head.collected.to_headers();
        let keep_alive = head.collected.version == "HTTP/1.1" && !headers.has_value("Connection", "close");
        {
            let mut ex = lock(&self.shared);
            ex.response_code = code;
            ex.headers = Some(headers.clone());
            ex.info = ResponseInfo {
                was_cached: false,
                was_fetched_via_proxy: key.proxy.is_some(),
                was_fetched_via_spdy: false,
                was_fetched_via_quic: false,
                negotiated_protocol: Some(
                    conn.negotiated_protocol
                        .clone()
                        .unwrap_or_else(|| PROTOCOL.to_string()),
                ),
            };
        }

        if is_redirect(code) {
            if let Some(location) = headers.first("Location") {
                let new_url = self
                    .url
                    .join(location)
                    .map_err(|_| NetError::InvalidResponse)?;
                return Ok(Some(RedirectInfo {
                    status_code: code,
                    new_url,
                }));
            }
        }

        let no_body = self.head.method == "HEAD" || code == 204 || code == 304 || (100..200).contains(&code);
        let chunked = !no_body && headers.has_value("Transfer-Encoding", "chunked");
        let content_length = if no_body {
            Some(0)
        } else if chunked {
            None
        } else {
            headers
                .first("Content-Length")
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        {
            let mut ex = lock(&self.shared);
            ex.expected_size = content_length;
            ex.headers_delivered = true;
        }
        self.delegate.response_started();

        let mut sink = BodySink {
            shared: &self.shared,
            delegate: &self.delegate,
        };
        head.parser.set_body_mode(content_length, chunked, &mut sink);
        let until_close = head.parser.reads_until_close();
        loop {
            head.parser.receive(&mut conn.read_buf, &mut sink)?;
            if head.parser.state() == ParseState::Idle {
                break;
            }
            let n = conn.fill().await?;
            if n == 0 {
                head.parser.connection_closed(&mut sink)?;
                break;
            }
            lock(&self.shared).received_bytes += n as u64;
        }

        if keep_alive && !until_close {
            self.context.idle.put(key, conn);
        }
        self.succeed();
        Ok(None)
    }

    async fn open(&self, key: &OriginKey) -> Result<Connection, NetError> {
        let socket_id = self.context.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let mut phases = LoadTimingInfo::default();
        let result = connect(key, self.tls.clone(), socket_id, &mut phases).await;
        let mut ex = lock(&self.shared);
        ex.timing.dns = phases.dns;
        ex.timing.connect = phases.connect;
        ex.timing.ssl = phases.ssl;
        result
    }

    async fn send_and_read_head(
        &self,
        conn: &mut Connection,
        key: &OriginKey,
        body_len: Option<u64>,
    ) -> Result<ResponseHead, NetError> {
        lock(&self.shared).timing.send.begin();
        let head = self
            .head
            .encode(&self.url, key.absolute_form(), body_len, &self.context.user_agent);
        conn.write_all(&head).await?;
        if let Some(upload) = &self.upload {
            self.send_body(conn, upload).await?;
        }
        conn.flush().await?;
        lock(&self.shared).timing.send.finish();

        let mut parser = ResponseParser::new();
        let mut collected = HeadCollector::default();
        loop {
            parser.receive(&mut conn.read_buf, &mut collected)?;
            if parser.state() == ParseState::HeadersComplete {
                if (100..200).contains(&collected.code) && collected.code != 101 {
                    // Interim response; the final one follows.
                    parser.reset();
                    collected = HeadCollector::default();
                    continue;
                }
                break;
            }
            let n = conn.fill().await?;
            if n == 0 {
                return Err(NetError::ConnectionClosed);
            }
            lock(&self.shared).received_bytes += n as u64;
        }
        lock(&self.shared).timing.receive_headers_end = Some(Instant::now());
        Ok(ResponseHead { parser, collected })
    }

    async fn send_body(&self, conn: &mut Connection, upload: &UploadData) -> Result<(), NetError> {
        for element in &upload.elements {
            match element {
                UploadElement::Bytes(data) => {
                    for chunk in data.chunks(UPLOAD_CHUNK) {
                        conn.write_all(chunk).await?;
                        lock(&self.shared).upload.position += chunk.len() as u64;
                    }
                }
                UploadElement::File { path, offset, length } => {
                    let mut remaining = file_region_len(path, *offset, *length).await?;
                    let mut file = tokio::fs::File::open(path)
                        .await
                        .map_err(|_| NetError::FileNotFound)?;
                    file.seek(SeekFrom::Start(*offset)).await?;
                    let mut buf = vec![0u8; UPLOAD_CHUNK];
                    while remaining > 0 {
                        let want = remaining.min(buf.len() as u64) as usize;
                        let n = file.read(&mut buf[..want]).await?;
                        if n == 0 {
                            // File shrank after its length was announced.
                            return Err(NetError::Failed);
                        }
                        conn.write_all(&buf[..n]).await?;
                        remaining -= n as u64;
                        lock(&self.shared).upload.position += n as u64;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_redirect(&mut self, redirect: RedirectInfo) {
        let code = redirect.status_code;
        let to_get = (code == 303 && self.head.method != "HEAD")
            || ((code == 301 || code == 302) && self.head.method == "POST");
        if to_get {
            self.head.method = "GET".to_string();
            self.upload = None;
            self.head.remove("Content-Type");
            self.head.remove("Content-Length");
        }
        self.url = redirect.new_url;
        let mut ex = lock(&self.shared);
        ex.url = self.url.clone();
        ex.response_code = -1;
        ex.headers = None;
        ex.upload = UploadProgress::default();
    }

    fn succeed(&self) {
        let notify = {
            let mut ex = lock(&self.shared);
            if ex.status != RequestStatus::InProgress {
                return;
            }
            ex.status = RequestStatus::Success;
            ex.read_pending.take().is_some()
        };
        if notify {
            self.delegate.read_completed(ReadResult::Eof);
        }
    }

    fn fail(&self, error: NetError) {
        let (headers_delivered, notify) = {
            let mut ex = lock(&self.shared);
            if ex.status != RequestStatus::InProgress {
                return;
            }
            ex.status = RequestStatus::Failed(error);
            (ex.headers_delivered, ex.read_pending.take().is_some())
        };
        if !headers_delivered {
            self.delegate.response_started();
        } else if notify {
            self.delegate.read_completed(ReadResult::Failed(error));
        }
    }
}

fn is_redirect(code: i32) -> bool {
    matches!(code, 301 | 302 | 303 | 307 | 308)
}

async fn file_region_len(path: &std::path::Path, offset: u64, length: Option<u64>) -> Result<u64, NetError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| NetError::FileNotFound)?;
    let available = meta.len().saturating_sub(offset);
    Ok(length.map(|l| l.min(available)).unwrap_or(available))
}

async fn upload_len(upload: &UploadData) -> Result<u64, NetError> {
    let mut total = 0u64;
    for element in &upload.elements {
        total += match element {
            UploadElement::Bytes(data) => data.len() as u64,
            UploadElement::File { path, offset, length } => file_region_len(path, *offset, *length).await?,
        };
    }
    Ok(total)
}
