/*
 * engine.rs
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

//! Transport engine interface.
//!
//! The pool drives HTTP through an injected [`TransportEngine`]. The engine
//! builds one [`EngineContext`] per pool, on the pool's network context, and
//! every call into the context and its requests happens on that thread.
//! Engines report progress through a [`RequestDelegate`], which queues the
//! event back onto the network context; delegate methods never re-enter the
//! fetch synchronously.
//!
//! Reads follow a synchronous-or-pending model: [`EngineRequest::read`] either
//! returns data (or end of body) immediately, or returns
//! [`ReadResult::Pending`] and later reports the outcome of that read through
//! [`RequestDelegate::read_completed`].

use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

use bytes::Bytes;
use url::Url;

use crate::error::{EngineError, NetError};
use crate::executor::Poster;
use crate::pool::NetCore;
use crate::proxy::ProxyConfig;
use crate::response::{ResponseHeaders, ResponseInfo};
use crate::timing::LoadTimingInfo;

/// Identifies a fetch within its pool.
pub type FetchId = u64;

/// Per-request load flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoadFlags(u32);

impl LoadFlags {
    pub const NORMAL: LoadFlags = LoadFlags(0);
    pub const VALIDATE_CACHE: LoadFlags = LoadFlags(1 << 0);
    pub const BYPASS_CACHE: LoadFlags = LoadFlags(1 << 1);
    pub const PREFERRING_CACHE: LoadFlags = LoadFlags(1 << 2);
    pub const ONLY_FROM_CACHE: LoadFlags = LoadFlags(1 << 3);
    pub const DISABLE_CACHE: LoadFlags = LoadFlags(1 << 4);
    pub const FROM_CACHE_IF_OFFLINE: LoadFlags = LoadFlags(1 << 5);
    pub const DO_NOT_SAVE_COOKIES: LoadFlags = LoadFlags(1 << 6);
    pub const DO_NOT_SEND_COOKIES: LoadFlags = LoadFlags(1 << 7);
    pub const IGNORE_CERT_AUTHORITY_INVALID: LoadFlags = LoadFlags(1 << 8);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: LoadFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LoadFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for LoadFlags {
    type Output = LoadFlags;

    fn bitor(self, rhs: LoadFlags) -> LoadFlags {
        LoadFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for LoadFlags {
    fn bitor_assign(&mut self, rhs: LoadFlags) {
        self.0 |= rhs.0;
    }
}

/// Scheduling priority hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Idle,
    Lowest,
    #[default]
    Low,
    Medium,
    Highest,
}

/// One piece of an upload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadElement {
    Bytes(Bytes),
    /// A region of a file, read when the body is sent. `None` length reads to end of file.
    File {
        path: PathBuf,
        offset: u64,
        length: Option<u64>,
    },
}

/// Upload body: elements sent back to back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadData {
    pub elements: Vec<UploadElement>,
}

impl UploadData {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            elements: vec![UploadElement::Bytes(data.into())],
        }
    }

    pub fn push(&mut self, element: UploadElement) {
        self.elements.push(element);
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Length of the in-memory elements, or `None` if any element is a file.
    pub fn known_len(&self) -> Option<u64> {
        let mut total = 0u64;
        for e in &self.elements {
            match e {
                UploadElement::Bytes(b) => total += b.len() as u64,
                UploadElement::File { .. } => return None,
            }
        }
        Some(total)
    }
}

/// Upload position and total size in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadProgress {
    pub position: u64,
    pub size: u64,
}

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    Data(Bytes),
    /// End of body.
    Eof,
    /// No data yet; the outcome arrives through `RequestDelegate::read_completed`.
    Pending,
    Failed(NetError),
}

/// Engine-side status of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestStatus {
    #[default]
    InProgress,
    Success,
    Failed(NetError),
    Cancelled(NetError),
}

impl RequestStatus {
    /// In progress or finished successfully.
    pub fn is_ok(&self) -> bool {
        matches!(self, RequestStatus::InProgress | RequestStatus::Success)
    }
}

/// A redirect the engine is waiting to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    pub status_code: i32,
    pub new_url: Url,
}

/// On-disk cache settings handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheParams {
    pub path: PathBuf,
    pub max_bytes: u64,
}

/// TLS settings applied to new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    pub false_start: bool,
    pub require_forward_secrecy: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            false_start: true,
            require_forward_secrecy: false,
        }
    }
}

/// Everything an engine needs to build its context.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub user_agent: String,
    pub enable_spdy: bool,
    pub enable_quic: bool,
    /// Disk cache, present only when both a path and a byte budget were configured.
    pub cache: Option<CacheParams>,
    pub tls: TlsPolicy,
}

/// Factory for per-pool engine contexts.
pub trait TransportEngine: Send + Sync {
    /// Build the context. Runs once, on the network context.
    fn build_context(&self, params: EngineParams) -> Result<Box<dyn EngineContext>, EngineError>;
}

/// Shared transport state for one pool: connections, TLS configuration, hints.
pub trait EngineContext {
    /// Create a request. The request does nothing until `start`.
    fn create_request(
        &mut self,
        url: &Url,
        priority: RequestPriority,
        proxy: &ProxyConfig,
        delegate: RequestDelegate,
    ) -> Result<Box<dyn EngineRequest>, EngineError>;

    /// Best-effort: open `streams` connections to the origin of `url`.
    fn preconnect(&mut self, url: &Url, streams: u32, priority: RequestPriority, proxy: &ProxyConfig);

    /// Replace the TLS policy used for new connections.
    fn set_tls_policy(&mut self, policy: TlsPolicy);

    /// Record that `host:port` is also served on `alternate_port` by an alternate protocol.
    fn add_alternate_protocol_hint(&mut self, _host: &str, _port: u16, _alternate_port: u16) {}

    /// The effective proxy configuration changed. Each request is still given
    /// the configuration in force when it is created.
    fn proxy_config_changed(&mut self, _config: &ProxyConfig) {}
}

/// One HTTP request inside the engine.
pub trait EngineRequest {
    fn set_load_flags(&mut self, flags: LoadFlags);
    fn set_method(&mut self, method: &str);
    /// Set a header. With `overwrite`, an existing header of the same name (any case) is replaced.
    fn set_header(&mut self, name: &str, value: &str, overwrite: bool);
    fn set_upload(&mut self, upload: UploadData);

    fn start(&mut self);
    /// Resume after `RequestDelegate::received_redirect`.
    fn follow_redirect(&mut self);
    fn cancel(&mut self) {
        self.cancel_with_error(NetError::Aborted);
    }
    fn cancel_with_error(&mut self, error: NetError);

    /// Read up to `max_bytes` of body.
    fn read(&mut self, max_bytes: usize) -> ReadResult;

    fn upload_progress(&self) -> UploadProgress;
    fn total_received_bytes(&self) -> u64;
    fn expected_content_size(&self) -> Option<u64>;
    fn status(&self) -> RequestStatus;
    /// HTTP status code, -1 before headers arrive.
    fn response_code(&self) -> i32;
    fn response_headers(&self) -> Option<ResponseHeaders>;
    fn response_info(&self) -> ResponseInfo;
    fn load_timing(&self) -> LoadTimingInfo;
    /// Current URL, after any followed redirects.
    fn url(&self) -> Url;
}

/// Event sink for one request. Cheap to clone and safe to use from any thread;
/// each event is queued onto the pool's network context.
#[derive(Clone)]
pub struct RequestDelegate {
    id: FetchId,
    network: Poster<NetCore>,
}

impl RequestDelegate {
    pub(crate) fn new(id: FetchId, network: Poster<NetCore>) -> Self {
        Self { id, network }
    }

    pub fn fetch_id(&self) -> FetchId {
        self.id
    }

    /// The request is about to use the network.
    pub fn before_network_start(&self) {
        let id = self.id;
        self.network.post(move |core| core.on_before_network_start(id));
    }

    /// A redirect was received. The engine waits for `follow_redirect` or a cancel.
    pub fn received_redirect(&self, redirect: RedirectInfo) {
        let id = self.id;
        self.network
            .post(move |core| core.on_received_redirect(id, redirect));
    }

    /// Response headers are available, or the request failed before they arrived.
    pub fn response_started(&self) {
        let id = self.id;
        self.network.post(move |core| core.on_response_started(id));
    }

    /// A read that returned `Pending` has completed.
    pub fn read_completed(&self, result: ReadResult) {
        let id = self.id;
        self.network
            .post(move |core| core.on_read_completed(id, result));
    }
}
