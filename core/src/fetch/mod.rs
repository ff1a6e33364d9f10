/*
 * mod.rs
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

//! Fetch requests: the caller-facing builder and handle.
//!
//! A [`FetchRequest`] collects everything about one fetch (method, headers,
//! parameters, body, output routing, watchdogs, callbacks). [`FetchRequest::start`]
//! consumes it and hands the description to the pool's network context, where
//! the state machine in `state` drives it to completion. The caller keeps a
//! [`FetchHandle`] for cancelling, tagging and identifying the fetch.
//!
//! Exactly one completion callback is delivered per started fetch, on the
//! pool's work context, whatever happens: success, engine failure, build
//! failure or any number of cancels.

mod body;
mod download;
mod state;
mod watchdog;

pub(crate) use download::FileCore;
pub(crate) use state::FetchState;

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::error;

use crate::engine::{FetchId, LoadFlags, RequestPriority};
use crate::oauth::OAuthCredentials;
use crate::params::UrlParams;
use crate::pool::ConnectionPool;
use crate::response::ResponseSnapshot;
use watchdog::MinSpeed;

/// Receives the finished fetch. Runs once, on the work context.
pub type CompletionCallback = Box<dyn FnOnce(&FetchHandle, Arc<ResponseSnapshot>) + Send + 'static>;

/// Progress report: bytes so far, and the total when known. Runs on the work context.
pub type ProgressCallback = Arc<dyn Fn(&FetchHandle, u64, Option<u64>) + Send + Sync + 'static>;

/// Cache policy for one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CacheBehavior {
    #[default]
    Normal,
    /// Revalidate cached entries with the server.
    Validate,
    /// Go to the network; do not read the cache.
    Bypass,
    /// Use a cached entry, however stale, when there is one.
    Prefer,
    /// Only use the cache; never the network.
    Only,
    /// Use the cache when offline.
    IfOffline,
    /// Neither read nor write the cache.
    Disable,
}

impl CacheBehavior {
    pub fn load_flags(self) -> LoadFlags {
        match self {
            CacheBehavior::Normal => LoadFlags::NORMAL,
            CacheBehavior::Validate => LoadFlags::VALIDATE_CACHE,
            CacheBehavior::Bypass => LoadFlags::BYPASS_CACHE,
            CacheBehavior::Prefer => LoadFlags::PREFERRING_CACHE,
            CacheBehavior::Only => LoadFlags::ONLY_FROM_CACHE,
            CacheBehavior::IfOffline => LoadFlags::FROM_CACHE_IF_OFFLINE,
            CacheBehavior::Disable => LoadFlags::DISABLE_CACHE,
        }
    }
}

/// Where URL parameters go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UrlParamsEncoding {
    /// Appended to the URL's query string.
    #[default]
    Query,
    /// `application/x-www-form-urlencoded` request body.
    FormBody,
    /// `multipart/form-data` request body, optionally with one file.
    Multipart,
}

/// A raw request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawUpload {
    Bytes {
        content_type: String,
        data: Bytes,
    },
    File {
        content_type: String,
        path: PathBuf,
        offset: u64,
        length: Option<u64>,
    },
}

/// The file part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilePart {
    pub key: String,
    pub filename: String,
    pub content_type: String,
    pub path: PathBuf,
    pub offset: u64,
    pub length: Option<u64>,
}

/// Request body source. One variant at a time; the setters switch between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UploadMode {
    /// Parameters in the query, with an optional raw body.
    Query(Option<RawUpload>),
    /// Parameters as a form body.
    Form,
    /// Parameters (and an optional file) as a multipart body.
    Multipart(Option<FilePart>),
}

impl Default for UploadMode {
    fn default() -> Self {
        UploadMode::Query(None)
    }
}

/// Everything the network context needs to build the transport request.
#[derive(Debug, Clone, Default)]
pub(crate) struct FetchSpec {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub cache: CacheBehavior,
    pub stop_on_redirect: bool,
    pub params: UrlParams,
    pub upload: UploadMode,
    pub output_path: Option<PathBuf>,
    pub oauth: Option<OAuthCredentials>,
    pub min_speed: MinSpeed,
    pub priority: RequestPriority,
}

impl FetchSpec {
    /// Set a header, replacing any existing one of the same name (any case).
    fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub completion: Option<CompletionCallback>,
    pub download: Option<ProgressCallback>,
    pub upload: Option<ProgressCallback>,
}

type UserData = Arc<dyn Any + Send + Sync>;

/// A fetch being configured. Created by [`ConnectionPool::create_fetch`].
pub struct FetchRequest {
    pool: ConnectionPool,
    url: String,
    spec: FetchSpec,
    callbacks: Callbacks,
    user_data: Option<UserData>,
}

impl FetchRequest {
    pub(crate) fn new(pool: ConnectionPool, url: &str, method: &str, completion: CompletionCallback) -> Self {
        Self {
            pool,
            url: url.to_string(),
            spec: FetchSpec {
                method: method.to_string(),
                ..FetchSpec::default()
            },
            callbacks: Callbacks {
                completion: Some(completion),
                ..Callbacks::default()
            },
            user_data: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.spec.method
    }

    /// Set a request header. A later value for the same name (any case) wins.
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.spec.set_header(name, value);
        self
    }

    pub fn set_cache_behavior(&mut self, behavior: CacheBehavior) -> &mut Self {
        self.spec.cache = behavior;
        self
    }

    /// Complete at the first redirect instead of following it. The snapshot then
    /// reports [`TransportStatus::Redirected`](crate::response::TransportStatus::Redirected)
    /// with the redirect's status code.
    pub fn set_stop_on_redirect(&mut self, stop: bool) -> &mut Self {
        self.spec.stop_on_redirect = stop;
        self
    }

    pub fn set_url_param(&mut self, key: &str, value: &str) -> &mut Self {
        self.spec.params.insert(key.to_string(), value.to_string());
        self
    }

    /// Choose where parameters go. Switching mode drops any body set for another mode.
    pub fn set_url_params_encoding(&mut self, encoding: UrlParamsEncoding) -> &mut Self {
        self.spec.upload = match (encoding, std::mem::take(&mut self.spec.upload)) {
            (UrlParamsEncoding::Query, UploadMode::Query(raw)) => UploadMode::Query(raw),
            (UrlParamsEncoding::Query, _) => UploadMode::Query(None),
            (UrlParamsEncoding::FormBody, _) => UploadMode::Form,
            (UrlParamsEncoding::Multipart, UploadMode::Multipart(file)) => UploadMode::Multipart(file),
            (UrlParamsEncoding::Multipart, _) => UploadMode::Multipart(None),
        };
        self
    }

    pub fn url_params_encoding(&self) -> UrlParamsEncoding {
        match self.spec.upload {
            UploadMode::Query(_) => UrlParamsEncoding::Query,
            UploadMode::Form => UrlParamsEncoding::FormBody,
            UploadMode::Multipart(_) => UrlParamsEncoding::Multipart,
        }
    }

    /// Attach a file to a multipart body, read from `path` starting at `offset`.
    /// `length` of `None` reads to the end of the file. Switches to multipart encoding.
    pub fn set_url_param_file(
        &mut self,
        key: &str,
        filename: &str,
        content_type: &str,
        path: impl Into<PathBuf>,
        offset: u64,
        length: Option<u64>,
    ) -> &mut Self {
        self.spec.upload = UploadMode::Multipart(Some(FilePart {
            key: key.to_string(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            path: path.into(),
            offset,
            length,
        }));
        self
    }

    /// Send `body` as the request body. Parameters go to the query string.
    pub fn set_upload_body(&mut self, content_type: &str, body: impl Into<Bytes>) -> &mut Self {
        self.spec.upload = UploadMode::Query(Some(RawUpload::Bytes {
            content_type: content_type.to_string(),
            data: body.into(),
        }));
        self
    }

    /// Send a region of a file as the request body. Parameters go to the query string.
    pub fn set_upload_file_path(
        &mut self,
        content_type: &str,
        path: impl Into<PathBuf>,
        offset: u64,
        length: Option<u64>,
    ) -> &mut Self {
        self.spec.upload = UploadMode::Query(Some(RawUpload::File {
            content_type: content_type.to_string(),
            path: path.into(),
            offset,
            length,
        }));
        self
    }

    /// Write the response body to `path` instead of buffering it. The file is
    /// removed if the fetch does not succeed.
    pub fn set_output_file_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.spec.output_path = Some(path.into());
        self
    }

    /// Sign the request with OAuth 1.0a (HMAC-SHA1) when it is built.
    pub fn set_oauth_credentials(&mut self, credentials: OAuthCredentials) -> &mut Self {
        self.spec.oauth = Some(credentials);
        self
    }

    /// Cancel with [`NetError::TimedOut`](crate::error::NetError::TimedOut) when the
    /// average transfer rate stays below `bytes_per_sec`. `duration` is both the
    /// smoothing window and the grace period. Zero for either disables the check.
    pub fn set_min_speed(&mut self, bytes_per_sec: u64, duration: Duration) -> &mut Self {
        self.spec.min_speed = MinSpeed::new(bytes_per_sec, duration);
        self
    }

    /// Attach a value, available later through [`FetchHandle::user_data`].
    pub fn set_user_data<T: Any + Send + Sync>(&mut self, data: T) -> &mut Self {
        self.user_data = Some(Arc::new(data));
        self
    }

    pub fn set_priority(&mut self, priority: RequestPriority) -> &mut Self {
        self.spec.priority = priority;
        self
    }

    pub fn on_download_progress<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&FetchHandle, u64, Option<u64>) + Send + Sync + 'static,
    {
        self.callbacks.download = Some(Arc::new(callback));
        self
    }

    /// Upload progress, reported every 100 ms while a body is being sent.
    pub fn on_upload_progress<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&FetchHandle, u64, Option<u64>) + Send + Sync + 'static,
    {
        self.callbacks.upload = Some(Arc::new(callback));
        self
    }

    /// Start the fetch. The request is built and submitted on the network context.
    pub fn start(self) -> FetchHandle {
        let FetchRequest {
            pool,
            url,
            spec,
            callbacks,
            user_data,
        } = self;
        let id = pool.next_fetch_id();
        let handle = FetchHandle {
            inner: Arc::new(FetchShared {
                id,
                pool: pool.clone(),
                initial_url: url,
                user_data,
            }),
        };
        let state_handle = handle.clone();
        if !pool.run_on_network(move |core| core.start_fetch(state_handle, spec, callbacks)) {
            error!("[fetch] {} not started: pool contexts have stopped", id);
        }
        handle
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("url", &self.url)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

struct FetchShared {
    id: FetchId,
    pool: ConnectionPool,
    initial_url: String,
    user_data: Option<UserData>,
}

/// A started fetch. Cheap to clone.
#[derive(Clone)]
pub struct FetchHandle {
    inner: Arc<FetchShared>,
}

impl FetchHandle {
    pub fn id(&self) -> FetchId {
        self.inner.id
    }

    /// URL as given to `create_fetch`.
    pub fn initial_url(&self) -> &str {
        &self.inner.initial_url
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// The value given to `set_user_data`, if it has type `T`.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner
            .user_data
            .as_deref()
            .and_then(|data| data.downcast_ref::<T>())
    }

    /// Cancel the fetch. Never blocks; safe to call repeatedly or after completion.
    pub fn cancel(&self) {
        let id = self.inner.id;
        self.inner.pool.run_on_network(move |core| core.cancel_fetch(id));
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("id", &self.inner.id)
            .field("initial_url", &self.inner.initial_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_behavior_sets_one_flag() {
        assert_eq!(CacheBehavior::Normal.load_flags(), LoadFlags::NORMAL);
        let all = [
            CacheBehavior::Validate,
            CacheBehavior::Bypass,
            CacheBehavior::Prefer,
            CacheBehavior::Only,
            CacheBehavior::IfOffline,
            CacheBehavior::Disable,
        ];
        for b in all {
            assert_eq!(b.load_flags().bits().count_ones(), 1, "{:?}", b);
        }
        assert!(CacheBehavior::Only
            .load_flags()
            .contains(LoadFlags::ONLY_FROM_CACHE));
    }

    #[test]
    fn headers_are_last_write_wins() {
        let mut spec = FetchSpec::default();
        spec.set_header("X-Test", "1");
        spec.set_header("Accept", "*/*");
        spec.set_header("x-test", "2");
        assert_eq!(
            spec.headers,
            vec![
                ("X-Test".to_string(), "2".to_string()),
                ("Accept".to_string(), "*/*".to_string())
            ]
        );
    }
}
