/*
 * state.rs
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

//! The fetch state machine, run on the network context.
//!
//! Each started fetch lives in `NetCore::fetches` until `finish_request`
//! removes it. Engine events, timer ticks, file results and cancels all arrive
//! as tasks on the network context and look the fetch up by id; an event for
//! a fetch that is gone is ignored.
//!
//! Completion has one entry point, `on_request_complete`, guarded by the
//! `completing` flag. With an output file, completion waits for the file
//! pipeline: `pending_ops` starts at 2 (request active, file open), each write
//! adds one, and each finished operation subtracts one. At zero the file is
//! closed and the response is assembled.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::body::prepare_upload;
use super::download::{FileCore, ReadBuffer, READ_CHUNK};
use super::watchdog::{SpeedMonitor, Timer, MIN_SPEED_INTERVAL, UPLOAD_PROGRESS_INTERVAL};
use super::{Callbacks, FetchHandle, FetchSpec, UploadMode};
use crate::engine::{
    EngineRequest, FetchId, LoadFlags, ReadResult, RedirectInfo, RequestDelegate, RequestStatus,
};
use crate::error::{EngineError, NetError};
use crate::executor::Poster;
use crate::oauth::sign_request;
use crate::params::encode_params;
use crate::pool::NetCore;
use crate::response::{ResponseSnapshot, SnapshotParts, TransportStatus};
use crate::timing::{FetchMarks, LoadTiming};

/// Where the body goes once headers have arrived.
enum Download {
    NotStarted,
    Buffered(ReadBuffer),
    File {
        path: PathBuf,
        files: Poster<FileCore>,
        pending_ops: u32,
    },
}

/// One in-flight fetch.
pub(crate) struct FetchState {
    handle: FetchHandle,
    spec: FetchSpec,
    callbacks: Callbacks,
    /// URL actually requested: the initial URL plus any query parameters.
    url: Option<Url>,
    request: Option<Box<dyn EngineRequest>>,
    build_error: Option<NetError>,
    has_upload: bool,
    received_bytes: u64,
    expected_size: Option<u64>,
    redirect_code: Option<i32>,
    /// Why this layer cancelled the transfer. Overrides whatever the engine
    /// reports afterwards, including a transfer it had already finished.
    cancelled: Option<NetError>,
    download: Download,
    output_failure: bool,
    marks: FetchMarks,
    completing: bool,
    upload_timer: Option<Timer>,
    speed_timer: Option<Timer>,
    speed: SpeedMonitor,
}

impl FetchState {
    fn new(handle: FetchHandle, spec: FetchSpec, callbacks: Callbacks) -> Self {
        let speed = SpeedMonitor::new(spec.min_speed);
        Self {
            handle,
            spec,
            callbacks,
            url: None,
            request: None,
            build_error: None,
            has_upload: false,
            received_bytes: 0,
            expected_size: None,
            redirect_code: None,
            cancelled: None,
            download: Download::NotStarted,
            output_failure: false,
            marks: FetchMarks::default(),
            completing: false,
            upload_timer: None,
            speed_timer: None,
            speed,
        }
    }

    /// Completion has begun; no further events are acted on.
    pub fn is_completing(&self) -> bool {
        self.completing
    }

    /// Final status and HTTP code, given the engine's status and code.
    fn outcome(&self, engine: Option<(RequestStatus, i32)>) -> (TransportStatus, i32) {
        if let Some(e) = self.build_error {
            return (TransportStatus::Failed(e), -1);
        }
        if self.output_failure {
            return (TransportStatus::Failed(NetError::Failed), -1);
        }
        if let Some(code) = self.redirect_code {
            return (TransportStatus::Redirected, code);
        }
        if let Some(e) = self.cancelled {
            return (TransportStatus::Cancelled(e), -1);
        }
        match engine {
            Some((RequestStatus::Success, code)) => (TransportStatus::Success, code),
            Some((RequestStatus::Failed(e), _)) => (TransportStatus::Failed(e), -1),
            Some((RequestStatus::Cancelled(e), _)) => (TransportStatus::Cancelled(e), -1),
            Some((RequestStatus::InProgress, _)) | None => (TransportStatus::Failed(NetError::Failed), -1),
        }
    }

    /// Cancel the transport request. The first reason recorded is the one reported.
    fn abort(&mut self, error: NetError) {
        self.cancelled.get_or_insert(error);
        if let Some(request) = self.request.as_mut() {
            request.cancel_with_error(error);
        }
    }
}

fn engine_error_code(e: &EngineError) -> NetError {
    match e {
        EngineError::UnsupportedScheme(_) => NetError::InvalidUrl,
        EngineError::Io(io) => NetError::from_io(io),
        EngineError::Unavailable | EngineError::Rejected(_) => NetError::Failed,
    }
}

/// Append encoded parameters to the query, after any query already present.
fn append_query(url: &mut Url, encoded: &str) {
    let query = match url.query() {
        Some(q) if !q.is_empty() => format!("{}&{}", q, encoded),
        _ => encoded.to_string(),
    };
    url.set_query(Some(&query));
}

impl NetCore {
    pub(crate) fn start_fetch(&mut self, handle: FetchHandle, spec: FetchSpec, callbacks: Callbacks) {
        let id = handle.id();
        let mut fetch = FetchState::new(handle, spec, callbacks);
        fetch.marks.started_at = Some(Utc::now());
        fetch.marks.request_started = Some(Instant::now());
        self.fetches.insert(id, fetch);
        self.fetcher_starting(id);

        match self.build_request(id) {
            Ok(()) => {
                if let Some(request) = self.fetches.get_mut(&id).and_then(|f| f.request.as_mut()) {
                    request.start();
                }
            }
            Err(e) => {
                warn!("[fetch] {} not started: {}", id, e);
                if let Some(fetch) = self.fetches.get_mut(&id) {
                    fetch.build_error = Some(e);
                }
                self.me.post(move |core| core.on_request_complete(id));
            }
        }
    }

    /// Create and configure the transport request.
    fn build_request(&mut self, id: FetchId) -> Result<(), NetError> {
        let (proxy, _) = self.proxy.latest_config();
        let trust_all = self.trust_all;
        let delegate = RequestDelegate::new(id, self.me.clone());
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return Ok(());
        };
        let Some(engine) = self.engine.as_mut() else {
            error!("[fetch] {}: transport context is not available", id);
            return Err(NetError::Failed);
        };

        let mut url = Url::parse(fetch.handle.initial_url()).map_err(|_| NetError::InvalidUrl)?;
        let spec = &mut fetch.spec;
        if let Some(credentials) = &spec.oauth {
            if url.query().is_some() {
                warn!("[fetch] {}: existing query is not covered by the OAuth signature", id);
            }
            sign_request(credentials, url.as_str(), &spec.method, &mut spec.params);
        }
        if matches!(spec.upload, UploadMode::Query(_)) && !spec.params.is_empty() {
            append_query(&mut url, &encode_params(&spec.params));
        }
        fetch.url = Some(url.clone());

        let mut request = engine
            .create_request(&url, spec.priority, &proxy, delegate)
            .map_err(|e| {
                warn!("[fetch] {}: engine rejected {}: {}", id, url, e);
                engine_error_code(&e)
            })?;

        let mut flags = LoadFlags::DO_NOT_SAVE_COOKIES | LoadFlags::DO_NOT_SEND_COOKIES;
        flags |= spec.cache.load_flags();
        if trust_all && cfg!(debug_assertions) {
            flags |= LoadFlags::IGNORE_CERT_AUTHORITY_INVALID;
        }
        request.set_load_flags(flags);
        request.set_method(&spec.method);
        for (name, value) in &spec.headers {
            request.set_header(name, value, true);
        }
        if let Some(upload) = prepare_upload(&spec.upload, &spec.params) {
            if let Some(content_type) = &upload.content_type {
                request.set_header("Content-Type", content_type, true);
            }
            if let Some(length) = upload.content_length {
                request.set_header("Content-Length", &length.to_string(), true);
            }
            request.set_upload(upload.data);
            fetch.has_upload = true;
        }
        fetch.request = Some(request);
        Ok(())
    }

    pub(crate) fn on_before_network_start(&mut self, id: FetchId) {
        let me = self.me.clone();
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        if fetch.completing {
            return;
        }
        fetch.marks.network_started = Some(Instant::now());
        if fetch.has_upload && fetch.callbacks.upload.is_some() && fetch.upload_timer.is_none() {
            fetch.upload_timer = Timer::every(UPLOAD_PROGRESS_INTERVAL, me.clone(), id, NetCore::on_upload_timer);
        }
        if fetch.speed.is_enabled() && fetch.speed_timer.is_none() {
            fetch.speed_timer = Timer::every(MIN_SPEED_INTERVAL, me, id, NetCore::on_min_speed_timer);
        }
    }

    pub(crate) fn on_upload_timer(&mut self, id: FetchId) {
        let work = self.work.clone();
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        if fetch.completing {
            return;
        }
        let (Some(request), Some(callback)) = (fetch.request.as_ref(), fetch.callbacks.upload.clone()) else {
            return;
        };
        let progress = request.upload_progress();
        let total = (progress.size > 0).then_some(progress.size);
        let handle = fetch.handle.clone();
        work.post(move |_| callback(&handle, progress.position, total));
        if progress.size > 0 && progress.position >= progress.size {
            fetch.upload_timer = None;
        }
    }

    pub(crate) fn on_min_speed_timer(&mut self, id: FetchId) {
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        if fetch.completing {
            return;
        }
        let Some(request) = fetch.request.as_ref() else {
            return;
        };
        let transferred = request.upload_progress().position + request.total_received_bytes();
        let elapsed = fetch
            .marks
            .network_started
            .or(fetch.marks.request_started)
            .map(|t| t.elapsed())
            .unwrap_or_default();
        if !fetch.speed.sample(transferred, MIN_SPEED_INTERVAL, elapsed) {
            return;
        }
        warn!(
            "[fetch] {} too slow: {:.0} B/s, cancelling {}",
            id,
            fetch.speed.average_bytes_per_sec(),
            fetch.handle.initial_url()
        );
        fetch.abort(NetError::TimedOut);
        self.on_request_complete(id);
    }

    pub(crate) fn on_received_redirect(&mut self, id: FetchId, redirect: RedirectInfo) {
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        if fetch.completing {
            return;
        }
        let Some(request) = fetch.request.as_mut() else {
            return;
        };
        if fetch.spec.stop_on_redirect {
            debug!("[fetch] {} stopping at {} redirect", id, redirect.status_code);
            fetch.redirect_code = Some(redirect.status_code);
            request.cancel();
            self.on_request_complete(id);
        } else {
            debug!("[fetch] {} following {} to {}", id, redirect.status_code, redirect.new_url);
            request.follow_redirect();
        }
    }

    pub(crate) fn on_response_started(&mut self, id: FetchId) {
        let files = self.files.clone();
        let me = self.me.clone();
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        if fetch.completing {
            return;
        }
        let Some(request) = fetch.request.as_ref() else {
            return;
        };
        if !request.status().is_ok() {
            self.on_request_complete(id);
            return;
        }
        fetch.marks.receive_started = Some(Instant::now());
        fetch.expected_size = request.expected_content_size();

        match fetch.spec.output_path.clone() {
            None => fetch.download = Download::Buffered(ReadBuffer::new(fetch.expected_size)),
            Some(path) => {
                let Some(poster) = files.poster() else {
                    fetch.output_failure = true;
                    self.cancel_fetch(id);
                    return;
                };
                fetch.download = Download::File {
                    path: path.clone(),
                    files: poster.clone(),
                    pending_ops: 2,
                };
                poster.post(move |files: &mut FileCore| {
                    let result = files.open(id, &path);
                    me.post(move |core| core.on_file_op_done(id, result));
                });
            }
        }
        self.read_response(id);
    }

    pub(crate) fn on_read_completed(&mut self, id: FetchId, result: ReadResult) {
        match result {
            ReadResult::Data(data) => {
                if self.consume(id, data) {
                    self.read_response(id);
                }
            }
            ReadResult::Pending => self.read_response(id),
            ReadResult::Eof | ReadResult::Failed(_) => self.on_request_complete(id),
        }
    }

    /// Read while the engine answers synchronously; stop at the first pending read.
    fn read_response(&mut self, id: FetchId) {
        loop {
            let Some(fetch) = self.fetches.get_mut(&id) else {
                return;
            };
            if fetch.completing {
                return;
            }
            let Some(request) = fetch.request.as_mut() else {
                return;
            };
            match request.read(READ_CHUNK) {
                ReadResult::Pending => return,
                ReadResult::Data(data) => {
                    if !self.consume(id, data) {
                        return;
                    }
                }
                ReadResult::Eof | ReadResult::Failed(_) => {
                    self.on_request_complete(id);
                    return;
                }
            }
        }
    }

    /// Hand one chunk to the sink and report progress. False to stop reading.
    fn consume(&mut self, id: FetchId, data: Bytes) -> bool {
        let me = self.me.clone();
        let work = self.work.clone();
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return false;
        };
        if fetch.completing {
            return false;
        }
        fetch.received_bytes += data.len() as u64;
        let fits = match &mut fetch.download {
            Download::Buffered(buffer) => buffer.append(&data),
            Download::File {
                files, pending_ops, ..
            } => {
                *pending_ops += 1;
                files.post(move |files: &mut FileCore| {
                    let result = files.write(id, &data);
                    me.post(move |core| core.on_file_op_done(id, result));
                });
                true
            }
            Download::NotStarted => true,
        };
        if !fits {
            warn!("[fetch] {} response too large for memory", id);
            fetch.abort(NetError::ResponseTooLarge);
            self.on_request_complete(id);
            return false;
        }
        if let Some(callback) = fetch.callbacks.download.clone() {
            let handle = fetch.handle.clone();
            let current = fetch.received_bytes;
            let total = fetch.expected_size;
            work.post(move |_| callback(&handle, current, total));
        }
        true
    }

    /// An open or write finished on the file context.
    fn on_file_op_done(&mut self, id: FetchId, result: io::Result<()>) {
        if let Err(e) = result {
            if let Some(fetch) = self.fetches.get_mut(&id) {
                if !fetch.output_failure {
                    warn!("[fetch] {} output file: {}", id, e);
                }
                fetch.output_failure = true;
            }
            self.cancel_fetch(id);
        }
        self.file_op_complete(id);
    }

    fn file_op_complete(&mut self, id: FetchId) {
        let me = self.me.clone();
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        let Download::File {
            path,
            files,
            pending_ops,
        } = &mut fetch.download
        else {
            return;
        };
        *pending_ops = pending_ops.saturating_sub(1);
        if *pending_ops > 0 {
            return;
        }
        let succeeded = !fetch.output_failure
            && fetch.cancelled.is_none()
            && fetch
                .request
                .as_ref()
                .is_some_and(|r| r.status() == RequestStatus::Success);
        let remove = (!succeeded).then(|| path.clone());
        let posted = files.post(move |files: &mut FileCore| {
            files.close(id, remove.as_deref());
            me.post(move |core| core.finish_request(id));
        });
        if !posted {
            self.finish_request(id);
        }
    }

    /// The single completion entry point. Later calls are no-ops.
    pub(crate) fn on_request_complete(&mut self, id: FetchId) {
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        if fetch.completing {
            return;
        }
        fetch.completing = true;
        fetch.marks.receive_completed = Some(Instant::now());
        fetch.upload_timer = None;
        fetch.speed_timer = None;
        if matches!(fetch.download, Download::File { .. }) {
            self.file_op_complete(id);
        } else {
            self.finish_request(id);
        }
    }

    pub(crate) fn cancel_fetch(&mut self, id: FetchId) {
        let Some(fetch) = self.fetches.get_mut(&id) else {
            return;
        };
        if !fetch.completing && fetch.request.is_some() {
            fetch.abort(NetError::Aborted);
        }
        self.on_request_complete(id);
    }

    /// Assemble the snapshot, deliver it on the work context and release the fetch.
    fn finish_request(&mut self, id: FetchId) {
        let Some(mut fetch) = self.fetches.remove(&id) else {
            return;
        };
        let url = fetch
            .url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| fetch.handle.initial_url().to_string());
        let request = fetch.request.as_ref();

        let (status, http_code) = fetch.outcome(request.map(|r| (r.status(), r.response_code())));
        if self.log_level > 0 {
            match status {
                TransportStatus::Success => {
                    if let Some(expected) = fetch.expected_size {
                        if expected != fetch.received_bytes {
                            warn!(
                                "[fetch] request incomplete: {} of {} bytes from {}",
                                fetch.received_bytes, expected, url
                            );
                        }
                    }
                }
                TransportStatus::Redirected => {}
                _ => error!("[fetch] request failed: {:?} {}", status, url),
            }
        }

        let info = request.map(|r| r.response_info()).unwrap_or_default();
        let timing = LoadTiming::derive(
            &request.map(|r| r.load_timing()).unwrap_or_default(),
            &fetch.marks,
            info.was_cached,
            request.map(|r| r.total_received_bytes()).unwrap_or(0),
            request.map(|r| r.upload_progress().position).unwrap_or(0),
        );
        let final_url = request.map(|r| r.url().to_string()).unwrap_or_else(|| url.clone());
        let headers = request.and_then(|r| r.response_headers());
        // A partial body is never delivered.
        let body = match std::mem::replace(&mut fetch.download, Download::NotStarted) {
            Download::Buffered(buffer) if status == TransportStatus::Success => Some(buffer.freeze()),
            _ => None,
        };
        if self.log_level > 1 {
            let host = fetch.url.as_ref().and_then(|u| u.host_str()).unwrap_or("");
            let stats = serde_json::to_string(&timing).unwrap_or_default();
            info!(
                "[fetch] (stats) code={} host={} content={} {} {}",
                http_code,
                host,
                body.as_ref().map(|b| b.len()).unwrap_or(0),
                stats,
                url
            );
        }

        // Clear every callback slot before delivery.
        let callbacks = std::mem::take(&mut fetch.callbacks);
        let snapshot = Arc::new(ResponseSnapshot::new(SnapshotParts {
            initial_url: fetch.handle.initial_url().to_string(),
            original_url: url,
            final_url,
            body,
            url_params: std::mem::take(&mut fetch.spec.params),
            timing,
            status,
            http_code,
            headers,
            info,
        }));
        if let Some(completion) = callbacks.completion {
            let handle = fetch.handle.clone();
            if !self.work.post(move |_| completion(&handle, snapshot)) {
                error!("[fetch] {} completion dropped: work context has stopped", id);
            }
        }
        self.fetcher_completed(id);
    }
}
