/*
 * fetch_lifecycle.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Fetch state machine tests against a scripted in-memory transport engine.
 * Each URL path selects a behaviour; the engine records what the pool asked
 * of it so tests can inspect the built requests.
 *
 * Run with:
 *   cargo test -p fetchpool_core --test fetch_lifecycle
 */

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use fetchpool_core::engine::{
    EngineContext, EngineParams, EngineRequest, LoadFlags, ReadResult, RedirectInfo, RequestDelegate,
    RequestPriority, RequestStatus, TlsPolicy, TransportEngine, UploadData, UploadElement, UploadProgress,
};
use fetchpool_core::proxy::ProxyConfig;
use fetchpool_core::response::ResponseInfo;
use fetchpool_core::timing::LoadTimingInfo;
use fetchpool_core::{
    CacheBehavior, ConnectionPool, EngineError, FetchHandle, FetchRequest, NetError, OAuthCredentials,
    PoolConfig, PoolObserver, ResponseHeaders, ResponseSnapshot, TransportStatus, UrlParamsEncoding,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone)]
enum Behavior {
    /// Headers (after an optional delay), then the chunks, each read answered synchronously.
    Body {
        code: i32,
        chunks: Vec<Bytes>,
        content_length: Option<u64>,
        delay: Option<Duration>,
    },
    /// Never responds.
    Hang,
    /// Fails before headers.
    Fail(NetError),
    /// Redirects to another path on the same host.
    Redirect(i32, &'static str),
    /// The transfer has already finished when headers arrive; each read hands
    /// over one chunk after `gap`.
    Finished { chunks: Vec<Bytes>, gap: Duration },
}

fn body(chunks: &[&'static [u8]]) -> Behavior {
    let chunks: Vec<Bytes> = chunks.iter().map(|c| Bytes::from_static(c)).collect();
    let len = chunks.iter().map(|c| c.len() as u64).sum();
    Behavior::Body {
        code: 200,
        chunks,
        content_length: Some(len),
        delay: None,
    }
}

/// What the pool asked the engine to do for one request.
#[derive(Debug, Clone, Default)]
struct Recorded {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    flags: LoadFlags,
    upload: Option<UploadData>,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Default)]
struct Script {
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    log: Arc<Mutex<Vec<Recorded>>>,
    proxy_changes: Arc<Mutex<Vec<ProxyConfig>>>,
}

impl Script {
    fn on(&self, path: &str, behavior: Behavior) -> &Self {
        self.behaviors.lock().unwrap().insert(path.to_string(), behavior);
        self
    }

    fn behavior(&self, url: &Url) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(url.path())
            .cloned()
            .unwrap_or_else(|| body(&[b"ok"]))
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    /// Wait until the engine has been told about `config`.
    fn wait_for_proxy(&self, config: &ProxyConfig) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if self.proxy_changes.lock().unwrap().last() == Some(config) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

struct ScriptedEngine(Script);

impl TransportEngine for ScriptedEngine {
    fn build_context(&self, _params: EngineParams) -> Result<Box<dyn EngineContext>, EngineError> {
        Ok(Box::new(ScriptedContext(self.0.clone())))
    }
}

struct ScriptedContext(Script);

impl EngineContext for ScriptedContext {
    fn create_request(
        &mut self,
        url: &Url,
        _priority: RequestPriority,
        _proxy: &ProxyConfig,
        delegate: RequestDelegate,
    ) -> Result<Box<dyn EngineRequest>, EngineError> {
        if url.scheme() != "http" {
            return Err(EngineError::UnsupportedScheme(url.scheme().to_string()));
        }
        Ok(Box::new(ScriptedRequest {
            script: self.0.clone(),
            url: url.clone(),
            delegate,
            recorded: Recorded {
                url: url.to_string(),
                method: "GET".into(),
                ..Recorded::default()
            },
            status: RequestStatus::InProgress,
            code: -1,
            chunks: VecDeque::new(),
            expected: None,
            received: 0,
            gap: None,
        }))
    }

    fn preconnect(&mut self, _url: &Url, _streams: u32, _priority: RequestPriority, _proxy: &ProxyConfig) {}

    fn set_tls_policy(&mut self, _policy: TlsPolicy) {}

    fn proxy_config_changed(&mut self, config: &ProxyConfig) {
        self.0.proxy_changes.lock().unwrap().push(config.clone());
    }
}

struct ScriptedRequest {
    script: Script,
    url: Url,
    delegate: RequestDelegate,
    recorded: Recorded,
    status: RequestStatus,
    code: i32,
    chunks: VecDeque<Bytes>,
    expected: Option<u64>,
    received: u64,
    gap: Option<Duration>,
}

impl ScriptedRequest {
    fn respond(&mut self) {
        match self.script.behavior(&self.url) {
            Behavior::Body {
                code,
                chunks,
                content_length,
                delay,
            } => {
                self.code = code;
                self.chunks = chunks.into();
                self.expected = content_length;
                match delay {
                    Some(delay) => {
                        let delegate = self.delegate.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            delegate.response_started();
                        });
                    }
                    None => self.delegate.response_started(),
                }
            }
            Behavior::Hang => {}
            Behavior::Fail(e) => {
                self.status = RequestStatus::Failed(e);
                self.delegate.response_started();
            }
            Behavior::Finished { chunks, gap } => {
                self.code = 200;
                self.expected = Some(chunks.iter().map(|c| c.len() as u64).sum());
                self.chunks = chunks.into();
                self.gap = Some(gap);
                self.status = RequestStatus::Success;
                self.delegate.response_started();
            }
            Behavior::Redirect(code, path) => {
                self.code = code;
                let new_url = self.url.join(path).unwrap();
                self.delegate.received_redirect(RedirectInfo {
                    status_code: code,
                    new_url,
                });
            }
        }
    }
}

impl EngineRequest for ScriptedRequest {
    fn set_load_flags(&mut self, flags: LoadFlags) {
        self.recorded.flags = flags;
    }

    fn set_method(&mut self, method: &str) {
        self.recorded.method = method.to_string();
    }

    fn set_header(&mut self, name: &str, value: &str, _overwrite: bool) {
        self.recorded.headers.push((name.to_string(), value.to_string()));
    }

    fn set_upload(&mut self, upload: UploadData) {
        self.recorded.upload = Some(upload);
    }

    fn start(&mut self) {
        self.script.log.lock().unwrap().push(self.recorded.clone());
        self.delegate.before_network_start();
        self.respond();
    }

    fn follow_redirect(&mut self) {
        if let Behavior::Redirect(_, path) = self.script.behavior(&self.url) {
            self.url = self.url.join(path).unwrap();
            self.respond();
        }
    }

    fn cancel_with_error(&mut self, error: NetError) {
        let unread = self.status == RequestStatus::Success && !self.chunks.is_empty();
        if self.status == RequestStatus::InProgress || unread {
            self.status = RequestStatus::Cancelled(error);
            self.chunks.clear();
        }
    }

    fn read(&mut self, _max_bytes: usize) -> ReadResult {
        if let RequestStatus::Failed(e) | RequestStatus::Cancelled(e) = self.status {
            return ReadResult::Failed(e);
        }
        match self.chunks.pop_front() {
            Some(chunk) => {
                self.received += chunk.len() as u64;
                let Some(gap) = self.gap else {
                    return ReadResult::Data(chunk);
                };
                let delegate = self.delegate.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(gap).await;
                    delegate.read_completed(ReadResult::Data(chunk));
                });
                ReadResult::Pending
            }
            None => {
                self.status = RequestStatus::Success;
                ReadResult::Eof
            }
        }
    }

    fn upload_progress(&self) -> UploadProgress {
        let size = self
            .recorded
            .upload
            .as_ref()
            .and_then(|u| u.known_len())
            .unwrap_or(0);
        UploadProgress { position: size, size }
    }

    fn total_received_bytes(&self) -> u64 {
        self.received
    }

    fn expected_content_size(&self) -> Option<u64> {
        self.expected
    }

    fn status(&self) -> RequestStatus {
        self.status
    }

    fn response_code(&self) -> i32 {
        self.code
    }

    fn response_headers(&self) -> Option<ResponseHeaders> {
        (self.code > 0).then(|| {
            let mut h = ResponseHeaders::new(format!("HTTP/1.1 {} Scripted", self.code));
            h.push("X-Scripted", "yes");
            h
        })
    }

    fn response_info(&self) -> ResponseInfo {
        ResponseInfo::default()
    }

    fn load_timing(&self) -> LoadTimingInfo {
        LoadTimingInfo::default()
    }

    fn url(&self) -> Url {
        self.url.clone()
    }
}

fn scripted_pool(script: &Script) -> ConnectionPool {
    let config = PoolConfig {
        disable_system_proxy: true,
        log_level: 2,
        ..PoolConfig::default()
    };
    ConnectionPool::create(None, config, Arc::new(ScriptedEngine(script.clone()))).unwrap()
}

/// Start a fetch and return a receiver for its snapshot.
fn start(
    pool: &ConnectionPool,
    url: &str,
    configure: impl FnOnce(&mut FetchRequest),
) -> (FetchHandle, mpsc::Receiver<Arc<ResponseSnapshot>>) {
    let (tx, rx) = mpsc::channel();
    let mut request = pool.create_fetch(url, "GET", move |_, snapshot| {
        tx.send(snapshot).unwrap();
    });
    configure(&mut request);
    (request.start(), rx)
}

fn fetch(pool: &ConnectionPool, url: &str, configure: impl FnOnce(&mut FetchRequest)) -> Arc<ResponseSnapshot> {
    let (_, rx) = start(pool, url, configure);
    rx.recv_timeout(WAIT).unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("fetchpool-lifecycle-{}-{}", std::process::id(), name))
}

#[test]
fn buffered_response() {
    let script = Script::default();
    script.on("/ok", body(&[b"Hello!", b"\n\n"]));
    let pool = scripted_pool(&script);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let snapshot = fetch(&pool, "http://h/ok", |r| {
        r.on_download_progress(move |_, current, total| seen.lock().unwrap().push((current, total)));
    });

    assert_eq!(snapshot.status(), TransportStatus::Success);
    assert_eq!(snapshot.http_code(), 200);
    assert_eq!(snapshot.body().map(|b| &b[..]), Some(&b"Hello!\n\n"[..]));
    assert_eq!(snapshot.first_header("x-scripted"), Some("yes"));
    assert_eq!(snapshot.initial_url(), "http://h/ok");
    assert_eq!(snapshot.final_url(), "http://h/ok");

    pool.drain().unwrap();
    let progress = progress.lock().unwrap();
    assert_eq!(progress.last(), Some(&(8, Some(8))));
}

#[test]
fn unknown_length_body_is_fully_buffered() {
    static CHUNK: [u8; 10_000] = [b'x'; 10_000];
    let script = Script::default();
    script.on(
        "/big",
        Behavior::Body {
            code: 200,
            chunks: vec![Bytes::from_static(&CHUNK); 10],
            content_length: None,
            delay: None,
        },
    );
    let pool = scripted_pool(&script);
    let snapshot = fetch(&pool, "http://h/big", |_| {});
    assert!(snapshot.succeeded());
    assert_eq!(snapshot.body_len(), 100_000);
    assert!(snapshot.body().unwrap().iter().all(|b| *b == b'x'));
}

#[test]
fn completion_fires_once_however_often_cancelled() {
    let script = Script::default();
    script.on("/hang", Behavior::Hang);
    let pool = scripted_pool(&script);

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let mut request = pool.create_fetch("http://h/hang", "GET", move |_, snapshot| {
        assert!(snapshot.cancelled());
        counted.fetch_add(1, Ordering::SeqCst);
    });
    request.set_user_data(17u32);
    let handle = request.start();
    assert_eq!(handle.user_data::<u32>(), Some(&17));
    assert_eq!(handle.user_data::<String>(), None);

    for _ in 0..5 {
        handle.cancel();
    }
    let other = handle.clone();
    std::thread::spawn(move || other.cancel()).join().unwrap();
    pool.drain().unwrap();
    handle.cancel();
    pool.drain().unwrap();
    // Let any stray completion reach the work context.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_fetch_reports_aborted() {
    let script = Script::default();
    script.on("/hang", Behavior::Hang);
    let pool = scripted_pool(&script);
    let (handle, rx) = start(&pool, "http://h/hang", |_| {});
    handle.cancel();
    let snapshot = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(snapshot.status(), TransportStatus::Cancelled(NetError::Aborted));
    assert_eq!(snapshot.http_code(), -1);
    assert!(snapshot.body().is_none());
}

fn finished_in_thirds() -> Behavior {
    Behavior::Finished {
        chunks: vec![
            Bytes::from_static(b"first "),
            Bytes::from_static(b"second "),
            Bytes::from_static(b"third"),
        ],
        gap: Duration::from_millis(300),
    }
}

#[test]
fn finished_transfer_is_delivered_whole() {
    let script = Script::default();
    script.on("/done", finished_in_thirds());
    let pool = scripted_pool(&script);
    let snapshot = fetch(&pool, "http://h/done", |_| {});
    assert_eq!(snapshot.status(), TransportStatus::Success);
    assert_eq!(snapshot.body().map(|b| &b[..]), Some(&b"first second third"[..]));
}

#[test]
fn cancel_after_the_engine_finished_reports_cancelled() {
    let script = Script::default();
    script.on("/done", finished_in_thirds());
    let pool = scripted_pool(&script);
    let (progress_tx, progress) = mpsc::channel();
    let (handle, rx) = start(&pool, "http://h/done", move |r| {
        r.on_download_progress(move |_, current, _| {
            let _ = progress_tx.send(current);
        });
    });
    assert_eq!(progress.recv_timeout(WAIT).unwrap(), 6);
    handle.cancel();

    let snapshot = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(snapshot.status(), TransportStatus::Cancelled(NetError::Aborted));
    assert_eq!(snapshot.http_code(), -1);
    assert!(snapshot.body().is_none());
    pool.drain().unwrap();
}

#[test]
fn cancel_after_the_engine_finished_removes_the_output_file() {
    let script = Script::default();
    script.on("/done", finished_in_thirds());
    let pool = scripted_pool(&script);
    let path = temp_path("finished-cancelled");
    let (progress_tx, progress) = mpsc::channel();
    let (handle, rx) = start(&pool, "http://h/done", |r| {
        r.set_output_file_path(&path).on_download_progress(move |_, current, _| {
            let _ = progress_tx.send(current);
        });
    });
    progress.recv_timeout(WAIT).unwrap();
    handle.cancel();

    let snapshot = rx.recv_timeout(WAIT).unwrap();
    assert!(snapshot.cancelled());
    assert_eq!(snapshot.http_code(), -1);
    assert!(!path.exists());
    pool.drain().unwrap();
}

#[test]
fn engine_hears_effective_proxy_changes() {
    let script = Script::default();
    let pool = scripted_pool(&script);
    assert!(script.wait_for_proxy(&ProxyConfig::direct()));

    pool.set_proxy_config("proxy.local:3128");
    assert!(script.wait_for_proxy(&ProxyConfig::parse("proxy.local:3128")));

    pool.set_proxy_config("");
    assert!(script.wait_for_proxy(&ProxyConfig::direct()));
}

#[test]
fn engine_failure_before_headers() {
    let script = Script::default();
    script.on("/reset", Behavior::Fail(NetError::ConnectionReset));
    let pool = scripted_pool(&script);
    let snapshot = fetch(&pool, "http://h/reset", |_| {});
    assert_eq!(snapshot.status(), TransportStatus::Failed(NetError::ConnectionReset));
    assert_eq!(snapshot.status().error_code(), -101);
    assert_eq!(snapshot.http_code(), -1);
    assert!(snapshot.body().is_none());
}

#[test]
fn build_failures_still_complete() {
    let script = Script::default();
    let pool = scripted_pool(&script);

    let snapshot = fetch(&pool, "not a url", |_| {});
    assert_eq!(snapshot.status(), TransportStatus::Failed(NetError::InvalidUrl));
    assert_eq!(snapshot.http_code(), -1);

    let snapshot = fetch(&pool, "ftp://h/file", |_| {});
    assert_eq!(snapshot.status(), TransportStatus::Failed(NetError::InvalidUrl));
    assert_eq!(snapshot.original_url(), "ftp://h/file");

    assert!(script.recorded().is_empty());
    pool.drain().unwrap();
    assert_eq!(*pool.live_requests().borrow(), 0);
}

#[test]
fn cancel_tag_cancels_only_its_members() {
    let script = Script::default();
    script.on("/hang", Behavior::Hang);
    let pool = scripted_pool(&script);

    let (a, rx_a) = start(&pool, "http://h/hang", |_| {});
    let (b, rx_b) = start(&pool, "http://h/hang", |_| {});
    let (c, rx_c) = start(&pool, "http://h/hang", |_| {});
    pool.tag_fetcher(&a, 7);
    pool.tag_fetcher(&b, 7);
    pool.tag_fetcher(&c, 7);
    // Retagging moves c out of 7.
    pool.tag_fetcher(&c, 8);
    pool.cancel_tag(7);

    assert!(rx_a.recv_timeout(WAIT).unwrap().cancelled());
    assert!(rx_b.recv_timeout(WAIT).unwrap().cancelled());
    assert!(rx_c.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(*pool.live_requests().borrow(), 1);

    // Cancelling the emptied tag again does nothing.
    pool.cancel_tag(7);
    pool.cancel_tag(8);
    assert!(rx_c.recv_timeout(WAIT).unwrap().cancelled());
    pool.drain().unwrap();
}

#[test]
fn tag_cancel_racing_natural_completion() {
    let script = Script::default();
    script.on("/fast", body(&[b"done"]));
    let pool = scripted_pool(&script);
    let mut receivers = Vec::new();
    for _ in 0..20 {
        let (handle, rx) = start(&pool, "http://h/fast", |_| {});
        pool.tag_fetcher(&handle, 3);
        receivers.push(rx);
    }
    pool.cancel_tag(3);
    for rx in receivers {
        let snapshot = rx.recv_timeout(WAIT).unwrap();
        assert!(snapshot.succeeded() || snapshot.cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }
    pool.drain().unwrap();
}

struct CountingObserver(mpsc::Sender<()>);

impl PoolObserver for CountingObserver {
    fn on_pool_idle(&self) {
        let _ = self.0.send(());
    }
}

#[test]
fn idle_observer_is_told_on_registration_and_on_idle() {
    let script = Script::default();
    script.on("/hang", Behavior::Hang);
    let pool = scripted_pool(&script);

    let (tx, rx) = mpsc::channel();
    let id = pool.add_observer(Arc::new(CountingObserver(tx)));
    rx.recv_timeout(WAIT).unwrap();

    let (handle, done) = start(&pool, "http://h/hang", |_| {});
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    handle.cancel();
    done.recv_timeout(WAIT).unwrap();
    rx.recv_timeout(WAIT).unwrap();

    pool.remove_observer(id);
    let (handle, done) = start(&pool, "http://h/hang", |_| {});
    handle.cancel();
    done.recv_timeout(WAIT).unwrap();
    pool.drain().unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn min_speed_watchdog_times_out_a_stalled_fetch() {
    let script = Script::default();
    script.on("/stall", Behavior::Hang);
    let pool = scripted_pool(&script);
    let snapshot = fetch(&pool, "http://h/stall", |r| {
        r.set_min_speed(1000, Duration::from_secs(1));
    });
    assert_eq!(snapshot.status(), TransportStatus::Cancelled(NetError::TimedOut));
    assert_eq!(snapshot.http_code(), -1);
}

#[test]
fn stop_on_redirect_reports_the_redirect_code() {
    let script = Script::default();
    script.on("/moved", Behavior::Redirect(302, "/ok"));
    script.on("/ok", body(&[b"landed"]));
    let pool = scripted_pool(&script);

    let snapshot = fetch(&pool, "http://h/moved", |r| {
        r.set_stop_on_redirect(true);
    });
    assert_eq!(snapshot.status(), TransportStatus::Redirected);
    assert!(snapshot.succeeded());
    assert_eq!(snapshot.http_code(), 302);

    let snapshot = fetch(&pool, "http://h/moved", |_| {});
    assert_eq!(snapshot.status(), TransportStatus::Success);
    assert_eq!(snapshot.final_url(), "http://h/ok");
    assert_eq!(snapshot.original_url(), "http://h/moved");
    assert_eq!(snapshot.body().map(|b| &b[..]), Some(&b"landed"[..]));
}

#[test]
fn request_is_built_from_the_builder() {
    let script = Script::default();
    let pool = scripted_pool(&script);
    let snapshot = fetch(&pool, "http://h/search?x=0", |r| {
        r.set_url_param("b", "2")
            .set_url_param("a", "1 2")
            .set_header("Accept", "text/plain")
            .set_header("accept", "application/json")
            .set_cache_behavior(CacheBehavior::Bypass);
    });
    assert!(snapshot.succeeded());
    assert_eq!(snapshot.original_url(), "http://h/search?x=0&a=1%202&b=2");

    let recorded = script.recorded();
    let r = &recorded[0];
    assert_eq!(r.url, "http://h/search?x=0&a=1%202&b=2");
    assert_eq!(r.method, "GET");
    assert_eq!(r.header("Accept"), Some("application/json"));
    assert!(r.flags.contains(
        LoadFlags::BYPASS_CACHE | LoadFlags::DO_NOT_SAVE_COOKIES | LoadFlags::DO_NOT_SEND_COOKIES
    ));
    assert!(r.upload.is_none());
}

#[test]
fn form_encoding_moves_params_into_the_body() {
    let script = Script::default();
    let pool = scripted_pool(&script);
    fetch(&pool, "http://h/form", |r| {
        r.set_url_param("name", "a b")
            .set_url_param("id", "7")
            .set_url_params_encoding(UrlParamsEncoding::FormBody);
    });
    let r = &script.recorded()[0];
    assert_eq!(r.url, "http://h/form");
    assert_eq!(r.header("Content-Type"), Some("application/x-www-form-urlencoded"));
    assert_eq!(r.header("Content-Length"), Some("15"));
    assert_eq!(r.upload, Some(UploadData::from_bytes(Bytes::from_static(b"id=7&name=a%20b"))));
}

#[test]
fn multipart_with_file_streams_the_file() {
    let script = Script::default();
    let pool = scripted_pool(&script);
    fetch(&pool, "http://h/upload", |r| {
        r.set_url_param("title", "t")
            .set_url_param_file("file", "a.txt", "text/plain", "/data/a.txt", 0, None);
    });
    let r = &script.recorded()[0];
    assert!(r
        .header("Content-Type")
        .unwrap()
        .starts_with("multipart/form-data; boundary=---------------------------"));
    assert_eq!(r.header("Content-Length"), None);
    let upload = r.upload.as_ref().unwrap();
    assert_eq!(upload.elements.len(), 3);
    assert_eq!(
        upload.elements[1],
        UploadElement::File {
            path: PathBuf::from("/data/a.txt"),
            offset: 0,
            length: None
        }
    );
}

#[test]
fn oauth_parameters_are_signed_into_the_query() {
    let script = Script::default();
    let pool = scripted_pool(&script);
    let snapshot = fetch(&pool, "http://h/api", |r| {
        r.set_url_param("status", "hi")
            .set_oauth_credentials(OAuthCredentials::new("key", "secret", "token", "tsecret"));
    });
    let params = snapshot.url_params();
    for name in [
        "oauth_consumer_key",
        "oauth_nonce",
        "oauth_signature",
        "oauth_signature_method",
        "oauth_timestamp",
        "oauth_token",
        "oauth_version",
    ] {
        assert!(params.contains_key(name), "missing {}", name);
    }
    assert_eq!(params["oauth_signature_method"], "HMAC-SHA1");
    let url = &script.recorded()[0].url;
    assert!(url.contains("oauth_signature="));
    assert!(url.contains("status=hi"));
}

#[test]
fn upload_progress_is_reported_while_in_flight() {
    let script = Script::default();
    script.on(
        "/slow",
        Behavior::Body {
            code: 201,
            chunks: vec![Bytes::from_static(b"ok")],
            content_length: Some(2),
            delay: Some(Duration::from_millis(400)),
        },
    );
    let pool = scripted_pool(&script);
    let reports = Arc::new(Mutex::new(Vec::new()));
    let seen = reports.clone();
    let snapshot = fetch(&pool, "http://h/slow", |r| {
        r.set_upload_body("text/plain", "0123456789")
            .on_upload_progress(move |_, position, total| seen.lock().unwrap().push((position, total)));
    });
    assert_eq!(snapshot.http_code(), 201);
    pool.drain().unwrap();
    // The timer stops itself once everything is sent.
    assert_eq!(*reports.lock().unwrap(), vec![(10, Some(10))]);
}

#[test]
fn upload_progress_never_called_without_a_body() {
    let script = Script::default();
    let pool = scripted_pool(&script);
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    fetch(&pool, "http://h/ok", |r| {
        r.on_upload_progress(move |_, _, _| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
    });
    pool.drain().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn output_file_receives_the_body() {
    let script = Script::default();
    script.on("/file", body(&[b"line one\n", b"line two\n"]));
    let pool = scripted_pool(&script);
    let path = temp_path("output");
    let snapshot = fetch(&pool, "http://h/file", |r| {
        r.set_output_file_path(&path);
    });
    assert!(snapshot.succeeded());
    assert!(snapshot.body().is_none());
    assert_eq!(std::fs::read(&path).unwrap(), b"line one\nline two\n");
    std::fs::remove_file(path).unwrap();
}

#[test]
fn output_file_is_removed_on_failure() {
    let script = Script::default();
    script.on("/gone", Behavior::Fail(NetError::ConnectionReset));
    script.on("/ok", body(&[b"data"]));
    let pool = scripted_pool(&script);

    // Failure before headers: the file is never created.
    let path = temp_path("failed");
    let snapshot = fetch(&pool, "http://h/gone", |r| {
        r.set_output_file_path(&path);
    });
    assert!(snapshot.failed());
    assert!(!path.exists());

    // Unwritable path: the fetch fails instead of hanging.
    let bad = temp_path("missing-dir").join("out");
    let snapshot = fetch(&pool, "http://h/ok", |r| {
        r.set_output_file_path(&bad);
    });
    assert!(snapshot.failed());
    assert_eq!(snapshot.http_code(), -1);
    assert!(!bad.exists());
    pool.drain().unwrap();
}

#[test]
fn drain_waits_for_live_fetches() {
    let script = Script::default();
    script.on(
        "/slow",
        Behavior::Body {
            code: 200,
            chunks: vec![Bytes::from_static(b"x")],
            content_length: Some(1),
            delay: Some(Duration::from_millis(200)),
        },
    );
    let pool = scripted_pool(&script);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let done = done.clone();
        pool.create_fetch("http://h/slow", "GET", move |_, _| {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .start();
    }
    pool.drain().unwrap();
    assert_eq!(*pool.live_requests().borrow(), 0);
    // Completions are posted to the work context before the idle signal.
    assert_eq!(done.load(Ordering::SeqCst), 3);
}
