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

//! Built-in transport engine: HTTP/1.1 over TCP or TLS.
//!
//! Design:
//! - One I/O task per request, spawned on the pool's network runtime.
//! - Push-parsed responses (`h1::ResponseParser`); body chunks are `Bytes` slices of the read buffer.
//! - Keep-alive connections parked per origin and proxy; `preconnect` fills the same pool.
//! - TLS via tokio-rustls with ALPN `http/1.1`.
//! - Plain HTTP proxies get absolute-form targets; HTTPS goes through CONNECT tunnels.
//! - No disk cache: only-from-cache requests fail with `CacheMiss`.

mod connection;
mod exchange;
mod h1;
mod request;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::engine::{
    EngineContext, EngineParams, EngineRequest, RequestDelegate, RequestPriority, TlsPolicy,
    TransportEngine,
};
use crate::error::EngineError;
use crate::net::TlsConfigs;
use crate::proxy::ProxyConfig;
use crate::timing::{LoadTimingInfo, Phase};
use connection::{connect, IdleSockets, OriginKey};
use exchange::HttpRequest;

/// The built-in engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpEngine;

impl HttpEngine {
    pub fn new() -> Self {
        Self
    }
}

impl TransportEngine for HttpEngine {
    fn build_context(&self, params: EngineParams) -> Result<Box<dyn EngineContext>, EngineError> {
        if let Some(cache) = &params.cache {
            warn!(
                "[http] disk cache at {} not supported; continuing without it",
                cache.path.display()
            );
        }
        if params.enable_spdy || params.enable_quic {
            debug!("[http] spdy/quic requested; only http/1.1 is spoken");
        }
        Ok(Box::new(HttpContext {
            shared: Arc::new(ContextShared {
                user_agent: params.user_agent,
                idle: IdleSockets::default(),
                next_socket_id: AtomicU32::new(1),
            }),
            tls: TlsConfigs::new(&params.tls),
            alternates: HashMap::new(),
        }))
    }
}

/// State shared by a context and all of its requests' I/O tasks.
pub(crate) struct ContextShared {
    user_agent: String,
    idle: IdleSockets,
    next_socket_id: AtomicU32,
}

struct HttpContext {
    shared: Arc<ContextShared>,
    tls: TlsConfigs,
    /// Alternate-protocol hints, kept for a future QUIC transport.
    alternates: HashMap<(String, u16), u16>,
}

fn check_scheme(url: &Url) -> Result<(), EngineError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(EngineError::UnsupportedScheme(other.to_string())),
    }
}

impl EngineContext for HttpContext {
    fn create_request(
        &mut self,
        url: &Url,
        _priority: RequestPriority,
        proxy: &ProxyConfig,
        delegate: RequestDelegate,
    ) -> Result<Box<dyn EngineRequest>, EngineError> {
        check_scheme(url)?;
        let mut proxy_resolve = Phase::default();
        proxy_resolve.begin();
        let server = proxy.proxy_for(url).cloned();
        proxy_resolve.finish();
        Ok(Box::new(HttpRequest::new(
            url.clone(),
            server,
            proxy_resolve,
            self.tls.clone(),
            self.shared.clone(),
            delegate,
        )))
    }

    fn preconnect(&mut self, url: &Url, streams: u32, _priority: RequestPriority, proxy: &ProxyConfig) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if check_scheme(url).is_err() {
            return;
        }
        let key = match OriginKey::new(url, proxy.proxy_for(url), false) {
            Ok(key) => key,
            Err(_) => return,
        };
        let missing = (streams as usize).saturating_sub(self.shared.idle.count(&key));
        for _ in 0..missing {
            let key = key.clone();
            let shared = self.shared.clone();
            let tls = self.tls.verified.clone();
            runtime.spawn(async move {
                let socket_id = shared.next_socket_id.fetch_add(1, Ordering::Relaxed);
                let mut timing = LoadTimingInfo::default();
                match connect(&key, tls, socket_id, &mut timing).await {
                    Ok(conn) => shared.idle.put(key, conn),
                    Err(e) => debug!("[http] preconnect to {}:{} failed: {}", key.host, key.port, e),
                }
            });
        }
    }

    fn set_tls_policy(&mut self, policy: TlsPolicy) {
        self.tls = TlsConfigs::new(&policy);
    }

    fn proxy_config_changed(&mut self, _config: &ProxyConfig) {
        let closed = self.shared.idle.clear();
        if closed > 0 {
            debug!("[http] proxy configuration changed; closed {} idle connections", closed);
        }
    }

    fn add_alternate_protocol_hint(&mut self, host: &str, port: u16, alternate_port: u16) {
        debug!("[http] alternate protocol hint {}:{} -> {}", host, port, alternate_port);
        self.alternates.insert((host.to_ascii_lowercase(), port), alternate_port);
    }
}
