/*
 * network.rs
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

//! State owned by the network context: the engine context, proxy store, tag
//! index, live count, observers, and every in-flight fetch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, warn};
use url::Url;

use super::{FileContext, ObserverId, PoolObserver};
use crate::config::PoolConfig;
use crate::engine::{EngineContext, EngineParams, FetchId, RequestPriority, TlsPolicy, TransportEngine};
use crate::executor::Poster;
use crate::fetch::FetchState;
use crate::proxy::{ConfigAvailability, ProxyConfig, ProxyConfigObserver, ProxyConfigStore, SystemProxySource};

use super::tags::TagRegistry;

/// Hands effective proxy changes from the store back to the network context.
struct ProxyChanges(Poster<NetCore>);

impl ProxyConfigObserver for ProxyChanges {
    fn on_proxy_config_changed(&mut self, config: &ProxyConfig, availability: ConfigAvailability) {
        let config = config.clone();
        self.0
            .post(move |core| core.on_proxy_config_changed(config, availability));
    }
}

pub(crate) struct NetCore {
    pub(crate) me: Poster<NetCore>,
    pub(crate) work: Poster<()>,
    pub(crate) files: Arc<FileContext>,
    pub(crate) engine: Option<Box<dyn EngineContext>>,
    pub(crate) proxy: ProxyConfigStore,
    pub(crate) fetches: HashMap<FetchId, FetchState>,
    pub(crate) trust_all: bool,
    pub(crate) log_level: u32,
    tls: TlsPolicy,
    tags: TagRegistry,
    live: usize,
    live_tx: watch::Sender<usize>,
    observers: Vec<(ObserverId, Arc<dyn PoolObserver>)>,
}

impl NetCore {
    pub(crate) fn new(
        me: Poster<NetCore>,
        work: Poster<()>,
        files: Arc<FileContext>,
        config: &PoolConfig,
        live_tx: watch::Sender<usize>,
    ) -> Self {
        let mut proxy = ProxyConfigStore::new();
        proxy.add_observer(Box::new(ProxyChanges(me.clone())));
        Self {
            me,
            work,
            files,
            engine: None,
            proxy,
            fetches: HashMap::new(),
            trust_all: config.effective_trust_all(),
            log_level: config.log_level,
            tls: config.tls_policy(),
            tags: TagRegistry::default(),
            live: 0,
            live_tx,
            observers: Vec::new(),
        }
    }

    pub(crate) fn build_engine(&mut self, engine: Arc<dyn TransportEngine>, params: EngineParams) {
        match engine.build_context(params) {
            Ok(context) => {
                self.engine = Some(context);
                debug!("[pool] transport context ready");
            }
            Err(e) => error!("[pool] cannot build transport context: {}", e),
        }
    }

    /// Attach the system proxy source (or none) and route its change notifications here.
    pub(crate) fn activate_proxy(&mut self, mut source: Option<Box<dyn SystemProxySource>>) {
        if let Some(source) = source.as_mut() {
            let me = self.me.clone();
            source.add_observer(Arc::new(move |config: ProxyConfig, availability: ConfigAvailability| {
                me.post(move |core| core.proxy.on_system_config_changed(config, availability));
            }));
        }
        self.proxy.activate(source);
    }

    pub(crate) fn set_proxy_config(&mut self, rules: &str) {
        self.proxy.set_proxy_config(rules);
    }

    fn on_proxy_config_changed(&mut self, config: ProxyConfig, availability: ConfigAvailability) {
        debug!("[pool] effective proxy configuration is now {:?}", config.rules());
        if availability == ConfigAvailability::Valid {
            if let Some(engine) = self.engine.as_mut() {
                engine.proxy_config_changed(&config);
            }
        }
    }

    pub(crate) fn set_trust_all(&mut self, trust: bool) {
        if trust && !cfg!(debug_assertions) {
            warn!("[pool] trusting all certificate authorities is not available in release builds");
        }
        self.trust_all = trust && cfg!(debug_assertions);
    }

    pub(crate) fn set_false_start(&mut self, enable: bool) {
        self.tls.false_start = enable;
        if let Some(engine) = self.engine.as_mut() {
            engine.set_tls_policy(self.tls);
        }
    }

    /// Register an observer. An already idle pool notifies it at once.
    pub(crate) fn add_observer(&mut self, id: ObserverId, observer: Arc<dyn PoolObserver>) {
        self.observers.push((id, observer.clone()));
        if self.live == 0 {
            observer.on_pool_idle();
        }
    }

    pub(crate) fn remove_observer(&mut self, id: ObserverId) {
        self.observers.retain(|(oid, _)| *oid != id);
    }

    pub(crate) fn preconnect(&mut self, url: &str, streams: u32) {
        let Ok(url) = Url::parse(url) else {
            debug!("[pool] preconnect: invalid URL {}", url);
            return;
        };
        let (proxy, _) = self.proxy.latest_config();
        if let Some(engine) = self.engine.as_mut() {
            engine.preconnect(&url, streams, RequestPriority::default(), &proxy);
        }
    }

    pub(crate) fn add_alternate_protocol_hint(&mut self, host: &str, port: u16, alternate_port: u16) {
        if let Some(engine) = self.engine.as_mut() {
            engine.add_alternate_protocol_hint(host, port, alternate_port);
        }
    }

    /// Tag a live fetch. Finished or unknown fetches are not tagged.
    pub(crate) fn tag_fetch(&mut self, id: FetchId, tag: i32) {
        match self.fetches.get(&id) {
            Some(fetch) if !fetch.is_completing() => self.tags.tag(id, tag),
            _ => debug!("[pool] not tagging finished fetch {}", id),
        }
    }

    /// Cancel every fetch tagged `tag`. The tag is emptied before any cancel runs.
    pub(crate) fn cancel_tag(&mut self, tag: i32) {
        let members = self.tags.take_tag(tag);
        debug!("[pool] cancelling {} fetches tagged {}", members.len(), tag);
        for id in members {
            self.cancel_fetch(id);
        }
    }

    pub(crate) fn fetcher_starting(&mut self, _id: FetchId) {
        self.live += 1;
        self.live_tx.send_replace(self.live);
    }

    pub(crate) fn fetcher_completed(&mut self, id: FetchId) {
        self.tags.untag(id);
        if self.live == 0 {
            warn!("[pool] fetch {} completed with no live requests", id);
            return;
        }
        self.live -= 1;
        self.live_tx.send_replace(self.live);
        if self.live == 0 {
            for (_, observer) in &self.observers {
                observer.on_pool_idle();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    #[cfg(test)]
    pub(crate) fn tag_of(&self, id: FetchId) -> Option<i32> {
        self.tags.tag_of(id)
    }
}
