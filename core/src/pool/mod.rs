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

//! The connection pool.
//!
//! A pool owns three execution contexts:
//! - network (`fetchpool-net`): the transport engine context, proxy store,
//!   tags, observers and all fetch state. Every mutation happens here.
//! - work (`fetchpool-work`): caller callbacks (completion, progress).
//! - file (`fetchpool-file`): output file I/O, started on first use.
//!
//! Public methods post to the network context and return at once; the one
//! exception is [`ConnectionPool::drain`], which blocks.
//!
//! When the last `ConnectionPool` clone is dropped the contexts are stopped
//! from the system context, or from a reaper thread when the drop happens on
//! one of the pool's own threads without a system context.

mod network;
mod tags;

pub(crate) use network::NetCore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::engine::{FetchId, TransportEngine};
use crate::error::PoolError;
use crate::executor::{Executor, Poster, SystemContext};
use crate::fetch::{FetchHandle, FetchRequest, FileCore};
use crate::protocol::http::HttpEngine;
use crate::response::ResponseSnapshot;

/// Told when the pool has no live requests.
pub trait PoolObserver: Send + Sync {
    /// Runs on the network context. Must not block.
    fn on_pool_idle(&self);
}

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// The file context, started on first use.
#[derive(Default)]
pub(crate) struct FileContext {
    executor: Mutex<Option<Arc<Executor<FileCore>>>>,
}

impl FileContext {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<Executor<FileCore>>>> {
        self.executor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Poster for the file context, starting it if needed. `None` if the thread cannot start.
    pub fn poster(&self) -> Option<Poster<FileCore>> {
        let mut guard = self.lock();
        if let Some(executor) = guard.as_ref() {
            return Some(executor.poster());
        }
        match Executor::spawn("fetchpool-file", |_| FileCore::default()) {
            Ok(executor) => {
                let poster = executor.poster();
                *guard = Some(Arc::new(executor));
                Some(poster)
            }
            Err(e) => {
                error!("[pool] cannot start file context: {}", e);
                None
            }
        }
    }

    fn take(&self) -> Option<Arc<Executor<FileCore>>> {
        self.lock().take()
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|e| e.runs_tasks_on_current_thread())
    }
}

struct PoolShared {
    config: PoolConfig,
    network: Arc<Executor<NetCore>>,
    work: Arc<Executor<()>>,
    files: Arc<FileContext>,
    system: Option<Arc<dyn SystemContext>>,
    live: watch::Receiver<usize>,
    next_fetch_id: AtomicU64,
    next_observer_id: AtomicU64,
}

impl PoolShared {
    fn on_pool_thread(&self) -> bool {
        self.network.runs_tasks_on_current_thread()
            || self.work.runs_tasks_on_current_thread()
            || self.files.runs_tasks_on_current_thread()
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let files = self.files.take();
        let work = self.work.clone();
        let network = self.network.clone();
        let teardown = move || {
            if let Some(files) = files {
                files.stop();
            }
            work.stop();
            network.stop();
            debug!("[pool] execution contexts stopped");
        };
        match &self.system {
            Some(system) if system.runs_tasks_on_current_thread() => teardown(),
            Some(system) => system.post(Box::new(teardown)),
            None if !self.on_pool_thread() => teardown(),
            None => {
                warn!("[pool] dropped on its own context; stopping from a reaper thread");
                if let Err(e) = thread::Builder::new()
                    .name("fetchpool-reaper".to_string())
                    .spawn(teardown)
                {
                    error!("[pool] cannot start reaper: {}; contexts detached", e);
                }
            }
        }
    }
}

/// Shared HTTP resources and the contexts fetches run on. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Pool using the built-in HTTP/1.1 engine and no system context.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::create(None, config, Arc::new(HttpEngine::new()))
    }

    /// Start the network and work contexts. The engine context is built
    /// asynchronously on the network context; system proxy discovery runs on
    /// `system` unless disabled in `config`.
    pub fn create(
        system: Option<Arc<dyn SystemContext>>,
        config: PoolConfig,
        engine: Arc<dyn TransportEngine>,
    ) -> Result<Self, PoolError> {
        let work = Executor::spawn("fetchpool-work", |_| ())
            .map_err(|source| PoolError::Spawn { name: "work", source })?;
        let files = Arc::new(FileContext::default());
        let (live_tx, live_rx) = watch::channel(0usize);

        let work_poster = work.poster();
        let core_files = files.clone();
        let core_config = config.clone();
        let network = Executor::spawn("fetchpool-net", move |me| {
            NetCore::new(me, work_poster, core_files, &core_config, live_tx)
        })
        .map_err(|source| PoolError::Spawn {
            name: "network",
            source,
        })?;

        let params = config.engine_params();
        network.post(move |core| core.build_engine(engine, params));

        match &system {
            Some(sys) if !config.disable_system_proxy => {
                let discover = sys.clone();
                let network = network.poster();
                sys.post(Box::new(move || {
                    let source = discover.create_proxy_source();
                    network.post(move |core| core.activate_proxy(source));
                }));
            }
            _ => {
                network.post(|core| core.activate_proxy(None));
            }
        }

        debug!("[pool] created");
        Ok(Self {
            inner: Arc::new(PoolShared {
                config,
                network: Arc::new(network),
                work: Arc::new(work),
                files,
                system,
                live: live_rx,
                next_fetch_id: AtomicU64::new(1),
                next_observer_id: AtomicU64::new(1),
            }),
        })
    }

    /// Queue `task` on the network context. False once the pool has stopped.
    pub(crate) fn run_on_network(&self, task: impl FnOnce(&mut NetCore) + Send + 'static) -> bool {
        self.inner.network.post(task)
    }

    pub(crate) fn next_fetch_id(&self) -> FetchId {
        self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Describe a fetch. Nothing happens until [`FetchRequest::start`].
    pub fn create_fetch<F>(&self, url: &str, method: &str, completion: F) -> FetchRequest
    where
        F: FnOnce(&FetchHandle, Arc<ResponseSnapshot>) + Send + 'static,
    {
        FetchRequest::new(self.clone(), url, method, Box::new(completion))
    }

    /// Manual proxy rules (see [`ProxyRules`](crate::proxy::ProxyRules)). Empty rules
    /// return to the system configuration.
    pub fn set_proxy_config(&self, rules: &str) {
        let rules = rules.to_string();
        self.run_on_network(move |core| core.set_proxy_config(&rules));
    }

    /// Accept any certificate authority. Has no effect in release builds.
    pub fn set_trust_all_cert_authorities(&self, trust: bool) {
        self.run_on_network(move |core| core.set_trust_all(trust));
    }

    pub fn set_enable_false_start(&self, enable: bool) {
        self.run_on_network(move |core| core.set_false_start(enable));
    }

    /// Register an idle observer. If the pool is idle it is notified right away.
    pub fn add_observer(&self, observer: Arc<dyn PoolObserver>) -> ObserverId {
        let id = ObserverId(self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.run_on_network(move |core| core.add_observer(id, observer));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.run_on_network(move |core| core.remove_observer(id));
    }

    /// Open up to `streams` idle connections to the origin of `url`. Best effort.
    pub fn preconnect(&self, url: &str, streams: u32) {
        let url = url.to_string();
        self.run_on_network(move |core| core.preconnect(&url, streams));
    }

    /// Group a fetch under `tag` for [`cancel_tag`](Self::cancel_tag). Retagging moves it.
    pub fn tag_fetcher(&self, fetch: &FetchHandle, tag: i32) {
        let id = fetch.id();
        self.run_on_network(move |core| core.tag_fetch(id, tag));
    }

    /// Cancel every fetch tagged `tag`.
    pub fn cancel_tag(&self, tag: i32) {
        self.run_on_network(move |core| core.cancel_tag(tag));
    }

    /// Number of live fetches, updated on the network context. The first value seen
    /// answers whether the pool is already idle.
    pub fn live_requests(&self) -> watch::Receiver<usize> {
        self.inner.live.clone()
    }

    pub fn add_alternate_protocol_hint(&self, host: &str, port: u16, alternate_port: u16) {
        let host = host.to_string();
        self.run_on_network(move |core| core.add_alternate_protocol_hint(&host, port, alternate_port));
    }

    /// Block until the pool has no live fetches. No timeout: meant for orderly shutdown.
    /// Fails when called on the pool's network or work context, where it would deadlock.
    pub fn drain(&self) -> Result<(), PoolError> {
        if self.inner.network.runs_tasks_on_current_thread() || self.inner.work.runs_tasks_on_current_thread() {
            return Err(PoolError::DrainOnPoolContext);
        }
        let (tx, rx) = sync_channel(1);
        let observer = Arc::new(DrainObserver {
            work: self.inner.work.poster(),
            signal: Mutex::new(Some(tx)),
        });
        let id = self.add_observer(observer);
        let result = rx.recv().map_err(|_| PoolError::ShutDown);
        self.remove_observer(id);
        result
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn log_level(&self) -> u32 {
        self.inner.config.log_level
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("live", &*self.inner.live.borrow())
            .finish()
    }
}

/// One-shot observer behind `drain`: signals the waiting caller from the work context.
struct DrainObserver {
    work: Poster<()>,
    signal: Mutex<Option<SyncSender<()>>>,
}

impl PoolObserver for DrainObserver {
    fn on_pool_idle(&self) {
        let signal = self.signal.lock().ok().and_then(|mut s| s.take());
        if let Some(tx) = signal {
            self.work.post(move |_| {
                let _ = tx.send(());
            });
        }
    }
}
