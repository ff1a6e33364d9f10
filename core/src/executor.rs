/*
 * executor.rs
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

//! Single-threaded execution contexts.
//!
//! An [`Executor`] is a named thread running a tokio current-thread runtime.
//! It owns a state value and runs posted `FnOnce(&mut S)` tasks one at a time,
//! in order. Futures spawned from a task (timers, socket I/O) run on the same
//! thread between tasks. Posting is the only way to reach the state, so the
//! state needs no locking.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::proxy::SystemProxySource;

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Message<S> {
    Run(Task<S>),
    Stop,
}

/// Cloneable handle for posting tasks to an executor.
pub(crate) struct Poster<S> {
    tx: mpsc::UnboundedSender<Message<S>>,
    thread: ThreadId,
}

impl<S> Clone for Poster<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            thread: self.thread,
        }
    }
}

impl<S: 'static> Poster<S> {
    /// Queue a task. Returns false once the executor has stopped.
    pub fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx.send(Message::Run(Box::new(task))).is_ok()
    }

    pub fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread
    }
}

/// A named thread that owns `S` and runs tasks against it.
pub(crate) struct Executor<S> {
    name: &'static str,
    poster: Poster<S>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> Executor<S> {
    /// Start the thread. `init` builds the state on the new thread, inside the runtime,
    /// and receives a poster for the executor itself.
    pub fn spawn<F>(name: &'static str, init: F) -> io::Result<Self>
    where
        F: FnOnce(Poster<S>) -> S + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner_tx = tx.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let poster = Poster {
                    tx: inner_tx,
                    thread: thread::current().id(),
                };
                run_loop(name, rx, poster, init);
            })?;
        let thread = handle.thread().id();
        Ok(Self {
            name,
            poster: Poster { tx, thread },
            join: Mutex::new(Some(handle)),
        })
    }

    pub fn poster(&self) -> Poster<S> {
        self.poster.clone()
    }

    pub fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.poster.post(task)
    }

    pub fn runs_tasks_on_current_thread(&self) -> bool {
        self.poster.runs_tasks_on_current_thread()
    }

    /// Finish queued tasks, stop, and join the thread. Must be called from another thread.
    pub fn stop(&self) {
        if self.runs_tasks_on_current_thread() {
            warn!("[executor] {} cannot stop itself", self.name);
            return;
        }
        let _ = self.poster.tx.send(Message::Stop);
        let handle = self.join.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[executor] {} panicked", self.name);
            }
            debug!("[executor] {} stopped", self.name);
        }
    }
}

impl<S> Drop for Executor<S> {
    fn drop(&mut self) {
        // Detach if stop() was never called; the thread exits after its queue drains.
        let _ = self.poster.tx.send(Message::Stop);
    }
}

fn run_loop<S, F>(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<Message<S>>,
    poster: Poster<S>,
    init: F,
) where
    F: FnOnce(Poster<S>) -> S,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("[executor] {}: cannot build runtime: {}", name, e);
            return;
        }
    };
    runtime.block_on(async move {
        let mut state = init(poster);
        while let Some(message) = rx.recv().await {
            match message {
                Message::Run(task) => task(&mut state),
                Message::Stop => break,
            }
        }
    });
}

/// The caller's UI or system context. Pool teardown runs here so that no pool
/// context has to stop itself; system proxy discovery runs here too.
pub trait SystemContext: Send + Sync + 'static {
    fn post(&self, task: Box<dyn FnOnce() + Send>);

    fn runs_tasks_on_current_thread(&self) -> bool;

    /// Discover the platform proxy source. Called on this context.
    fn create_proxy_source(&self) -> Option<Box<dyn SystemProxySource>> {
        None
    }
}

type ProxySourceFactory = Box<dyn Fn() -> Option<Box<dyn SystemProxySource>> + Send + Sync>;

/// A [`SystemContext`] backed by a dedicated thread.
pub struct SystemThread {
    executor: Executor<()>,
    proxy_source: Option<ProxySourceFactory>,
}

impl SystemThread {
    pub fn spawn(name: &'static str) -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            executor: Executor::spawn(name, |_| ())?,
            proxy_source: None,
        }))
    }

    /// Like `spawn`, with a factory used for system proxy discovery.
    pub fn with_proxy_source<F>(name: &'static str, factory: F) -> io::Result<Arc<Self>>
    where
        F: Fn() -> Option<Box<dyn SystemProxySource>> + Send + Sync + 'static,
    {
        Ok(Arc::new(Self {
            executor: Executor::spawn(name, |_| ())?,
            proxy_source: Some(Box::new(factory)),
        }))
    }
}

impl SystemContext for SystemThread {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        self.executor.post(move |_| task());
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.executor.runs_tasks_on_current_thread()
    }

    fn create_proxy_source(&self) -> Option<Box<dyn SystemProxySource>> {
        self.proxy_source.as_ref().and_then(|f| f())
    }
}
