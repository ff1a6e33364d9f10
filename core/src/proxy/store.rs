/*
 * store.rs
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

//! Effective proxy configuration: a manual override merged with an optional
//! system-detected source.
//!
//! The store is owned by the pool's network context and is not thread-safe.
//! System sources report changes through a [`SystemConfigCallback`], which the
//! pool forwards back onto the network context.

use std::sync::Arc;

use tracing::{debug, warn};

use super::ProxyConfig;

/// Whether a reported configuration can be used yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAvailability {
    /// Still being determined; not yet usable.
    Pending,
    Valid,
}

/// Called by a system source when its configuration changes. May be invoked from any thread.
pub type SystemConfigCallback = Arc<dyn Fn(ProxyConfig, ConfigAvailability) + Send + Sync>;

/// Platform proxy settings provider (environment, OS settings, PAC resolver, ...).
pub trait SystemProxySource: Send {
    /// Current configuration, synchronously.
    fn latest_config(&self) -> (ProxyConfig, ConfigAvailability);

    /// Register for change notifications.
    fn add_observer(&mut self, callback: SystemConfigCallback);
}

/// Receives effective configuration changes from the store.
pub trait ProxyConfigObserver {
    fn on_proxy_config_changed(&mut self, config: &ProxyConfig, availability: ConfigAvailability);
}

/// Merges manual proxy rules with the system source.
pub struct ProxyConfigStore {
    config: ProxyConfig,
    availability: ConfigAvailability,
    manual: bool,
    initializing: bool,
    source: Option<Box<dyn SystemProxySource>>,
    observers: Vec<(u64, Box<dyn ProxyConfigObserver>)>,
    next_observer_id: u64,
}

impl ProxyConfigStore {
    /// New store: pending, direct, awaiting activation.
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::direct(),
            availability: ConfigAvailability::Pending,
            manual: false,
            initializing: true,
            source: None,
            observers: Vec::new(),
            next_observer_id: 1,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn availability(&self) -> ConfigAvailability {
        self.availability
    }

    pub fn has_system_source(&self) -> bool {
        self.source.is_some()
    }

    /// Attach the system source (or none). Adopts its configuration unless a manual override is active.
    pub fn activate(&mut self, source: Option<Box<dyn SystemProxySource>>) {
        self.initializing = false;
        if source.is_none() {
            warn!("[proxy] no system proxy source; using direct connections");
        }
        self.source = source;
        if !self.manual {
            let (config, availability) = match &self.source {
                Some(s) => s.latest_config(),
                None => (ProxyConfig::direct(), ConfigAvailability::Valid),
            };
            self.on_system_config_changed(config, availability);
        }
    }

    /// Change notification from the system source. Ignored while a manual override is active.
    pub fn on_system_config_changed(&mut self, config: ProxyConfig, availability: ConfigAvailability) {
        if self.manual {
            debug!("[proxy] system change ignored: manual override active");
            return;
        }
        if availability == ConfigAvailability::Pending
            && self.availability != ConfigAvailability::Pending
        {
            // Never return to pending once a usable config has been published.
            return;
        }
        self.availability = availability;
        self.config = config;
        if self.availability != ConfigAvailability::Pending {
            self.notify();
        }
    }

    /// Set manual rules. Empty rules clear the override and fall back to the system source (or direct).
    pub fn set_proxy_config(&mut self, rules: &str) {
        if !rules.trim().is_empty() {
            self.manual = true;
            self.config = ProxyConfig::parse(rules);
            self.availability = ConfigAvailability::Valid;
        } else if let Some(source) = &self.source {
            self.manual = false;
            let (config, availability) = source.latest_config();
            self.config = config;
            if availability != ConfigAvailability::Pending
                || self.availability == ConfigAvailability::Pending
            {
                self.availability = availability;
            }
        } else if self.initializing {
            self.config = ProxyConfig::direct();
            if self.availability != ConfigAvailability::Pending {
                self.manual = false;
                self.availability = ConfigAvailability::Valid;
            }
        } else {
            self.manual = false;
            self.config = ProxyConfig::direct();
            self.availability = ConfigAvailability::Valid;
        }
        if self.availability != ConfigAvailability::Pending {
            self.notify();
        }
    }

    /// Configuration to use now: the stored one under a manual override or without a source,
    /// otherwise read live from the system source.
    pub fn latest_config(&self) -> (ProxyConfig, ConfigAvailability) {
        match &self.source {
            Some(source) if !self.manual => source.latest_config(),
            _ => (self.config.clone(), self.availability),
        }
    }

    /// The stored effective configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Register an observer; returns an id for removal.
    pub fn add_observer(&mut self, observer: Box<dyn ProxyConfigObserver>) -> u64 {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn remove_observer(&mut self, id: u64) {
        self.observers.retain(|(oid, _)| *oid != id);
    }

    fn notify(&mut self) {
        let config = &self.config;
        let availability = self.availability;
        for (_, observer) in self.observers.iter_mut() {
            observer.on_proxy_config_changed(config, availability);
        }
    }
}

impl Default for ProxyConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
