/*
 * config.rs
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

//! Pool configuration. Loadable from JSON; missing fields take their defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::{CacheParams, EngineParams, TlsPolicy};
use crate::error::PoolError;

/// Default User-Agent sent by the built-in engine.
pub const DEFAULT_USER_AGENT: &str = concat!("fetchpool/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub user_agent: String,
    pub enable_spdy: bool,
    pub enable_quic: bool,
    pub enable_ssl_false_start: bool,
    /// Accept any certificate authority. Ignored in release builds.
    pub trust_all_cert_authorities: bool,
    /// Do not consult the system context for proxy settings.
    pub disable_system_proxy: bool,
    pub cache_path: Option<PathBuf>,
    pub cache_max_bytes: u64,
    /// 0: quiet, 1: failures and short bodies, 2: per-request statistics.
    pub log_level: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            enable_spdy: true,
            enable_quic: false,
            enable_ssl_false_start: true,
            trust_all_cert_authorities: false,
            disable_system_proxy: false,
            cache_path: None,
            cache_max_bytes: 0,
            log_level: 0,
        }
    }
}

impl PoolConfig {
    pub fn from_json(json: &str) -> Result<Self, PoolError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, PoolError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Disk cache settings, only when both a path and a nonzero budget are given.
    pub fn cache(&self) -> Option<CacheParams> {
        match &self.cache_path {
            Some(path) if self.cache_max_bytes > 0 && !path.as_os_str().is_empty() => Some(CacheParams {
                path: path.clone(),
                max_bytes: self.cache_max_bytes,
            }),
            _ => None,
        }
    }

    /// Whether certificate authority errors are ignored. Always false in release builds.
    pub fn effective_trust_all(&self) -> bool {
        cfg!(debug_assertions) && self.trust_all_cert_authorities
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        TlsPolicy {
            false_start: self.enable_ssl_false_start,
            ..TlsPolicy::default()
        }
    }

    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            user_agent: self.user_agent.clone(),
            enable_spdy: self.enable_spdy,
            enable_quic: self.enable_quic,
            cache: self.cache(),
            tls: self.tls_policy(),
        }
    }
}
