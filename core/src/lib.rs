/*
 * lib.rs
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

//! Fetchpool core: HTTP request orchestration over a pluggable transport engine.
//!
//! A [`ConnectionPool`] owns the shared transport state and three execution
//! contexts (network, work, file). Fetches are described with a
//! [`FetchRequest`], started into a [`FetchHandle`], and finish with exactly
//! one completion callback carrying an immutable [`ResponseSnapshot`].

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod mime;
mod net;
pub mod oauth;
pub mod params;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod response;
pub mod timing;

pub use config::PoolConfig;
pub use engine::{FetchId, RequestPriority, TransportEngine};
pub use error::{EngineError, NetError, PoolError};
pub use executor::{SystemContext, SystemThread};
pub use fetch::{CacheBehavior, FetchHandle, FetchRequest, UrlParamsEncoding};
pub use oauth::OAuthCredentials;
pub use params::UrlParams;
pub use pool::{ConnectionPool, ObserverId, PoolObserver};
pub use protocol::http::HttpEngine;
pub use proxy::{ProxyConfig, ProxyRules};
pub use response::{ResponseHeaders, ResponseSnapshot, TransportStatus};
pub use timing::LoadTiming;
