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

//! Proxy configuration: rule parsing and the manual/system merge store.
//!
//! Rules use the familiar `scheme=server;scheme=server` syntax, for example
//! `http=proxy:3128;https=secure-proxy:8443`, or a bare `proxy:3128` applying
//! to every scheme. `socks=server` is the fallback for schemes with no rule.

mod store;

pub use store::{ConfigAvailability, ProxyConfigObserver, ProxyConfigStore, SystemConfigCallback, SystemProxySource};

use std::collections::BTreeMap;

use url::Url;

/// Protocol spoken to a proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Direct,
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Some(ProxyScheme::Direct),
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks4" => Some(ProxyScheme::Socks4),
            "socks" | "socks5" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Direct => 0,
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
            ProxyScheme::Socks4 | ProxyScheme::Socks5 => 1080,
        }
    }
}

/// One proxy server (or the direct pseudo-server).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyServer {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl ProxyServer {
    pub fn direct() -> Self {
        Self {
            scheme: ProxyScheme::Direct,
            host: String::new(),
            port: 0,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.scheme == ProxyScheme::Direct
    }

    /// Parse `[scheme://]host[:port]`. `default_scheme` applies when no scheme is given.
    pub fn parse(s: &str, default_scheme: ProxyScheme) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (scheme, rest) = match s.find("://") {
            Some(i) => (ProxyScheme::from_str(&s[..i])?, &s[i + 3..]),
            None => (default_scheme, s),
        };
        if scheme == ProxyScheme::Direct {
            return Some(Self::direct());
        }
        let rest = rest.trim_end_matches('/');
        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            // [v6addr]:port
            let end = stripped.find(']')?;
            let host = &stripped[..end];
            let after = &stripped[end + 1..];
            let port = match after.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if after.is_empty() => scheme.default_port(),
                None => return None,
            };
            (host.to_string(), port)
        } else {
            match rest.rfind(':') {
                Some(i) => (rest[..i].to_string(), rest[i + 1..].parse().ok()?),
                None => (rest.to_string(), scheme.default_port()),
            }
        };
        if host.is_empty() {
            return None;
        }
        Some(Self { scheme, host, port })
    }
}

/// Parsed manual proxy rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRules {
    /// Servers for every scheme (bare entries).
    all: Vec<ProxyServer>,
    /// Servers by URL scheme (`http=...`).
    by_scheme: BTreeMap<String, Vec<ProxyServer>>,
    /// `socks=...` fallback for schemes without a rule.
    fallback: Vec<ProxyServer>,
}

impl ProxyRules {
    /// Parse a rules string. Entries that cannot be parsed are skipped.
    pub fn parse(rules: &str) -> Self {
        let mut out = ProxyRules::default();
        for entry in rules.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('=') {
                Some((scheme, servers)) => {
                    let scheme = scheme.trim().to_ascii_lowercase();
                    if scheme == "socks" {
                        out.fallback
                            .extend(parse_list(servers, ProxyScheme::Socks4));
                    } else {
                        let list = parse_list(servers, ProxyScheme::Http);
                        if !list.is_empty() {
                            out.by_scheme.entry(scheme).or_default().extend(list);
                        }
                    }
                }
                None => out.all.extend(parse_list(entry, ProxyScheme::Http)),
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.by_scheme.is_empty() && self.fallback.is_empty()
    }

    /// The first server configured for a URL scheme, if any.
    pub fn server_for_scheme(&self, scheme: &str) -> Option<&ProxyServer> {
        if let Some(s) = self.all.first() {
            return Some(s);
        }
        self.by_scheme
            .get(&scheme.to_ascii_lowercase())
            .and_then(|list| list.first())
            .or_else(|| self.fallback.first())
    }
}

fn parse_list(servers: &str, default_scheme: ProxyScheme) -> Vec<ProxyServer> {
    servers
        .split(',')
        .filter_map(|s| ProxyServer::parse(s, default_scheme))
        .collect()
}

/// An effective proxy configuration: direct, or a set of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    rules: ProxyRules,
}

impl ProxyConfig {
    /// No proxy.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: ProxyRules) -> Self {
        Self { rules }
    }

    /// Parse a rules string into a configuration.
    pub fn parse(rules: &str) -> Self {
        Self::from_rules(ProxyRules::parse(rules))
    }

    pub fn rules(&self) -> &ProxyRules {
        &self.rules
    }

    pub fn is_direct(&self) -> bool {
        self.rules.is_empty()
    }

    /// Proxy to use for `url`, or `None` to connect directly.
    pub fn proxy_for(&self, url: &Url) -> Option<&ProxyServer> {
        self.rules
            .server_for_scheme(url.scheme())
            .filter(|s| !s.is_direct())
    }
}
