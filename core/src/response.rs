/*
 * response.rs
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

//! Immutable response snapshot delivered to completion callbacks.

use bytes::Bytes;

use crate::error::NetError;
use crate::params::UrlParams;
use crate::timing::LoadTiming;

/// Final status of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Success,
    Failed(NetError),
    Cancelled(NetError),
    /// Stopped at a redirect by request; the HTTP code is the redirect status.
    Redirected,
}

impl TransportStatus {
    /// Success or a requested stop at a redirect.
    pub fn is_success(&self) -> bool {
        matches!(self, TransportStatus::Success | TransportStatus::Redirected)
    }

    pub fn error(&self) -> Option<NetError> {
        match self {
            TransportStatus::Failed(e) | TransportStatus::Cancelled(e) => Some(*e),
            _ => None,
        }
    }

    /// Numeric error code, 0 when there is no error.
    pub fn error_code(&self) -> i32 {
        self.error().map(|e| e.code()).unwrap_or(0)
    }
}

/// Response headers: multi-valued, names compared case-insensitively, order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    status_line: String,
    entries: Vec<(String, String)>,
}

impl ResponseHeaders {
    pub fn new(status_line: impl Into<String>) -> Self {
        Self {
            status_line: status_line.into(),
            entries: Vec::new(),
        }
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn first<'a>(&'a self, name: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in received order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = name.to_string();
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(&name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any value of `name` equals `value` (case-insensitive), also matching
    /// comma-separated list members.
    pub fn has_value(&self, name: &str, value: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How the response was obtained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub was_cached: bool,
    pub was_fetched_via_proxy: bool,
    pub was_fetched_via_spdy: bool,
    pub was_fetched_via_quic: bool,
    /// ALPN or status-line protocol, e.g. "http/1.1".
    pub negotiated_protocol: Option<String>,
}

/// Everything known about a completed fetch. Immutable; share it freely.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    initial_url: String,
    original_url: String,
    final_url: String,
    body: Option<Bytes>,
    url_params: UrlParams,
    timing: LoadTiming,
    status: TransportStatus,
    http_code: i32,
    headers: Option<ResponseHeaders>,
    info: ResponseInfo,
}

/// Parts of a snapshot, assembled by the fetch on completion.
pub(crate) struct SnapshotParts {
    pub initial_url: String,
    pub original_url: String,
    pub final_url: String,
    pub body: Option<Bytes>,
    pub url_params: UrlParams,
    pub timing: LoadTiming,
    pub status: TransportStatus,
    pub http_code: i32,
    pub headers: Option<ResponseHeaders>,
    pub info: ResponseInfo,
}

impl ResponseSnapshot {
    pub(crate) fn new(parts: SnapshotParts) -> Self {
        Self {
            initial_url: parts.initial_url,
            original_url: parts.original_url,
            final_url: parts.final_url,
            body: parts.body,
            url_params: parts.url_params,
            timing: parts.timing,
            status: parts.status,
            http_code: parts.http_code,
            headers: parts.headers,
            info: parts.info,
        }
    }

    /// URL as given by the caller.
    pub fn initial_url(&self) -> &str {
        &self.initial_url
    }

    /// URL actually requested, after query parameters were appended.
    pub fn original_url(&self) -> &str {
        &self.original_url
    }

    /// URL after redirects.
    pub fn final_url(&self) -> &str {
        &self.final_url
    }

    /// Body, when the response was buffered in memory.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Parameters sent with the request, including any OAuth parameters.
    pub fn url_params(&self) -> &UrlParams {
        &self.url_params
    }

    pub fn timing(&self) -> &LoadTiming {
        &self.timing
    }

    pub fn status(&self) -> TransportStatus {
        self.status
    }

    pub fn succeeded(&self) -> bool {
        self.status.is_success()
    }

    pub fn failed(&self) -> bool {
        matches!(self.status, TransportStatus::Failed(_))
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.status, TransportStatus::Cancelled(_))
    }

    /// HTTP status code, or -1 when no usable response was received.
    pub fn http_code(&self) -> i32 {
        self.http_code
    }

    pub fn headers(&self) -> Option<&ResponseHeaders> {
        self.headers.as_ref()
    }

    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|h| h.first(name))
    }

    pub fn has_header_value(&self, name: &str, value: &str) -> bool {
        self.headers
            .as_ref()
            .map(|h| h.has_value(name, value))
            .unwrap_or(false)
    }

    pub fn info(&self) -> &ResponseInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: TransportStatus, code: i32, body: Option<&'static [u8]>) -> ResponseSnapshot {
        let mut headers = ResponseHeaders::new("HTTP/1.1 200 OK");
        headers.push("Content-Type", "text/plain");
        headers.push("Cache-Control", "no-cache, no-store");
        headers.push("cache-control", "private");
        ResponseSnapshot::new(SnapshotParts {
            initial_url: "http://h/a".into(),
            original_url: "http://h/a?x=1".into(),
            final_url: "http://h/b".into(),
            body: body.map(Bytes::from_static),
            url_params: UrlParams::new(),
            timing: LoadTiming::default(),
            status,
            http_code: code,
            headers: Some(headers),
            info: ResponseInfo::default(),
        })
    }

    #[test]
    fn status_predicates() {
        let ok = snapshot(TransportStatus::Success, 200, Some(b"hi"));
        assert!(ok.succeeded() && !ok.failed() && !ok.cancelled());
        assert_eq!(ok.body_len(), 2);

        let failed = snapshot(TransportStatus::Failed(NetError::ConnectionReset), -1, None);
        assert!(failed.failed() && !failed.succeeded());
        assert_eq!(failed.status().error_code(), -101);
        assert_eq!(failed.body_len(), 0);

        let cancelled = snapshot(TransportStatus::Cancelled(NetError::Aborted), -1, None);
        assert!(cancelled.cancelled() && !cancelled.failed());

        let redirected = snapshot(TransportStatus::Redirected, 302, None);
        assert!(redirected.succeeded());
        assert_eq!(redirected.status().error_code(), 0);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let s = snapshot(TransportStatus::Success, 200, None);
        assert_eq!(s.first_header("content-type"), Some("text/plain"));
        let all: Vec<_> = s.headers().unwrap().get_all("CACHE-CONTROL").collect();
        assert_eq!(all, vec!["no-cache, no-store", "private"]);
        assert!(s.has_header_value("Cache-Control", "NO-STORE"));
        assert!(!s.has_header_value("Cache-Control", "public"));
        assert_eq!(s.first_header("missing"), None);
    }

    #[test]
    fn header_values_outlive_the_lookup_key() {
        let s = snapshot(TransportStatus::Success, 200, None);
        let headers = s.headers().unwrap();
        let (first, all) = {
            let key = String::from("cache-control");
            (headers.first(&key), headers.get_all(&key).collect::<Vec<_>>())
        };
        assert_eq!(first, Some("no-cache, no-store"));
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn urls() {
        let s = snapshot(TransportStatus::Success, 200, None);
        assert_eq!(s.initial_url(), "http://h/a");
        assert_eq!(s.original_url(), "http://h/a?x=1");
        assert_eq!(s.final_url(), "http://h/b");
    }
}
