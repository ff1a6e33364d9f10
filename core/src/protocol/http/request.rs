/*
 * request.rs
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

//! HTTP/1.1 request head: method, target, headers.

use url::Url;

/// Request line and headers, in the order they were set.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Vec::new(),
        }
    }

    /// Set a header. Names compare case-insensitively; without `overwrite` an existing value is kept.
    pub fn set(&mut self, name: &str, value: &str, overwrite: bool) {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            if overwrite {
                entry.1 = value.to_string();
            }
            return;
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Serialize the head. `absolute_form` is used when talking to a plain HTTP proxy.
    /// `body_len` adds Content-Length unless the caller set one.
    pub fn encode(&self, url: &Url, absolute_form: bool, body_len: Option<u64>, user_agent: &str) -> Vec<u8> {
        let target = if absolute_form {
            let mut u = url.clone();
            u.set_fragment(None);
            u.to_string()
        } else {
            origin_form(url)
        };
        let mut req = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, target, host_header(url));
        if self.get("User-Agent").is_none() && !user_agent.is_empty() {
            req.push_str("User-Agent: ");
            req.push_str(user_agent);
            req.push_str("\r\n");
        }
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("host") {
                continue;
            }
            req.push_str(k);
            req.push_str(": ");
            req.push_str(v);
            req.push_str("\r\n");
        }
        if self.get("Content-Length").is_none() {
            match body_len {
                Some(len) => req.push_str(&format!("Content-Length: {}\r\n", len)),
                None if needs_empty_length(&self.method) => req.push_str("Content-Length: 0\r\n"),
                None => {}
            }
        }
        if self.get("Connection").is_none() {
            req.push_str("Connection: keep-alive\r\n");
        }
        req.push_str("\r\n");
        req.into_bytes()
    }
}

impl Default for RequestHead {
    fn default() -> Self {
        Self::new()
    }
}

fn needs_empty_length(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

/// Path and query, as sent to an origin server.
pub(crate) fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Host header value: host, plus the port when it is not the scheme default.
pub(crate) fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(head: &RequestHead, url: &str, absolute: bool, len: Option<u64>) -> String {
        let url = Url::parse(url).unwrap();
        String::from_utf8(head.encode(&url, absolute, len, "fetchpool-test")).unwrap()
    }

    #[test]
    fn get_origin_form() {
        let head = RequestHead::new();
        let s = text(&head, "http://example.com:8080/a/b?x=1#frag", false, None);
        assert!(s.starts_with("GET /a/b?x=1 HTTP/1.1\r\nHost: example.com:8080\r\n"));
        assert!(s.contains("User-Agent: fetchpool-test\r\n"));
        assert!(s.contains("Connection: keep-alive\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn absolute_form_for_proxies() {
        let head = RequestHead::new();
        let s = text(&head, "http://example.com/p?q#f", true, None);
        assert!(s.starts_with("GET http://example.com/p?q HTTP/1.1\r\nHost: example.com\r\n"));
    }

    #[test]
    fn headers_overwrite_case_insensitively() {
        let mut head = RequestHead::new();
        head.set("X-Thing", "1", true);
        head.set("x-thing", "2", true);
        head.set("X-THING", "3", false);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.get("X-Thing"), Some("2"));
        head.set("User-Agent", "custom", true);
        let s = text(&head, "http://h/", false, None);
        assert!(s.contains("User-Agent: custom\r\n"));
        assert!(!s.contains("fetchpool-test"));
    }

    #[test]
    fn content_length() {
        let mut head = RequestHead::new();
        head.method = "POST".into();
        assert!(text(&head, "http://h/", false, None).contains("Content-Length: 0\r\n"));
        assert!(text(&head, "http://h/", false, Some(12)).contains("Content-Length: 12\r\n"));
        head.set("Content-Length", "5", true);
        let s = text(&head, "http://h/", false, Some(12));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(!s.contains("Content-Length: 12"));
    }
}
