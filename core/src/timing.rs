/*
 * timing.rs
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

//! Load timing: raw phase marks from the transport and the derived per-request telemetry.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Start/end marks of one transport phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Phase {
    pub start: Option<Instant>,
    pub end: Option<Instant>,
}

impl Phase {
    pub fn begin(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn finish(&mut self) {
        self.end = Some(Instant::now());
    }

    /// Milliseconds between start and end; zero unless both are set and end is after start.
    pub fn ms(&self) -> u32 {
        match (self.start, self.end) {
            (Some(s), Some(e)) if e > s => millis(e - s),
            _ => 0,
        }
    }
}

/// Phase marks reported by the transport engine for one request.
#[derive(Debug, Clone, Default)]
pub struct LoadTimingInfo {
    /// Wall-clock time the engine started the request.
    pub request_start_time: Option<DateTime<Utc>>,
    pub socket_reused: bool,
    pub socket_log_id: u32,
    pub proxy_resolve: Phase,
    pub dns: Phase,
    pub connect: Phase,
    pub ssl: Phase,
    pub send: Phase,
    pub receive_headers_end: Option<Instant>,
}

/// Marks recorded by the fetch itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchMarks {
    pub started_at: Option<DateTime<Utc>>,
    pub request_started: Option<Instant>,
    pub network_started: Option<Instant>,
    pub receive_started: Option<Instant>,
    pub receive_completed: Option<Instant>,
}

/// Timing telemetry attached to every response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadTiming {
    /// Start time in seconds since the Unix epoch.
    pub start_s: f64,
    pub queued_ms: u32,
    pub dns_ms: u32,
    pub connect_ms: u32,
    pub ssl_ms: u32,
    pub proxy_resolve_ms: u32,
    pub send_ms: u32,
    pub headers_receive_ms: u32,
    pub data_receive_ms: u32,
    pub total_ms: u32,
    pub from_cache: bool,
    pub socket_reused: bool,
    pub socket_log_id: u32,
    pub total_recv_bytes: u64,
    pub total_send_bytes: u64,
}

impl LoadTiming {
    /// Derive telemetry from engine marks and the fetch's own marks.
    ///
    /// Queue time is whatever part of the total no measured phase accounts for.
    pub fn derive(
        info: &LoadTimingInfo,
        marks: &FetchMarks,
        from_cache: bool,
        total_recv_bytes: u64,
        total_send_bytes: u64,
    ) -> Self {
        let start = info.request_start_time.or(marks.started_at);
        let start_s = start
            .map(|t| t.timestamp_millis() as f64 / 1000.0)
            .unwrap_or(0.0);

        let total_ms = span_ms(marks.request_started, marks.receive_completed);
        let dns_ms = info.dns.ms();
        let ssl_ms = info.ssl.ms();
        let mut connect_ms = info.connect.ms();
        // TLS happens inside the connect phase.
        if connect_ms > ssl_ms {
            connect_ms -= ssl_ms;
        }
        let proxy_resolve_ms = info.proxy_resolve.ms();
        let send_ms = info.send.ms();
        let headers_receive_ms = match info.send.start {
            Some(_) => span_ms(info.send.end, info.receive_headers_end),
            None => 0,
        };
        let data_receive_ms = match marks.receive_started {
            Some(_) => span_ms(marks.receive_started, marks.receive_completed),
            None => 0,
        };

        let sum = [
            proxy_resolve_ms,
            dns_ms,
            connect_ms,
            ssl_ms,
            send_ms,
            headers_receive_ms,
            data_receive_ms,
        ]
        .iter()
        .fold(0u32, |acc, v| acc.saturating_add(*v));
        let queued_ms = total_ms.saturating_sub(sum);

        Self {
            start_s,
            queued_ms,
            dns_ms,
            connect_ms,
            ssl_ms,
            proxy_resolve_ms,
            send_ms,
            headers_receive_ms,
            data_receive_ms,
            total_ms,
            from_cache,
            socket_reused: info.socket_reused,
            socket_log_id: info.socket_log_id,
            total_recv_bytes,
            total_send_bytes,
        }
    }
}

fn span_ms(start: Option<Instant>, end: Option<Instant>) -> u32 {
    match (start, end) {
        (Some(s), Some(e)) if e > s => millis(e - s),
        _ => 0,
    }
}

fn millis(d: std::time::Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}
