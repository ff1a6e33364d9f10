/*
 * watchdog.rs
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

//! Periodic fetch timers and the minimum-speed monitor.

use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::engine::FetchId;
use crate::executor::Poster;
use crate::pool::NetCore;

pub(crate) const UPLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const MIN_SPEED_INTERVAL: Duration = Duration::from_millis(1000);

/// Minimum transfer rate for a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct MinSpeed {
    pub bytes_per_sec: f64,
    /// Smoothing factor, `1 / window` in seconds.
    pub coefficient: f64,
}

impl MinSpeed {
    pub fn new(bytes_per_sec: u64, window: Duration) -> Self {
        if bytes_per_sec == 0 || window.is_zero() {
            return Self::default();
        }
        // The window is never shorter than one sampling interval.
        let secs = window.as_secs_f64().max(MIN_SPEED_INTERVAL.as_secs_f64());
        Self {
            bytes_per_sec: bytes_per_sec as f64,
            coefficient: 1.0 / secs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_per_sec > 0.0 && self.coefficient > 0.0
    }
}

/// Exponentially weighted moving average of the transfer rate.
#[derive(Debug)]
pub(crate) struct SpeedMonitor {
    min: MinSpeed,
    last_bytes: u64,
    /// Bytes per millisecond.
    average: f64,
}

impl SpeedMonitor {
    pub fn new(min: MinSpeed) -> Self {
        Self {
            min,
            last_bytes: 0,
            average: 0.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.min.is_enabled()
    }

    /// Feed the running byte total, sampled every `interval`, `elapsed` after the
    /// network phase began. True when the transfer is too slow: the grace period
    /// has passed and the average is under the minimum.
    pub fn sample(&mut self, total_bytes: u64, interval: Duration, elapsed: Duration) -> bool {
        let c = self.min.coefficient;
        let interval_ms = (interval.as_millis() as f64).max(1.0);
        let current = total_bytes.saturating_sub(self.last_bytes) as f64 / interval_ms;
        self.last_bytes = total_bytes;
        self.average = if self.average > 0.0 {
            (1.0 - c) * self.average + c * current
        } else {
            current
        };
        self.is_enabled()
            && elapsed.as_secs_f64() * c > 1.0
            && self.average_bytes_per_sec() < self.min.bytes_per_sec
    }

    pub fn average_bytes_per_sec(&self) -> f64 {
        self.average * 1000.0
    }
}

/// A repeating timer task on the network runtime. Dropping it stops the timer.
#[derive(Debug)]
pub(crate) struct Timer(AbortHandle);

impl Timer {
    /// Post `tick(core, id)` to the network context every `period`, first after one period.
    /// `None` outside a tokio runtime.
    pub fn every(
        period: Duration,
        network: Poster<NetCore>,
        id: FetchId,
        tick: fn(&mut NetCore, FetchId),
    ) -> Option<Timer> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let task = runtime.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !network.post(move |core| tick(core, id)) {
                    break;
                }
            }
        });
        Some(Timer(task.abort_handle()))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.abort();
    }
}
