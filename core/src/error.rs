/*
 * error.rs
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

//! Error types: pool lifecycle, transport engine, and transport status codes.

use std::io;

/// Errors from creating or operating a connection pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to start {name} context: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("drain called from one of the pool's own execution contexts")]
    DrainOnPoolContext,

    #[error("pool execution contexts have stopped")]
    ShutDown,

    #[error("invalid pool configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Errors reported by a transport engine when building its context or a request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transport context is not available")]
    Unavailable,

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Transport error codes carried by failed and cancelled responses.
///
/// Codes are negative and stable so they can cross language boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum NetError {
    #[error("request failed")]
    Failed,
    #[error("request aborted")]
    Aborted,
    #[error("file not found")]
    FileNotFound,
    #[error("timed out")]
    TimedOut,
    #[error("file too big")]
    FileTooBig,
    #[error("not implemented")]
    NotImplemented,
    #[error("response too large")]
    ResponseTooLarge,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("name not resolved")]
    NameNotResolved,
    #[error("tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("certificate invalid")]
    CertificateInvalid,
    #[error("invalid URL")]
    InvalidUrl,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("invalid response")]
    InvalidResponse,
    #[error("cache miss")]
    CacheMiss,
}

impl NetError {
    /// Stable numeric code.
    pub fn code(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Aborted => -3,
            NetError::FileNotFound => -6,
            NetError::TimedOut => -7,
            NetError::FileTooBig => -8,
            NetError::NotImplemented => -11,
            NetError::ResponseTooLarge => -12,
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::NameNotResolved => -105,
            NetError::TunnelConnectionFailed => -111,
            NetError::CertificateInvalid => -202,
            NetError::InvalidUrl => -300,
            NetError::TooManyRedirects => -310,
            NetError::InvalidResponse => -320,
            NetError::CacheMiss => -400,
        }
    }

    /// Classify an I/O error from a socket or file operation.
    pub fn from_io(err: &io::Error) -> NetError {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => NetError::ConnectionReset,
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionAborted => NetError::Aborted,
            io::ErrorKind::TimedOut => NetError::TimedOut,
            io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            io::ErrorKind::NotFound => NetError::FileNotFound,
            io::ErrorKind::InvalidData => NetError::InvalidResponse,
            io::ErrorKind::Unsupported => NetError::NotImplemented,
            _ => NetError::Failed,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        NetError::from_io(&err)
    }
}
