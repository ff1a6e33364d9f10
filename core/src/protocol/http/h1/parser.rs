/*
 * parser.rs
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

//! HTTP/1.1 response push parser: status line, headers, body (Content-Length, chunked, or until close).

use bytes::{Buf, Bytes, BytesMut};

use crate::error::NetError;

/// Receives parse events. Body data is handed over as owned slices of the read buffer.
pub(crate) trait H1ResponseHandler {
    fn status(&mut self, version: &str, code: u16, reason: &str);
    fn header(&mut self, name: &str, value: &str);
    fn body_chunk(&mut self, data: Bytes);
    fn complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseState {
    StatusLine,
    Headers,
    /// Headers done; the caller must call `set_body_mode`.
    HeadersComplete,
    Body,
    UntilClose,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    ChunkTrailer,
    Idle,
}

/// Longest status or header line accepted.
const MAX_LINE: usize = 64 * 1024;

/// Push parser for one HTTP/1.1 response at a time. Feed bytes via `receive`.
pub(crate) struct ResponseParser {
    state: ParseState,
    body_remaining: u64,
    chunk_remaining: u64,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StatusLine,
            body_remaining: 0,
            chunk_remaining: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Ready for the next response head (after a 1xx, or on a reused connection).
    pub fn reset(&mut self) {
        self.state = ParseState::StatusLine;
        self.body_remaining = 0;
        self.chunk_remaining = 0;
    }

    /// Whether the body length is delimited by the connection closing.
    pub fn reads_until_close(&self) -> bool {
        self.state == ParseState::UntilClose
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        buf.windows(2).position(|w| w == b"\r\n")
    }

    fn take_line(buf: &mut BytesMut) -> Result<Option<String>, NetError> {
        let line_end = match Self::find_crlf(buf) {
            Some(n) => n,
            None if buf.len() > MAX_LINE => return Err(NetError::InvalidResponse),
            None => return Ok(None),
        };
        let line = buf.split_to(line_end + 2);
        let text = std::str::from_utf8(&line[..line_end])
            .map_err(|_| NetError::InvalidResponse)?;
        Ok(Some(text.to_string()))
    }

    /// Consume as much of `buf` as possible. Unconsumed bytes stay in `buf`.
    pub fn receive<H: H1ResponseHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> Result<(), NetError> {
        while !buf.is_empty() {
            match self.state {
                ParseState::StatusLine => {
                    let Some(line) = Self::take_line(buf)? else {
                        return Ok(());
                    };
                    // HTTP/1.1 200 OK or HTTP/1.1 200
                    let mut parts = line.splitn(3, ' ');
                    let version = parts.next().unwrap_or("");
                    if !version.starts_with("HTTP/") {
                        return Err(NetError::InvalidResponse);
                    }
                    let code = parts
                        .next()
                        .and_then(|s| s.parse::<u16>().ok())
                        .ok_or(NetError::InvalidResponse)?;
                    let reason = parts.next().unwrap_or("");
                    handler.status(version, code, reason);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    if buf.starts_with(b"\r\n") {
                        buf.advance(2);
                        self.state = ParseState::HeadersComplete;
                        return Ok(());
                    }
                    let Some(line) = Self::take_line(buf)? else {
                        return Ok(());
                    };
                    if let Some((name, value)) = line.split_once(':') {
                        handler.header(name.trim(), value.trim());
                    }
                }
                ParseState::HeadersComplete | ParseState::Idle => return Ok(()),
                ParseState::Body => {
                    let to_read = (self.body_remaining.min(buf.len() as u64)) as usize;
                    if to_read > 0 {
                        handler.body_chunk(buf.split_to(to_read).freeze());
                        self.body_remaining -= to_read as u64;
                    }
                    if self.body_remaining == 0 {
                        self.state = ParseState::Idle;
                        handler.complete();
                    }
                }
                ParseState::UntilClose => {
                    let len = buf.len();
                    handler.body_chunk(buf.split_to(len).freeze());
                }
                ParseState::ChunkSize => {
                    let Some(line) = Self::take_line(buf)? else {
                        return Ok(());
                    };
                    let hex = line.split(';').next().unwrap_or("").trim();
                    self.chunk_remaining =
                        u64::from_str_radix(hex, 16).map_err(|_| NetError::InvalidResponse)?;
                    self.state = if self.chunk_remaining == 0 {
                        ParseState::ChunkTrailer
                    } else {
                        ParseState::ChunkData
                    };
                }
                ParseState::ChunkData => {
                    let to_read = (self.chunk_remaining.min(buf.len() as u64)) as usize;
                    handler.body_chunk(buf.split_to(to_read).freeze());
                    self.chunk_remaining -= to_read as u64;
                    if self.chunk_remaining == 0 {
                        self.state = ParseState::ChunkDataEnd;
                    }
                }
                ParseState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    if !buf.starts_with(b"\r\n") {
                        return Err(NetError::InvalidResponse);
                    }
                    buf.advance(2);
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let Some(line) = Self::take_line(buf)? else {
                        return Ok(());
                    };
                    // Trailer fields are read and dropped.
                    if line.is_empty() {
                        self.state = ParseState::Idle;
                        handler.complete();
                    }
                }
            }
        }
        Ok(())
    }

    /// Choose the body framing after the head. `None` length without chunking reads until close.
    pub fn set_body_mode<H: H1ResponseHandler>(
        &mut self,
        content_length: Option<u64>,
        chunked: bool,
        handler: &mut H,
    ) {
        if self.state != ParseState::HeadersComplete {
            return;
        }
        if chunked {
            self.state = ParseState::ChunkSize;
        } else if let Some(len) = content_length {
            self.body_remaining = len;
            if len == 0 {
                self.state = ParseState::Idle;
                handler.complete();
            } else {
                self.state = ParseState::Body;
            }
        } else {
            self.state = ParseState::UntilClose;
        }
    }

    /// The peer closed the connection. Completes a read-until-close body; anything else is truncated.
    pub fn connection_closed<H: H1ResponseHandler>(&mut self, handler: &mut H) -> Result<(), NetError> {
        match self.state {
            ParseState::UntilClose => {
                self.state = ParseState::Idle;
                handler.complete();
                Ok(())
            }
            ParseState::Idle => Ok(()),
            _ => Err(NetError::ConnectionClosed),
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}
