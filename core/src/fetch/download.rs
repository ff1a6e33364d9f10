/*
 * download.rs
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

//! Response body sinks: an in-memory buffer, or an output file written on the
//! file context.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::engine::FetchId;

/// Bytes requested from the engine per read.
pub(crate) const READ_CHUNK: usize = 64 * 1024;
/// Buffer growth step once the preallocation is used up.
pub(crate) const GROW_INCREMENT: usize = 16 * 1024;
/// Largest preallocation taken from a Content-Length.
const MAX_PREALLOC: usize = 5 * 1024 * 1024;
/// Largest body the buffered path accepts.
pub(crate) const MAX_BODY: usize = i32::MAX as usize;

/// Append-only response buffer. Capacity grows in fixed steps up to a limit.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    data: BytesMut,
    capacity: usize,
    limit: usize,
}

impl ReadBuffer {
    pub fn new(expected: Option<u64>) -> Self {
        Self::with_limit(expected, MAX_BODY)
    }

    pub fn with_limit(expected: Option<u64>, limit: usize) -> Self {
        let capacity = expected
            .map(|n| n.min(MAX_PREALLOC as u64) as usize)
            .unwrap_or(0)
            .min(limit);
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            limit,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Add one increment of capacity. False at the limit.
    fn grow(&mut self) -> bool {
        if self.capacity >= self.limit {
            return false;
        }
        let capacity = (self.capacity + GROW_INCREMENT).min(self.limit);
        self.data.reserve(capacity - self.data.len());
        self.capacity = capacity;
        true
    }

    /// Append `chunk`, growing as needed. False, with nothing appended, when the
    /// chunk would take the buffer past its limit.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        if self.data.len() + chunk.len() > self.limit {
            return false;
        }
        while self.remaining() < chunk.len() {
            if !self.grow() {
                return false;
            }
        }
        self.data.extend_from_slice(chunk);
        true
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

/// State of the file context: output files by fetch.
#[derive(Default)]
pub(crate) struct FileCore {
    open: HashMap<FetchId, File>,
}

impl FileCore {
    /// Create (or truncate) the output file for `id`.
    pub fn open(&mut self, id: FetchId, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        debug!("[fetch] {} writing to {}", id, path.display());
        self.open.insert(id, file);
        Ok(())
    }

    pub fn write(&mut self, id: FetchId, data: &[u8]) -> io::Result<()> {
        match self.open.get_mut(&id) {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "output file is not open")),
        }
    }

    /// Close the output file, then remove `remove` if given.
    pub fn close(&mut self, id: FetchId, remove: Option<&Path>) {
        if let Some(mut file) = self.open.remove(&id) {
            if let Err(e) = file.flush() {
                warn!("[fetch] {} flushing output file: {}", id, e);
            }
        }
        if let Some(path) = remove {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("[fetch] {} removed {}", id, path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("[fetch] {} cannot remove {}: {}", id, path.display(), e),
            }
        }
    }

    #[cfg(test)]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
