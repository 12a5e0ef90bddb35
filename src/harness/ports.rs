/*
 * Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

use rand::Rng;
use std::net::TcpListener;
use std::sync::{Mutex, OnceLock, PoisonError};

const DEFAULT_RANGE_START: u16 = 21000;
const DEFAULT_RANGE_END: u16 = 30000;
const MAX_PROBE_ATTEMPTS: u16 = 64;

/// Hands out candidate localhost ports for locally spawned services.
///
/// A monotonic counter walks a fixed range and every candidate is verified by
/// briefly binding it on 127.0.0.1. The counter only ever moves forward (with
/// wraparound), and both the advance and the probe happen under one lock, so
/// two concurrent callers can never be handed the same value. If an unlikely
/// streak of probes fails, the next counter value is returned unchecked and
/// the spawned service will surface the conflict itself.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    next: Mutex<u16>,
}

impl PortAllocator {
    /// Allocator over the default range, starting at a random offset so
    /// concurrent test processes on one host tend not to walk in lockstep.
    pub fn new() -> Self {
        let offset = rand::rng().random_range(0..DEFAULT_RANGE_END - DEFAULT_RANGE_START);
        Self {
            start: DEFAULT_RANGE_START,
            end: DEFAULT_RANGE_END,
            next: Mutex::new(DEFAULT_RANGE_START + offset),
        }
    }

    /// Allocator over `start..end`, beginning exactly at `start`.
    pub fn with_range(start: u16, end: u16) -> Self {
        assert!(start < end, "port range must be non-empty");
        Self {
            start,
            end,
            next: Mutex::new(start),
        }
    }

    /// The process-wide allocator shared by environments that do not inject
    /// their own.
    pub fn global() -> &'static PortAllocator {
        static GLOBAL: OnceLock<PortAllocator> = OnceLock::new();
        GLOBAL.get_or_init(PortAllocator::new)
    }

    pub fn allocate(&self) -> u16 {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..MAX_PROBE_ATTEMPTS {
            let candidate = *next;
            *next = self.advance(candidate);
            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                return candidate;
            }
        }
        let fallback = *next;
        *next = self.advance(fallback);
        tracing::warn!(
            "No bindable port found in {MAX_PROBE_ATTEMPTS} probes, falling back to {fallback}"
        );
        fallback
    }

    fn advance(&self, current: u16) -> u16 {
        if current + 1 >= self.end {
            self.start
        } else {
            current + 1
        }
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_forward_and_wraps() {
        let allocator = PortAllocator::with_range(39500, 39503);
        let first = allocator.allocate();
        let second = allocator.allocate();
        assert_ne!(first, second);
        assert!((39500..39503).contains(&first));
        assert!((39500..39503).contains(&second));

        // A few more than the range holds, to cross the wrap boundary.
        for _ in 0..5 {
            let port = allocator.allocate();
            assert!((39500..39503).contains(&port));
        }
    }

    #[test]
    fn allocated_port_is_bindable() {
        let allocator = PortAllocator::with_range(39510, 39530);
        let port = allocator.allocate();
        TcpListener::bind(("127.0.0.1", port)).expect("probed port should be bindable");
    }
}
