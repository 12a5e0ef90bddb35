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

mod common;

use quarry_harness::harness::ports::PortAllocator;
use serial_test::parallel;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

const WORKERS: usize = 16;

#[test]
#[parallel]
fn concurrent_allocations_never_collide() {
    let allocator = Arc::new(PortAllocator::with_range(38000, 38200));
    let mut handles = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let allocator = allocator.clone();
        handles.push(std::thread::spawn(move || allocator.allocate()));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let port = handle.join().expect("Failed to join allocator thread");
        assert!(seen.insert(port), "port {port} was handed out twice");
    }
    assert_eq!(seen.len(), WORKERS);
}

#[test]
#[parallel]
fn busy_port_is_skipped() {
    let allocator = PortAllocator::with_range(38300, 38310);
    let _occupied =
        TcpListener::bind(("127.0.0.1", 38300)).expect("Failed to occupy the first candidate");

    let port = allocator.allocate();
    assert_ne!(port, 38300, "allocator handed out a port in use");
    TcpListener::bind(("127.0.0.1", port)).expect("allocated port should be bindable");
}

#[test]
#[parallel]
fn global_allocator_walks_forward() {
    let first = PortAllocator::global().allocate();
    let second = PortAllocator::global().allocate();
    assert_ne!(first, second);
}
