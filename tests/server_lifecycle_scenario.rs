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

use quarry_harness::harness::config::{HarnessTimeouts, ServerConfig, TestKind};
use quarry_harness::harness::context::ResultStore;
use quarry_harness::harness::error::HarnessError;
use quarry_harness::harness::handle::{ServerProcess, SupervisorState};
use quarry_harness::harness::orchestrator::{BackendKind, Lifecycle, TestEnv};
use serial_test::{parallel, serial};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Answers 200 on every GET once it has bound the port from the generated
/// config, and dies on SIGTERM like the real service.
const STUB_SERVICE: &str = r#"#!/usr/bin/env python3
import http.server
import os
import re
import sys

text = open(os.environ["QUARRY_CONFIG_PATH"]).read()
port = int(re.search(r'127\.0\.0\.1:(\d+)', text).group(1))

class Handler(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        self.send_response(200)
        self.send_header("content-type", "application/json")
        self.end_headers()
        self.wfile.write(b'{"status":"ok"}')

    def log_message(self, *args):
        print(*args, file=sys.stderr)

http.server.HTTPServer(("127.0.0.1", port), Handler).serve_forever()
"#;

const SLEEPER: &str = "#!/bin/sh\nexec sleep 30\n";

fn write_executable(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("Failed to write script");
    let mut perms = std::fs::metadata(&path)
        .expect("Failed to stat script")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("Failed to chmod script");
    path
}

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

fn store_for(tmp: &Path, name: &str) -> Arc<ResultStore> {
    Arc::new(
        ResultStore::create_under(tmp, TestKind::ServiceLifecycle, name)
            .expect("Failed to create store"),
    )
}

fn short_timeouts() -> HarnessTimeouts {
    HarnessTimeouts {
        readiness: Duration::from_secs(2),
        ..HarnessTimeouts::default()
    }
}

#[tokio::test]
#[parallel]
async fn missing_binary_surfaces_spawn_error() {
    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let config = ServerConfig {
        executable_path: Some(PathBuf::from("/nonexistent/quarry-server-missing")),
        ..ServerConfig::default()
    };
    let mut server = ServerProcess::new(config, short_timeouts(), store_for(tmp.path(), "spawn"));

    let error = server.start().await.expect_err("start should fail");
    assert!(
        matches!(error, HarnessError::ProcessSpawn { .. }),
        "unexpected error: {error}"
    );
    assert_eq!(server.state(), SupervisorState::Failed);

    // The supervisor is single-use; a second attempt is rejected outright.
    let error = server.start().await.expect_err("restart should fail");
    assert!(matches!(error, HarnessError::AlreadyStarted));
}

#[tokio::test]
#[parallel]
async fn crashing_binary_reports_exit_status() {
    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let config = ServerConfig {
        executable_path: Some(PathBuf::from("/bin/false")),
        ..ServerConfig::default()
    };
    let mut server = ServerProcess::new(config, short_timeouts(), store_for(tmp.path(), "crash"));

    let error = server.start().await.expect_err("start should fail");
    match error {
        HarnessError::ProcessCrashed { binary, status, .. } => {
            assert!(binary.contains("false"));
            assert!(status.contains('1'), "unexpected status: {status}");
        }
        other => panic!("expected a crash report, got: {other}"),
    }
    assert_eq!(server.state(), SupervisorState::Failed);
}

#[tokio::test]
#[parallel]
async fn unresponsive_binary_times_out() {
    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let sleeper = write_executable(tmp.path(), "sleeper.sh", SLEEPER);
    let config = ServerConfig {
        executable_path: Some(sleeper),
        ..ServerConfig::default()
    };
    let mut server = ServerProcess::new(config, short_timeouts(), store_for(tmp.path(), "mute"));

    let error = server.start().await.expect_err("start should fail");
    match error {
        HarnessError::ReadinessTimeout { elapsed, .. } => {
            assert!(elapsed >= Duration::from_secs(2), "timed out too early");
        }
        other => panic!("expected a readiness timeout, got: {other}"),
    }
    assert_eq!(server.state(), SupervisorState::Failed);
    assert!(!server.is_running(), "child should be killed after timeout");
}

#[tokio::test]
#[parallel]
async fn stub_service_full_lifecycle() {
    if !python3_available() {
        eprintln!("Skipping stub_service_full_lifecycle: python3 not found");
        return;
    }

    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let stub = write_executable(tmp.path(), "stub-server.py", STUB_SERVICE);
    let config = ServerConfig {
        executable_path: Some(stub),
        ..ServerConfig::default()
    };
    let store = store_for(tmp.path(), "full");
    let mut server = ServerProcess::new(config, HarnessTimeouts::default(), store);

    server.start().await.expect("Failed to start stub service");
    assert_eq!(server.state(), SupervisorState::Ready);
    let port = server.port().expect("ready server must expose its port");
    let base_url = server.base_url().expect("ready server must have a URL");

    let response = reqwest::get(format!("{base_url}/health"))
        .await
        .expect("Failed to reach stub service");
    assert_eq!(response.status().as_u16(), 200);

    server.stop().await.expect("Failed to stop stub service");
    assert_eq!(server.state(), SupervisorState::Stopped);
    assert!(
        TcpStream::connect(("127.0.0.1", port)).is_err(),
        "port {port} still accepts connections after stop"
    );
}

#[tokio::test]
#[parallel]
async fn stop_before_start_is_a_no_op() {
    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let mut server = ServerProcess::new(
        ServerConfig::default(),
        HarnessTimeouts::default(),
        store_for(tmp.path(), "idle"),
    );

    server.stop().await.expect("stop should be a no-op");
    assert_eq!(server.state(), SupervisorState::Stopped);
}

#[tokio::test]
#[parallel]
async fn facade_stop_before_start_marks_stopped() {
    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let mut env = TestEnv::builder()
        .test_name("facade-idle")
        .kind(TestKind::ServiceLifecycle)
        .results_root(tmp.path())
        .build()
        .expect("Failed to build environment");

    env.stop().await;
    env.stop().await;
    assert_eq!(env.state(), Lifecycle::Stopped);

    let error = env.start().await.expect_err("start after stop must fail");
    assert!(matches!(error, HarnessError::InvalidState { .. }));
}

#[tokio::test]
#[parallel]
async fn finish_merges_cleanup_errors() {
    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let env = TestEnv::builder()
        .test_name("facade-cleanup")
        .kind(TestKind::ServiceLifecycle)
        .results_root(tmp.path())
        .build()
        .expect("Failed to build environment");

    env.cleanup_sink()
        .note("release demo resource", "already gone");
    let summary = env
        .finish(true, "cleanup noise should not flip the verdict")
        .await
        .expect("Failed to finish");

    assert!(summary.passed);
    assert_eq!(summary.errors, vec!["release demo resource: already gone"]);
}

#[tokio::test]
#[serial]
async fn env_override_forces_external_backend() {
    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    // SAFETY: serial keeps the rest of this binary from racing the
    // process environment while the override is set.
    unsafe { std::env::set_var("QUARRY_TEST_SERVER_URL", "http://127.0.0.1:39999/") };
    let built = TestEnv::builder()
        .test_name("facade-override")
        .kind(TestKind::ServiceLifecycle)
        .containerized()
        .results_root(tmp.path())
        .build();
    unsafe { std::env::remove_var("QUARRY_TEST_SERVER_URL") };

    let env = built.expect("Failed to build environment");
    assert!(matches!(env.backend_kind(), BackendKind::External));
    assert_eq!(env.base_url().as_deref(), Some("http://127.0.0.1:39999"));
}

#[tokio::test]
#[parallel]
async fn facade_runs_a_local_service() {
    if !python3_available() {
        eprintln!("Skipping facade_runs_a_local_service: python3 not found");
        return;
    }
    if std::env::var("QUARRY_TEST_SERVER_URL").is_ok() {
        eprintln!("Skipping facade_runs_a_local_service: external backend forced");
        return;
    }

    let tmp = tempfile::tempdir().expect("Failed to create tempdir");
    let stub = write_executable(tmp.path(), "stub-server.py", STUB_SERVICE);
    let mut env = TestEnv::builder()
        .test_name("facade-local")
        .kind(TestKind::ServiceLifecycle)
        .server(ServerConfig {
            executable_path: Some(stub),
            ..ServerConfig::default()
        })
        .results_root(tmp.path())
        .build()
        .expect("Failed to build environment");

    env.start().await.expect("Failed to start environment");
    assert_eq!(env.state(), Lifecycle::Started);
    let error = env.start().await.expect_err("second start must fail");
    assert!(matches!(error, HarnessError::AlreadyStarted));

    let api = env.api_client().expect("started env must hand out clients");
    let health = api
        .get("/health")
        .await
        .expect("Failed to reach local service");
    assert!(health.is_success());
    assert!(
        env.service_logs().is_some(),
        "local backend should expose service logs"
    );

    let summary = env
        .finish(true, "local service answered")
        .await
        .expect("Failed to finish");
    assert!(summary.passed, "errors: {:?}", summary.errors);
    assert!(summary.errors.is_empty(), "cleanup errors: {:?}", summary.errors);
    assert_eq!(summary.logs, vec!["service.log", "test.log"]);
}
