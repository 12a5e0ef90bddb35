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

use crate::harness::config::{
    CONFIG_PATH_ENV_VAR, ENV_VAR_PREFIX, HEALTH_PATH, HarnessTimeouts, SERVER_BIN_ENV_VAR,
    SERVER_BINARY_NAME, SERVER_URL_ENV_VAR, ServerConfig, ServerSettings, VERBOSE_ENV_VAR,
};
use crate::harness::context::ResultStore;
use crate::harness::error::{HarnessError, HarnessResult};
use crate::harness::ports::PortAllocator;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::panicking;
use std::time::{Duration, Instant};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PORT_RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const LOG_TAIL_LINES: usize = 40;

const CONFIG_FILE_NAME: &str = "quarry-server.toml";
const STORAGE_DIR_NAME: &str = "storage";

/// Host variables the supervisor sets itself; never forwarded from the
/// caller's environment.
const PROTECTED_ENV_VARS: &[&str] = &[CONFIG_PATH_ENV_VAR, SERVER_URL_ENV_VAR];

/// Lifecycle of one supervised child. Transitions only move forward;
/// `Failed` is terminal for environments that never became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

/// Supervises one locally spawned quarry-server: renders its config, spawns
/// it with stdio captured into the result store, polls readiness, and later
/// walks it down with SIGTERM, a grace period and a port-release wait.
pub struct ServerProcess {
    config: ServerConfig,
    timeouts: HarnessTimeouts,
    store: Arc<ResultStore>,
    allocator: Option<Arc<PortAllocator>>,
    state: SupervisorState,
    child: Option<Child>,
    port: Option<u16>,
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("state", &self.state)
            .field("port", &self.port)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl ServerProcess {
    pub fn new(config: ServerConfig, timeouts: HarnessTimeouts, store: Arc<ResultStore>) -> Self {
        Self {
            config,
            timeouts,
            store,
            allocator: None,
            state: SupervisorState::NotStarted,
            child: None,
            port: None,
        }
    }

    /// Replaces the process-wide port allocator, for tests that need an
    /// isolated range.
    pub fn with_allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn base_url(&self) -> Option<String> {
        self.port.map(|port| format!("http://127.0.0.1:{port}"))
    }

    pub async fn start(&mut self) -> HarnessResult<()> {
        if self.state != SupervisorState::NotStarted {
            return Err(HarnessError::AlreadyStarted);
        }
        self.state = SupervisorState::Starting;

        let port = self
            .allocator
            .as_deref()
            .unwrap_or_else(|| PortAllocator::global())
            .allocate();
        self.port = Some(port);

        let config_path = self.write_config(port)?;
        let binary = self.binary_path();
        self.store.log(format!(
            "Starting {} on port {port} with config {}",
            binary.display(),
            config_path.display()
        ));

        let mut command = Command::new(&binary);
        command.env(CONFIG_PATH_ENV_VAR, &config_path);
        command.envs(self.build_envs());

        if std::env::var(VERBOSE_ENV_VAR).is_ok() {
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
        } else {
            let log_path = self.store.service_log_path();
            let log_file =
                File::create(&log_path).map_err(|e| HarnessError::DirectoryCreation {
                    path: log_path.clone(),
                    source: e,
                })?;
            let log_clone = log_file.try_clone().map_err(|e| HarnessError::DirectoryCreation {
                path: log_path,
                source: e,
            })?;
            command.stdout(log_file);
            command.stderr(log_clone);
        }

        let child = command.spawn().map_err(|e| HarnessError::ProcessSpawn {
            binary: binary.display().to_string(),
            source: e,
        })?;
        self.child = Some(child);

        match self.wait_until_healthy(port).await {
            Ok(()) => {
                self.state = SupervisorState::Ready;
                self.store.log(format!(
                    "{} ready at http://127.0.0.1:{port}",
                    binary.display()
                ));
                Ok(())
            }
            Err(e) => {
                self.kill_child();
                self.state = SupervisorState::Failed;
                Err(e)
            }
        }
    }

    /// Graceful stop: SIGTERM, wait out the grace period, SIGKILL on
    /// overrun, then hold until the port actually refuses connections so a
    /// follow-up test can reuse the address.
    pub async fn stop(&mut self) -> HarnessResult<()> {
        match self.state {
            SupervisorState::Ready => {}
            SupervisorState::NotStarted => {
                self.state = SupervisorState::Stopped;
                return Ok(());
            }
            _ => return Ok(()),
        }
        self.state = SupervisorState::Stopping;

        let Some(mut child) = self.child.take() else {
            self.state = SupervisorState::Stopped;
            return Ok(());
        };

        self.store.log(format!("Stopping pid {}", child.id()));
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }

        let grace_deadline = Instant::now() + self.timeouts.shutdown_grace;
        let mut exited = false;
        while Instant::now() < grace_deadline {
            if let Ok(Some(status)) = child.try_wait() {
                self.store.log(format!("Service exited with {status}"));
                exited = true;
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        if !exited {
            self.store
                .log("Service ignored SIGTERM within grace period, killing");
            let _ = child.kill();
            let _ = child.wait();
        }

        self.wait_for_port_release().await?;
        self.state = SupervisorState::Stopped;
        Ok(())
    }

    /// Immediate teardown for environments that never finished starting:
    /// kills the child without grace or port-release waits.
    pub fn abort(&mut self) {
        self.kill_child();
        if self.state != SupervisorState::Stopped {
            self.state = SupervisorState::Failed;
        }
    }

    /// Contents of `service.log`, for assertions on service output.
    pub fn collect_logs(&self) -> String {
        fs::read_to_string(self.store.service_log_path()).unwrap_or_default()
    }

    fn binary_path(&self) -> PathBuf {
        self.config
            .executable_path
            .clone()
            .or_else(|| std::env::var(SERVER_BIN_ENV_VAR).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(SERVER_BINARY_NAME))
    }

    fn write_config(&self, port: u16) -> HarnessResult<PathBuf> {
        let data_dir = self.store.data_dir();
        let storage_path = data_dir.join(STORAGE_DIR_NAME);
        fs::create_dir_all(&storage_path).map_err(|e| HarnessError::DirectoryCreation {
            path: storage_path.clone(),
            source: e,
        })?;

        let settings = ServerSettings::for_test(port, &storage_path, &self.config);
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        fs::write(&config_path, settings.to_toml()?)?;
        Ok(config_path)
    }

    /// Forwards `QUARRY_`-prefixed host variables (minus the ones the
    /// supervisor owns), then applies per-test extras on top.
    fn build_envs(&self) -> HashMap<String, String> {
        let mut envs: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| {
                key.starts_with(ENV_VAR_PREFIX) && !PROTECTED_ENV_VARS.contains(&key.as_str())
            })
            .collect();
        envs.extend(self.config.extra_envs.clone());
        envs
    }

    async fn wait_until_healthy(&mut self, port: u16) -> HarnessResult<()> {
        let address = format!("http://127.0.0.1:{port}");
        let health_url = format!("{address}{HEALTH_PATH}");
        let client = reqwest::Client::new();
        let started = Instant::now();
        let mut last_error = "no probe answered".to_string();

        while started.elapsed() < self.timeouts.readiness {
            if let Some(child) = self.child.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                self.child = None;
                return Err(HarnessError::ProcessCrashed {
                    binary: self.binary_path().display().to_string(),
                    status: status.to_string(),
                    log_tail: self.log_tail(),
                });
            }

            match client
                .get(&health_url)
                .timeout(HEALTH_PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = format!("health answered {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }

        Err(HarnessError::ReadinessTimeout {
            target: self.binary_path().display().to_string(),
            address,
            elapsed: started.elapsed(),
            last_error,
        })
    }

    async fn wait_for_port_release(&self) -> HarnessResult<()> {
        let Some(port) = self.port else {
            return Ok(());
        };
        let started = Instant::now();
        while started.elapsed() < self.timeouts.port_release {
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_err() {
                return Ok(());
            }
            tokio::time::sleep(PORT_RELEASE_POLL_INTERVAL).await;
        }
        Err(HarnessError::Timeout {
            operation: format!("release of port {port}"),
            elapsed: started.elapsed(),
        })
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn log_tail(&self) -> String {
        let logs = self.collect_logs();
        let lines: Vec<&str> = logs.lines().collect();
        let start = lines.len().saturating_sub(LOG_TAIL_LINES);
        lines[start..].join("\n")
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill_child();
        if panicking() {
            eprintln!("quarry-server log tail:\n{}", self.log_tail());
        }
    }
}
