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

use crate::api_client::ApiClient;
use crate::harness::config::{
    HEALTH_PATH, HarnessTimeouts, SERVER_URL_ENV_VAR, ServerConfig, TestKind, TopologyConfig,
};
use crate::harness::context::{ResultStore, TestSummary, default_results_root};
use crate::harness::error::{CleanupSink, HarnessError, HarnessResult};
use crate::harness::fixtures::ServiceTopology;
use crate::harness::handle::{BrowserCapture, ServerProcess};
use crate::harness::logging;
use crate::harness::ports::PortAllocator;
use crate::mcp_client::McpClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Screenshot names every UI test must produce.
const UI_REQUIRED_SCREENSHOTS: [&str; 2] = ["before", "after"];

/// Environment lifecycle; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// How the service under test is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    External,
    Containerized,
}

enum Backend {
    Local(ServerProcess),
    External { base_url: String },
    Containerized {
        config: TopologyConfig,
        topology: Option<ServiceTopology>,
    },
}

/// One test environment: a provisioned service plus typed clients and the
/// artifact store, behind a single facade. Tests build it, start it, talk
/// to the service, then call [`TestEnv::finish`].
///
/// The backend is chosen at build time: `QUARRY_TEST_SERVER_URL` forces the
/// external backend no matter what the builder requested; otherwise the
/// builder's request wins and defaults to a local child process.
pub struct TestEnv {
    store: Arc<ResultStore>,
    timeouts: HarnessTimeouts,
    backend: Backend,
    state: Lifecycle,
    cleanup: CleanupSink,
    browser: Option<BrowserCapture>,
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv")
            .field("test_name", &self.store.test_name())
            .field("kind", &self.store.kind())
            .field("backend", &self.backend_kind())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            Backend::Local(_) => BackendKind::Local,
            Backend::External { .. } => BackendKind::External,
            Backend::Containerized { .. } => BackendKind::Containerized,
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn cleanup_sink(&self) -> &CleanupSink {
        &self.cleanup
    }

    /// The containerized backend's topology, for driver-side exercises.
    pub fn topology(&self) -> Option<&ServiceTopology> {
        match &self.backend {
            Backend::Containerized { topology, .. } => topology.as_ref(),
            _ => None,
        }
    }

    /// Contents of the service log. Only the local backend manages the
    /// process and owns its output; other backends return `None`.
    pub fn service_logs(&self) -> Option<String> {
        match &self.backend {
            Backend::Local(server) => Some(server.collect_logs()),
            _ => None,
        }
    }

    pub fn base_url(&self) -> Option<String> {
        match &self.backend {
            Backend::Local(server) => server.base_url(),
            Backend::External { base_url } => Some(base_url.clone()),
            Backend::Containerized { topology, .. } => {
                topology.as_ref().map(|t| t.host_base_url().to_string())
            }
        }
    }

    /// Provisions the backend, bounded by the suite timeout. Partial
    /// resources are released before a provisioning error is returned.
    pub async fn start(&mut self) -> HarnessResult<()> {
        match self.state {
            Lifecycle::Created => {}
            Lifecycle::Started => return Err(HarnessError::AlreadyStarted),
            Lifecycle::Stopped => {
                return Err(HarnessError::invalid_state(
                    "environment was already stopped",
                ));
            }
        }

        let started_at = Instant::now();
        let suite = self.timeouts.suite;
        match tokio::time::timeout(suite, self.provision()).await {
            Ok(Ok(())) => {
                self.state = Lifecycle::Started;
                self.store.log(format!(
                    "Environment ready ({:?} backend) at {}",
                    self.backend_kind(),
                    self.base_url().unwrap_or_default()
                ));
                Ok(())
            }
            Ok(Err(e)) => {
                self.release_partial().await;
                Err(e)
            }
            Err(_) => {
                self.release_partial().await;
                Err(HarnessError::Timeout {
                    operation: "environment provisioning".to_string(),
                    elapsed: started_at.elapsed(),
                })
            }
        }
    }

    /// Best-effort teardown in reverse provisioning order. Idempotent;
    /// failures land in the cleanup sink instead of being raised.
    pub async fn stop(&mut self) {
        match self.state {
            Lifecycle::Stopped => return,
            Lifecycle::Created => {
                self.state = Lifecycle::Stopped;
                self.store.log("Environment stopped before it was started");
                return;
            }
            Lifecycle::Started => {}
        }

        if let Some(browser) = self.browser.take() {
            browser.close().await;
        }
        match &mut self.backend {
            Backend::Local(server) => {
                if let Err(e) = server.stop().await {
                    self.cleanup.note("stop local service", e);
                }
            }
            Backend::External { .. } => {}
            Backend::Containerized { topology, .. } => {
                if let Some(topology) = topology.take() {
                    topology.stop(&self.cleanup).await;
                }
            }
        }

        self.state = Lifecycle::Stopped;
        self.store.log("Environment stopped");
    }

    /// Stops the environment and writes the summary, folding collected
    /// cleanup failures into its error list.
    pub async fn finish(mut self, passed: bool, details: &str) -> HarnessResult<TestSummary> {
        let duration = self.store.elapsed();
        self.stop().await;
        let errors = self.cleanup.drain();
        self.store.write_summary(passed, duration, details, errors)
    }

    pub fn api_client(&self) -> HarnessResult<ApiClient> {
        Ok(ApiClient::new(self.require_base_url()?, self.store.clone()))
    }

    pub fn mcp_client(&self) -> HarnessResult<McpClient> {
        Ok(McpClient::new(self.require_base_url()?, self.store.clone()))
    }

    /// Launches the browser on first use and reuses it afterwards.
    pub async fn browser(&mut self) -> HarnessResult<&BrowserCapture> {
        if self.browser.is_none() {
            let base_url = self.require_base_url()?;
            let browser =
                BrowserCapture::launch(base_url, self.store.clone(), self.timeouts.browser_op)
                    .await?;
            self.browser = Some(browser);
        }
        self.browser
            .as_ref()
            .ok_or_else(|| HarnessError::invalid_state("browser launch raced a teardown"))
    }

    async fn provision(&mut self) -> HarnessResult<()> {
        match &mut self.backend {
            Backend::Local(server) => server.start().await,
            Backend::External { base_url } => {
                probe_external(base_url, self.store.as_ref()).await
            }
            Backend::Containerized { config, topology } => {
                let started = ServiceTopology::start(
                    config.clone(),
                    self.timeouts,
                    self.store.clone(),
                )
                .await?;
                *topology = Some(started);
                Ok(())
            }
        }
    }

    async fn release_partial(&mut self) {
        if let Some(browser) = self.browser.take() {
            browser.close().await;
        }
        match &mut self.backend {
            Backend::Local(server) => server.abort(),
            Backend::External { .. } => {}
            Backend::Containerized { topology, .. } => {
                if let Some(topology) = topology.take() {
                    topology.stop(&self.cleanup).await;
                }
            }
        }
    }

    fn require_base_url(&self) -> HarnessResult<String> {
        if self.state != Lifecycle::Started {
            return Err(HarnessError::invalid_state(
                "environment is not started; no base URL yet",
            ));
        }
        self.base_url()
            .ok_or_else(|| HarnessError::invalid_state("started environment without a base URL"))
    }
}

/// External readiness is one probe: the supplied deployment either answers
/// its health check right now or the test fails fast.
async fn probe_external(base_url: &str, store: &ResultStore) -> HarnessResult<()> {
    let health_url = format!("{base_url}{HEALTH_PATH}");
    let started = Instant::now();
    let response = reqwest::get(&health_url).await;
    match response {
        Ok(response) if response.status().is_success() => {
            store.log(format!("External service healthy at {base_url}"));
            Ok(())
        }
        Ok(response) => Err(HarnessError::ReadinessTimeout {
            target: "external service".to_string(),
            address: base_url.to_string(),
            elapsed: started.elapsed(),
            last_error: format!("health answered {}", response.status()),
        }),
        Err(e) => Err(HarnessError::ReadinessTimeout {
            target: "external service".to_string(),
            address: base_url.to_string(),
            elapsed: started.elapsed(),
            last_error: e.to_string(),
        }),
    }
}

pub struct TestEnvBuilder {
    test_name: Option<String>,
    kind: TestKind,
    backend: BackendRequest,
    server_config: ServerConfig,
    topology_config: TopologyConfig,
    timeouts: HarnessTimeouts,
    results_root: Option<PathBuf>,
    allocator: Option<Arc<PortAllocator>>,
}

enum BackendRequest {
    Local,
    External(String),
    Containerized,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            test_name: None,
            kind: TestKind::Api,
            backend: BackendRequest::Local,
            server_config: ServerConfig::default(),
            topology_config: TopologyConfig::default(),
            timeouts: HarnessTimeouts::default(),
            results_root: None,
            allocator: None,
        }
    }
}

impl TestEnvBuilder {
    /// Override the test name (defaults to the test thread's name).
    pub fn test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = Some(name.into());
        self
    }

    pub fn kind(mut self, kind: TestKind) -> Self {
        self.kind = kind;
        self
    }

    /// Request the containerized backend with default images.
    pub fn containerized(mut self) -> Self {
        self.backend = BackendRequest::Containerized;
        self
    }

    pub fn containerized_with(mut self, config: TopologyConfig) -> Self {
        self.topology_config = config;
        self.backend = BackendRequest::Containerized;
        self
    }

    /// Request the external backend explicitly, without the env override.
    pub fn external(mut self, base_url: impl Into<String>) -> Self {
        self.backend = BackendRequest::External(base_url.into());
        self
    }

    pub fn server(mut self, config: ServerConfig) -> Self {
        self.server_config = config;
        self
    }

    pub fn timeouts(mut self, timeouts: HarnessTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Redirect the results tree, for tests exercising the harness itself.
    pub fn results_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.results_root = Some(root.into());
        self
    }

    pub fn port_allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Builds the environment. Does NOT provision anything yet.
    pub fn build(self) -> HarnessResult<TestEnv> {
        logging::init();

        let test_name = self.test_name.unwrap_or_else(derive_test_name);
        let results_root = self.results_root.unwrap_or_else(default_results_root);
        let store = Arc::new(ResultStore::create_under(
            &results_root,
            self.kind,
            &test_name,
        )?);
        if self.kind == TestKind::Ui {
            for name in UI_REQUIRED_SCREENSHOTS {
                store.require_screenshot(name);
            }
        }

        let backend = if let Ok(base_url) = std::env::var(SERVER_URL_ENV_VAR) {
            store.log(format!(
                "{SERVER_URL_ENV_VAR} is set, forcing external backend at {base_url}"
            ));
            Backend::External {
                base_url: trim_base_url(base_url),
            }
        } else {
            match self.backend {
                BackendRequest::Local => {
                    let mut server =
                        ServerProcess::new(self.server_config, self.timeouts, store.clone());
                    if let Some(allocator) = self.allocator {
                        server = server.with_allocator(allocator);
                    }
                    Backend::Local(server)
                }
                BackendRequest::External(base_url) => Backend::External {
                    base_url: trim_base_url(base_url),
                },
                BackendRequest::Containerized => Backend::Containerized {
                    config: self.topology_config,
                    topology: None,
                },
            }
        };

        Ok(TestEnv {
            store,
            timeouts: self.timeouts,
            backend,
            state: Lifecycle::Created,
            cleanup: CleanupSink::new(),
            browser: None,
        })
    }
}

fn derive_test_name() -> String {
    match std::thread::current().name() {
        Some(name) if !name.is_empty() && name != "main" => name.replace("::", "_"),
        _ => format!("test-{}", Uuid::new_v4()),
    }
}

fn trim_base_url(mut base_url: String) -> String {
    while base_url.ends_with('/') {
        base_url.pop();
    }
    base_url
}
