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
    API_TOKEN_ENV_VAR, CREDENTIALS_FILE_ENV_VAR, HEALTH_PATH, HarnessTimeouts, MCP_RPC_PATH,
    SERVICE_HTTP_PORT, TopologyConfig,
};
use crate::harness::context::ResultStore;
use crate::harness::error::{CleanupSink, HarnessError, HarnessResult};
use crate::harness::scrub::parse_exec_json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::core::wait::HttpWaitStrategy;
use testcontainers::core::{ExecCommand, IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::time::sleep;
use uuid::Uuid;

const EXEC_PROBE_INTERVAL: Duration = Duration::from_millis(250);
const EXEC_PROBE_ATTEMPTS: usize = 40;

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const CREDENTIALS_CONTAINER_PATH: &str = "/root/.config/quarry/credentials.json";

/// Cheap daemon probe so container-backed tests can skip instead of failing
/// on hosts without docker.
pub fn docker_available() -> bool {
    std::env::var("DOCKER_HOST").is_ok() || Path::new(DOCKER_SOCKET).exists()
}

/// Host secrets file candidate for driver provisioning:
/// `QUARRY_CREDENTIALS_FILE` or `~/.config/quarry/credentials.json`.
pub fn host_credentials_path() -> Option<PathBuf> {
    credentials_path_from(
        std::env::var(CREDENTIALS_FILE_ENV_VAR).ok(),
        std::env::var("HOME").ok(),
    )
}

fn credentials_path_from(file_override: Option<String>, home: Option<String>) -> Option<PathBuf> {
    if let Some(path) = file_override {
        return Some(PathBuf::from(path));
    }
    home.map(|home| PathBuf::from(home).join(".config/quarry/credentials.json"))
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    fn ensure_success(self, container: &str) -> HarnessResult<Self> {
        if self.exit_code != 0 {
            return Err(HarnessError::ExecFailed {
                container: container.to_string(),
                exit_code: self.exit_code,
                output: self.combined(),
            });
        }
        Ok(self)
    }
}

/// Two-container environment on a private network: the service under test
/// (primary) and a shell-capable driver for exercising it from inside the
/// network. Containers address each other by network alias only; the host
/// talks to the primary through its mapped port.
pub struct ServiceTopology {
    primary: ContainerAsync<GenericImage>,
    driver: ContainerAsync<GenericImage>,
    network: String,
    primary_alias: String,
    driver_alias: String,
    host_base_url: String,
    store: Arc<ResultStore>,
}

impl std::fmt::Debug for ServiceTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTopology")
            .field("network", &self.network)
            .field("primary_alias", &self.primary_alias)
            .field("host_base_url", &self.host_base_url)
            .finish_non_exhaustive()
    }
}

impl ServiceTopology {
    pub async fn start(
        config: TopologyConfig,
        timeouts: HarnessTimeouts,
        store: Arc<ResultStore>,
    ) -> HarnessResult<Self> {
        if !docker_available() {
            return Err(HarnessError::skipped("no docker daemon on this host"));
        }

        let id = Uuid::new_v4();
        let network = format!("quarry-test-{id}");
        let primary_alias = format!("quarry-server-{id}");
        let driver_alias = format!("quarry-driver-{id}");

        store.log(format!(
            "Starting {}:{} as {primary_alias} on network {network}",
            config.image, config.tag
        ));
        let wait = HttpWaitStrategy::new(HEALTH_PATH)
            .with_port(SERVICE_HTTP_PORT.tcp())
            .with_expected_status_code(200u16);
        let mut primary_request = GenericImage::new(&config.image, &config.tag)
            .with_exposed_port(SERVICE_HTTP_PORT.tcp())
            .with_wait_for(WaitFor::http(wait))
            .with_network(&network)
            .with_container_name(&primary_alias)
            .with_env_var(
                "QUARRY_HTTP_ADDRESS",
                format!("0.0.0.0:{SERVICE_HTTP_PORT}"),
            )
            .with_env_var("QUARRY_LOG_LEVEL", "debug")
            .with_startup_timeout(timeouts.container_startup);
        if let Ok(token) = std::env::var(API_TOKEN_ENV_VAR) {
            primary_request = primary_request.with_env_var(API_TOKEN_ENV_VAR, token);
        }
        let primary = primary_request
            .start()
            .await
            .map_err(|e| setup_error("primary", e))?;

        let host = primary
            .get_host()
            .await
            .map_err(|e| setup_error("primary", e))?;
        let host_port = primary
            .get_host_port_ipv4(SERVICE_HTTP_PORT)
            .await
            .map_err(|e| setup_error("primary", e))?;
        let host_base_url = format!("http://{host}:{host_port}");
        store.log(format!("Primary reachable from host at {host_base_url}"));

        // The driver's entrypoint is replaced by a keep-alive; everything it
        // does happens through exec.
        let driver = GenericImage::new(&config.driver_image, &config.driver_tag)
            .with_entrypoint("tail")
            .with_cmd(["-f", "/dev/null"])
            .with_network(&network)
            .with_container_name(&driver_alias)
            .start()
            .await
            .map_err(|e| setup_error("driver", e))?;

        let topology = Self {
            primary,
            driver,
            network,
            primary_alias,
            driver_alias,
            host_base_url,
            store,
        };
        topology.wait_driver_ready().await?;
        Ok(topology)
    }

    /// Base URL the harness uses from the host.
    pub fn host_base_url(&self) -> &str {
        &self.host_base_url
    }

    /// Base URL the driver uses from inside the network.
    pub fn internal_base_url(&self) -> String {
        format!("http://{}:{SERVICE_HTTP_PORT}", self.primary_alias)
    }

    pub fn primary_alias(&self) -> &str {
        &self.primary_alias
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Runs a command in the driver container, returning exit code and both
    /// output streams. Success is not enforced here; callers decide.
    pub async fn exec(
        &self,
        cmd: impl IntoIterator<Item = impl Into<String>>,
    ) -> HarnessResult<ExecOutput> {
        let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
        let display = cmd.join(" ");

        let mut result = self
            .driver
            .exec(ExecCommand::new(cmd))
            .await
            .map_err(|e| setup_error(&self.driver_alias, e))?;
        let exit_code = result
            .exit_code()
            .await
            .map_err(|e| setup_error(&self.driver_alias, e))?
            .unwrap_or(0);
        let stdout = String::from_utf8_lossy(
            &result
                .stdout_to_vec()
                .await
                .map_err(|e| setup_error(&self.driver_alias, e))?,
        )
        .into_owned();
        let stderr = String::from_utf8_lossy(
            &result
                .stderr_to_vec()
                .await
                .map_err(|e| setup_error(&self.driver_alias, e))?,
        )
        .into_owned();

        self.store.log(format!("exec `{display}` -> {exit_code}"));
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    pub async fn exec_script(&self, script: &str) -> HarnessResult<ExecOutput> {
        self.exec(["sh", "-c", script]).await
    }

    /// Fetches an arbitrary URL from inside the network. Exit code 6 from
    /// curl marks an unresolvable host, which is exactly what reaching for
    /// an unregistered alias should produce.
    pub async fn driver_fetch(&self, url: &str) -> HarnessResult<ExecOutput> {
        self.exec_script(&format!("curl -sS --max-time 10 {}", shell_quote(url)))
            .await
    }

    /// POSTs a JSON body to the primary from inside the network and decodes
    /// the scrubbed response.
    pub async fn driver_post_json(&self, path: &str, body: &Value) -> HarnessResult<Value> {
        let url = format!("{}{path}", self.internal_base_url());
        let script = format!(
            "curl -sS --max-time 30 -X POST -H 'Content-Type: application/json' --data {} {}",
            shell_quote(&body.to_string()),
            shell_quote(&url),
        );
        let output = self
            .exec_script(&script)
            .await?
            .ensure_success(&self.driver_alias)?;
        parse_exec_json(&output.stdout)
    }

    pub async fn driver_get_json(&self, path: &str) -> HarnessResult<Value> {
        let url = format!("{}{path}", self.internal_base_url());
        let output = self
            .driver_fetch(&url)
            .await?
            .ensure_success(&self.driver_alias)?;
        parse_exec_json(&output.stdout)
    }

    /// JSON-RPC call driven from inside the network; returns the raw
    /// envelope for the caller to pick apart.
    pub async fn driver_rpc(&self, method: &str, params: Value) -> HarnessResult<Value> {
        self.driver_post_json(
            MCP_RPC_PATH,
            &json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}),
        )
        .await
    }

    pub async fn driver_tool_call(&self, name: &str, arguments: Value) -> HarnessResult<Value> {
        self.driver_rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    pub async fn driver_search(&self, project_id: &str, query: &str) -> HarnessResult<Value> {
        self.driver_post_json(
            &format!("/projects/{project_id}/search"),
            &json!({"query": query}),
        )
        .await
    }

    /// Copies the host secrets file into the driver with tight permissions.
    /// Skips (rather than fails) when the host has no credentials to give.
    pub async fn provision_credentials(&self) -> HarnessResult<PathBuf> {
        let Some(path) = host_credentials_path() else {
            return Err(HarnessError::skipped("no home directory for credentials"));
        };
        if !path.exists() {
            return Err(HarnessError::skipped(format!(
                "no credentials file at {}",
                path.display()
            )));
        }

        let bytes = std::fs::read(&path)?;
        self.copy_file(&bytes, CREDENTIALS_CONTAINER_PATH, "600")
            .await?;
        self.store.log(format!(
            "Provisioned {} into {} at {CREDENTIALS_CONTAINER_PATH}",
            path.display(),
            self.driver_alias
        ));
        Ok(PathBuf::from(CREDENTIALS_CONTAINER_PATH))
    }

    /// Writes a literal payload into the driver by piping base64 through the
    /// container shell, then fixes mode and ownership.
    pub async fn copy_file(&self, bytes: &[u8], remote_path: &str, mode: &str) -> HarnessResult<()> {
        let encoded = BASE64.encode(bytes);
        let quoted_path = shell_quote(remote_path);
        let parent = Path::new(remote_path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let script = format!(
            "mkdir -p {} && printf '%s' {} | base64 -d > {quoted_path} \
             && chmod {mode} {quoted_path} && chown root:root {quoted_path}",
            shell_quote(&parent),
            shell_quote(&encoded),
        );
        self.exec_script(&script)
            .await?
            .ensure_success(&self.driver_alias)?;
        Ok(())
    }

    /// Stops both containers, tolerating resources that are already gone.
    /// The network is removed with its last container.
    pub async fn stop(&self, sink: &CleanupSink) {
        sink.record("stop driver container", self.driver.stop().await);
        sink.record("stop primary container", self.primary.stop().await);
        self.store.log(format!("Topology on {} stopped", self.network));
    }

    async fn wait_driver_ready(&self) -> HarnessResult<()> {
        for _ in 0..EXEC_PROBE_ATTEMPTS {
            if let Ok(output) = self.exec(["true"]).await
                && output.exit_code == 0
            {
                self.store
                    .log(format!("Driver {} is responsive", self.driver_alias));
                return Ok(());
            }
            sleep(EXEC_PROBE_INTERVAL).await;
        }
        Err(setup_error(
            &self.driver_alias,
            "shell never became responsive",
        ))
    }
}

fn setup_error(container: &str, error: impl Display) -> HarnessError {
    HarnessError::ContainerSetup {
        container: container.to_string(),
        message: error.to_string(),
    }
}

/// POSIX single-quoting; the only character needing care inside single
/// quotes is the single quote itself.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}
