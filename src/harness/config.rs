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

use crate::harness::error::HarnessResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Forces the external backend and names its base URL.
pub const SERVER_URL_ENV_VAR: &str = "QUARRY_TEST_SERVER_URL";
/// Path of the quarry-server binary for the local backend.
pub const SERVER_BIN_ENV_VAR: &str = "QUARRY_SERVER_BIN";
/// When set, spawned services inherit stdio instead of logging to a file.
pub const VERBOSE_ENV_VAR: &str = "QUARRY_TEST_VERBOSE";
/// Credential forwarded to spawned services and provisioned into drivers.
pub const API_TOKEN_ENV_VAR: &str = "QUARRY_API_TOKEN";
/// Overrides the host secrets file used for driver provisioning.
pub const CREDENTIALS_FILE_ENV_VAR: &str = "QUARRY_CREDENTIALS_FILE";
/// Overrides the primary container image / tag.
pub const SERVER_IMAGE_ENV_VAR: &str = "QUARRY_SERVER_IMAGE";
pub const SERVER_IMAGE_TAG_ENV_VAR: &str = "QUARRY_SERVER_IMAGE_TAG";
/// Overrides the root of the results tree.
pub const RESULTS_DIR_ENV_VAR: &str = "QUARRY_TEST_RESULTS_DIR";
/// Handed to the spawned service, pointing at the generated config file.
pub const CONFIG_PATH_ENV_VAR: &str = "QUARRY_CONFIG_PATH";

/// Host variables with this prefix are forwarded to spawned services.
pub const ENV_VAR_PREFIX: &str = "QUARRY_";

pub const SERVER_BINARY_NAME: &str = "quarry-server";
/// Fixed HTTP port the service binds inside containers.
pub const SERVICE_HTTP_PORT: u16 = 8080;

pub const HEALTH_PATH: &str = "/health";
pub const MCP_RPC_PATH: &str = "/mcp/v1";
pub const MCP_SSE_PATH: &str = "/mcp/sse";

/// Which results subtree a test writes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKind {
    Api,
    McpProtocol,
    Ui,
    ServiceLifecycle,
}

impl TestKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            TestKind::Api => "api",
            TestKind::McpProtocol => "mcp-protocol",
            TestKind::Ui => "ui",
            TestKind::ServiceLifecycle => "service-lifecycle",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Every provisioning and teardown bound the harness enforces.
#[derive(Debug, Clone, Copy)]
pub struct HarnessTimeouts {
    /// Local service must answer its health probe within this bound.
    pub readiness: Duration,
    /// Grace between SIGTERM and SIGKILL on stop.
    pub shutdown_grace: Duration,
    /// After stop, the service port must refuse connections within this bound.
    pub port_release: Duration,
    /// Primary container must pass its HTTP wait strategy within this bound.
    pub container_startup: Duration,
    /// Bound on each browser navigation or capture.
    pub browser_op: Duration,
    /// Overall bound on provisioning one environment.
    pub suite: Duration,
}

impl Default for HarnessTimeouts {
    fn default() -> Self {
        Self {
            readiness: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            port_release: Duration::from_secs(10),
            container_startup: Duration::from_secs(60),
            browser_op: Duration::from_secs(60),
            suite: Duration::from_secs(600),
        }
    }
}

/// Local-backend knobs; everything not set here comes from the host
/// environment or the defaults in [`ServerSettings`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Explicit binary path. Falls back to `QUARRY_SERVER_BIN`, then to
    /// `quarry-server` on PATH.
    pub executable_path: Option<PathBuf>,
    pub web_ui: bool,
    pub mcp: bool,
    pub log_level: String,
    pub index_watch: bool,
    pub index_debounce_ms: u64,
    pub extra_envs: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable_path: None,
            web_ui: true,
            mcp: true,
            log_level: "debug".to_string(),
            // Watching is off under test; indexing is driven by explicit
            // reindex calls so assertions never race the debouncer.
            index_watch: false,
            index_debounce_ms: 100,
            extra_envs: HashMap::new(),
        }
    }
}

/// Images used by the containerized backend.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub image: String,
    pub tag: String,
    pub driver_image: String,
    pub driver_tag: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            image: std::env::var(SERVER_IMAGE_ENV_VAR).unwrap_or_else(|_| "quarry".to_string()),
            tag: std::env::var(SERVER_IMAGE_TAG_ENV_VAR).unwrap_or_else(|_| "local".to_string()),
            // alpine/curl runs as root, which file provisioning relies on.
            driver_image: "alpine/curl".to_string(),
            driver_tag: "8.11.1".to_string(),
        }
    }
}

/// The config document generated for a spawned service, section for section
/// what quarry-server reads at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub http: HttpSettings,
    pub storage: StorageSettings,
    pub features: FeatureSettings,
    pub logging: LoggingSettings,
    pub index: IndexSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSettings {
    pub web_ui: bool,
    pub mcp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    pub watch: bool,
    pub debounce_ms: u64,
}

impl ServerSettings {
    pub fn for_test(port: u16, storage_path: &Path, config: &ServerConfig) -> Self {
        Self {
            http: HttpSettings {
                address: format!("127.0.0.1:{port}"),
            },
            storage: StorageSettings {
                path: storage_path.to_path_buf(),
            },
            features: FeatureSettings {
                web_ui: config.web_ui,
                mcp: config.mcp,
            },
            logging: LoggingSettings {
                level: config.log_level.clone(),
            },
            index: IndexSettings {
                watch: config.index_watch,
                debounce_ms: config.index_debounce_ms,
            },
        }
    }

    pub fn to_toml(&self) -> HarnessResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_section() {
        let settings = ServerSettings::for_test(
            21500,
            Path::new("/tmp/quarry-test/storage"),
            &ServerConfig::default(),
        );
        let rendered = settings.to_toml().expect("settings should render");

        for section in ["[http]", "[storage]", "[features]", "[logging]", "[index]"] {
            assert!(rendered.contains(section), "missing {section} in:\n{rendered}");
        }
        assert!(rendered.contains("address = \"127.0.0.1:21500\""));
        assert!(rendered.contains("web_ui = true"));
        assert!(rendered.contains("watch = false"));
        assert!(rendered.contains("debounce_ms = 100"));
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(TestKind::Api.dir_name(), "api");
        assert_eq!(TestKind::McpProtocol.dir_name(), "mcp-protocol");
        assert_eq!(TestKind::Ui.dir_name(), "ui");
        assert_eq!(TestKind::ServiceLifecycle.dir_name(), "service-lifecycle");
    }
}
