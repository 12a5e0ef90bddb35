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

use crate::harness::config::{MCP_RPC_PATH, MCP_SSE_PATH};
use crate::harness::context::ResultStore;
use crate::harness::error::{HarnessError, HarnessResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Tool names the service is contractually expected to expose.
pub const EXPECTED_TOOLS: [&str; 5] = [
    "list_projects",
    "register_project",
    "delete_project",
    "search",
    "index_status",
];

const SSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SSE_MAX_CHUNKS: usize = 10;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 client for the service's MCP endpoint, plus the SSE
/// handshake probe. Every exchange is logged to the result store.
#[derive(Debug)]
pub struct McpClient {
    rpc_url: String,
    sse_url: String,
    client: Client,
    next_id: AtomicU64,
    store: Arc<ResultStore>,
}

impl McpClient {
    pub fn new(base_url: impl Into<String>, store: Arc<ResultStore>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            rpc_url: format!("{base_url}{MCP_RPC_PATH}"),
            sse_url: format!("{base_url}{MCP_SSE_PATH}"),
            client: Client::new(),
            next_id: AtomicU64::new(1),
            store,
        }
    }

    /// Performs one JSON-RPC call and returns the `result` member. An `error`
    /// member maps to [`HarnessError::Rpc`]; a response carrying neither, or
    /// echoing the wrong id, is a protocol violation.
    pub async fn call(&self, method: &str, params: Option<Value>) -> HarnessResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let response = self.client.post(&self.rpc_url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        self.store
            .log(format!("rpc {method} id={id} -> {} {body}", status.as_u16()));

        if !status.is_success() {
            return Err(HarnessError::protocol(format!(
                "rpc {method} answered HTTP {status}: {body}"
            )));
        }
        let envelope: RpcResponse = serde_json::from_str(&body)?;
        validate_envelope(id, method, envelope)
    }

    pub async fn initialize(&self) -> HarnessResult<Value> {
        self.call(
            "initialize",
            Some(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {
                    "name": "quarry-harness",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        )
        .await
    }

    /// `tools/list`, reduced to the declared tool names.
    pub async fn tools_list(&self) -> HarnessResult<Vec<String>> {
        let result = self.call("tools/list", None).await?;
        let tools = result["tools"].as_array().ok_or_else(|| {
            HarnessError::protocol(format!("tools/list result lacks a tools array: {result}"))
        })?;
        tools
            .iter()
            .map(|tool| {
                tool["name"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| HarnessError::protocol(format!("tool without a name: {tool}")))
            })
            .collect()
    }

    pub async fn tool_call(&self, name: &str, arguments: Value) -> HarnessResult<Value> {
        self.call(
            "tools/call",
            Some(json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    /// Opens the SSE endpoint, reads only the opening handshake and returns
    /// the callback URL it announces. The stream is dropped afterwards; this
    /// probes the contract, it does not consume events.
    pub async fn probe_sse(&self) -> HarnessResult<String> {
        let started = std::time::Instant::now();
        let handshake = tokio::time::timeout(SSE_HANDSHAKE_TIMEOUT, self.read_handshake())
            .await
            .map_err(|_| HarnessError::Timeout {
                operation: "sse handshake".to_string(),
                elapsed: started.elapsed(),
            })??;

        let endpoint = parse_sse_handshake(&handshake)?;
        self.store.log(format!("sse endpoint -> {endpoint}"));
        Ok(endpoint)
    }

    async fn read_handshake(&self) -> HarnessResult<String> {
        let mut response = self
            .client
            .get(&self.sse_url)
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HarnessError::protocol(format!(
                "sse endpoint answered HTTP {}",
                response.status()
            )));
        }

        // One event is typically one chunk, but chunk boundaries are not
        // guaranteed; accumulate until the event terminator shows up.
        let mut buffer = String::new();
        for _ in 0..SSE_MAX_CHUNKS {
            match response.chunk().await? {
                Some(chunk) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));
                    if buffer.contains("\n\n") {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(buffer)
    }
}

fn validate_envelope(expected_id: u64, method: &str, envelope: RpcResponse) -> HarnessResult<Value> {
    if envelope.jsonrpc != "2.0" {
        return Err(HarnessError::protocol(format!(
            "rpc {method} answered with jsonrpc version {:?}",
            envelope.jsonrpc
        )));
    }
    if let Some(error) = envelope.error {
        return Err(HarnessError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    let Some(result) = envelope.result else {
        return Err(HarnessError::protocol(format!(
            "rpc {method} answered with neither result nor error"
        )));
    };
    if envelope.id != Some(json!(expected_id)) {
        return Err(HarnessError::protocol(format!(
            "rpc {method} echoed id {:?}, expected {expected_id}",
            envelope.id
        )));
    }
    Ok(result)
}

/// Parses the opening SSE event: it must be `event: endpoint` with a `data:`
/// line naming an http URL.
fn parse_sse_handshake(handshake: &str) -> HarnessResult<String> {
    let mut lines = handshake
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(':'));

    match lines.next() {
        Some("event: endpoint") => {}
        other => {
            return Err(HarnessError::protocol(format!(
                "sse stream did not open with an endpoint event: {other:?}"
            )));
        }
    }
    let Some(data) = lines.next().and_then(|line| line.strip_prefix("data: ")) else {
        return Err(HarnessError::protocol(
            "sse endpoint event carries no data line".to_string(),
        ));
    };
    if !data.starts_with("http") {
        return Err(HarnessError::protocol(format!(
            "sse endpoint event names a non-http callback: {data}"
        )));
    }
    Ok(data.to_string())
}
