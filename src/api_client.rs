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

use crate::harness::context::ResultStore;
use crate::harness::error::{HarnessError, HarnessResult};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// HTTP client for the service API. Every request and response is logged to
/// the test's result store, so a failed run can be reconstructed from the
/// artifacts alone.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
    store: Arc<ResultStore>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, store: Arc<ResultStore>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: Client::new(),
            store,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> HarnessResult<ApiResponse> {
        self.execute(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str) -> HarnessResult<ApiResponse> {
        self.execute(Method::POST, path, None).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> HarnessResult<ApiResponse> {
        self.execute(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> HarnessResult<ApiResponse> {
        self.execute(Method::DELETE, path, None).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> HarnessResult<ApiResponse> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        self.store
            .log(format!("{method} {path} -> {} {body}", status.as_u16()));

        Ok(ApiResponse { status, body })
    }
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> HarnessResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn json_value(&self) -> HarnessResult<Value> {
        self.json()
    }

    pub fn expect_status(self, expected: StatusCode) -> HarnessResult<Self> {
        if self.status != expected {
            return Err(HarnessError::Assertion(format!(
                "expected status {expected}, got {}: {}",
                self.status, self.body
            )));
        }
        Ok(self)
    }

    pub fn expect_ok_json<T: DeserializeOwned>(self) -> HarnessResult<T> {
        self.expect_status(StatusCode::OK)?.json()
    }
}

/// Collects assertion failures instead of bailing on the first one, so a
/// single run reports every mismatch it found.
#[derive(Debug, Default)]
pub struct Checks {
    failures: Vec<String>,
}

impl Checks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&mut self, condition: bool, message: impl Into<String>) {
        if !condition {
            self.failures.push(message.into());
        }
    }

    pub fn expect_eq<T: PartialEq + Debug>(&mut self, label: &str, expected: T, actual: T) {
        if expected != actual {
            self.failures
                .push(format!("{label}: expected {expected:?}, got {actual:?}"));
        }
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn into_result(self) -> HarnessResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Assertion(self.failures.join("; ")))
        }
    }
}
