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
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const WINDOW_WIDTH: u32 = 1280;
const WINDOW_HEIGHT: u32 = 800;
/// Selector whose presence marks a page as rendered enough to capture.
const READY_SELECTOR: &str = "body";

/// Headless Chrome driver for UI checks against a running environment.
/// Every operation is bounded by the browser op timeout; captures land in
/// the result store where the summary scan picks them up.
pub struct BrowserCapture {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
    base_url: String,
    store: Arc<ResultStore>,
    op_timeout: Duration,
}

impl std::fmt::Debug for BrowserCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserCapture")
            .field("base_url", &self.base_url)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl BrowserCapture {
    /// Launches headless Chrome and opens a blank page. A host without a
    /// usable Chrome yields [`HarnessError::Skipped`], so UI tests degrade
    /// to skips instead of failures.
    pub async fn launch(
        base_url: impl Into<String>,
        store: Arc<ResultStore>,
        op_timeout: Duration,
    ) -> HarnessResult<Self> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(WINDOW_WIDTH, WINDOW_HEIGHT)
            .build()
            .map_err(|e| HarnessError::Browser {
                message: format!("invalid browser config: {e}"),
            })?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| HarnessError::skipped(format!("no usable Chrome on this host: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(HarnessError::Browser {
                    message: format!("failed to open a page: {e}"),
                });
            }
        };

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        store.log(format!("Browser launched against {base_url}"));

        Ok(Self {
            browser,
            handler_task,
            page,
            base_url,
            store,
            op_timeout,
        })
    }

    /// Navigates to `path` under the base URL and waits until the page body
    /// exists.
    pub async fn navigate(&self, path: &str) -> HarnessResult<()> {
        let url = format!("{}{path}", self.base_url);
        self.store.log(format!("Browser navigating to {url}"));
        let page = &self.page;
        self.bounded(&format!("navigation to {path}"), async move {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            page.find_element(READY_SELECTOR).await?;
            Ok(())
        })
        .await
    }

    /// Captures a full-page PNG and stores it as `{name}.png`.
    pub async fn screenshot(&self, name: &str) -> HarnessResult<PathBuf> {
        let page = &self.page;
        let png = self
            .bounded(&format!("screenshot {name}"), async move {
                page.screenshot(
                    ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .full_page(true)
                        .build(),
                )
                .await
            })
            .await?;

        let path = self.store.save_screenshot(name, &png)?;
        self.store
            .log(format!("Captured {name}.png ({} bytes)", png.len()));
        Ok(path)
    }

    pub async fn navigate_and_capture(&self, path: &str, name: &str) -> HarnessResult<PathBuf> {
        self.navigate(path).await?;
        self.screenshot(name).await
    }

    pub async fn close(mut self) {
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        self.store.log("Browser closed");
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, chromiumoxide::error::CdpError>>,
    ) -> HarnessResult<T> {
        let started = Instant::now();
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(HarnessError::Browser {
                message: format!("{operation}: {e}"),
            }),
            Err(_) => Err(HarnessError::Timeout {
                operation: operation.to_string(),
                elapsed: started.elapsed(),
            }),
        }
    }
}

impl Drop for BrowserCapture {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}
