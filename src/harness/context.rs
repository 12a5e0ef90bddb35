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

use crate::harness::config::{RESULTS_DIR_ENV_VAR, TestKind};
use crate::harness::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const TEST_LOG_FILE: &str = "test.log";
const SERVICE_LOG_FILE: &str = "service.log";
const SUMMARY_JSON_FILE: &str = "summary.json";
const SUMMARY_MD_FILE: &str = "SUMMARY.md";
const DATA_DIR: &str = "data";

/// Per-test artifact store rooted at `results/{kind}/{test_name}/`.
///
/// The layout is fixed: client artifacts under `data/`, screenshots and log
/// files at the root, and `summary.json` / `SUMMARY.md` written last by
/// [`ResultStore::write_summary`]. Creating the store purges any previous run
/// of the same test, so artifacts never leak across reruns.
#[derive(Debug)]
pub struct ResultStore {
    kind: TestKind,
    test_name: String,
    root: PathBuf,
    created_at: Instant,
    log_file: Mutex<Option<File>>,
    required_screenshots: Mutex<Vec<String>>,
}

/// What `summary.json` holds; `SUMMARY.md` renders the same facts for humans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub test: String,
    pub kind: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub timestamp: String,
    pub details: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Root of the results tree: `QUARRY_TEST_RESULTS_DIR` or `./results`.
pub fn default_results_root() -> PathBuf {
    std::env::var(RESULTS_DIR_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("results"))
}

impl ResultStore {
    pub fn create(kind: TestKind, test_name: &str) -> HarnessResult<Self> {
        Self::create_under(&default_results_root(), kind, test_name)
    }

    /// Like [`ResultStore::create`] with an explicit tree root.
    pub fn create_under(results_root: &Path, kind: TestKind, test_name: &str) -> HarnessResult<Self> {
        let root = results_root.join(kind.dir_name()).join(test_name);
        match fs::remove_dir_all(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(HarnessError::DirectoryCreation {
                    path: root,
                    source: e,
                });
            }
        }
        fs::create_dir_all(root.join(DATA_DIR)).map_err(|e| HarnessError::DirectoryCreation {
            path: root.join(DATA_DIR),
            source: e,
        })?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(TEST_LOG_FILE))
            .ok();

        Ok(Self {
            kind,
            test_name: test_name.to_string(),
            root,
            created_at: Instant::now(),
            log_file: Mutex::new(log_file),
            required_screenshots: Mutex::new(Vec::new()),
        })
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn service_log_path(&self) -> PathBuf {
        self.root.join(SERVICE_LOG_FILE)
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Appends a timestamped line to `test.log` and forwards it to the
    /// tracing reporter. Logging never fails the test; file errors are
    /// swallowed.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(test = %self.test_name, "{message}");
        if let Ok(mut guard) = self.log_file.lock()
            && let Some(file) = guard.as_mut()
        {
            let line = format!("[{}] {message}\n", chrono::Utc::now().to_rfc3339());
            let _ = file.write_all(line.as_bytes());
        }
    }

    /// Writes an artifact under `data/` and returns its path.
    pub fn save(&self, name: &str, bytes: &[u8]) -> HarnessResult<PathBuf> {
        let path = self.data_dir().join(name);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn save_json<T: Serialize>(&self, name: &str, value: &T) -> HarnessResult<PathBuf> {
        let rendered = serde_json::to_vec_pretty(value)?;
        self.save(name, &rendered)
    }

    /// Writes `{name}.png` at the results root, where summary scanning picks
    /// it up.
    pub fn save_screenshot(&self, name: &str, png: &[u8]) -> HarnessResult<PathBuf> {
        let path = self.root.join(format!("{name}.png"));
        fs::write(&path, png)?;
        Ok(path)
    }

    /// Registers a screenshot name that must exist by summary time. A missing
    /// required screenshot forces the summary to failed.
    pub fn require_screenshot(&self, name: &str) {
        if let Ok(mut required) = self.required_screenshots.lock() {
            required.push(name.to_string());
        }
    }

    /// Scans the store, enforces the required-screenshot policy and writes
    /// `summary.json` plus `SUMMARY.md`. Filesystem failures here are fatal:
    /// a test without a summary cannot be audited afterwards.
    pub fn write_summary(
        &self,
        passed: bool,
        duration: Duration,
        details: &str,
        errors: Vec<String>,
    ) -> HarnessResult<TestSummary> {
        let (screenshots, logs) = self.scan_artifacts()?;

        let mut passed = passed;
        let mut errors = errors;
        let required = self
            .required_screenshots
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        for name in &required {
            let file_name = format!("{name}.png");
            if !screenshots.contains(&file_name) {
                passed = false;
                errors.push(format!("Required screenshot missing: {file_name}"));
            }
        }

        let summary = TestSummary {
            test: self.test_name.clone(),
            kind: self.kind.dir_name().to_string(),
            passed,
            duration_ms: duration.as_millis() as u64,
            timestamp: chrono::Utc::now().to_rfc3339(),
            details: details.to_string(),
            errors,
            screenshots,
            logs,
        };

        let json = serde_json::to_vec_pretty(&summary)?;
        fs::write(self.root.join(SUMMARY_JSON_FILE), json)?;
        fs::write(self.root.join(SUMMARY_MD_FILE), render_markdown(&summary))?;
        Ok(summary)
    }

    /// Collects `*.png` and `*.log` files at the root, sorted by name. The
    /// scan happens after every artifact-producing call, so anything saved
    /// earlier through this store is guaranteed to be visible.
    fn scan_artifacts(&self) -> HarnessResult<(Vec<String>, Vec<String>)> {
        let mut screenshots = Vec::new();
        let mut logs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".png") {
                screenshots.push(name);
            } else if name.ends_with(".log") {
                logs.push(name);
            }
        }
        screenshots.sort();
        logs.sort();
        Ok((screenshots, logs))
    }
}

fn render_markdown(summary: &TestSummary) -> String {
    let mut md = String::new();
    md.push_str(&format!("# {}\n\n", summary.test));
    md.push_str(&format!("- Kind: {}\n", summary.kind));
    md.push_str(&format!(
        "- Result: {}\n",
        if summary.passed { "PASSED" } else { "FAILED" }
    ));
    md.push_str(&format!(
        "- Duration: {}\n",
        humantime::format_duration(Duration::from_millis(summary.duration_ms))
    ));
    md.push_str(&format!("- Finished: {}\n", summary.timestamp));

    if !summary.details.is_empty() {
        md.push_str(&format!("\n{}\n", summary.details));
    }
    if !summary.errors.is_empty() {
        md.push_str("\n## Errors\n\n");
        for error in &summary.errors {
            md.push_str(&format!("- {error}\n"));
        }
    }
    if !summary.screenshots.is_empty() {
        md.push_str("\n## Screenshots\n\n");
        for screenshot in &summary.screenshots {
            md.push_str(&format!("- {screenshot}\n"));
        }
    }
    if !summary.logs.is_empty() {
        md.push_str("\n## Logs\n\n");
        for log in &summary.logs {
            md.push_str(&format!("- {log}\n"));
        }
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_created_with_data_dir_and_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store =
            ResultStore::create_under(tmp.path(), TestKind::Api, "layout").expect("create store");

        assert!(store.root().ends_with("api/layout"));
        assert!(store.data_dir().is_dir());
        store.log("hello");
        let log = fs::read_to_string(store.root().join(TEST_LOG_FILE)).expect("test.log");
        assert!(log.contains("hello"));
    }

    #[test]
    fn markdown_lists_errors_and_artifacts() {
        let summary = TestSummary {
            test: "sample".to_string(),
            kind: "ui".to_string(),
            passed: false,
            duration_ms: 1500,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            details: "details here".to_string(),
            errors: vec!["boom".to_string()],
            screenshots: vec!["before.png".to_string()],
            logs: vec!["test.log".to_string()],
        };
        let md = render_markdown(&summary);
        assert!(md.contains("# sample"));
        assert!(md.contains("- Result: FAILED"));
        assert!(md.contains("- boom"));
        assert!(md.contains("- before.png"));
        assert!(md.contains("- test.log"));
    }
}
