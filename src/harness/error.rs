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

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while provisioning, exercising or tearing down a test
/// environment. Setup failures are fatal to the owning test; `Skipped` marks
/// environments the host cannot provide (no docker daemon, no browser, no
/// credentials) and is recognized via [`HarnessError::is_skip`].
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Failed to spawn {binary}: {source}")]
    ProcessSpawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("Failed to create {path}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{binary} exited during startup ({status}): {log_tail}")]
    ProcessCrashed {
        binary: String,
        status: String,
        log_tail: String,
    },

    #[error("{target} not ready at {address} after {elapsed:?}: {last_error}")]
    ReadinessTimeout {
        target: String,
        address: String,
        elapsed: Duration,
        last_error: String,
    },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Environment already started")]
    AlreadyStarted,

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Skipped: {reason}")]
    Skipped { reason: String },

    #[error("Container setup failed for {container}: {message}")]
    ContainerSetup { container: String, message: String },

    #[error("Exec in {container} exited with code {exit_code}: {output}")]
    ExecFailed {
        container: String,
        exit_code: i64,
        output: String,
    },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Browser error: {message}")]
    Browser { message: String },

    #[error("Config error: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    pub fn skipped(reason: impl Into<String>) -> Self {
        HarnessError::Skipped {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        HarnessError::InvalidState {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        HarnessError::Protocol {
            message: message.into(),
        }
    }

    /// True for environmental conditions a test should skip on rather than
    /// fail on.
    pub fn is_skip(&self) -> bool {
        matches!(self, HarnessError::Skipped { .. })
    }

    /// True when the underlying transport could not connect at all, as
    /// opposed to a slow or misbehaving peer. Used to tell a released port
    /// apart from a hung one.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, HarnessError::Http(e) if e.is_connect())
    }
}

/// Collects teardown failures instead of raising them. Cleanup must never
/// mask the error that actually failed a test, so every stop path records
/// here and the drained messages end up in the test summary.
#[derive(Debug, Default)]
pub struct CleanupSink {
    errors: Mutex<Vec<String>>,
}

impl CleanupSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed cleanup step and returns the success value if any.
    pub fn record<T, E: Display>(&self, what: &str, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.note(what, error);
                None
            }
        }
    }

    pub fn note(&self, what: &str, error: impl Display) {
        let message = format!("{what}: {error}");
        tracing::warn!("Cleanup failure ignored: {message}");
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(message);
        }
    }

    pub fn drain(&self) -> Vec<String> {
        match self.errors.lock() {
            Ok(mut errors) => std::mem::take(&mut *errors),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().map(|e| e.is_empty()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_detection_only_matches_skipped() {
        assert!(HarnessError::skipped("no docker daemon").is_skip());
        assert!(!HarnessError::AlreadyStarted.is_skip());
    }

    #[test]
    fn sink_collects_in_order_and_drains_once() {
        let sink = CleanupSink::new();
        sink.record::<(), _>("stop server", Err("signal failed"));
        sink.note("remove network", "already gone");
        assert!(!sink.is_empty());

        let drained = sink.drain();
        assert_eq!(
            drained,
            vec![
                "stop server: signal failed".to_string(),
                "remove network: already gone".to_string()
            ]
        );
        assert!(sink.is_empty());
    }
}
