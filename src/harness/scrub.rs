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

use crate::harness::error::{HarnessError, HarnessResult};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// CSI sequences, OSC sequences and lone ESC controls, in that order.
const ANSI_PATTERN: &str =
    r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]";

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(ANSI_PATTERN).expect("ANSI pattern is valid"))
}

/// Strips terminal escape sequences and stray control bytes from raw exec
/// output. Shells inside containers happily mix progress meters, carriage
/// returns and color codes into otherwise machine-readable output; decoding
/// works on the cleaned text only.
pub fn clean_exec_output(raw: &str) -> String {
    let without_ansi = ansi_regex().replace_all(raw, "");
    without_ansi
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Locates the first top-level JSON value (`{` or `[`) in already-cleaned
/// text and decodes it, tolerating trailing noise after the value.
pub fn first_json_value(cleaned: &str) -> HarnessResult<Value> {
    let start = cleaned.find(['{', '[']).ok_or_else(|| {
        HarnessError::protocol(format!(
            "no JSON value found in exec output: {}",
            truncate(cleaned)
        ))
    })?;

    let mut stream = serde_json::Deserializer::from_str(&cleaned[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(HarnessError::protocol(format!(
            "malformed JSON in exec output: {e}: {}",
            truncate(&cleaned[start..])
        ))),
        None => Err(HarnessError::protocol(format!(
            "empty JSON stream in exec output: {}",
            truncate(cleaned)
        ))),
    }
}

/// Scrub-then-decode, the path every driver-side protocol call takes.
pub fn parse_exec_json(raw: &str) -> HarnessResult<Value> {
    first_json_value(&clean_exec_output(raw))
}

fn truncate(text: &str) -> &str {
    let limit = 200.min(text.len());
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
