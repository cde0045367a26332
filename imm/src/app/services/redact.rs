// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde_json::Value;

use crate::app::types::CommandSpec;

const SECRET_MARKERS: [&str; 5] = ["password", "token", "secret", "credential", "securestring"];
const MASK: &str = "***";

pub fn is_secret_parameter(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Loggable one-line form of a command with secret parameter values masked.
pub fn redacted(command: &CommandSpec) -> String {
    let mut out = command.name.clone();
    for (key, value) in &command.parameters {
        out.push_str(" -");
        out.push_str(key);
        if is_secret_parameter(key) {
            out.push(' ');
            out.push_str(MASK);
            continue;
        }
        match value {
            Value::Bool(true) => {}
            Value::String(s) => {
                out.push_str(" '");
                out.push_str(&s.replace('\'', "''"));
                out.push('\'');
            }
            other => {
                out.push(' ');
                out.push_str(&other.to_string());
            }
        }
    }
    out
}

/// Removes any secret parameter value that leaked into free text.
pub fn scrub(text: &str, command: &CommandSpec) -> String {
    command
        .parameters
        .iter()
        .filter(|(key, _)| is_secret_parameter(key))
        .filter_map(|(_, value)| value.as_str())
        .filter(|secret| !secret.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, MASK))
}
