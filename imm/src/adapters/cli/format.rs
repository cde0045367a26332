// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt::Write as _;

use crate::app::types::{BatchOperationItem, BatchOperationResult, ItemStatus, Severity};

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Blocker => "BLOCKER",
        Severity::Warning => "WARNING",
        Severity::Info => "INFO",
    }
}

fn item_row(item: &BatchOperationItem) -> String {
    let row = item
        .request
        .row
        .map_or_else(|| format!("#{}", item.index), |row| row.to_string());
    let detail = match (&item.last_error, &item.remote_job_handle) {
        (Some(err), _) => err.to_string(),
        (None, Some(job)) => format!("job {job}"),
        (None, None) => String::new(),
    };
    format!(
        "{row:<6} {:<38} {:<11} {}",
        item.identifier,
        item.status.as_str(),
        detail
    )
    .trim_end()
    .to_string()
}

/// Plain-text report: one line per item, then a summary line. Skipped items
/// are followed by their validation issues; with `all_issues` every item is.
pub fn format_result(result: &BatchOperationResult, all_issues: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<6} {:<38} {:<11} DETAIL", "ROW", "SOURCE", "STATUS");
    for item in &result.items {
        let _ = writeln!(out, "{}", item_row(item));
        if !all_issues && item.status != ItemStatus::Skipped {
            continue;
        }
        let issues = item
            .validation_result
            .as_ref()
            .map(|validation| validation.issues())
            .unwrap_or_default();
        for issue in issues {
            let _ = writeln!(
                out,
                "       {:<8} {}: {}",
                severity_label(issue.severity),
                issue.code,
                issue.message
            );
            if !issue.remediation_hint.is_empty() {
                let _ = writeln!(out, "                -> {}", issue.remediation_hint);
            }
        }
    }
    let _ = writeln!(
        out,
        "{}: {} total, {} succeeded, {} failed, {} skipped, {} cancelled",
        result.batch_id,
        result.total,
        result.succeeded,
        result.failed,
        result.skipped,
        result.cancelled
    );
    out
}
