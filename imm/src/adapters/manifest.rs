// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! CSV manifests for bulk operations.
//!
//! Every problem in a manifest is collected before anything is returned, so a
//! bad file is fixed in one round trip. Row numbers count the header as row 1.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::app::errors::{AppError, AppErrorKind, codes};
use crate::app::services::identifiers::{is_guid, is_valid_email};
use crate::app::types::{
    OperationClass, OperationKind, OperationRequest, RecoveryParams, RestoreParams,
};

const SOURCE_GUID: &str = "source_guid";
const SOURCE_IDENTITY: &str = "source_identity";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestProblem {
    /// `None` for problems with the header itself.
    pub row: Option<usize>,
    pub message: String,
}

impl fmt::Display for ManifestProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "row {row}: {}", self.message),
            None => write!(f, "header: {}", self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Read(#[from] csv::Error),
    #[error("manifest has {} problem(s)", .0.len())]
    Invalid(Vec<ManifestProblem>),
}

impl ManifestError {
    pub fn problems(&self) -> &[ManifestProblem] {
        match self {
            ManifestError::Invalid(problems) => problems,
            ManifestError::Read(_) => &[],
        }
    }
}

impl From<ManifestError> for AppError {
    fn from(err: ManifestError) -> Self {
        let context = err
            .problems()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            err.to_string(),
        )
        .with_context(context)
    }
}

struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(headers: &csv::StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_ascii_lowercase(), idx))
            .collect();
        Self { index }
    }

    fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn get<'r>(&self, record: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        self.index
            .get(name)
            .and_then(|idx| record.get(*idx))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn required_columns(class: OperationClass) -> &'static [&'static str] {
    match class {
        OperationClass::Inspect => &[],
        OperationClass::Recovery => &["target_upn", "display_name"],
        OperationClass::Restore => &["target_mailbox"],
    }
}

fn optional_columns(class: OperationClass) -> &'static [&'static str] {
    match class {
        OperationClass::Inspect => &[],
        OperationClass::Recovery => &["target_smtp", "first_name", "last_name"],
        OperationClass::Restore => &["target_folder", "conflict_resolution"],
    }
}

pub fn read_manifest(
    path: &Path,
    class: OperationClass,
) -> Result<Vec<OperationRequest>, ManifestError> {
    let file = std::fs::File::open(path).map_err(csv::Error::from)?;
    let requests = parse_manifest(file, class)?;
    tracing::info!(
        manifest = %path.display(),
        operation = class.as_str(),
        rows = requests.len(),
        "manifest loaded"
    );
    Ok(requests)
}

pub fn parse_manifest<R: io::Read>(
    reader: R,
    class: OperationClass,
) -> Result<Vec<OperationRequest>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let columns = Columns::new(reader.headers()?);

    let mut problems = Vec::new();
    let source_column = if columns.has(SOURCE_GUID) {
        Some(SOURCE_GUID)
    } else if columns.has(SOURCE_IDENTITY) {
        Some(SOURCE_IDENTITY)
    } else {
        problems.push(ManifestProblem {
            row: None,
            message: format!("missing column '{SOURCE_GUID}' or '{SOURCE_IDENTITY}'"),
        });
        None
    };
    for column in required_columns(class) {
        if !columns.has(column) {
            problems.push(ManifestProblem {
                row: None,
                message: format!("missing column '{column}'"),
            });
        }
    }
    if !problems.is_empty() {
        return Err(ManifestError::Invalid(problems));
    }

    let mut requests = Vec::new();
    let mut seen = HashSet::new();
    for (idx, record) in reader.records().enumerate() {
        // Blank lines are skipped by the reader, so prefer the physical line.
        let row = match &record {
            Ok(record) => record.position().map_or(idx + 2, |pos| pos.line() as usize),
            Err(_) => idx + 2,
        };
        let mut report = |message: String| {
            problems.push(ManifestProblem {
                row: Some(row),
                message,
            })
        };
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                report(format!("unreadable record: {err}"));
                continue;
            }
        };
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }

        let source = source_column.and_then(|column| columns.get(&record, column));
        let Some(source) = source else {
            report("source is empty".to_string());
            continue;
        };
        if source_column == Some(SOURCE_GUID) && !is_guid(source) {
            report(format!("'{source}' is not a valid GUID"));
        }
        if !seen.insert(source.to_ascii_lowercase()) {
            report(format!("duplicate source '{source}'"));
        }

        for column in required_columns(class) {
            if columns.get(&record, column).is_none() {
                report(format!("'{column}' is empty"));
            }
        }
        for column in ["target_upn", "target_smtp", "target_mailbox"] {
            let invalid = columns
                .get(&record, column)
                .filter(|value| !is_valid_email(value));
            if let Some(value) = invalid {
                report(format!("{column} '{value}' is not a valid email address"));
            }
        }

        let operation = match class {
            OperationClass::Inspect => OperationKind::Inspect,
            OperationClass::Recovery => OperationKind::Recovery(RecoveryParams {
                target_upn: columns.get(&record, "target_upn").unwrap_or_default().to_string(),
                target_smtp: columns.get(&record, "target_smtp").map(str::to_string),
                display_name: columns
                    .get(&record, "display_name")
                    .unwrap_or_default()
                    .to_string(),
                first_name: columns.get(&record, "first_name").map(str::to_string),
                last_name: columns.get(&record, "last_name").map(str::to_string),
            }),
            OperationClass::Restore => {
                let conflict_resolution = columns
                    .get(&record, "conflict_resolution")
                    .unwrap_or_default()
                    .parse()
                    .unwrap_or_else(|message: String| {
                        report(message);
                        Default::default()
                    });
                OperationKind::Restore(RestoreParams {
                    target_mailbox: columns
                        .get(&record, "target_mailbox")
                        .unwrap_or_default()
                        .to_string(),
                    target_folder: columns.get(&record, "target_folder").map(str::to_string),
                    conflict_resolution,
                })
            }
        };

        requests.push(OperationRequest {
            identity: source.to_string(),
            operation,
            row: Some(row),
        });
    }

    if problems.is_empty() {
        Ok(requests)
    } else {
        Err(ManifestError::Invalid(problems))
    }
}

/// Header plus one example row for the given operation.
pub fn template(class: OperationClass) -> String {
    let mut header = vec![SOURCE_GUID];
    header.extend(required_columns(class));
    header.extend(optional_columns(class));
    let example: Vec<&str> = header
        .iter()
        .map(|column| match *column {
            SOURCE_GUID => "00000000-0000-0000-0000-000000000000",
            "target_upn" | "target_smtp" => "jane.roe@contoso.com",
            "display_name" => "Jane Roe",
            "first_name" => "Jane",
            "last_name" => "Roe",
            "target_mailbox" => "archive@contoso.com",
            "target_folder" => "Recovered",
            "conflict_resolution" => "KeepAll",
            _ => "",
        })
        .collect();
    format!("{}\n{}\n", header.join(","), example.join(","))
}
