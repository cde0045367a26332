// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Credentials are treated as expired slightly before their stated expiry so
/// a command never starts with a token that lapses mid-flight.
const CREDENTIAL_EXPIRY_SKEW: time::Duration = time::Duration::seconds(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Error => "error",
        }
    }
}

/// Point-in-time view of the session owned by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSession {
    pub state: SessionState,
    pub last_error: Option<String>,
    pub attempt: u32,
    pub connected_at: Option<String>, // RFC3339
}

/// Opaque, renewable access credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
    expires_at: Option<OffsetDateTime>,
}

impl Credential {
    pub fn new(secret: impl Into<String>, expires_at: Option<OffsetDateTime>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => now + CREDENTIAL_EXPIRY_SKEW >= expires_at,
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Idempotent; safe to resend.
    Read,
    /// Not idempotent; never resent once it may have reached the remote side.
    Mutating,
}

/// Structured description of one remote command. Rendering it into shell
/// syntax is the transport's business.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub parameters: BTreeMap<String, Value>,
    pub kind: CommandKind,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn read(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            kind: CommandKind::Read,
            timeout: None,
        }
    }

    pub fn mutating(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            kind: CommandKind::Mutating,
            timeout: None,
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn param_opt(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_mutating(&self) -> bool {
        self.kind == CommandKind::Mutating
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Three-way outcome of a command the remote service accepted for processing.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    ImmediateSuccess(Value),
    ImmediateFailure { code: String, message: String },
    Deferred(JobHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    /// Accepts the remote shell's spellings (`InProgress`,
    /// `CompletedWithWarning`, `Suspended`, ...) as well as our own.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "queued" | "none" | "pending" => Ok(JobStatus::Queued),
            "running" | "inprogress" | "started" => Ok(JobStatus::Running),
            "completed" | "completedwithwarning" | "succeeded" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" | "suspended" => Ok(JobStatus::Cancelled),
            _ => Err(format!("unknown job status '{}'", s.trim())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub progress_percent: Option<f32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    Unsupported,
}

/// Remote job being observed by the job monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsyncJob {
    pub handle: JobHandle,
    pub status: JobStatus,
    pub progress_percent: Option<f32>,
    pub message: Option<String>,
    pub error_code: Option<&'static str>,
    pub polls: u32,
    pub observed_for: Duration,
}

impl AsyncJob {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            status: JobStatus::Queued,
            progress_percent: None,
            message: None,
            error_code: None,
            polls: 0,
            observed_for: Duration::ZERO,
        }
    }
}

/// Typed view of a mailbox as returned by the preflight query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EntitySnapshot {
    #[serde(deserialize_with = "null_as_default")]
    pub identity: String,
    pub display_name: Option<String>,
    pub primary_smtp_address: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_inactive_mailbox: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_aux_primary: bool,
    pub mailbox_location_type: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub auto_expanding_archive_enabled: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub litigation_hold_enabled: bool,
    #[serde(deserialize_with = "one_or_many")]
    pub in_place_holds: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub delay_hold_applied: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub delay_release_hold_applied: bool,
    #[serde(rename = "SizeMB", alias = "size_mb", deserialize_with = "null_as_default")]
    pub size_mb: f64,
    #[serde(alias = "age_days", deserialize_with = "null_as_default")]
    pub inactive_days: u32,
}

impl EntitySnapshot {
    /// Maps a raw preflight payload. `null` and `[]` mean "no such entity";
    /// arrays are reduced to their first element.
    pub fn from_payload(payload: &Value) -> Result<Option<Self>, serde_json::Error> {
        let object = match payload {
            Value::Null => return Ok(None),
            Value::Array(items) => match items.first() {
                Some(first) => first,
                None => return Ok(None),
            },
            other => other,
        };
        serde_json::from_value(object.clone()).map(Some)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) if value.trim().is_empty() => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConflictResolution {
    #[default]
    KeepAll,
    KeepLatestItem,
    KeepSourceItem,
    UpdateFromSource,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::KeepAll => "KeepAll",
            ConflictResolution::KeepLatestItem => "KeepLatestItem",
            ConflictResolution::KeepSourceItem => "KeepSourceItem",
            ConflictResolution::UpdateFromSource => "UpdateFromSource",
        }
    }
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "keepall" => Ok(ConflictResolution::KeepAll),
            "keeplatestitem" => Ok(ConflictResolution::KeepLatestItem),
            "keepsourceitem" => Ok(ConflictResolution::KeepSourceItem),
            "updatefromsource" => Ok(ConflictResolution::UpdateFromSource),
            other => Err(format!("unknown conflict resolution '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryParams {
    pub target_upn: String,
    pub target_smtp: Option<String>,
    pub display_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl RecoveryParams {
    /// SMTP address the recovered mailbox will claim; defaults to the UPN.
    pub fn effective_smtp(&self) -> &str {
        self.target_smtp.as_deref().unwrap_or(&self.target_upn)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreParams {
    pub target_mailbox: String,
    pub target_folder: Option<String>,
    pub conflict_resolution: ConflictResolution,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// Read-only inventory query.
    Inspect,
    /// Recover an inactive mailbox into a new account.
    Recovery(RecoveryParams),
    /// Merge an inactive mailbox's content into an active one.
    Restore(RestoreParams),
}

impl OperationKind {
    pub fn class(&self) -> OperationClass {
        match self {
            OperationKind::Inspect => OperationClass::Inspect,
            OperationKind::Recovery(_) => OperationClass::Recovery,
            OperationKind::Restore(_) => OperationClass::Restore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Inspect,
    Recovery,
    Restore,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::Inspect => "inspect",
            OperationClass::Recovery => "recovery",
            OperationClass::Restore => "restore",
        }
    }
}

impl FromStr for OperationClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inspect" => Ok(OperationClass::Inspect),
            "recovery" | "recover" => Ok(OperationClass::Recovery),
            "restore" => Ok(OperationClass::Restore),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

/// One requested operation against one source mailbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRequest {
    pub identity: String,
    pub operation: OperationKind,
    /// Manifest row the request came from, when imported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
}

impl OperationRequest {
    pub fn new(identity: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            identity: identity.into(),
            operation,
            row: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocker,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub code: &'static str,
    pub severity: Severity,
    pub message: String,
    pub remediation_hint: String,
}

impl ValidationIssue {
    pub fn blocker(code: &'static str, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::new(code, Severity::Blocker, message, hint)
    }

    pub fn warning(code: &'static str, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::new(code, Severity::Warning, message, hint)
    }

    pub fn info(code: &'static str, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::new(code, Severity::Info, message, hint)
    }

    fn new(
        code: &'static str,
        severity: Severity,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            remediation_hint: hint.into(),
        }
    }

    pub fn is_blocker(&self) -> bool {
        self.severity == Severity::Blocker
    }
}

/// Gate decision for one operation. Built once, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    issues: Vec<ValidationIssue>,
    is_executable: bool,
}

impl ValidationResult {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        let is_executable = !issues.iter().any(ValidationIssue::is_blocker);
        Self {
            issues,
            is_executable,
        }
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    pub fn blockers(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| issue.is_blocker())
    }

    /// One line naming every blocker, for an item's terminal reason.
    pub fn blocker_summary(&self) -> String {
        self.blockers()
            .map(|issue| format!("{}: {}", issue.code, issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped | ItemStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub code: &'static str,
    pub message: String,
}

impl ItemError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOperationItem {
    pub index: usize,
    pub identifier: String,
    pub request: OperationRequest,
    /// Snapshot supplied by the caller (e.g. from a local cache); fetched
    /// through the session when absent.
    #[serde(skip)]
    pub snapshot: Option<EntitySnapshot>,
    pub status: ItemStatus,
    pub validation_result: Option<ValidationResult>,
    pub attempt_count: u32,
    pub last_error: Option<ItemError>,
    pub remote_job_handle: Option<JobHandle>,
    pub job_status: Option<JobStatus>,
    pub job_progress_percent: Option<f32>,
    pub payload: Option<Value>,
    pub started_at: Option<String>,  // RFC3339
    pub finished_at: Option<String>, // RFC3339
}

impl BatchOperationItem {
    pub fn new(request: OperationRequest) -> Self {
        Self {
            index: 0,
            identifier: request.identity.clone(),
            request,
            snapshot: None,
            status: ItemStatus::Pending,
            validation_result: None,
            attempt_count: 0,
            last_error: None,
            remote_job_handle: None,
            job_status: None,
            job_progress_percent: None,
            payload: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: EntitySnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOperationResult {
    pub batch_id: BatchId,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub items: Vec<BatchOperationItem>,
}

impl BatchOperationResult {
    pub fn from_items(batch_id: BatchId, items: Vec<BatchOperationItem>) -> Self {
        let count = |status: ItemStatus| items.iter().filter(|item| item.status == status).count();
        Self {
            batch_id,
            total: items.len(),
            succeeded: count(ItemStatus::Completed),
            failed: count(ItemStatus::Failed),
            skipped: count(ItemStatus::Skipped),
            cancelled: count(ItemStatus::Cancelled),
            items,
        }
    }
}
