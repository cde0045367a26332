// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::codes::VALIDATION_CHECK_UNAVAILABLE;
use crate::app::services::identifiers::is_valid_email;
use crate::app::services::validation::lookup::LookupError;
use crate::app::services::validation::{CheckContext, ValidationCheck};
use crate::app::types::{OperationKind, ValidationIssue};

pub const ENTITY_NOT_FOUND: &str = "entity-not-found";
pub const NOT_INACTIVE: &str = "not-inactive";
pub const IRREVERSIBLE_STRUCTURAL_SPLIT: &str = "irreversible-structural-split";
pub const INVALID_TARGET_IDENTIFIER: &str = "invalid-target-identifier";
pub const AUTO_EXPANDING_ARCHIVE: &str = "auto-expanding-archive";
pub const LITIGATION_HOLD: &str = "litigation-hold";
pub const EDISCOVERY_HOLD: &str = "ediscovery-hold";
pub const RETENTION_POLICY_HOLD: &str = "retention-policy-hold";
pub const DELAY_HOLD: &str = "delay-hold";
pub const LARGE_MAILBOX: &str = "large-mailbox";
pub const STALE_MAILBOX: &str = "stale-mailbox";
pub const CONFLICTING_IDENTIFIER: &str = "conflicting-identifier";
pub const CONFLICTING_ADDRESS: &str = "conflicting-address";
pub const TARGET_NOT_FOUND: &str = "target-not-found";
pub const TARGET_INACTIVE: &str = "target-inactive";
pub const DUPLICATE_RESTORE_REQUEST: &str = "duplicate-restore-request";

const LARGE_MAILBOX_MB: f64 = 10_240.0;
const STALE_MAILBOX_DAYS: u32 = 730;
const EDISCOVERY_HOLD_PREFIX: &str = "UniH";
// Hold id prefixes that are not retention policies.
const NON_RETENTION_PREFIXES: [&str; 4] = ["UniH", "mbx", "skp", "grp"];

pub(crate) fn unavailable(check: &str, err: &LookupError) -> ValidationIssue {
    ValidationIssue::blocker(
        VALIDATION_CHECK_UNAVAILABLE,
        format!("{check} could not run: {err}"),
        "Check connectivity to the directory and validate again",
    )
}

pub struct NotInactive;

#[async_trait]
impl ValidationCheck for NotInactive {
    fn name(&self) -> &'static str {
        "not-inactive"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        if ctx.snapshot.is_inactive_mailbox {
            return Vec::new();
        }
        vec![ValidationIssue::blocker(
            NOT_INACTIVE,
            format!("{} is not an inactive mailbox", ctx.snapshot.identity),
            "Pick an inactive mailbox; active mailboxes are managed directly",
        )]
    }
}

pub struct StructuralSplit;

#[async_trait]
impl ValidationCheck for StructuralSplit {
    fn name(&self) -> &'static str {
        "structural-split"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let location = ctx.snapshot.mailbox_location_type.as_deref().unwrap_or("");
        if !ctx.snapshot.is_aux_primary && !location.eq_ignore_ascii_case("auxprimary") {
            return Vec::new();
        }
        vec![ValidationIssue::blocker(
            IRREVERSIBLE_STRUCTURAL_SPLIT,
            "Mailbox is an auxiliary primary shard and cannot be recovered directly",
            "Recover the primary mailbox first, or restore this content into another mailbox",
        )]
    }
}

pub struct TargetIdentifiers;

#[async_trait]
impl ValidationCheck for TargetIdentifiers {
    fn name(&self) -> &'static str {
        "target-identifiers"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        match &ctx.request.operation {
            OperationKind::Recovery(params) => {
                if !is_valid_email(&params.target_upn) {
                    issues.push(ValidationIssue::blocker(
                        INVALID_TARGET_IDENTIFIER,
                        format!("Target UPN '{}' is not a valid address", params.target_upn),
                        "Use the form user@domain with a verified domain",
                    ));
                }
                if let Some(smtp) = &params.target_smtp {
                    if !is_valid_email(smtp) {
                        issues.push(ValidationIssue::blocker(
                            INVALID_TARGET_IDENTIFIER,
                            format!("Target SMTP address '{smtp}' is not a valid address"),
                            "Use the form user@domain or leave it empty to reuse the UPN",
                        ));
                    }
                }
                if params.display_name.trim().is_empty() {
                    issues.push(ValidationIssue::blocker(
                        INVALID_TARGET_IDENTIFIER,
                        "Display name is empty",
                        "Provide a display name for the recovered mailbox",
                    ));
                }
            }
            OperationKind::Restore(params) => {
                let target = params.target_mailbox.trim();
                let well_formed = if target.contains('@') {
                    is_valid_email(target)
                } else {
                    !target.is_empty()
                };
                if !well_formed {
                    issues.push(ValidationIssue::blocker(
                        INVALID_TARGET_IDENTIFIER,
                        format!("Target mailbox '{target}' is not a valid identity"),
                        "Use the target's address, alias or GUID",
                    ));
                }
                if target.eq_ignore_ascii_case(&ctx.request.identity)
                    || target.eq_ignore_ascii_case(&ctx.snapshot.identity)
                {
                    issues.push(ValidationIssue::blocker(
                        INVALID_TARGET_IDENTIFIER,
                        "Target mailbox is the source mailbox",
                        "Restore into a different, active mailbox",
                    ));
                }
            }
            OperationKind::Inspect => {}
        }
        issues
    }
}

pub struct AutoExpandingArchive;

#[async_trait]
impl ValidationCheck for AutoExpandingArchive {
    fn name(&self) -> &'static str {
        "auto-expanding-archive"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        if !ctx.snapshot.auto_expanding_archive_enabled {
            return Vec::new();
        }
        vec![ValidationIssue::warning(
            AUTO_EXPANDING_ARCHIVE,
            "Mailbox has an auto-expanding archive; auxiliary archive content may not come along",
            "Verify archive content after the operation, or export it separately beforehand",
        )]
    }
}

/// Holds are reported, never interpreted.
pub struct Holds;

#[async_trait]
impl ValidationCheck for Holds {
    fn name(&self) -> &'static str {
        "holds"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let snapshot = ctx.snapshot;
        let mut issues = Vec::new();
        if snapshot.litigation_hold_enabled {
            issues.push(ValidationIssue::warning(
                LITIGATION_HOLD,
                "Mailbox has Litigation Hold enabled",
                "The hold carries over; consult legal or compliance before removing it",
            ));
        }
        let ediscovery = snapshot
            .in_place_holds
            .iter()
            .filter(|hold| hold.starts_with(EDISCOVERY_HOLD_PREFIX))
            .count();
        if ediscovery > 0 {
            issues.push(ValidationIssue::warning(
                EDISCOVERY_HOLD,
                format!("Mailbox has {ediscovery} eDiscovery hold(s)"),
                "eDiscovery holds carry over and are managed in the compliance center",
            ));
        }
        let retention = snapshot
            .in_place_holds
            .iter()
            .filter(|hold| {
                !NON_RETENTION_PREFIXES
                    .iter()
                    .any(|prefix| hold.starts_with(prefix))
            })
            .count();
        if retention > 0 {
            issues.push(ValidationIssue::warning(
                RETENTION_POLICY_HOLD,
                format!("Mailbox has {retention} retention policy hold(s)"),
                "Retention policies keep applying; review them in the compliance center",
            ));
        }
        if snapshot.delay_hold_applied || snapshot.delay_release_hold_applied {
            issues.push(ValidationIssue::warning(
                DELAY_HOLD,
                "Mailbox has a delay hold applied",
                "The delay hold expires on its own; the operation can proceed meanwhile",
            ));
        }
        issues
    }
}

pub struct LargeMailbox;

#[async_trait]
impl ValidationCheck for LargeMailbox {
    fn name(&self) -> &'static str {
        "large-mailbox"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let size_mb = ctx.snapshot.size_mb;
        if size_mb <= LARGE_MAILBOX_MB {
            return Vec::new();
        }
        vec![ValidationIssue::info(
            LARGE_MAILBOX,
            format!("Mailbox is large ({:.1} GB)", size_mb / 1024.0),
            "Expect the operation to take longer than usual",
        )]
    }
}

pub struct StaleMailbox;

#[async_trait]
impl ValidationCheck for StaleMailbox {
    fn name(&self) -> &'static str {
        "stale-mailbox"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let days = ctx.snapshot.inactive_days;
        if days <= STALE_MAILBOX_DAYS {
            return Vec::new();
        }
        vec![ValidationIssue::info(
            STALE_MAILBOX,
            format!("Mailbox has been inactive for {days} days"),
            "Confirm the content is still needed",
        )]
    }
}

/// Target UPN (and SMTP address, when given) must not belong to anyone yet.
pub struct TargetConflicts;

impl TargetConflicts {
    async fn check(
        ctx: &CheckContext<'_>,
        address: &str,
        code: &'static str,
        what: &str,
    ) -> Option<ValidationIssue> {
        if !is_valid_email(address) {
            return None;
        }
        match ctx.lookup.address_in_use(address).await {
            Ok(false) => None,
            Ok(true) => Some(ValidationIssue::blocker(
                code,
                format!("{what} '{address}' is already in use"),
                "Choose an unused address or remove the existing recipient first",
            )),
            Err(err) => Some(unavailable(what, &err)),
        }
    }
}

#[async_trait]
impl ValidationCheck for TargetConflicts {
    fn name(&self) -> &'static str {
        "target-conflicts"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let OperationKind::Recovery(params) = &ctx.request.operation else {
            return Vec::new();
        };
        let mut issues = Vec::new();
        issues.extend(
            Self::check(ctx, &params.target_upn, CONFLICTING_IDENTIFIER, "Target UPN").await,
        );
        if let Some(smtp) = params.target_smtp.as_deref() {
            if !smtp.eq_ignore_ascii_case(&params.target_upn) {
                issues.extend(
                    Self::check(ctx, smtp, CONFLICTING_ADDRESS, "Target SMTP address").await,
                );
            }
        }
        issues
    }
}

pub struct RestoreTarget;

#[async_trait]
impl ValidationCheck for RestoreTarget {
    fn name(&self) -> &'static str {
        "restore-target"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let OperationKind::Restore(params) = &ctx.request.operation else {
            return Vec::new();
        };
        let target = params.target_mailbox.trim();
        if target.is_empty() {
            return Vec::new();
        }
        match ctx.lookup.mailbox(target).await {
            Ok(None) => vec![ValidationIssue::blocker(
                TARGET_NOT_FOUND,
                format!("Target mailbox '{target}' was not found"),
                "Check the target identity; it must be an existing mailbox",
            )],
            Ok(Some(mailbox)) if mailbox.is_inactive_mailbox => {
                vec![ValidationIssue::blocker(
                    TARGET_INACTIVE,
                    format!("Target mailbox '{target}' is inactive"),
                    "Restore into an active mailbox",
                )]
            }
            Ok(Some(_)) => Vec::new(),
            Err(err) => vec![unavailable("Restore target lookup", &err)],
        }
    }
}

pub struct DuplicateRestore;

#[async_trait]
impl ValidationCheck for DuplicateRestore {
    fn name(&self) -> &'static str {
        "duplicate-restore"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue> {
        let OperationKind::Restore(params) = &ctx.request.operation else {
            return Vec::new();
        };
        match ctx
            .lookup
            .restore_request_pending(&ctx.request.identity, &params.target_mailbox)
            .await
        {
            Ok(false) => Vec::new(),
            Ok(true) => vec![ValidationIssue::blocker(
                DUPLICATE_RESTORE_REQUEST,
                "A restore request between these mailboxes is already queued or running",
                "Wait for it to finish or remove it before submitting another",
            )],
            Err(err) => vec![unavailable("Restore request lookup", &err)],
        }
    }
}
