// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use crate::app::services::random::generate_initial_password;
use crate::app::types::{CommandSpec, OperationKind, OperationRequest};

const RECOVERY_TIMEOUT: Duration = Duration::from_secs(300);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_PASSWORD_LEN: usize = 16;

/// Source mailbox state used by every validation run.
pub fn preflight(identity: &str) -> CommandSpec {
    CommandSpec::read("Get-EXOMailbox")
        .param("Identity", identity)
        .param("InactiveMailboxOnly", true)
        .param("PropertySets", "All")
        .with_timeout(Some(LOOKUP_TIMEOUT))
}

/// Any mailbox (active or inactive) by identity.
pub fn mailbox_lookup(identity: &str) -> CommandSpec {
    CommandSpec::read("Get-EXOMailbox")
        .param("Identity", identity)
        .param("IncludeInactiveMailbox", true)
        .with_timeout(Some(LOOKUP_TIMEOUT))
}

/// Recipient that already owns `address` as a UPN or proxy address.
pub fn recipient_lookup(address: &str) -> CommandSpec {
    CommandSpec::read("Get-EXORecipient")
        .param("Filter", format!("EmailAddresses -eq 'smtp:{address}'"))
        .with_timeout(Some(LOOKUP_TIMEOUT))
}

pub fn restore_requests(source: &str, target: &str) -> CommandSpec {
    CommandSpec::read("Get-MailboxRestoreRequest")
        .param("SourceMailbox", source)
        .param("TargetMailbox", target)
        .with_timeout(Some(LOOKUP_TIMEOUT))
}

/// Command that carries out the requested operation.
pub fn for_operation(request: &OperationRequest) -> CommandSpec {
    match &request.operation {
        OperationKind::Inspect => CommandSpec::read("Get-EXOMailboxStatistics")
            .param("Identity", request.identity.as_str())
            .param("IncludeSoftDeletedRecipients", true),
        OperationKind::Recovery(params) => CommandSpec::mutating("New-Mailbox")
            .param("InactiveMailbox", request.identity.as_str())
            .param("Name", params.display_name.as_str())
            .param("DisplayName", params.display_name.as_str())
            .param("MicrosoftOnlineServicesID", params.target_upn.as_str())
            .param_opt("PrimarySmtpAddress", params.target_smtp.as_deref())
            .param_opt("FirstName", params.first_name.as_deref())
            .param_opt("LastName", params.last_name.as_deref())
            .param("Password", generate_initial_password(INITIAL_PASSWORD_LEN))
            .param("ResetPasswordOnNextLogon", true)
            .with_timeout(Some(RECOVERY_TIMEOUT)),
        OperationKind::Restore(params) => CommandSpec::mutating("New-MailboxRestoreRequest")
            .param("SourceMailbox", request.identity.as_str())
            .param("TargetMailbox", params.target_mailbox.as_str())
            .param_opt("TargetRootFolder", params.target_folder.as_deref())
            .param("AllowLegacyDNMismatch", true)
            .param("ConflictResolutionOption", params.conflict_resolution.as_str()),
    }
}
