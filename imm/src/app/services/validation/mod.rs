// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod checks;
pub mod lookup;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::services::session::SessionManager;
use crate::app::types::{
    EntitySnapshot, OperationClass, OperationRequest, ValidationIssue, ValidationResult,
};

pub use lookup::{DirectoryLookup, LookupError};

/// Everything a check may look at. Checks never mutate anything.
pub struct CheckContext<'a> {
    pub snapshot: &'a EntitySnapshot,
    pub request: &'a OperationRequest,
    pub lookup: &'a DirectoryLookup,
}

#[async_trait]
pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &CheckContext<'_>) -> Vec<ValidationIssue>;
}

/// Ordered checks per operation class. Every registered check runs, even
/// after a blocker; issues keep registration order.
pub struct ValidationPipeline {
    lookup: DirectoryLookup,
    checks: HashMap<OperationClass, Vec<Box<dyn ValidationCheck>>>,
}

impl ValidationPipeline {
    pub fn new(lookup: DirectoryLookup) -> Self {
        Self {
            lookup,
            checks: HashMap::new(),
        }
    }

    pub fn standard(session: Arc<SessionManager>) -> Self {
        use checks::*;

        let mut pipeline = Self::new(DirectoryLookup::new(session));
        pipeline
            .register(OperationClass::Recovery, NotInactive)
            .register(OperationClass::Recovery, StructuralSplit)
            .register(OperationClass::Recovery, TargetIdentifiers)
            .register(OperationClass::Recovery, AutoExpandingArchive)
            .register(OperationClass::Recovery, Holds)
            .register(OperationClass::Recovery, LargeMailbox)
            .register(OperationClass::Recovery, StaleMailbox)
            .register(OperationClass::Recovery, TargetConflicts);
        pipeline
            .register(OperationClass::Restore, NotInactive)
            .register(OperationClass::Restore, TargetIdentifiers)
            .register(OperationClass::Restore, RestoreTarget)
            .register(OperationClass::Restore, DuplicateRestore)
            .register(OperationClass::Restore, Holds)
            .register(OperationClass::Restore, LargeMailbox);
        pipeline
    }

    pub fn register(
        &mut self,
        class: OperationClass,
        check: impl ValidationCheck + 'static,
    ) -> &mut Self {
        self.checks.entry(class).or_default().push(Box::new(check));
        self
    }

    pub fn check_names(&self, class: OperationClass) -> Vec<&'static str> {
        self.checks
            .get(&class)
            .map(|checks| checks.iter().map(|check| check.name()).collect())
            .unwrap_or_default()
    }

    pub async fn validate(
        &self,
        snapshot: &EntitySnapshot,
        request: &OperationRequest,
    ) -> ValidationResult {
        let class = request.operation.class();
        let ctx = CheckContext {
            snapshot,
            request,
            lookup: &self.lookup,
        };
        let mut issues = Vec::new();
        for check in self.checks.get(&class).into_iter().flatten() {
            let found = check.run(&ctx).await;
            tracing::debug!(
                identity = %request.identity,
                check = check.name(),
                issues = found.len(),
                "validation check finished"
            );
            issues.extend(found);
        }
        let result = ValidationResult::new(issues);
        tracing::info!(
            identity = %request.identity,
            operation = class.as_str(),
            issues = result.issues().len(),
            executable = result.is_executable(),
            "validation finished"
        );
        result
    }

    /// Validates a request, fetching the source snapshot when the caller has
    /// none. Returns the snapshot used, if any.
    pub async fn validate_request(
        &self,
        request: &OperationRequest,
        snapshot: Option<&EntitySnapshot>,
    ) -> (ValidationResult, Option<EntitySnapshot>) {
        if let Some(snapshot) = snapshot {
            return (self.validate(snapshot, request).await, Some(snapshot.clone()));
        }
        match self.lookup.source_snapshot(&request.identity).await {
            Ok(Some(snapshot)) => {
                let result = self.validate(&snapshot, request).await;
                (result, Some(snapshot))
            }
            Ok(None) => {
                let issue = ValidationIssue::blocker(
                    checks::ENTITY_NOT_FOUND,
                    format!("No inactive mailbox matches '{}'", request.identity),
                    "Check the identity; the mailbox may have been purged",
                );
                (ValidationResult::new(vec![issue]), None)
            }
            Err(err) => {
                tracing::warn!(identity = %request.identity, error = %err, "preflight lookup failed");
                let issue = checks::unavailable("Preflight lookup", &err);
                (ValidationResult::new(vec![issue]), None)
            }
        }
    }
}
