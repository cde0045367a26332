// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use thiserror::Error;

use crate::app::types::Credential;

#[derive(Debug, Clone, Error)]
#[error("credential unavailable: {reason}")]
pub struct CredentialUnavailable {
    pub reason: String,
}

impl CredentialUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
/// Source of renewable access credentials. Acquisition (interactive sign-in,
/// certificate flows, ...) happens behind this boundary.
pub trait CredentialProvider: Send + Sync {
    async fn get_credential(&self) -> Result<Credential, CredentialUnavailable>;
}
