// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::ports::{ClockPort, CredentialProvider, CredentialUnavailable};
use crate::app::types::Credential;
use crate::config::{CredentialsConfig, TokenSource};

/// Reads a pre-acquired access token from an environment variable or a file
/// on every request, so an external refresher can rotate it in place.
pub struct TokenCredentials {
    source: TokenSource,
    lifetime: Duration,
    clock: Arc<dyn ClockPort>,
}

impl TokenCredentials {
    pub fn new(config: &CredentialsConfig, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            source: config.source.clone(),
            lifetime: config.lifetime,
            clock,
        }
    }

    async fn read_token(&self) -> Result<String, CredentialUnavailable> {
        let raw = match &self.source {
            TokenSource::Env(var) => std::env::var(var).map_err(|err| {
                CredentialUnavailable::new(format!("environment variable {var}: {err}"))
            })?,
            TokenSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|err| {
                CredentialUnavailable::new(format!("token file {}: {err}", path.display()))
            })?,
        };
        let token = raw.trim();
        if token.is_empty() {
            return Err(CredentialUnavailable::new(match &self.source {
                TokenSource::Env(var) => format!("environment variable {var} is empty"),
                TokenSource::File(path) => format!("token file {} is empty", path.display()),
            }));
        }
        Ok(token.to_string())
    }
}

#[async_trait]
impl CredentialProvider for TokenCredentials {
    #[tracing::instrument(skip(self))]
    async fn get_credential(&self) -> Result<Credential, CredentialUnavailable> {
        let token = self.read_token().await?;
        let expires_at = self.clock.now_utc() + self.lifetime;
        tracing::debug!(expires_at = %expires_at, "access token loaded");
        Ok(Credential::new(token, Some(expires_at)))
    }
}
