//! Funding-source resolution
//!
//! Decides which balance bucket pays for a request:
//! 1. providers configured as local resolve to `local`
//! 2. a preferred BYOK credential resolves to `byok` with the decrypted key
//! 3. everything else is platform-funded

use crate::{
    types::SourceType,
    vault::{normalize_provider, ByokVault, ProviderCredential},
    Result,
};
use std::collections::HashSet;
use uuid::Uuid;

/// Resolved funding source
#[derive(Debug, Clone, PartialEq)]
pub enum TokenSource {
    /// Platform capacity
    Platform,
    /// Caller's own provider key
    Byok {
        /// Decrypted credential
        config: ProviderCredential,
    },
    /// Locally hosted provider
    Local {
        /// Provider name
        provider: String,
    },
}

impl TokenSource {
    /// Bucket to deduct from
    pub fn source_type(&self) -> SourceType {
        match self {
            TokenSource::Platform => SourceType::Platform,
            TokenSource::Byok { .. } => SourceType::Byok,
            TokenSource::Local { .. } => SourceType::Local,
        }
    }
}

/// Source resolver backed by the BYOK vault
#[derive(Debug)]
pub struct SourceResolver {
    vault: ByokVault,
    local_providers: HashSet<String>,
}

impl SourceResolver {
    /// Create resolver
    pub fn new(vault: ByokVault, local_providers: &[String]) -> Self {
        Self {
            vault,
            local_providers: local_providers
                .iter()
                .map(|p| normalize_provider(p))
                .collect(),
        }
    }

    /// Credential vault
    pub fn vault(&self) -> &ByokVault {
        &self.vault
    }

    /// Decide which bucket funds a request from `user_id` to `provider`
    pub fn determine_token_source(&self, user_id: Uuid, provider: &str) -> Result<TokenSource> {
        let provider = normalize_provider(provider);

        if self.local_providers.contains(&provider) {
            return Ok(TokenSource::Local { provider });
        }

        if let Some(config) = self.vault.resolve(user_id, &provider)? {
            tracing::debug!(user_id = %user_id, provider = %provider, "Resolved BYOK source");
            return Ok(TokenSource::Byok { config });
        }

        Ok(TokenSource::Platform)
    }
}
