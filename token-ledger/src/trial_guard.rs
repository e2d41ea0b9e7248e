//! Admission control consulted before a deduction
//!
//! The guard is fail-closed: when an organization or its balance cannot be
//! verified, the request is denied. Trial tenants are capped at their
//! balance; paying tenants may run into pay-as-you-go overage, which is
//! flagged but never blocked. The ledger engine itself enforces none of this.

use crate::{ledger::TokenLedgerEngine, types::AccountId, types::SourceType, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Denial reason when the organization cannot be verified
pub const REASON_CHECK_FAILED: &str = "Balance check failed";
/// Denial reason when a trial tenant is out of tokens
pub const REASON_TRIAL_LIMIT: &str = "Trial token limit reached";
/// Denial reason for suspended tenants
pub const REASON_SUSPENDED: &str = "Organization suspended";

/// Tenant billing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    /// Free trial, hard-capped
    Trial,
    /// Active subscription
    Active,
    /// Paid plan
    Paid,
    /// Suspended (no usage)
    Suspended,
}

/// Organization as seen by the guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    /// Organization ID
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Billing status
    pub status: TenantStatus,
}

/// Source of organization records (owned by the tenant management layer)
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    /// Look up an organization
    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>>;
}

/// In-memory directory
#[derive(Debug, Default)]
pub struct InMemoryOrganizations {
    orgs: DashMap<Uuid, Organization>,
}

impl InMemoryOrganizations {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an organization
    pub fn upsert(&self, org: Organization) {
        self.orgs.insert(org.id, org);
    }

    /// Remove an organization
    pub fn remove(&self, org_id: Uuid) -> Option<Organization> {
        self.orgs.remove(&org_id).map(|(_, org)| org)
    }
}

#[async_trait]
impl OrganizationDirectory for InMemoryOrganizations {
    async fn get_organization(&self, org_id: Uuid) -> Result<Option<Organization>> {
        Ok(self.orgs.get(&org_id).map(|entry| entry.value().clone()))
    }
}

/// Admission decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// Why the request was denied
    pub reason: Option<String>,
    /// Paid tenant admitted beyond its balance
    pub paygo_triggered: bool,
    /// Balance seen at decision time (absent when unverifiable)
    pub balance: Option<Decimal>,
    /// Requested tokens
    pub requested: Decimal,
}

impl AdmissionDecision {
    fn allow(balance: Decimal, requested: Decimal) -> Self {
        Self {
            allowed: true,
            reason: None,
            paygo_triggered: false,
            balance: Some(balance),
            requested,
        }
    }

    fn paygo(balance: Decimal, requested: Decimal) -> Self {
        Self {
            paygo_triggered: true,
            ..Self::allow(balance, requested)
        }
    }

    fn deny(reason: &str, balance: Option<Decimal>, requested: Decimal) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            paygo_triggered: false,
            balance,
            requested,
        }
    }
}

/// Trial/PAYGO admission guard
pub struct TrialGuard {
    directory: Arc<dyn OrganizationDirectory>,
    engine: Arc<TokenLedgerEngine>,
}

impl std::fmt::Debug for TrialGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialGuard").finish_non_exhaustive()
    }
}

impl TrialGuard {
    /// Create guard
    pub fn new(directory: Arc<dyn OrganizationDirectory>, engine: Arc<TokenLedgerEngine>) -> Self {
        Self { directory, engine }
    }

    /// Decide whether `org_id` may consume `requested` tokens
    pub async fn has_org_sufficient_balance(
        &self,
        org_id: Uuid,
        requested: Decimal,
    ) -> AdmissionDecision {
        let decision = self.decide(org_id, requested).await;

        let metrics = self.engine.metrics();
        if !decision.allowed {
            metrics.record_denied();
            tracing::warn!(
                org_id = %org_id,
                requested = %requested,
                reason = decision.reason.as_deref().unwrap_or_default(),
                "Admission denied"
            );
        } else if decision.paygo_triggered {
            metrics.record_paygo();
            tracing::info!(
                org_id = %org_id,
                requested = %requested,
                balance = ?decision.balance,
                "PAYGO overage triggered"
            );
        }

        decision
    }

    async fn decide(&self, org_id: Uuid, requested: Decimal) -> AdmissionDecision {
        let org = match self.directory.get_organization(org_id).await {
            Ok(Some(org)) => org,
            Ok(None) => return AdmissionDecision::deny(REASON_CHECK_FAILED, None, requested),
            Err(e) => {
                tracing::error!(org_id = %org_id, error = %e, "Organization lookup failed");
                return AdmissionDecision::deny(REASON_CHECK_FAILED, None, requested);
            }
        };

        let balance = match self.engine.get_balance(AccountId::organization(org_id)) {
            Ok(balance) => balance.available(SourceType::Platform),
            Err(e) => {
                tracing::error!(org_id = %org_id, error = %e, "Balance lookup failed");
                return AdmissionDecision::deny(REASON_CHECK_FAILED, None, requested);
            }
        };

        match org.status {
            TenantStatus::Suspended => {
                AdmissionDecision::deny(REASON_SUSPENDED, Some(balance), requested)
            }
            TenantStatus::Trial if balance < requested => {
                AdmissionDecision::deny(REASON_TRIAL_LIMIT, Some(balance), requested)
            }
            TenantStatus::Trial => AdmissionDecision::allow(balance, requested),
            TenantStatus::Active | TenantStatus::Paid if balance < requested => {
                AdmissionDecision::paygo(balance, requested)
            }
            TenantStatus::Active | TenantStatus::Paid => AdmissionDecision::allow(balance, requested),
        }
    }
}
