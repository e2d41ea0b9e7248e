//! Token ledger engine
//!
//! Ties storage, the writer actor, margins and source resolution together
//! into the public ledger API.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_decimal::Decimal;
//! use token_ledger::{AccountId, AesGcmCipher, Config, CreditOptions, DeductOptions};
//! use token_ledger::{SourceType, TokenLedgerEngine};
//!
//! #[tokio::main]
//! async fn main() -> token_ledger::Result<()> {
//!     let engine = TokenLedgerEngine::open(Config::default(), Arc::new(AesGcmCipher::generate())).await?;
//!     let account = AccountId::user(uuid::Uuid::new_v4());
//!
//!     engine
//!         .credit_tokens(account, Decimal::from(5_000), Decimal::ZERO, CreditOptions::default())
//!         .await?;
//!     engine
//!         .deduct_tokens(account, Decimal::from(1_000), SourceType::Platform, DeductOptions::default())
//!         .await?;
//!
//!     engine.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle, Mutation},
    config::MarginConfig,
    margin::{Margin, MarginCalculator, MarginUpdate},
    metrics::Metrics,
    source::{SourceResolver, TokenSource},
    types::{
        checked_sum, AccountId, Balance, BalanceReconciliation, CreditOptions, DeductOptions, LedgerEntry,
        LedgerSummary, SourceDiscrepancy, SourceType, TransactionRecord, TransactionResult,
    },
    vault::{ApiKeyRequest, ByokKeySummary, ByokVault, Cipher},
    Config, Error, Result, Storage,
};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Main token ledger interface
pub struct TokenLedgerEngine {
    /// Writer actor handle
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Funding-source resolution and BYOK vault
    resolver: SourceResolver,

    /// Serializes margin read-modify-write
    margin_lock: Mutex<()>,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for TokenLedgerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLedgerEngine")
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

impl TokenLedgerEngine {
    /// Open the engine, seeding default margins on first use
    pub async fn open(config: Config, cipher: Arc<dyn Cipher>) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);

        let defaults: Vec<Margin> = config.margins.iter().map(MarginConfig::to_margin).collect();
        let seeded = storage.seed_margins(&defaults)?;
        if seeded > 0 {
            tracing::info!(seeded, "Seeded default margins");
        }

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let vault = ByokVault::new(storage.clone(), cipher);
        let resolver = SourceResolver::new(vault, &config.byok.local_providers);

        let handle = spawn_ledger_actor(storage.clone(), config.writer.mailbox_capacity);

        tracing::info!(
            data_dir = %config.data_dir.display(),
            service = %config.service_name,
            "Token ledger opened"
        );

        Ok(Self {
            handle,
            storage,
            resolver,
            margin_lock: Mutex::new(()),
            metrics,
            config,
        })
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration the engine was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Balances
    // ---------------------------------------------------------------------

    /// Create a zero balance row if absent
    pub async fn ensure_balance(&self, account: AccountId) -> Result<Balance> {
        require_account(&account)?;
        self.handle.ensure_balance(account).await
    }

    /// Current balance; unknown accounts read as all-zero
    pub fn get_balance(&self, account: AccountId) -> Result<Balance> {
        Ok(self
            .storage
            .get_balance(&account)?
            .unwrap_or_else(|| Balance::zero(account)))
    }

    /// `balance[source] + balance[source_bonus] >= amount`
    pub fn has_sufficient_balance(
        &self,
        account: AccountId,
        amount: Decimal,
        source: SourceType,
    ) -> Result<bool> {
        Ok(self.get_balance(account)?.available(source) >= amount)
    }

    /// Add tokens to an account
    ///
    /// `amount` lands in the option's source (platform by default) and
    /// `bonus` in `platform_bonus`.
    pub async fn credit_tokens(
        &self,
        account: AccountId,
        amount: Decimal,
        bonus: Decimal,
        options: CreditOptions,
    ) -> Result<TransactionResult> {
        require_account(&account)?;
        require_key(options.idempotency_key.as_deref())?;
        if amount < Decimal::ZERO || bonus < Decimal::ZERO {
            return Err(Error::InvalidAmount(
                "Credit amounts must not be negative".to_string(),
            ));
        }
        if amount.is_zero() && bonus.is_zero() {
            return Err(Error::InvalidAmount(
                "Credit must add a positive amount".to_string(),
            ));
        }

        let source = options.source.unwrap_or(SourceType::Platform);
        let result = self
            .handle
            .apply(Mutation::Credit {
                account,
                amount,
                bonus,
                source,
                reason: options.reason.unwrap_or_else(|| "credit".to_string()),
                idempotency_key: options.idempotency_key,
                metadata: options.metadata,
            })
            .await?;

        if result.idempotent_replay {
            self.metrics.record_replay();
        } else {
            self.metrics.record_credit();
            tracing::info!(
                account = %account,
                transaction_id = %result.transaction_id,
                source = %source,
                amount = %amount,
                bonus = %bonus,
                "Tokens credited"
            );
        }

        Ok(result)
    }

    /// Consume tokens for `raw_units` of usage
    ///
    /// Billing goes through the source's margin, then the multiplier.
    /// Overdraft is allowed; admission is the caller's concern.
    pub async fn deduct_tokens(
        &self,
        account: AccountId,
        raw_units: Decimal,
        source: SourceType,
        options: DeductOptions,
    ) -> Result<TransactionResult> {
        require_account(&account)?;
        require_key(options.idempotency_key.as_deref())?;
        if raw_units < Decimal::ZERO {
            return Err(Error::InvalidAmount(
                "Raw units must not be negative".to_string(),
            ));
        }
        if source == SourceType::PlatformBonus {
            return Err(Error::InvalidAmount(
                "Bonus tokens are consumed through the platform source".to_string(),
            ));
        }
        let multiplier = options.multiplier.unwrap_or(Decimal::ONE);
        if multiplier <= Decimal::ZERO {
            return Err(Error::InvalidAmount(
                "Multiplier must be positive".to_string(),
            ));
        }

        let margin = self.storage.get_margin(source)?;
        let billed = MarginCalculator::bill(raw_units, margin.as_ref(), multiplier)?;

        let result = self
            .handle
            .apply(Mutation::Debit {
                account,
                billed,
                raw_units,
                multiplier,
                source,
                reason: options.reason.unwrap_or_else(|| "usage".to_string()),
                idempotency_key: options.idempotency_key,
                metadata: options.metadata,
            })
            .await?;

        if result.idempotent_replay {
            self.metrics.record_replay();
        } else {
            self.metrics
                .record_debit(result.tokens.to_f64().unwrap_or_default());
            tracing::info!(
                account = %account,
                transaction_id = %result.transaction_id,
                source = %source,
                raw_units = %raw_units,
                billed = %billed,
                "Tokens deducted"
            );
        }

        Ok(result)
    }

    // ---------------------------------------------------------------------
    // Ledger reads
    // ---------------------------------------------------------------------

    /// Ledger entries for an account, oldest first
    pub fn get_ledger_entries(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        self.storage.account_entries(&account)
    }

    /// Stored transaction
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<TransactionRecord> {
        self.storage
            .get_transaction(transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))
    }

    /// Totals over an account's ledger
    pub fn get_ledger_summary(&self, account: AccountId) -> Result<LedgerSummary> {
        let entries = self.storage.account_entries(&account)?;

        let mut total_credits = Decimal::ZERO;
        let mut total_debits = Decimal::ZERO;
        let mut transactions = HashSet::new();
        for entry in &entries {
            if entry.delta >= Decimal::ZERO {
                total_credits = checked_sum(total_credits, entry.delta)?;
            } else {
                total_debits = checked_sum(total_debits, -entry.delta)?;
            }
            transactions.insert(entry.transaction_id);
        }

        Ok(LedgerSummary {
            account,
            total_credits,
            total_debits,
            computed_balance: checked_sum(total_credits, -total_debits)?,
            transaction_count: transactions.len(),
        })
    }

    /// Recompute every bucket from the ledger and compare with the balance row
    pub fn verify_balance(&self, account: AccountId) -> Result<BalanceReconciliation> {
        let stored = self.get_balance(account)?;

        let mut computed: BTreeMap<SourceType, Decimal> = BTreeMap::new();
        for entry in self.storage.account_entries(&account)? {
            let bucket = computed.entry(entry.source).or_default();
            *bucket = checked_sum(*bucket, entry.delta)?;
        }

        let discrepancies: Vec<SourceDiscrepancy> = SourceType::ALL
            .iter()
            .filter_map(|source| {
                let computed = computed.get(source).copied().unwrap_or_default();
                let stored = stored.get(*source);
                (computed != stored).then_some(SourceDiscrepancy {
                    source: *source,
                    stored,
                    computed,
                })
            })
            .collect();

        if !discrepancies.is_empty() {
            tracing::error!(
                account = %account,
                discrepancies = discrepancies.len(),
                "Balance does not match ledger"
            );
        }

        Ok(BalanceReconciliation {
            account,
            matches: discrepancies.is_empty(),
            discrepancies,
        })
    }

    // ---------------------------------------------------------------------
    // Margins
    // ---------------------------------------------------------------------

    /// All stored margins
    pub fn get_margins(&self) -> Result<Vec<Margin>> {
        self.storage.list_margins()
    }

    /// Margin for one source
    pub fn get_margin(&self, source: SourceType) -> Result<Margin> {
        self.storage
            .get_margin(source)?
            .ok_or_else(|| Error::NotFound(format!("margin for {}", source)))
    }

    /// Partially update a margin
    ///
    /// A source with no stored row starts from its configured default, or
    /// from an inactive zero rule when none is configured.
    pub fn update_margin(&self, source: SourceType, update: MarginUpdate) -> Result<Margin> {
        let _guard = self.margin_lock.lock();

        let mut margin = match self.storage.get_margin(source)? {
            Some(margin) => margin,
            None => self
                .config
                .margins
                .iter()
                .find(|m| m.source == source)
                .map(MarginConfig::to_margin)
                .unwrap_or_else(|| Margin {
                    is_active: false,
                    ..Margin::new(source, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
                }),
        };

        margin.apply_update(&update)?;
        self.storage.put_margin(&margin)?;

        tracing::info!(
            source = %source,
            base_cost_per_1k = %margin.base_cost_per_1k,
            margin_percent = %margin.margin_percent,
            min_charge = %margin.min_charge,
            is_active = margin.is_active,
            "Margin updated"
        );

        Ok(margin)
    }

    // ---------------------------------------------------------------------
    // BYOK and source resolution
    // ---------------------------------------------------------------------

    /// Store (or rotate) a user's provider key
    pub fn add_user_api_key(&self, user_id: Uuid, request: ApiKeyRequest) -> Result<ByokKeySummary> {
        self.vault().add(user_id, request)
    }

    /// List a user's keys (display data only)
    pub fn get_user_api_keys(&self, user_id: Uuid) -> Result<Vec<ByokKeySummary>> {
        self.vault().list(user_id)
    }

    /// Hard-delete a user's key for a provider
    pub fn delete_user_api_key(&self, user_id: Uuid, provider: &str) -> Result<bool> {
        self.vault().delete(user_id, provider)
    }

    /// Which bucket funds `user_id` calling `provider`
    pub fn determine_token_source(&self, user_id: Uuid, provider: &str) -> Result<TokenSource> {
        self.resolver.determine_token_source(user_id, provider)
    }

    fn vault(&self) -> &ByokVault {
        self.resolver.vault()
    }

    /// Shutdown the writer actor
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Token ledger shutting down");
        self.handle.shutdown().await
    }
}

fn require_account(account: &AccountId) -> Result<()> {
    if account.is_missing() {
        return Err(Error::MissingRequired("account_id".to_string()));
    }
    Ok(())
}

fn require_key(key: Option<&str>) -> Result<()> {
    match key {
        Some(k) if k.trim().is_empty() => {
            Err(Error::MissingRequired("idempotency_key".to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::AesGcmCipher;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    async fn create_test_engine() -> (TokenLedgerEngine, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let engine = TokenLedgerEngine::open(config, Arc::new(AesGcmCipher::generate()))
            .await
            .unwrap();
        (engine, temp_dir)
    }

    fn user() -> AccountId {
        AccountId::user(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_unknown_account_reads_zero() {
        let (engine, _temp) = create_test_engine().await;
        let balance = engine.get_balance(user()).unwrap();
        assert_eq!(balance.total(), Decimal::ZERO);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_balance() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();

        engine.ensure_balance(account).await.unwrap();
        engine.ensure_balance(account).await.unwrap();
        assert!(engine.get_ledger_entries(account).unwrap().is_empty());

        let err = engine
            .ensure_balance(AccountId::user(Uuid::nil()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_REQUIRED");
    }

    #[tokio::test]
    async fn test_credit_with_bonus() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();

        let result = engine
            .credit_tokens(
                account,
                dec("100"),
                dec("25"),
                CreditOptions::default().with_reason("signup"),
            )
            .await
            .unwrap();
        assert_eq!(result.tokens, dec("125"));
        assert!(!result.idempotent_replay);

        let balance = engine.get_balance(account).unwrap();
        assert_eq!(balance.platform, dec("100"));
        assert_eq!(balance.platform_bonus, dec("25"));

        let entries = engine.get_ledger_entries(account).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.transaction_id == result.transaction_id));
        assert!(entries.iter().all(|e| e.reason == "signup"));

        let record = engine.get_transaction(result.transaction_id).unwrap();
        assert_eq!(record.entry_ids.len(), 2);
        assert_eq!(engine.metrics().credits_total.get(), 1);
    }

    #[tokio::test]
    async fn test_credit_validation() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();

        let err = engine
            .credit_tokens(account, Decimal::ZERO, Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let err = engine
            .credit_tokens(account, dec("-1"), Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let err = engine
            .credit_tokens(
                account,
                dec("1"),
                Decimal::ZERO,
                CreditOptions::default().with_idempotency_key("  "),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_REQUIRED");

        assert_eq!(engine.get_balance(account).unwrap().total(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_overflowing_credit_leaves_writer_running() {
        let (engine, _temp) = create_test_engine().await;
        let whale = user();
        let other = user();

        engine
            .credit_tokens(whale, Decimal::MAX, Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap();
        let err = engine
            .credit_tokens(whale, Decimal::MAX, Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let err = engine
            .credit_tokens(other, Decimal::MAX, Decimal::MAX, CreditOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        // Rejected mutations leave nothing behind and the writer keeps serving
        assert_eq!(engine.get_balance(whale).unwrap().platform, Decimal::MAX);
        assert_eq!(engine.get_ledger_entries(whale).unwrap().len(), 1);
        engine
            .credit_tokens(other, dec("1"), Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.get_balance(other).unwrap().platform, dec("1"));
        assert!(engine.verify_balance(whale).unwrap().matches);
    }

    #[tokio::test]
    async fn test_overdraw_past_range_is_rejected() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();
        engine
            .update_margin(
                SourceType::Byok,
                MarginUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        engine
            .deduct_tokens(account, Decimal::MAX, SourceType::Byok, DeductOptions::default())
            .await
            .unwrap();
        let err = engine
            .deduct_tokens(account, dec("1"), SourceType::Byok, DeductOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
        assert_eq!(engine.get_balance(account).unwrap().byok, Decimal::MIN);

        let err = engine
            .deduct_tokens(
                account,
                Decimal::MAX,
                SourceType::Byok,
                DeductOptions::default().with_multiplier(dec("2")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let result = engine
            .credit_tokens(user(), dec("5"), Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap();
        assert!(!result.idempotent_replay);
    }

    #[tokio::test]
    async fn test_bonus_bucket_is_not_a_deduction_source() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();
        engine
            .credit_tokens(account, Decimal::ZERO, dec("10"), CreditOptions::default())
            .await
            .unwrap();

        let err = engine
            .deduct_tokens(account, dec("50"), SourceType::PlatformBonus, DeductOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let balance = engine.get_balance(account).unwrap();
        assert_eq!(balance.platform_bonus, dec("10"));
        assert_eq!(engine.get_ledger_entries(account).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deduct_applies_margin_and_multiplier() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();

        engine
            .credit_tokens(account, dec("10000"), Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap();

        // default platform margin: 1000 per 1k, +20%, min 1
        let result = engine
            .deduct_tokens(
                account,
                dec("1000"),
                SourceType::Platform,
                DeductOptions::default().with_multiplier(dec("2")),
            )
            .await
            .unwrap();
        assert_eq!(result.tokens, dec("2400"));
        assert_eq!(engine.get_balance(account).unwrap().platform, dec("7600"));

        let record = engine.get_transaction(result.transaction_id).unwrap();
        assert_eq!(record.raw_units, Some(dec("1000")));
        assert_eq!(record.multiplier, dec("2"));
    }

    #[tokio::test]
    async fn test_deduct_uses_bonus_then_overdraws() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();

        engine
            .update_margin(
                SourceType::Platform,
                MarginUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        engine
            .credit_tokens(account, dec("10"), dec("5"), CreditOptions::default())
            .await
            .unwrap();

        engine
            .deduct_tokens(account, dec("20"), SourceType::Platform, DeductOptions::default())
            .await
            .unwrap();

        let balance = engine.get_balance(account).unwrap();
        assert_eq!(balance.platform_bonus, Decimal::ZERO);
        assert_eq!(balance.platform, dec("-5"));
        assert!(!engine
            .has_sufficient_balance(account, dec("1"), SourceType::Platform)
            .unwrap());
        assert!(engine.verify_balance(account).unwrap().matches);
    }

    #[tokio::test]
    async fn test_deduct_idempotent_replay() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();
        engine
            .credit_tokens(account, dec("5000"), Decimal::ZERO, CreditOptions::default())
            .await
            .unwrap();

        let options = DeductOptions::default().with_idempotency_key("req-42");
        let first = engine
            .deduct_tokens(account, dec("1000"), SourceType::Platform, options.clone())
            .await
            .unwrap();
        let second = engine
            .deduct_tokens(account, dec("1000"), SourceType::Platform, options)
            .await
            .unwrap();

        assert!(!first.idempotent_replay);
        assert!(second.idempotent_replay);
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(first.tokens, second.tokens);
        assert_eq!(engine.get_balance(account).unwrap().platform, dec("3800"));
        assert_eq!(engine.metrics().idempotent_replays.get(), 1);
        assert_eq!(engine.metrics().debits_total.get(), 1);
    }

    #[tokio::test]
    async fn test_deduct_validation() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();

        let err = engine
            .deduct_tokens(account, dec("-1"), SourceType::Platform, DeductOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        let err = engine
            .deduct_tokens(
                account,
                dec("1"),
                SourceType::Platform,
                DeductOptions::default().with_multiplier(Decimal::ZERO),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        // zero usage still bills the minimum charge
        let result = engine
            .deduct_tokens(account, Decimal::ZERO, SourceType::Platform, DeductOptions::default())
            .await
            .unwrap();
        assert_eq!(result.tokens, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_ledger_summary() {
        let (engine, _temp) = create_test_engine().await;
        let account = user();

        engine
            .credit_tokens(account, dec("100"), dec("50"), CreditOptions::default())
            .await
            .unwrap();
        engine
            .deduct_tokens(account, dec("70"), SourceType::Byok, DeductOptions::default())
            .await
            .unwrap();

        let summary = engine.get_ledger_summary(account).unwrap();
        assert_eq!(summary.total_credits, dec("150"));
        assert_eq!(summary.total_debits, dec("70"));
        assert_eq!(summary.computed_balance, dec("80"));
        assert_eq!(summary.transaction_count, 2);
        assert_eq!(summary.computed_balance, engine.get_balance(account).unwrap().total());
    }

    #[tokio::test]
    async fn test_update_margin() {
        let (engine, _temp) = create_test_engine().await;

        let updated = engine
            .update_margin(
                SourceType::Platform,
                MarginUpdate {
                    margin_percent: Some(dec("50")),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.margin_percent, dec("50"));
        assert_eq!(updated.base_cost_per_1k, dec("1000"));
        assert_eq!(engine.get_margin(SourceType::Platform).unwrap(), updated);

        let err = engine
            .update_margin(
                SourceType::Platform,
                MarginUpdate {
                    min_charge: Some(dec("-1")),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");

        assert_eq!(
            engine.get_margin(SourceType::PlatformBonus).unwrap_err().code(),
            "NOT_FOUND"
        );
        assert_eq!(engine.get_margins().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_byok_lifecycle_through_engine() {
        let (engine, _temp) = create_test_engine().await;
        let user_id = Uuid::new_v4();

        engine
            .add_user_api_key(
                user_id,
                ApiKeyRequest {
                    provider: "anthropic".to_string(),
                    api_key: "sk-ant-test".to_string(),
                    display_name: Some("Team key".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let keys = engine.get_user_api_keys(user_id).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].display_name, "Team key");

        let source = engine.determine_token_source(user_id, "anthropic").unwrap();
        assert_eq!(source.source_type(), SourceType::Byok);

        assert!(engine.delete_user_api_key(user_id, "anthropic").unwrap());
        assert!(!engine.delete_user_api_key(user_id, "anthropic").unwrap());
        assert_eq!(
            engine.determine_token_source(user_id, "anthropic").unwrap(),
            TokenSource::Platform
        );
    }

    #[tokio::test]
    async fn test_get_transaction_not_found() {
        let (engine, _temp) = create_test_engine().await;
        let err = engine.get_transaction(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
