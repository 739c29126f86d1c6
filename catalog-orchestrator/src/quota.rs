//! Per-account quota admission control.
//!
//! Reservations are conditional `UPDATE`s executed inside one transaction, so a
//! request touching several quota names either lands completely or not at all,
//! and two concurrent reservations can never both pass a check only one of them
//! satisfies.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Amounts requested per quota name, e.g. `share.blocks → 20`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaRequest(BTreeMap<String, i64>);

impl QuotaRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, quota_name: impl Into<String>, amount: i64) -> Self {
        self.add(quota_name, amount);
        self
    }

    pub fn add(&mut self, quota_name: impl Into<String>, amount: i64) {
        *self.0.entry(quota_name.into()).or_insert(0) += amount;
    }

    pub fn merge(&mut self, other: &QuotaRequest) {
        for (name, amount) in other.iter() {
            self.add(name, amount);
        }
    }

    /// Removes `other` from this request, dropping names that reach zero.
    pub fn subtract(&mut self, other: &QuotaRequest) {
        for (name, amount) in other.iter() {
            self.add(name, -amount);
        }
        self.0.retain(|_, amount| *amount != 0);
    }

    pub fn amount(&self, quota_name: &str) -> i64 {
        self.0.get(quota_name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|amount| *amount == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.0.iter().map(|(name, amount)| (name.as_str(), *amount))
    }

    /// Splits a signed delta into the part to reserve and the part to release.
    pub fn split_delta(&self) -> (QuotaRequest, QuotaRequest) {
        let mut grow = QuotaRequest::new();
        let mut shrink = QuotaRequest::new();
        for (name, amount) in self.iter() {
            if amount > 0 {
                grow.add(name, amount);
            } else if amount < 0 {
                shrink.add(name, -amount);
            }
        }
        (grow, shrink)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct QuotaUsage {
    pub quota_name: String,
    #[sqlx(rename = "quota_limit")]
    pub limit: Option<i64>,
    pub allocated: i64,
}

#[derive(Clone)]
pub struct QuotaGuard {
    pool: SqlitePool,
    defaults: Arc<BTreeMap<String, i64>>,
}

impl QuotaGuard {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_defaults(pool, BTreeMap::new())
    }

    /// Default limits are applied the first time an account touches a quota name.
    pub fn with_defaults(pool: SqlitePool, defaults: BTreeMap<String, i64>) -> Self {
        Self {
            pool,
            defaults: Arc::new(defaults),
        }
    }

    /// Set (or clear, with `None`) the limit of one quota for an account.
    pub async fn set_limit(
        &self,
        account_id: &str,
        quota_name: &str,
        limit: Option<i64>,
    ) -> Result<()> {
        if limit.is_some_and(|l| l < 0) {
            return Err(OrchestratorError::InvalidInput(format!(
                "quota limit for {quota_name} must not be negative"
            )));
        }

        sqlx::query(
            "INSERT INTO quotas (account_id, quota_name, quota_limit, allocated)
             VALUES (?, ?, ?, 0)
             ON CONFLICT(account_id, quota_name) DO UPDATE SET quota_limit = excluded.quota_limit",
        )
        .bind(account_id)
        .bind(quota_name)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn usage(&self, account_id: &str) -> Result<Vec<QuotaUsage>> {
        let rows = sqlx::query_as::<_, QuotaUsage>(
            "SELECT quota_name, quota_limit, allocated FROM quotas
             WHERE account_id = ? ORDER BY quota_name",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get(&self, account_id: &str, quota_name: &str) -> Result<Option<QuotaUsage>> {
        let row = sqlx::query_as::<_, QuotaUsage>(
            "SELECT quota_name, quota_limit, allocated FROM quotas
             WHERE account_id = ? AND quota_name = ?",
        )
        .bind(account_id)
        .bind(quota_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Reserve every amount in `request` or none of them.
    #[instrument(skip(self, request), fields(account_id = %account_id))]
    pub async fn check_and_reserve(&self, account_id: &str, request: &QuotaRequest) -> Result<()> {
        if let Some((name, _)) = request.iter().find(|(_, amount)| *amount < 0) {
            return Err(OrchestratorError::InvalidInput(format!(
                "cannot reserve a negative amount of {name}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        for (name, amount) in request.iter().filter(|(_, amount)| *amount > 0) {
            sqlx::query(
                "INSERT OR IGNORE INTO quotas (account_id, quota_name, quota_limit, allocated)
                 VALUES (?, ?, ?, 0)",
            )
            .bind(account_id)
            .bind(name)
            .bind(self.defaults.get(name).copied())
            .execute(&mut *tx)
            .await?;

            let reserved = sqlx::query(
                "UPDATE quotas SET allocated = allocated + ?
                 WHERE account_id = ? AND quota_name = ?
                   AND (quota_limit IS NULL OR allocated + ? <= quota_limit)",
            )
            .bind(amount)
            .bind(account_id)
            .bind(name)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

            if reserved.rows_affected() == 0 {
                let (limit, allocated): (Option<i64>, i64) = sqlx::query_as(
                    "SELECT quota_limit, allocated FROM quotas
                     WHERE account_id = ? AND quota_name = ?",
                )
                .bind(account_id)
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;

                tx.rollback().await?;

                return Err(OrchestratorError::QuotaExceeded {
                    account_id: account_id.to_string(),
                    quota: name.to_string(),
                    requested: amount,
                    allocated,
                    limit: limit.unwrap_or_default(),
                });
            }

            debug!(quota = name, amount, "Reserved quota");
        }

        tx.commit().await?;

        Ok(())
    }

    /// Return amounts to the account. Counters never drop below zero.
    #[instrument(skip(self, request), fields(account_id = %account_id))]
    pub async fn release(&self, account_id: &str, request: &QuotaRequest) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        release_on(&mut tx, account_id, request).await?;
        tx.commit().await?;

        Ok(())
    }
}

/// Release on a caller-owned connection, so the release commits or rolls back
/// together with the caller's other writes.
pub(crate) async fn release_on(
    conn: &mut SqliteConnection,
    account_id: &str,
    request: &QuotaRequest,
) -> Result<()> {
    for (name, amount) in request.iter().filter(|(_, amount)| *amount > 0) {
        sqlx::query(
            "UPDATE quotas SET allocated = MAX(allocated - ?, 0)
             WHERE account_id = ? AND quota_name = ?",
        )
        .bind(amount)
        .bind(account_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;

        debug!(quota = name, amount, "Released quota");
    }

    Ok(())
}
