//! Transaction persistence for the enrichment pipeline.
//!
//! The store only loads and writes rows. Grouping, batching, recurrence rules
//! and cohort math live in the callers.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::Result;

/// `category_source` written for classifier results.
pub const CATEGORY_SOURCE_LLM: &str = "llm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPeriod {
    Monthly,
    Yearly,
    Unknown,
}

impl SubscriptionPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPeriod::Monthly => "monthly",
            SubscriptionPeriod::Yearly => "yearly",
            SubscriptionPeriod::Unknown => "unknown",
        }
    }

    /// Exact parse of a stored value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(SubscriptionPeriod::Monthly),
            "yearly" => Some(SubscriptionPeriod::Yearly),
            "unknown" => Some(SubscriptionPeriod::Unknown),
            _ => None,
        }
    }

    /// Lenient mapping for free-form classifier output.
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "monthly" | "month" | "monatlich" => SubscriptionPeriod::Monthly,
            "yearly" | "annual" | "annually" | "jährlich" | "jaehrlich" => {
                SubscriptionPeriod::Yearly
            }
            _ => SubscriptionPeriod::Unknown,
        }
    }
}

/// Full enrichment view of one row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: i64,
    pub owner_token: String,
    pub import_id: i64,
    pub booking_hash: String,
    pub booking_text: String,
    pub booking_type: Option<String>,
    pub booking_amount_value: Option<f64>,
    pub booking_date: Option<NaiveDate>,

    pub merchant_normalized: Option<String>,
    pub booking_category: Option<String>,
    pub category_confidence: Option<f64>,
    pub category_source: Option<String>,
    pub is_subscription: bool,
    pub subscription_period: Option<String>,
    pub is_recurring: bool,
    pub subscription_key: Option<String>,
    pub recurrence_score: f64,
}

impl Transaction {
    pub fn period(&self) -> Option<SubscriptionPeriod> {
        self.subscription_period
            .as_deref()
            .and_then(SubscriptionPeriod::parse)
    }
}

/// What ingestion hands over. Only used by tooling and tests here.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub owner_token: String,
    pub import_id: i64,
    pub booking_hash: String,
    pub booking_text: String,
    pub booking_type: Option<String>,
    pub booking_amount_value: Option<f64>,
    pub booking_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingTransaction {
    pub id: i64,
    pub booking_text: String,
    pub booking_type: Option<String>,
    pub booking_amount_value: Option<f64>,
}

/// One classified text group, applied to every row id in `ids`.
#[derive(Debug, Clone)]
pub struct CategoryUpdate {
    pub ids: Vec<i64>,
    pub category: String,
    pub confidence: f64,
    pub merchant: String,
    pub is_subscription: bool,
    pub subscription_period: Option<SubscriptionPeriod>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MerchantActivity {
    pub id: i64,
    pub merchant: String,
    pub booking_date: NaiveDate,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CohortMember {
    pub id: i64,
    pub merchant: String,
    pub amount: f64,
    pub booking_date: NaiveDate,
    pub booking_category: Option<String>,
}

/// Detector result for one cohort.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortVerdict {
    pub key: String,
    pub ids: Vec<i64>,
    pub is_recurring: bool,
    pub is_subscription: bool,
    /// Written only over a NULL or `unknown` period.
    pub period: Option<SubscriptionPeriod>,
    pub score: f64,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Rows of one import with no category yet, ordered by id.
    async fn pending_for_import(
        &self,
        owner_token: &str,
        import_id: i64,
    ) -> Result<Vec<PendingTransaction>>;

    /// Apply one classifier batch atomically. Rows that gained a category in
    /// the meantime are left alone. Returns the number of rows written.
    async fn apply_category_batch(
        &self,
        owner_token: &str,
        updates: &[CategoryUpdate],
    ) -> Result<u64>;

    /// Dated rows with a known merchant on or after `since`.
    async fn merchant_activity(
        &self,
        owner_token: &str,
        since: NaiveDate,
    ) -> Result<Vec<MerchantActivity>>;

    async fn mark_recurring(&self, owner_token: &str, ids: &[i64]) -> Result<u64>;

    /// Positive-amount rows with a known merchant on or after `since`, sorted
    /// by merchant, amount, date.
    async fn cohort_candidates(
        &self,
        owner_token: &str,
        since: NaiveDate,
    ) -> Result<Vec<CohortMember>>;

    async fn apply_cohort_verdict(&self, owner_token: &str, verdict: &CohortVerdict)
        -> Result<u64>;
}

#[derive(Clone)]
pub struct TransactionsRepo {
    pool: PgPool,
}

const TRANSACTION_COLUMNS: &str = r#"
    id, owner_token, import_id, booking_hash, booking_text, booking_type,
    booking_amount_value::float8 AS booking_amount_value, booking_date,
    merchant_normalized, booking_category, category_confidence, category_source,
    is_subscription, subscription_period, is_recurring, subscription_key,
    recurrence_score
"#;

impl TransactionsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a row unless `(owner_token, booking_hash)` already exists.
    pub async fn insert(&self, tx: &NewTransaction) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO transactions (
                owner_token, import_id, booking_hash, booking_text,
                booking_type, booking_amount_value, booking_date
            )
            VALUES ($1, $2, $3, $4, $5, $6::float8::numeric, $7)
            ON CONFLICT (owner_token, booking_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&tx.owner_token)
        .bind(tx.import_id)
        .bind(&tx.booking_hash)
        .bind(&tx.booking_text)
        .bind(&tx.booking_type)
        .bind(tx.booking_amount_value)
        .bind(tx.booking_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_transaction(&self, owner_token: &str, id: i64) -> Result<Option<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE owner_token = $1 AND id = $2"
        );
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(owner_token)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_for_import(&self, owner_token: &str, import_id: i64) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE owner_token = $1 AND import_id = $2 ORDER BY id ASC"
        );
        let rows = sqlx::query_as::<_, Transaction>(&sql)
            .bind(owner_token)
            .bind(import_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl TransactionStore for TransactionsRepo {
    async fn pending_for_import(
        &self,
        owner_token: &str,
        import_id: i64,
    ) -> Result<Vec<PendingTransaction>> {
        let rows = sqlx::query_as::<_, PendingTransaction>(
            r#"
            SELECT id, booking_text, booking_type,
                   booking_amount_value::float8 AS booking_amount_value
            FROM transactions
            WHERE owner_token = $1
              AND import_id = $2
              AND (booking_category IS NULL OR booking_category = '')
            ORDER BY id ASC
            "#,
        )
        .bind(owner_token)
        .bind(import_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn apply_category_batch(
        &self,
        owner_token: &str,
        updates: &[CategoryUpdate],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for update in updates {
            written += sqlx::query(
                r#"
                UPDATE transactions
                SET booking_category = $3,
                    category_confidence = $4,
                    category_source = $5,
                    merchant_normalized = $6,
                    is_subscription = $7,
                    subscription_period = $8
                WHERE owner_token = $1
                  AND id = ANY($2)
                  AND (booking_category IS NULL OR booking_category = '')
                "#,
            )
            .bind(owner_token)
            .bind(&update.ids)
            .bind(&update.category)
            .bind(update.confidence)
            .bind(CATEGORY_SOURCE_LLM)
            .bind(&update.merchant)
            .bind(update.is_subscription)
            .bind(update.subscription_period.map(|p| p.as_str()))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn merchant_activity(
        &self,
        owner_token: &str,
        since: NaiveDate,
    ) -> Result<Vec<MerchantActivity>> {
        let rows = sqlx::query_as::<_, MerchantActivity>(
            r#"
            SELECT id, merchant_normalized AS merchant, booking_date
            FROM transactions
            WHERE owner_token = $1
              AND merchant_normalized IS NOT NULL
              AND merchant_normalized <> ''
              AND booking_date IS NOT NULL
              AND booking_date >= $2
            ORDER BY merchant_normalized, booking_date, id
            "#,
        )
        .bind(owner_token)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_recurring(&self, owner_token: &str, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET is_recurring = true
            WHERE owner_token = $1
              AND id = ANY($2)
              AND NOT is_recurring
            "#,
        )
        .bind(owner_token)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn cohort_candidates(
        &self,
        owner_token: &str,
        since: NaiveDate,
    ) -> Result<Vec<CohortMember>> {
        let rows = sqlx::query_as::<_, CohortMember>(
            r#"
            SELECT id,
                   merchant_normalized AS merchant,
                   booking_amount_value::float8 AS amount,
                   booking_date,
                   booking_category
            FROM transactions
            WHERE owner_token = $1
              AND booking_amount_value > 0
              AND merchant_normalized IS NOT NULL
              AND merchant_normalized <> ''
              AND booking_date IS NOT NULL
              AND booking_date >= $2
            ORDER BY merchant_normalized, booking_amount_value, booking_date, id
            "#,
        )
        .bind(owner_token)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn apply_cohort_verdict(
        &self,
        owner_token: &str,
        verdict: &CohortVerdict,
    ) -> Result<u64> {
        // Single statement, so each cohort commits on its own.
        let res = sqlx::query(
            r#"
            UPDATE transactions
            SET subscription_key = $3,
                recurrence_score = GREATEST(recurrence_score, $4),
                is_recurring = is_recurring OR $5,
                is_subscription = is_subscription OR $6,
                subscription_period = CASE
                    WHEN $7::text IS NOT NULL
                         AND (subscription_period IS NULL OR subscription_period = 'unknown')
                    THEN $7::text
                    ELSE subscription_period
                END
            WHERE owner_token = $1
              AND id = ANY($2)
            "#,
        )
        .bind(owner_token)
        .bind(&verdict.ids)
        .bind(&verdict.key)
        .bind(verdict.score)
        .bind(verdict.is_recurring)
        .bind(verdict.is_subscription)
        .bind(verdict.period.map(|p| p.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}
