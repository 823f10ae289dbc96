//! In-memory stores and classifier doubles.
//!
//! Compiled for this crate's tests and, with the `test-utils` feature, for
//! dependents (the worker binary's tests).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::enrich::classifier::{Classification, ClassificationItem, Classifier};
use crate::enrich::parsing::parse_classifications;
use crate::enrich::transactions::{
    CategoryUpdate, CohortMember, CohortVerdict, MerchantActivity, PendingTransaction,
    SubscriptionPeriod, Transaction, TransactionStore, CATEGORY_SOURCE_LLM,
};
use crate::error::{Error, Result};
use crate::jobs::model::{truncate_error, Job, JobStatus, NewJob};
use crate::jobs::store::JobStore;

/// A queued job that never went through a store.
pub fn job_fixture(job_type: &str, payload: Value) -> Job {
    let now = Utc::now();
    Job {
        id: Uuid::new_v4(),
        job_type: job_type.to_string(),
        payload,
        owner_token: "owner".to_string(),
        status: JobStatus::Queued.as_str().to_string(),
        attempts: 0,
        locked_by: None,
        locked_at: None,
        run_after: now,
        last_error: None,
        last_error_code: None,
        finished_on: None,
        created_on: now,
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Job>>,
    failing_claims: AtomicUsize,
}

impl MemoryJobStore {
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock().iter().find(|j| j.id == id).cloned()
    }

    pub fn all(&self) -> Vec<Job> {
        self.lock().clone()
    }

    /// Put a running job back in the queue, as the stale-job reaper does.
    pub fn requeue(&self, id: Uuid) {
        if let Some(job) = self.lock().iter_mut().find(|j| j.id == id) {
            job.status = JobStatus::Queued.as_str().to_string();
            job.locked_by = None;
            job.locked_at = None;
        }
    }

    /// Make the next `n` claims return an error.
    pub fn fail_next_claims(&self, n: usize) {
        self.failing_claims.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn holds_lease(job: &Job, worker_id: &str, attempt: i32) -> bool {
    job.status == JobStatus::Running.as_str()
        && job.locked_by.as_deref() == Some(worker_id)
        && job.attempts == attempt
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let mut stored = job_fixture(&job.job_type, job.payload);
        stored.owner_token = job.owner_token;
        stored.run_after = job.run_after;
        // Insertion order doubles as FIFO order; keep created_on monotonic.
        let mut jobs = self.lock();
        if let Some(last) = jobs.last() {
            if stored.created_on <= last.created_on {
                stored.created_on = last.created_on + chrono::Duration::microseconds(1);
            }
        }
        let id = stored.id;
        jobs.push(stored);
        Ok(id)
    }

    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<Job>> {
        if self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("simulated claim failure");
        }

        let now = Utc::now();
        let mut jobs = self.lock();
        let next = jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Queued.as_str() && j.run_after <= now)
            .min_by(|a, b| a.created_on.cmp(&b.created_on).then(a.id.cmp(&b.id)));

        Ok(next.map(|job| {
            job.status = JobStatus::Running.as_str().to_string();
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str, attempt: i32) -> anyhow::Result<bool> {
        let mut jobs = self.lock();
        match jobs
            .iter_mut()
            .find(|j| j.id == job_id && holds_lease(j, worker_id, attempt))
        {
            Some(job) => {
                job.status = JobStatus::Done.as_str().to_string();
                job.finished_on = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempt: i32,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool> {
        let mut jobs = self.lock();
        match jobs
            .iter_mut()
            .find(|j| j.id == job_id && holds_lease(j, worker_id, attempt))
        {
            Some(job) => {
                job.status = JobStatus::Failed.as_str().to_string();
                job.finished_on = Some(Utc::now());
                job.last_error_code = Some(error_code.to_string());
                job.last_error = Some(truncate_error(error_message));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Builder for rows inserted into [`MemoryTransactionStore`].
#[derive(Debug, Clone)]
pub struct TransactionFixture {
    pub owner_token: String,
    pub import_id: i64,
    pub booking_text: String,
    pub booking_type: Option<String>,
    pub amount: f64,
    pub date: NaiveDate,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub period: Option<SubscriptionPeriod>,
}

impl TransactionFixture {
    pub fn new(owner_token: &str, import_id: i64, text: &str, amount: f64, date: NaiveDate) -> Self {
        Self {
            owner_token: owner_token.to_string(),
            import_id,
            booking_text: text.to_string(),
            booking_type: None,
            amount,
            date,
            merchant: None,
            category: None,
            period: None,
        }
    }

    /// Pretend the row was categorized earlier.
    pub fn categorized(mut self, merchant: &str, category: &str) -> Self {
        self.merchant = Some(merchant.to_string());
        self.category = Some(category.to_string());
        self
    }

    pub fn subscription(mut self, period: SubscriptionPeriod) -> Self {
        self.period = Some(period);
        self
    }
}

#[derive(Default)]
pub struct MemoryTransactionStore {
    rows: Mutex<BTreeMap<i64, Transaction>>,
    fail_cohort_reads: AtomicBool,
}

impl MemoryTransactionStore {
    pub fn insert(&self, f: TransactionFixture) -> i64 {
        let mut rows = self.lock();
        let id = rows.keys().next_back().copied().unwrap_or(0) + 1;
        let source = f.category.as_ref().map(|_| CATEGORY_SOURCE_LLM.to_string());
        rows.insert(
            id,
            Transaction {
                id,
                owner_token: f.owner_token,
                import_id: f.import_id,
                booking_hash: format!("hash-{id}"),
                booking_text: f.booking_text,
                booking_type: f.booking_type,
                booking_amount_value: Some(f.amount),
                booking_date: Some(f.date),
                merchant_normalized: f.merchant,
                booking_category: f.category,
                category_confidence: source.as_ref().map(|_| 1.0),
                category_source: source,
                is_subscription: f.period.is_some(),
                subscription_period: f.period.map(|p| p.as_str().to_string()),
                is_recurring: false,
                subscription_key: None,
                recurrence_score: 0.0,
            },
        );
        id
    }

    pub fn get(&self, id: i64) -> Option<Transaction> {
        self.lock().get(&id).cloned()
    }

    /// All rows of one owner, by id.
    pub fn rows_for(&self, owner_token: &str) -> Vec<Transaction> {
        self.lock()
            .values()
            .filter(|t| t.owner_token == owner_token)
            .cloned()
            .collect()
    }

    /// Make `cohort_candidates` fail, to exercise the degraded path.
    pub fn fail_cohort_reads(&self, fail: bool) {
        self.fail_cohort_reads.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<i64, Transaction>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn uncategorized(t: &Transaction) -> bool {
    t.booking_category.as_deref().map_or(true, str::is_empty)
}

fn known_merchant(t: &Transaction) -> Option<&str> {
    t.merchant_normalized.as_deref().filter(|m| !m.is_empty())
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn pending_for_import(
        &self,
        owner_token: &str,
        import_id: i64,
    ) -> Result<Vec<PendingTransaction>> {
        Ok(self
            .lock()
            .values()
            .filter(|t| t.owner_token == owner_token && t.import_id == import_id && uncategorized(t))
            .map(|t| PendingTransaction {
                id: t.id,
                booking_text: t.booking_text.clone(),
                booking_type: t.booking_type.clone(),
                booking_amount_value: t.booking_amount_value,
            })
            .collect())
    }

    async fn apply_category_batch(
        &self,
        owner_token: &str,
        updates: &[CategoryUpdate],
    ) -> Result<u64> {
        let mut rows = self.lock();
        let mut written = 0;
        for update in updates {
            for id in &update.ids {
                let Some(t) = rows.get_mut(id) else { continue };
                if t.owner_token != owner_token || !uncategorized(t) {
                    continue;
                }
                t.booking_category = Some(update.category.clone());
                t.category_confidence = Some(update.confidence);
                t.category_source = Some(CATEGORY_SOURCE_LLM.to_string());
                t.merchant_normalized = Some(update.merchant.clone());
                t.is_subscription = update.is_subscription;
                t.subscription_period = update.subscription_period.map(|p| p.as_str().to_string());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn merchant_activity(
        &self,
        owner_token: &str,
        since: NaiveDate,
    ) -> Result<Vec<MerchantActivity>> {
        Ok(self
            .lock()
            .values()
            .filter(|t| t.owner_token == owner_token)
            .filter_map(|t| {
                let merchant = known_merchant(t)?;
                let date = t.booking_date.filter(|d| *d >= since)?;
                Some(MerchantActivity {
                    id: t.id,
                    merchant: merchant.to_string(),
                    booking_date: date,
                })
            })
            .collect())
    }

    async fn mark_recurring(&self, owner_token: &str, ids: &[i64]) -> Result<u64> {
        let mut rows = self.lock();
        let mut flagged = 0;
        for id in ids {
            if let Some(t) = rows.get_mut(id) {
                if t.owner_token == owner_token && !t.is_recurring {
                    t.is_recurring = true;
                    flagged += 1;
                }
            }
        }
        Ok(flagged)
    }

    async fn cohort_candidates(
        &self,
        owner_token: &str,
        since: NaiveDate,
    ) -> Result<Vec<CohortMember>> {
        if self.fail_cohort_reads.load(Ordering::SeqCst) {
            return Err(Error::InvalidData("simulated cohort read failure".into()));
        }

        let mut out: Vec<CohortMember> = self
            .lock()
            .values()
            .filter(|t| t.owner_token == owner_token)
            .filter_map(|t| {
                let merchant = known_merchant(t)?;
                let amount = t.booking_amount_value.filter(|a| *a > 0.0)?;
                let date = t.booking_date.filter(|d| *d >= since)?;
                Some(CohortMember {
                    id: t.id,
                    merchant: merchant.to_string(),
                    amount,
                    booking_date: date,
                    booking_category: t.booking_category.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| {
            a.merchant
                .cmp(&b.merchant)
                .then(a.amount.total_cmp(&b.amount))
                .then(a.booking_date.cmp(&b.booking_date))
                .then(a.id.cmp(&b.id))
        });
        Ok(out)
    }

    async fn apply_cohort_verdict(
        &self,
        owner_token: &str,
        verdict: &CohortVerdict,
    ) -> Result<u64> {
        let mut rows = self.lock();
        let mut updated = 0;
        for id in &verdict.ids {
            let Some(t) = rows.get_mut(id) else { continue };
            if t.owner_token != owner_token {
                continue;
            }
            t.subscription_key = Some(verdict.key.clone());
            t.recurrence_score = t.recurrence_score.max(verdict.score);
            t.is_recurring |= verdict.is_recurring;
            t.is_subscription |= verdict.is_subscription;
            if let Some(p) = verdict.period {
                let replaceable = matches!(t.subscription_period.as_deref(), None | Some("unknown"));
                if replaceable {
                    t.subscription_period = Some(p.as_str().to_string());
                }
            }
            updated += 1;
        }
        Ok(updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierFailure {
    /// Return a transport-style error.
    Unavailable,
    /// Drop the last key of the batch from the reply.
    MissingKey,
    /// Reply with a JSON object keyed by item key instead of an array.
    NonArray,
    /// Repeat the first item of the reply.
    DuplicateKey,
}

/// Answers every key with a fixed category, records what it saw, and can be
/// told to fail on a given call (1-based).
#[derive(Default)]
pub struct ScriptedClassifier {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    fail_on: Option<(usize, ClassifierFailure)>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(call: usize, failure: ClassifierFailure) -> Self {
        Self {
            fail_on: Some((call, failure)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_keys(&self) -> Vec<String> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify_batch(&self, items: &[ClassificationItem]) -> Result<Vec<Classification>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(items.iter().map(|i| i.key.clone()));

        let mut out: Vec<Classification> = items
            .iter()
            .map(|i| Classification {
                key: i.key.clone(),
                merchant: None,
                category: "Misc".to_string(),
                confidence: 0.5,
                is_subscription: false,
                subscription_period: None,
            })
            .collect();

        match self.fail_on {
            Some((n, ClassifierFailure::Unavailable)) if n == call => {
                Err(Error::Classifier("simulated outage".into()))
            }
            Some((n, ClassifierFailure::MissingKey)) if n == call => {
                out.pop();
                Ok(out)
            }
            Some((n, ClassifierFailure::NonArray)) if n == call => {
                let reply: serde_json::Map<String, Value> = items
                    .iter()
                    .map(|i| (i.key.clone(), json!({ "category_path": "Misc" })))
                    .collect();
                parse_classifications(Value::Object(reply))
            }
            Some((n, ClassifierFailure::DuplicateKey)) if n == call => {
                if let Some(first) = out.first().cloned() {
                    out.push(first);
                }
                Ok(out)
            }
            _ => Ok(out),
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
