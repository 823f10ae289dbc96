use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::DEFAULT_BATCH_SIZE;
use crate::enrich::classifier::{Classification, ClassificationItem, Classifier};
use crate::enrich::detector::{DetectorStats, PatternDetector};
use crate::enrich::merchant::resolve_merchant;
use crate::enrich::recurring::flag_recurring_merchants;
use crate::enrich::transactions::{
    CategoryUpdate, PendingTransaction, SubscriptionPeriod, TransactionStore,
};
use crate::error::{Error, Result};

/// How the best-effort detector step ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum Detection {
    Completed(DetectorStats),
    /// The detector failed; categorization results are still committed.
    Degraded(String),
    /// Nothing was pending, so no follow-up passes ran.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorizeOutcome {
    pub transactions_categorized: u64,
    pub groups: usize,
    pub batches: usize,
    pub recurring_flagged: u64,
    pub detection: Detection,
}

impl CategorizeOutcome {
    fn skipped() -> Self {
        Self {
            transactions_categorized: 0,
            groups: 0,
            batches: 0,
            recurring_flagged: 0,
            detection: Detection::Skipped,
        }
    }
}

/// Rows of one import sharing an exact `booking_text`.
#[derive(Debug, Clone)]
pub struct TextGroup {
    pub text: String,
    pub ids: Vec<i64>,
    pub type_hint: String,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
}

impl TextGroup {
    fn to_item(&self, key: String) -> ClassificationItem {
        ClassificationItem {
            key,
            text: self.text.clone(),
            type_hint: self.type_hint.clone(),
            count: self.ids.len(),
            amount_min: self.amount_min,
            amount_max: self.amount_max,
        }
    }
}

pub fn type_hint(booking_type: Option<&str>, amount: Option<f64>) -> String {
    match booking_type.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.to_string(),
        None if amount.unwrap_or(0.0) < 0.0 => "debit".to_string(),
        None => "credit".to_string(),
    }
}

/// Group by exact text, in order of first appearance. The type hint comes
/// from the first row of each group.
pub fn group_by_text(rows: &[PendingTransaction]) -> Vec<TextGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<TextGroup> = Vec::new();

    for row in rows {
        let amount = row.booking_amount_value;
        match index.get(row.booking_text.as_str()) {
            Some(&i) => {
                let g = &mut groups[i];
                g.ids.push(row.id);
                if let Some(a) = amount {
                    g.amount_min = Some(g.amount_min.map_or(a, |m| m.min(a)));
                    g.amount_max = Some(g.amount_max.map_or(a, |m| m.max(a)));
                }
            }
            None => {
                index.insert(row.booking_text.as_str(), groups.len());
                groups.push(TextGroup {
                    text: row.booking_text.clone(),
                    ids: vec![row.id],
                    type_hint: type_hint(row.booking_type.as_deref(), amount),
                    amount_min: amount,
                    amount_max: amount,
                });
            }
        }
    }
    groups
}

/// Match a classifier reply to the keys that were sent. Every key must be
/// answered exactly once; extra keys are ignored.
fn index_results(
    items: &[ClassificationItem],
    results: Vec<Classification>,
) -> Result<HashMap<String, Classification>> {
    let expected: HashSet<&str> = items.iter().map(|i| i.key.as_str()).collect();
    let mut by_key = HashMap::with_capacity(results.len());
    for result in results {
        if expected.contains(result.key.as_str()) {
            if by_key.contains_key(&result.key) {
                return Err(Error::MalformedResponse(format!(
                    "classifier answered key {} more than once",
                    result.key
                )));
            }
            by_key.insert(result.key.clone(), result);
        } else {
            tracing::warn!(key = %result.key, "classifier returned an unknown key, ignoring");
        }
    }

    let missing: Vec<&str> = items
        .iter()
        .map(|i| i.key.as_str())
        .filter(|k| !by_key.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        return Err(Error::MalformedResponse(format!(
            "classifier response is missing keys: {}",
            missing.join(", ")
        )));
    }
    Ok(by_key)
}

fn category_update(group: &TextGroup, result: &Classification) -> CategoryUpdate {
    let subscription_period = if result.is_subscription {
        Some(result.subscription_period.unwrap_or(SubscriptionPeriod::Unknown))
    } else {
        None
    };

    CategoryUpdate {
        ids: group.ids.clone(),
        category: result.category.clone(),
        confidence: result.confidence,
        merchant: resolve_merchant(result.merchant.as_deref(), &group.text),
        is_subscription: result.is_subscription,
        subscription_period,
    }
}

/// Categorizes one import in classifier batches, then runs the recurring
/// passes over the owner's history.
#[derive(Clone)]
pub struct CategorizationProcessor {
    store: Arc<dyn TransactionStore>,
    classifier: Arc<dyn Classifier>,
    detector: PatternDetector,
    batch_size: usize,
}

impl CategorizationProcessor {
    pub fn new(store: Arc<dyn TransactionStore>, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            detector: PatternDetector::new(store.clone()),
            store,
            classifier,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_detector(mut self, detector: PatternDetector) -> Self {
        self.detector = detector;
        self
    }

    /// A failed batch aborts the import. Batches committed before it stay,
    /// and a rerun only sees rows that are still uncategorized.
    pub async fn categorize_import(
        &self,
        owner_token: &str,
        import_id: i64,
    ) -> Result<CategorizeOutcome> {
        let pending = self.store.pending_for_import(owner_token, import_id).await?;
        if pending.is_empty() {
            tracing::info!(owner_token, import_id, "nothing to categorize");
            return Ok(CategorizeOutcome::skipped());
        }

        let groups = group_by_text(&pending);
        let mut categorized = 0;
        let mut batches = 0;

        for (batch_no, chunk) in groups.chunks(self.batch_size).enumerate() {
            let offset = batch_no * self.batch_size;
            let items: Vec<ClassificationItem> = chunk
                .iter()
                .enumerate()
                .map(|(i, g)| g.to_item(format!("g{}", offset + i)))
                .collect();

            let results = self.classifier.classify_batch(&items).await?;
            let by_key = index_results(&items, results)?;

            let updates: Vec<CategoryUpdate> = chunk
                .iter()
                .zip(&items)
                .filter_map(|(group, item)| by_key.get(&item.key).map(|r| category_update(group, r)))
                .collect();

            let written = self.store.apply_category_batch(owner_token, &updates).await?;
            categorized += written;
            batches += 1;

            tracing::debug!(
                owner_token,
                import_id,
                batch = batch_no,
                groups = chunk.len(),
                written,
                model = self.classifier.model(),
                "batch categorized"
            );
        }

        let today = Utc::now().date_naive();
        let recurring_flagged =
            flag_recurring_merchants(self.store.as_ref(), owner_token, today).await?;

        let detection = match self.detector.detect_as_of(owner_token, today).await {
            Ok(stats) => Detection::Completed(stats),
            Err(e) => {
                tracing::warn!(owner_token, import_id, error = %e, "pattern detection failed, continuing");
                Detection::Degraded(e.to_string())
            }
        };

        tracing::info!(
            owner_token,
            import_id,
            transactions = categorized,
            groups = groups.len(),
            batches,
            recurring_flagged,
            "import categorized"
        );

        Ok(CategorizeOutcome {
            transactions_categorized: categorized,
            groups: groups.len(),
            batches,
            recurring_flagged,
            detection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        ClassifierFailure, MemoryTransactionStore, ScriptedClassifier, TransactionFixture,
    };
    use crate::enrich::classifier::MockClassifier;
    use chrono::{Days, NaiveDate};

    fn pending(id: i64, text: &str, ty: Option<&str>, amount: Option<f64>) -> PendingTransaction {
        PendingTransaction {
            id,
            booking_text: text.into(),
            booking_type: ty.map(str::to_string),
            booking_amount_value: amount,
        }
    }

    #[test]
    fn type_hint_prefers_booking_type() {
        assert_eq!(type_hint(Some("Lastschrift"), Some(5.0)), "Lastschrift");
        assert_eq!(type_hint(None, Some(-1.0)), "debit");
        assert_eq!(type_hint(Some("  "), Some(0.0)), "credit");
        assert_eq!(type_hint(None, None), "credit");
    }

    #[test]
    fn groups_keep_first_seen_order_and_amount_range() {
        let rows = vec![
            pending(1, "REWE", None, Some(-10.0)),
            pending(2, "NETFLIX", None, Some(-12.99)),
            pending(3, "REWE", None, Some(-30.5)),
            pending(4, "REWE", None, None),
        ];
        let groups = group_by_text(&rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].text, "REWE");
        assert_eq!(groups[0].ids, vec![1, 3, 4]);
        assert_eq!(groups[0].amount_min, Some(-30.5));
        assert_eq!(groups[0].amount_max, Some(-10.0));
        assert_eq!(groups[0].type_hint, "debit");
        assert_eq!(groups[1].ids, vec![2]);
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn processor(
        store: &Arc<MemoryTransactionStore>,
        classifier: Arc<dyn Classifier>,
        batch_size: usize,
    ) -> CategorizationProcessor {
        CategorizationProcessor::new(store.clone(), classifier).with_batch_size(batch_size)
    }

    #[tokio::test]
    async fn categorizes_every_row_of_every_group() {
        let store = Arc::new(MemoryTransactionStore::default());
        store.insert(TransactionFixture::new("o1", 7, "NETFLIX.COM", -12.99, today()));
        store.insert(TransactionFixture::new("o1", 7, "NETFLIX.COM", -12.99, today()));
        store.insert(TransactionFixture::new("o1", 7, "kiosk am eck 42", -3.0, today()));
        store.insert(TransactionFixture::new("o2", 7, "NETFLIX.COM", -12.99, today()));

        let outcome = processor(&store, Arc::new(MockClassifier::new()), 30)
            .categorize_import("o1", 7)
            .await
            .unwrap();

        assert_eq!(outcome.transactions_categorized, 3);
        assert_eq!(outcome.groups, 2);
        assert_eq!(outcome.batches, 1);
        assert!(matches!(outcome.detection, Detection::Completed(_)));

        let rows = store.rows_for("o1");
        let netflix = &rows[0];
        assert_eq!(netflix.booking_category.as_deref(), Some("Leisure > Streaming"));
        assert_eq!(netflix.category_source.as_deref(), Some("llm"));
        assert_eq!(netflix.merchant_normalized.as_deref(), Some("NETFLIX"));
        assert!(netflix.is_subscription);
        assert_eq!(netflix.period(), Some(SubscriptionPeriod::Monthly));

        let kiosk = &rows[2];
        assert_eq!(kiosk.merchant_normalized.as_deref(), Some("KIOSK AM ECK"));
        assert!(!kiosk.is_subscription);
        assert_eq!(kiosk.subscription_period, None);

        // other owner untouched
        assert!(store.rows_for("o2")[0].booking_category.is_none());
    }

    #[tokio::test]
    async fn rerun_is_a_noop() {
        let store = Arc::new(MemoryTransactionStore::default());
        store.insert(TransactionFixture::new("o1", 1, "REWE SAGT DANKE", -20.0, today()));

        let classifier = Arc::new(ScriptedClassifier::new());
        let p = processor(&store, classifier.clone(), 30);
        let first = p.categorize_import("o1", 1).await.unwrap();
        assert_eq!(first.transactions_categorized, 1);
        let before = store.rows_for("o1");

        let second = p.categorize_import("o1", 1).await.unwrap();
        assert_eq!(second, CategorizeOutcome::skipped());
        assert_eq!(classifier.calls(), 1);

        let after = store.rows_for("o1");
        assert_eq!(before[0].booking_category, after[0].booking_category);
        assert_eq!(before[0].category_confidence, after[0].category_confidence);
    }

    #[tokio::test]
    async fn batches_use_global_keys() {
        let store = Arc::new(MemoryTransactionStore::default());
        for i in 0..5 {
            store.insert(TransactionFixture::new("o1", 1, &format!("shop {i}"), -1.0, today()));
        }
        let classifier = Arc::new(ScriptedClassifier::new());
        let outcome = processor(&store, classifier.clone(), 2)
            .categorize_import("o1", 1)
            .await
            .unwrap();

        assert_eq!(outcome.batches, 3);
        assert_eq!(
            classifier.seen_keys(),
            vec!["g0", "g1", "g2", "g3", "g4"]
        );
    }

    #[tokio::test]
    async fn malformed_batch_fails_and_keeps_earlier_batches() {
        let store = Arc::new(MemoryTransactionStore::default());
        for i in 0..4 {
            store.insert(TransactionFixture::new("o1", 1, &format!("shop {i}"), -1.0, today()));
        }
        let classifier = Arc::new(ScriptedClassifier::failing_on(2, ClassifierFailure::MissingKey));

        let err = processor(&store, classifier, 2)
            .categorize_import("o1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(ref m) if m.contains("g3")));

        let rows = store.rows_for("o1");
        assert!(rows[0].booking_category.is_some());
        assert!(rows[1].booking_category.is_some());
        assert!(rows[2].booking_category.is_none());
        assert!(rows[3].booking_category.is_none());
    }

    #[tokio::test]
    async fn non_array_reply_fails_and_keeps_earlier_batches() {
        let store = Arc::new(MemoryTransactionStore::default());
        for i in 0..3 {
            store.insert(TransactionFixture::new("o1", 1, &format!("shop {i}"), -1.0, today()));
        }
        let classifier = Arc::new(ScriptedClassifier::failing_on(2, ClassifierFailure::NonArray));

        let err = processor(&store, classifier, 2)
            .categorize_import("o1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));

        let rows = store.rows_for("o1");
        assert!(rows[0].booking_category.is_some());
        assert!(rows[1].booking_category.is_some());
        assert!(rows[2].booking_category.is_none());
    }

    #[tokio::test]
    async fn duplicate_keys_in_reply_are_malformed() {
        let store = Arc::new(MemoryTransactionStore::default());
        store.insert(TransactionFixture::new("o1", 1, "shop a", -1.0, today()));
        store.insert(TransactionFixture::new("o1", 1, "shop b", -2.0, today()));
        let classifier = Arc::new(ScriptedClassifier::failing_on(1, ClassifierFailure::DuplicateKey));

        let err = processor(&store, classifier, 30)
            .categorize_import("o1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(ref m) if m.contains("g0")));
        assert!(store
            .rows_for("o1")
            .iter()
            .all(|r| r.booking_category.is_none()));
    }

    #[tokio::test]
    async fn unavailable_classifier_writes_nothing() {
        let store = Arc::new(MemoryTransactionStore::default());
        store.insert(TransactionFixture::new("o1", 1, "shop", -1.0, today()));
        let classifier = Arc::new(ScriptedClassifier::failing_on(1, ClassifierFailure::Unavailable));

        let err = processor(&store, classifier, 30)
            .categorize_import("o1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Classifier(_)));
        assert!(store.rows_for("o1")[0].booking_category.is_none());
    }

    #[tokio::test]
    async fn detector_failure_degrades_but_succeeds() {
        let store = Arc::new(MemoryTransactionStore::default());
        store.insert(TransactionFixture::new("o1", 1, "shop", -1.0, today()));
        store.fail_cohort_reads(true);

        let outcome = processor(&store, Arc::new(MockClassifier::new()), 30)
            .categorize_import("o1", 1)
            .await
            .unwrap();
        assert_eq!(outcome.transactions_categorized, 1);
        assert!(matches!(outcome.detection, Detection::Degraded(_)));
    }

    #[tokio::test]
    async fn netflix_history_becomes_monthly_subscription() {
        let store = Arc::new(MemoryTransactionStore::default());
        // The detector only considers positive amounts.
        let first = today().checked_sub_days(Days::new(30 * 11)).unwrap();
        for i in 0..12u64 {
            let date = first.checked_add_days(Days::new(30 * i)).unwrap();
            store.insert(TransactionFixture::new("o1", 3, "NETFLIX.COM", 12.99, date));
        }

        let outcome = processor(&store, Arc::new(MockClassifier::new()), 30)
            .categorize_import("o1", 3)
            .await
            .unwrap();

        match outcome.detection {
            Detection::Completed(stats) => {
                assert_eq!(stats.cohorts_examined, 1);
                assert_eq!(stats.monthly, 1);
                assert_eq!(stats.transactions_updated, 12);
            }
            other => panic!("unexpected detection {other:?}"),
        }

        for row in store.rows_for("o1") {
            assert!(row.is_recurring);
            assert!(row.is_subscription);
            assert_eq!(row.period(), Some(SubscriptionPeriod::Monthly));
            assert_eq!(row.recurrence_score, 1.0);
            assert_eq!(row.subscription_key.as_deref(), Some("NETFLIX|12.99"));
        }
    }
}
