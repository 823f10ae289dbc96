//! Amount/interval based recurring and subscription detection.
//!
//! Cohorts are an owner's transactions sharing merchant and amount (to the
//! cent). Day gaps between consecutive members decide the billing period.

use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde::Serialize;

use crate::enrich::transactions::{CohortMember, CohortVerdict, SubscriptionPeriod, TransactionStore};
use crate::error::Result;

/// Case-insensitive substrings of a category that mark a subscription even
/// without a detected period.
pub const SUBSCRIPTION_HINTS: &[&str] = &[
    "abo",
    "subscription",
    "streaming",
    "insurance",
    "versicherung",
    "rent",
    "miete",
    "internet",
    "phone",
    "handy",
    "mobilfunk",
    "nebenkosten",
    "utilities",
    "membership",
];

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub window_months: u32,
    pub monthly_gap_days: RangeInclusive<i64>,
    pub yearly_gap_days: RangeInclusive<i64>,
    pub min_monthly_occurrences: usize,
    pub min_monthly_signals: usize,
    pub min_recurring_months: usize,
    pub min_recurring_occurrences: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_months: 24,
            monthly_gap_days: 25..=35,
            yearly_gap_days: 330..=400,
            min_monthly_occurrences: 3,
            min_monthly_signals: 2,
            min_recurring_months: 3,
            min_recurring_occurrences: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    pub cohorts_examined: u64,
    pub cohorts_updated: u64,
    pub monthly: u64,
    pub yearly: u64,
    pub transactions_updated: u64,
}

pub fn amount_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn cohort_key(merchant: &str, cents: i64) -> String {
    format!("{}|{}.{:02}", merchant, cents / 100, (cents % 100).abs())
}

/// Period and score for a cohort's consecutive day gaps.
pub fn classify_gaps(gaps: &[i64], cfg: &DetectorConfig) -> (Option<SubscriptionPeriod>, f64) {
    if gaps.is_empty() {
        return (None, 0.0);
    }
    let occurrences = gaps.len() + 1;
    let total = gaps.len() as f64;

    let monthly = gaps
        .iter()
        .filter(|g| cfg.monthly_gap_days.contains(g))
        .count();
    let yearly = gaps
        .iter()
        .filter(|g| cfg.yearly_gap_days.contains(g))
        .count();

    if occurrences >= cfg.min_monthly_occurrences && monthly >= cfg.min_monthly_signals {
        (Some(SubscriptionPeriod::Monthly), monthly as f64 / total)
    } else if yearly >= 1 {
        (Some(SubscriptionPeriod::Yearly), yearly as f64 / total)
    } else {
        (None, 0.0)
    }
}

pub fn has_subscription_hint(category: &str) -> bool {
    let category = category.to_lowercase();
    SUBSCRIPTION_HINTS.iter().any(|hint| category.contains(hint))
}

/// Verdict for one cohort. `members` must be sorted by date.
pub fn evaluate_cohort(key: String, members: &[CohortMember], cfg: &DetectorConfig) -> CohortVerdict {
    let gaps: Vec<i64> = members
        .windows(2)
        .map(|w| (w[1].booking_date - w[0].booking_date).num_days())
        .collect();
    let (period, score) = classify_gaps(&gaps, cfg);

    let distinct_months: HashSet<(i32, u32)> = members
        .iter()
        .map(|m| (m.booking_date.year(), m.booking_date.month()))
        .collect();

    let is_recurring = period.is_some()
        || (distinct_months.len() >= cfg.min_recurring_months
            && members.len() >= cfg.min_recurring_occurrences);

    let hinted = members
        .iter()
        .filter_map(|m| m.booking_category.as_deref())
        .any(has_subscription_hint);
    let is_subscription = period.is_some() || hinted;

    let period = match period {
        Some(p) => Some(p),
        None if is_subscription => Some(SubscriptionPeriod::Unknown),
        None => None,
    };

    CohortVerdict {
        key,
        ids: members.iter().map(|m| m.id).collect(),
        is_recurring,
        is_subscription,
        period,
        score,
    }
}

/// Group rows into cohorts of two or more, each sorted chronologically.
pub fn build_cohorts(rows: Vec<CohortMember>) -> Vec<(String, Vec<CohortMember>)> {
    let mut cohorts: BTreeMap<(String, i64), Vec<CohortMember>> = BTreeMap::new();
    for row in rows {
        let cents = amount_cents(row.amount);
        cohorts
            .entry((row.merchant.clone(), cents))
            .or_default()
            .push(row);
    }

    cohorts
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|((merchant, cents), mut members)| {
            members.sort_by(|a, b| a.booking_date.cmp(&b.booking_date).then(a.id.cmp(&b.id)));
            (cohort_key(&merchant, cents), members)
        })
        .collect()
}

#[derive(Clone)]
pub struct PatternDetector {
    store: Arc<dyn TransactionStore>,
    cfg: DetectorConfig,
}

impl PatternDetector {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self::with_config(store, DetectorConfig::default())
    }

    pub fn with_config(store: Arc<dyn TransactionStore>, cfg: DetectorConfig) -> Self {
        Self { store, cfg }
    }

    pub async fn detect(&self, owner_token: &str) -> Result<DetectorStats> {
        self.detect_as_of(owner_token, Utc::now().date_naive()).await
    }

    pub async fn detect_as_of(&self, owner_token: &str, today: NaiveDate) -> Result<DetectorStats> {
        let since = today
            .checked_sub_months(Months::new(self.cfg.window_months))
            .unwrap_or(NaiveDate::MIN);

        let rows = self.store.cohort_candidates(owner_token, since).await?;
        let mut stats = DetectorStats::default();

        for (key, members) in build_cohorts(rows) {
            stats.cohorts_examined += 1;
            let verdict = evaluate_cohort(key, &members, &self.cfg);

            match verdict.period {
                Some(SubscriptionPeriod::Monthly) => stats.monthly += 1,
                Some(SubscriptionPeriod::Yearly) => stats.yearly += 1,
                _ => {}
            }

            let updated = self.store.apply_cohort_verdict(owner_token, &verdict).await?;
            if updated > 0 {
                stats.cohorts_updated += 1;
                stats.transactions_updated += updated;
            }
        }

        tracing::info!(
            owner_token,
            cohorts = stats.cohorts_examined,
            monthly = stats.monthly,
            yearly = stats.yearly,
            transactions_updated = stats.transactions_updated,
            "pattern detection finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DetectorConfig {
        DetectorConfig::default()
    }

    fn member(id: i64, date: NaiveDate, category: Option<&str>) -> CohortMember {
        CohortMember {
            id,
            merchant: "NETFLIX".into(),
            amount: 12.99,
            booking_date: date,
            booking_category: category.map(str::to_string),
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn gap_boundaries() {
        assert_eq!(
            classify_gaps(&[28, 29, 31], &cfg()),
            (Some(SubscriptionPeriod::Monthly), 1.0)
        );
        assert_eq!(classify_gaps(&[40], &cfg()), (None, 0.0));
        assert_eq!(
            classify_gaps(&[365], &cfg()),
            (Some(SubscriptionPeriod::Yearly), 1.0)
        );
        assert_eq!(
            classify_gaps(&[25, 35], &cfg()),
            (Some(SubscriptionPeriod::Monthly), 1.0)
        );
        assert_eq!(classify_gaps(&[24, 36], &cfg()), (None, 0.0));
        assert_eq!(
            classify_gaps(&[330], &cfg()),
            (Some(SubscriptionPeriod::Yearly), 1.0)
        );
        assert_eq!(classify_gaps(&[401], &cfg()), (None, 0.0));
        assert_eq!(classify_gaps(&[], &cfg()), (None, 0.0));
    }

    #[test]
    fn single_monthly_gap_is_not_enough() {
        assert_eq!(classify_gaps(&[30], &cfg()), (None, 0.0));
        assert_eq!(classify_gaps(&[30, 90], &cfg()), (None, 0.0));
    }

    #[test]
    fn monthly_score_is_share_of_gaps() {
        let (period, score) = classify_gaps(&[30, 30, 60, 30], &cfg());
        assert_eq!(period, Some(SubscriptionPeriod::Monthly));
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn yearly_needs_no_minimum_occurrences() {
        let (period, score) = classify_gaps(&[365, 100], &cfg());
        assert_eq!(period, Some(SubscriptionPeriod::Yearly));
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn monthly_cohort_is_recurring_subscription() {
        let members: Vec<_> = (0..6)
            .map(|i| member(i, ymd(2024, 1 + i as u32, 5), None))
            .collect();
        let v = evaluate_cohort("NETFLIX|12.99".into(), &members, &cfg());
        assert!(v.is_recurring);
        assert!(v.is_subscription);
        assert_eq!(v.period, Some(SubscriptionPeriod::Monthly));
        assert_eq!(v.score, 1.0);
        assert_eq!(v.ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn hint_only_subscription_gets_unknown_period() {
        let members = vec![
            member(1, ymd(2024, 1, 1), Some("Versicherung")),
            member(2, ymd(2024, 2, 20), None),
        ];
        let v = evaluate_cohort("k".into(), &members, &cfg());
        assert!(v.is_subscription);
        assert!(!v.is_recurring);
        assert_eq!(v.period, Some(SubscriptionPeriod::Unknown));
        assert_eq!(v.score, 0.0);
    }

    #[test]
    fn irregular_but_spread_cohort_is_recurring_only() {
        let members = vec![
            member(1, ymd(2024, 1, 1), Some("Living > Groceries")),
            member(2, ymd(2024, 2, 15), None),
            member(3, ymd(2024, 4, 2), None),
        ];
        let v = evaluate_cohort("k".into(), &members, &cfg());
        assert!(v.is_recurring);
        assert!(!v.is_subscription);
        assert_eq!(v.period, None);
    }

    #[test]
    fn cohorts_bucket_by_cents_and_drop_singletons() {
        let rows = vec![
            CohortMember {
                id: 3,
                merchant: "NETFLIX".into(),
                amount: 12.99,
                booking_date: ymd(2024, 3, 1),
                booking_category: None,
            },
            CohortMember {
                id: 1,
                merchant: "NETFLIX".into(),
                amount: 12.990000001,
                booking_date: ymd(2024, 1, 1),
                booking_category: None,
            },
            CohortMember {
                id: 2,
                merchant: "NETFLIX".into(),
                amount: 17.99,
                booking_date: ymd(2024, 2, 1),
                booking_category: None,
            },
        ];
        let cohorts = build_cohorts(rows);
        assert_eq!(cohorts.len(), 1);
        assert_eq!(cohorts[0].0, "NETFLIX|12.99");
        let ids: Vec<_> = cohorts[0].1.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn cohort_key_pads_cents() {
        assert_eq!(cohort_key("RENT", 90005), "RENT|900.05");
        assert_eq!(cohort_key("X", 7), "X|0.07");
    }

    #[tokio::test]
    async fn existing_monthly_period_is_not_downgraded() {
        use crate::testing::{MemoryTransactionStore, TransactionFixture};

        let store = Arc::new(MemoryTransactionStore::default());
        for date in [ymd(2025, 1, 10), ymd(2026, 1, 10)] {
            store.insert(
                TransactionFixture::new("o1", 1, "HUK COBURG", 80.0, date)
                    .categorized("HUK", "Versicherung")
                    .subscription(SubscriptionPeriod::Monthly),
            );
        }
        // Outside the 24 month window.
        store.insert(
            TransactionFixture::new("o1", 1, "HUK COBURG", 80.0, ymd(2023, 1, 10))
                .categorized("HUK", "Versicherung"),
        );

        let stats = PatternDetector::new(store.clone())
            .detect_as_of("o1", ymd(2026, 2, 1))
            .await
            .unwrap();
        assert_eq!(stats.cohorts_examined, 1);
        assert_eq!(stats.yearly, 1);
        assert_eq!(stats.transactions_updated, 2);

        let rows = store.rows_for("o1");
        for row in &rows[..2] {
            assert_eq!(row.period(), Some(SubscriptionPeriod::Monthly));
            assert_eq!(row.subscription_key.as_deref(), Some("HUK|80.00"));
            assert_eq!(row.recurrence_score, 1.0);
            assert!(row.is_subscription);
            assert!(row.is_recurring);
        }
        assert_eq!(rows[2].subscription_key, None);
    }

    #[tokio::test]
    async fn three_netflix_charges_become_monthly_subscription() {
        use crate::testing::{MemoryTransactionStore, TransactionFixture};

        let store = Arc::new(MemoryTransactionStore::default());
        for date in [ymd(2024, 1, 5), ymd(2024, 2, 4), ymd(2024, 3, 6)] {
            store.insert(
                TransactionFixture::new("o1", 1, "NETFLIX.COM", 12.99, date)
                    .categorized("NETFLIX", "Leisure > Streaming"),
            );
        }

        let stats = PatternDetector::new(store.clone())
            .detect_as_of("o1", ymd(2024, 4, 1))
            .await
            .unwrap();
        assert_eq!(stats.monthly, 1);

        let rows = store.rows_for("o1");
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert!(row.is_recurring);
            assert!(row.is_subscription);
            assert_eq!(row.period(), Some(SubscriptionPeriod::Monthly));
            assert_eq!(row.recurrence_score, 1.0);
            assert_eq!(row.subscription_key.as_deref(), Some("NETFLIX|12.99"));
        }
    }

    #[test]
    fn hints_match_case_insensitively() {
        assert!(has_subscription_hint("Wohnen > MIETE"));
        assert!(has_subscription_hint("Leisure > Streaming"));
        assert!(!has_subscription_hint("Living > Groceries"));
    }
}
