use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Months, NaiveDate};

use crate::enrich::transactions::{MerchantActivity, TransactionStore};
use crate::error::Result;

pub const COARSE_WINDOW_MONTHS: u32 = 18;
pub const MIN_DISTINCT_MONTHS: usize = 3;
pub const MIN_TRANSACTIONS: usize = 3;

/// Ids of every row whose merchant shows up in at least three distinct
/// calendar months across at least three transactions.
pub fn recurring_merchant_ids(activity: &[MerchantActivity]) -> Vec<i64> {
    let mut by_merchant: BTreeMap<&str, Vec<&MerchantActivity>> = BTreeMap::new();
    for row in activity {
        by_merchant.entry(row.merchant.as_str()).or_default().push(row);
    }

    by_merchant
        .into_values()
        .filter(|rows| {
            let months: HashSet<(i32, u32)> = rows
                .iter()
                .map(|r| (r.booking_date.year(), r.booking_date.month()))
                .collect();
            rows.len() >= MIN_TRANSACTIONS && months.len() >= MIN_DISTINCT_MONTHS
        })
        .flatten()
        .map(|r| r.id)
        .collect()
}

/// Coarse pass over an owner's last 18 months. Returns rows newly flagged.
pub async fn flag_recurring_merchants(
    store: &dyn TransactionStore,
    owner_token: &str,
    today: NaiveDate,
) -> Result<u64> {
    let since = today
        .checked_sub_months(Months::new(COARSE_WINDOW_MONTHS))
        .unwrap_or(NaiveDate::MIN);

    let activity = store.merchant_activity(owner_token, since).await?;
    let ids = recurring_merchant_ids(&activity);
    if ids.is_empty() {
        return Ok(0);
    }

    let flagged = store.mark_recurring(owner_token, &ids).await?;
    tracing::debug!(owner_token, candidates = ids.len(), flagged, "coarse recurring pass");
    Ok(flagged)
}
