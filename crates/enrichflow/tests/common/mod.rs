use chrono::NaiveDate;
use enrichflow::enrich::transactions::NewTransaction;
use enrichflow::enrich::TransactionsRepo;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Connects to `TEST_DATABASE_URL`, migrates and truncates.
///
/// Returns `None` when the variable is unset so the suite still passes on
/// machines without Postgres.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping database test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs, transactions RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

#[allow(dead_code)]
pub fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[allow(dead_code)]
pub async fn insert_tx(
    repo: &TransactionsRepo,
    owner: &str,
    import_id: i64,
    text: &str,
    amount: f64,
    date: NaiveDate,
) -> i64 {
    let new = NewTransaction {
        owner_token: owner.to_string(),
        import_id,
        booking_hash: format!("{text}|{amount}|{date}"),
        booking_text: text.to_string(),
        booking_type: None,
        booking_amount_value: Some(amount),
        booking_date: Some(date),
    };
    repo.insert(&new)
        .await
        .expect("insert failed")
        .expect("duplicate booking hash")
}
