use enrichflow::config::DbSettings;
use enrichflow::db;
use enrichflow::enrich::{PatternDetector, TransactionsRepo};
use enrichflow::jobs::error_codes::suggested_action;
use enrichflow::jobs::{JobsRepo, MaintenanceRepo};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const USAGE: &str = "enrichctl <command>\n\
     Commands:\n\
     - migrate\n\
     - enqueue <owner_token> <import_id>\n\
     - show <job_id>\n\
     - counts\n\
     - reap <older_than_secs> [max_attempts]\n\
     - detect <owner_token>\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

fn usage_exit() -> ! {
    eprintln!("{USAGE}");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    enrichflow::telemetry::init(enrichflow::config::LogFormat::Pretty);

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage_exit();
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;
    let pool = db::connect(&url, &DbSettings::from_env()).await?;

    match args[1].as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "enqueue" => {
            let (Some(owner), Some(import_id)) = (args.get(2), args.get(3)) else {
                usage_exit();
            };
            let import_id: i64 = import_id.parse()?;
            let job_id = JobsRepo::new(pool.clone())
                .enqueue_categorize_import(owner, import_id)
                .await?;
            println!("+ enqueued categorize_import id={job_id}");
        }
        "show" => {
            let Some(id) = args.get(2) else { usage_exit() };
            let job_id: Uuid = id.parse()?;
            match JobsRepo::new(pool.clone()).get_job(job_id).await? {
                Some(job) => {
                    println!("{}", serde_json::to_string_pretty(&job)?);
                    if let Some(code) = job.last_error_code.as_deref() {
                        println!("suggested action: {}", suggested_action(code));
                    }
                }
                None => {
                    eprintln!("job {job_id} not found");
                    std::process::exit(1);
                }
            }
        }
        "counts" => {
            let c = JobsRepo::new(pool.clone()).status_counts().await?;
            println!(
                "jobs: queued={} running={} done={} failed={}",
                c.queued, c.running, c.done, c.failed
            );
        }
        "reap" => {
            let Some(secs) = args.get(2) else { usage_exit() };
            let secs: u64 = secs.parse()?;
            let max_attempts: i32 = match args.get(3) {
                Some(s) => s.parse()?,
                None => enrichflow::config::DEFAULT_MAX_ATTEMPTS,
            };
            let report = MaintenanceRepo::new(pool.clone())
                .requeue_stale(Duration::from_secs(secs), max_attempts)
                .await?;
            println!(
                "reaped: requeued={} failed={}",
                report.requeued, report.failed
            );
        }
        "detect" => {
            let Some(owner) = args.get(2) else { usage_exit() };
            let store = Arc::new(TransactionsRepo::new(pool.clone()));
            let stats = PatternDetector::new(store).detect(owner).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        other => {
            eprintln!("Unknown command: {other}");
            usage_exit();
        }
    }

    Ok(())
}
