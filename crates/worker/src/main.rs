use enrichflow::api;
use enrichflow::config;
use enrichflow::db;
use enrichflow::telemetry;

use enrichflow::enrich::{
    CategorizationProcessor, Classifier, ClassifierClient, TransactionStore, TransactionsRepo,
};
use enrichflow::jobs::{JobStore, JobsRepo, MaintenanceRepo, Worker, WorkerConfig};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init(cfg.log_format);

    tracing::info!(
        worker_id = %cfg.worker_id,
        poll_interval_ms = cfg.poll_interval.as_millis() as u64,
        batch_size = cfg.batch_size,
        admin_api = %cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        reap_stale_after_secs = ?cfg.reap_stale_after.map(|d| d.as_secs()),
        max_attempts = cfg.max_attempts,
        handler_timeout_secs = ?cfg.handler_timeout.map(|d| d.as_secs()),
        db_max_connections = cfg.db.max_connections,
        "enrichflow worker starting"
    );

    let pool = db::connect(&cfg.database_url, &cfg.db).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs_repo = JobsRepo::new(pool.clone());
    let maintenance_repo = MaintenanceRepo::new(pool.clone());
    let transactions: Arc<dyn TransactionStore> = Arc::new(TransactionsRepo::new(pool.clone()));

    let classifier = ClassifierClient::from_env()?;
    tracing::info!(model = %classifier.model(), "classifier ready");
    let classifier: Arc<dyn Classifier> = Arc::new(classifier);

    let processor =
        CategorizationProcessor::new(transactions, classifier).with_batch_size(cfg.batch_size);
    let registry = build_registry(processor, cfg.handler_timeout);

    let shutdown = CancellationToken::new();

    // ---- API task ----
    let api_state = api::ApiState {
        jobs: jobs_repo.clone(),
        maintenance: maintenance_repo.clone(),
        max_attempts: cfg.max_attempts,
    };
    let app = api::router(api_state);
    let api_addr = cfg.admin_addr.clone();
    let api_shutdown = shutdown.clone();

    let mut api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
                .await?;
        } else {
            api_shutdown.cancelled().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Reaper task (opt-in) ----
    let mut reaper_handle = {
        let maintenance = maintenance_repo.clone();
        let reap_after = cfg.reap_stale_after;
        let max_attempts = cfg.max_attempts;
        let reaper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let Some(older_than) = reap_after else {
                reaper_shutdown.cancelled().await;
                return Ok::<(), anyhow::Error>(());
            };
            let interval = (older_than / 2).max(Duration::from_secs(1));
            loop {
                match maintenance.requeue_stale(older_than, max_attempts).await {
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = ?e, "reaper pass failed"),
                }
                tokio::select! {
                    _ = reaper_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            Ok(())
        })
    };

    // ---- Worker loop task ----
    let jobs: Arc<dyn JobStore> = Arc::new(jobs_repo);
    let worker = Worker::new(
        jobs,
        registry,
        WorkerConfig::new(cfg.worker_id.clone()).poll_interval(cfg.poll_interval),
    );
    let worker_shutdown = shutdown.clone();
    let mut worker_handle = tokio::spawn(async move { worker.run(worker_shutdown).await });

    // ---- Signals ----
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, finishing in-flight job");
            }
            shutdown.cancel();
        });
    }

    let first = tokio::select! {
        res = &mut api_handle => res,
        res = &mut worker_handle => res,
        res = &mut reaper_handle => res,
    };
    shutdown.cancel();
    if !worker_handle.is_finished() {
        worker_handle.await??;
    }
    first??;

    tracing::info!("enrichflow worker stopped");
    Ok(())
}
