use enrichflow::enrich::{CategorizationProcessor, Detection};
use enrichflow::jobs::error_codes::ErrorCode;
use enrichflow::jobs::registry::{boxed, parse_payload};
use enrichflow::jobs::{HandlerOptions, HandlerRegistry, JobError, CATEGORIZE_IMPORT};
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
struct CategorizeImportPayload {
    import_id: i64,
}

pub fn build_registry(
    processor: CategorizationProcessor,
    handler_timeout: Option<Duration>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    let mut opts = HandlerOptions::new();
    if let Some(dur) = handler_timeout {
        opts = opts.timeout(dur);
    }

    registry.register_with_options(
        CATEGORIZE_IMPORT,
        move |job, ctx| {
            let processor = processor.clone();
            boxed(async move {
                let payload: CategorizeImportPayload = parse_payload(job)?;
                if payload.import_id <= 0 {
                    return Err(JobError::with_code(
                        ErrorCode::BadPayload,
                        "import_id must be positive",
                    ));
                }

                let outcome = processor
                    .categorize_import(&job.owner_token, payload.import_id)
                    .await?;

                if let Detection::Degraded(reason) = &outcome.detection {
                    tracing::warn!(
                        job_id = %job.id,
                        worker_id = %ctx.worker_id,
                        import_id = payload.import_id,
                        %reason,
                        "categorized without pattern detection"
                    );
                }
                Ok(())
            })
        },
        opts,
    );

    registry
}
