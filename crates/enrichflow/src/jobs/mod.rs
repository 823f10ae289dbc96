pub mod error_codes;
pub mod maintenance;
pub mod model;
pub mod registry;
pub mod repo;
pub mod runner;
pub mod store;
pub mod worker;

pub use maintenance::{MaintenanceRepo, ReapReport};
pub use model::{Job, JobStatus, NewJob, CATEGORIZE_IMPORT};
pub use registry::{HandlerOptions, HandlerRegistry, JobContext, JobError};
pub use repo::JobsRepo;
pub use store::JobStore;
pub use worker::{TickOutcome, Worker, WorkerConfig};
