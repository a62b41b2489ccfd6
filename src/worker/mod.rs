mod dispatcher;
mod reaper;
mod worker;

pub use dispatcher::{job_queue, DispatchError, JobDispatcher, JobQueue};
pub use reaper::{ReapReport, Reaper};
pub use worker::{process_job, JobOutcome, WorkerContext, WorkerPool, WorkerSettings};
