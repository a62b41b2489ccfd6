mod forms;
mod task;
mod status;

pub use forms::ProcessForm;
pub use task::{ResultMap, Task, TaskId, TaskParams, TaskPatch, TaskStatus};
pub use status::{project, QuotaUsage, StatusPayload, TaskListing};
