mod files;
mod quota;
mod registry;
mod tasks;

pub use files::FileStore;
pub use quota::{Admission, QuotaGuard};
pub use registry::TaskRegistry;
pub use tasks::{TaskService, Upload};
