pub mod admission;
pub mod job;
pub mod priority;
pub mod store;

pub use job::{Job, JobStatus};
pub use store::QueueStore;
