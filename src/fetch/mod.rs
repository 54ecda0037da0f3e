//! Fetch scheduling: deduplicated, priority-ordered, strategy-bounded

mod retry;
mod scheduler;
mod task;

pub use scheduler::FetchScheduler;

pub(crate) use retry::RunnerCtx;
