mod checker;
mod executor;
mod runner;

pub use checker::ExecutionReason;
pub use executor::{Executor, Outcome, WorkOutcome, WorkState};
pub use runner::BuildReport;

pub(crate) use runner::run_work_parallel;
