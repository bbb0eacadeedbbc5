//! CLI commands

mod cache;
mod complete;
mod completions;
mod decide;
mod init;
mod plan;
mod status;
mod subtask;
mod validate;

pub use cache::CacheCommand;
pub use complete::CompleteCommand;
pub use completions::CompletionsCommand;
pub use decide::DecideCommand;
pub use init::InitCommand;
pub use plan::PlanCommand;
pub use status::StatusCommand;
pub use subtask::SubtaskCommand;
pub use validate::ValidateCommand;
