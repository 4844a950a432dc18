//! Container lifecycle: creation, process supervision, logs and commits.

mod logs;
mod manager;
pub mod process;

pub use logs::{LogBuffer, LogStream};
pub use manager::ContainerManager;
