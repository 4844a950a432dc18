//! Image building: Dockerfile parsing, RUN execution and the layer cache.

pub mod dockerfile;
pub mod engine;
pub mod runner;

pub use dockerfile::Dockerfile;
pub use engine::{BuildResult, ImageBuilder};
pub use runner::{CommandRunner, RunRequest, ShellRunner};
