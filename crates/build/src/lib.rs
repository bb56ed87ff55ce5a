//! PaaS build: runs OCI image builds and repository hooks as external processes.

#![forbid(unsafe_code)]

pub mod env;
pub mod hooks;
pub mod oci;
pub mod orchestrator;
pub mod process;

pub use env::build_env;
pub use hooks::HookRunner;
pub use oci::OciBuilder;
pub use orchestrator::{BuildJob, BuildOrchestrator};
pub use process::{ProcessHandle, ProcessOutput, ProcessSpawner, TokioProcessSpawner};
