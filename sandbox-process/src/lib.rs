mod command;
mod config;
mod limits;
mod monitor;
mod paths;
mod prerequisites;
mod process;
mod python;
mod sandbox;

pub use config::{Isolation, ProcessSandboxConfig};
pub use paths::ExecutionPaths;
pub use prerequisites::check_prerequisites;
pub use python::PythonRuntime;
pub use sandbox::ProcessSandbox;
