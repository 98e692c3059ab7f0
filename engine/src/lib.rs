pub mod classifier;
pub mod codegen;
pub mod config;
mod error;
pub mod format;
pub mod limiter;
pub mod orchestrator;
pub mod preview;
pub mod resolver;
pub mod serializer;
pub mod telemetry;
pub mod types;

pub use classifier::ErrorKind;
pub use codegen::{CodeGenerator, GeminiGenerator};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use limiter::{AdmissionError, AdmissionLimiter, AdmissionPolicy};
pub use orchestrator::{Orchestrator, OrchestratorSettings, build_store};
pub use resolver::{FileDescription, ResolutionFailure, Resolver};
pub use types::{
    Cell, Envelope, ExecutionRequest, ExecutionResult, Failure, FileReference, Payload,
    ResultTable, TextFallback,
};
