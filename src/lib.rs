//! deploy-pipeline - fetch, build, push and deploy a containerized service

pub mod cli;
pub mod core;
pub mod execution;
pub mod health;
pub mod persistence;
pub mod tools;

// Re-export commonly used types
pub use core::{
    ExecutionStatus, ImageReference, Pipeline, PipelineContext, PipelineError, RunInputs, Step,
    StepState,
};
pub use execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
pub use tools::{SubprocessRunner, ToolRunner};
