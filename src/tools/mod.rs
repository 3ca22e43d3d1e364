//! Tool system: trait, schema validation, and the executor.

pub mod executor;
pub mod tool;
pub mod validation;

pub use executor::{aborted_output, ToolExecutor, DEFAULT_ABORT_GRACE};
pub use tool::{
    FnTool, ParameterBuilder, Tool, ToolDefinition, ToolInvocation, ToolOutput, ToolParameters,
    ToolUpdate, ToolUpdateCallback,
};
pub use validation::{validate_arguments, ValidationError};
