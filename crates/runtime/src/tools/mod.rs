//! Tool registry boundary and tool-level errors.

pub mod errors;
mod registry;

pub use errors::ToolError;
pub use registry::{EmptyRegistry, ToolAllowList, ToolRegistry};
