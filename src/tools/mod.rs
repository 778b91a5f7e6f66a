//! Tool surface: trait, registry, builtins, and the confirmation gate.

pub mod builtin;
pub mod confirm;
pub mod registry;
pub mod tool;

pub use builtin::{builtin_source, DelegateTool};
pub use confirm::{ConfirmationGate, PendingCall};
pub use registry::{ToolRegistry, ToolSource};
pub use tool::{Tool, ToolContext, ToolOutput};
