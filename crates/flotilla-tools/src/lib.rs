pub mod builtin;
pub mod registry;
pub mod serialized;

pub use registry::ToolRegistry;
pub use serialized::{EditLock, SerializedTool};
