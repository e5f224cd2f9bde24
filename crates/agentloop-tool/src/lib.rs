pub mod mcp;
pub mod registry;
pub mod tool;

pub use mcp::*;
pub use registry::*;
pub use tool::*;
