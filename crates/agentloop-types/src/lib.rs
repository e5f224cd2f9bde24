pub mod checkpoint;
pub mod content;
pub mod tool_result;

pub use checkpoint::*;
pub use content::*;
pub use tool_result::*;
