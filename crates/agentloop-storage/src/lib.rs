pub mod checkpoint;
pub mod conversation;
pub mod error;

pub use checkpoint::*;
pub use conversation::*;
pub use error::*;
