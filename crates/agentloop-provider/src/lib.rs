pub mod provider;
pub mod stream;
pub mod token;

pub use provider::*;
pub use stream::*;
pub use token::*;
