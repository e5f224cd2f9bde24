pub mod loader;
pub mod schema;
pub mod settings_provider;

pub use loader::{load_settings, ConfigLoader};
pub use schema::*;
pub use settings_provider::{SettingsProvider, StaticSettings};
