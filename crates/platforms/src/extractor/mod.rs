pub mod error;
pub mod platform;
pub mod platform_extractor;
pub mod platforms;
pub mod registry;
pub mod utils;
mod default;

pub use default::default_registry;
