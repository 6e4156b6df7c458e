//! Repository traits and their SQLx implementations.

pub mod catalog;
pub mod job;

pub use catalog::{AssetCatalog, SqlxAssetCatalog};
pub use job::{JobRepository, SqlxJobRepository, StaleLocks};
