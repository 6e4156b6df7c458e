//! Database row models.

pub mod catalog;
pub mod job;

pub use catalog::{DubTrackDbModel, MediaAssetDbModel};
pub use job::JobDbModel;
