pub mod archive_org;
pub mod dailymotion;
pub mod direct;
pub mod streamable;
pub mod vimeo;
pub mod youtube;

pub use archive_org::ArchiveOrg;
pub use dailymotion::Dailymotion;
pub use direct::DirectFile;
pub use streamable::Streamable;
pub use vimeo::Vimeo;
pub use youtube::YouTube;
