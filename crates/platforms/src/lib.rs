//! Resolve video platform page URLs into direct media URLs.
//!
//! Each platform is a [`PlatformExtractor`] registered in an
//! [`ExtractorRegistry`]; callers never branch on the platform themselves.

pub mod extractor;

pub use extractor::default_registry;
pub use extractor::error::{ExtractorError, ExtractorErrorKind};
pub use extractor::platform::Platform;
pub use extractor::platform_extractor::{Extraction, HttpExtractor, PlatformExtractor};
pub use extractor::registry::{DEFAULT_CACHE_TTL, ExtractorRegistry, Resolved};
