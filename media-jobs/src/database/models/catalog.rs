//! Catalog rows produced by finished pipelines.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A hosted video produced by the video acquisition pipeline.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct MediaAssetDbModel {
    pub id: String,
    pub job_id: String,
    pub source_url: String,
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_ms: Option<i64>,
    pub video_codec: Option<String>,
    pub created_at: i64,
}

/// A dubbed audio track for a movie.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DubTrackDbModel {
    pub id: String,
    pub job_id: String,
    pub movie_id: String,
    pub language: String,
    pub storage_key: String,
    pub format: String,
    pub duration_ms: Option<i64>,
    pub voice_model: String,
    pub created_at: i64,
}
