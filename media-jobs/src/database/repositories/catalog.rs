//! Asset catalog: where finished pipelines record what they produced.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{DubTrackDbModel, MediaAssetDbModel};
use crate::database::retry::retry_on_sqlite_busy;

#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// Insert or replace the asset produced by a job. Re-running the
    /// finalize phase for the same job is a no-op beyond refreshing fields.
    async fn record_media_asset(&self, asset: &MediaAssetDbModel) -> Result<()>;
    async fn find_media_asset(&self, id: &str) -> Result<Option<MediaAssetDbModel>>;
    async fn media_asset_for_job(&self, job_id: &str) -> Result<Option<MediaAssetDbModel>>;

    async fn record_dub_track(&self, track: &DubTrackDbModel) -> Result<()>;
    async fn dub_tracks_for_movie(&self, movie_id: &str) -> Result<Vec<DubTrackDbModel>>;
}

pub struct SqlxAssetCatalog {
    pool: SqlitePool,
}

impl SqlxAssetCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetCatalog for SqlxAssetCatalog {
    async fn record_media_asset(&self, asset: &MediaAssetDbModel) -> Result<()> {
        retry_on_sqlite_busy("record_media_asset", || async {
            sqlx::query(
                r#"
                INSERT INTO media_asset (
                    id, job_id, source_url, storage_key, content_type, size_bytes,
                    width, height, duration_ms, video_codec, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job_id) DO UPDATE SET
                    storage_key = excluded.storage_key,
                    content_type = excluded.content_type,
                    size_bytes = excluded.size_bytes,
                    width = excluded.width,
                    height = excluded.height,
                    duration_ms = excluded.duration_ms,
                    video_codec = excluded.video_codec
                "#,
            )
            .bind(&asset.id)
            .bind(&asset.job_id)
            .bind(&asset.source_url)
            .bind(&asset.storage_key)
            .bind(&asset.content_type)
            .bind(asset.size_bytes)
            .bind(asset.width)
            .bind(asset.height)
            .bind(asset.duration_ms)
            .bind(&asset.video_codec)
            .bind(asset.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn find_media_asset(&self, id: &str) -> Result<Option<MediaAssetDbModel>> {
        Ok(
            sqlx::query_as::<_, MediaAssetDbModel>("SELECT * FROM media_asset WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn media_asset_for_job(&self, job_id: &str) -> Result<Option<MediaAssetDbModel>> {
        Ok(
            sqlx::query_as::<_, MediaAssetDbModel>("SELECT * FROM media_asset WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn record_dub_track(&self, track: &DubTrackDbModel) -> Result<()> {
        retry_on_sqlite_busy("record_dub_track", || async {
            sqlx::query(
                r#"
                INSERT INTO dub_track (
                    id, job_id, movie_id, language, storage_key, format,
                    duration_ms, voice_model, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(job_id) DO UPDATE SET
                    storage_key = excluded.storage_key,
                    format = excluded.format,
                    duration_ms = excluded.duration_ms,
                    voice_model = excluded.voice_model
                "#,
            )
            .bind(&track.id)
            .bind(&track.job_id)
            .bind(&track.movie_id)
            .bind(&track.language)
            .bind(&track.storage_key)
            .bind(&track.format)
            .bind(track.duration_ms)
            .bind(&track.voice_model)
            .bind(track.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn dub_tracks_for_movie(&self, movie_id: &str) -> Result<Vec<DubTrackDbModel>> {
        Ok(sqlx::query_as::<_, DubTrackDbModel>(
            "SELECT * FROM dub_track WHERE movie_id = ? ORDER BY created_at",
        )
        .bind(movie_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
