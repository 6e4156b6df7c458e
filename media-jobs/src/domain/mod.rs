//! Domain types shared by the queue, the worker and the pipelines.

pub mod backoff;
pub mod checkpoint;
pub mod failure;
pub mod job;

pub use backoff::{BACKOFF_SCHEDULE_SECS, FailOutcome, backoff_for_retry};
pub use checkpoint::{Checkpoint, CheckpointError, Phase, checkpoint_key, checkpoint_prefix};
pub use failure::{ClassifiedFailure, FailureCategory};
pub use job::{
    CreateJobOptions, DEFAULT_MAX_RETRIES, DubbingMetadata, Job, JobMetadata, JobStatus, JobType,
    OutputFormat, ProgressDetail, Quality, SpeakerMode, SpeakerSpec, VideoDownloadMetadata,
    VoiceGender, VoiceQuality,
};
