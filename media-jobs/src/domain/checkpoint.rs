//! Typed pipeline checkpoints.
//!
//! A checkpoint records which phases finished and the blob-store key of each
//! phase's output. It is serialized into `progress_detail.checkpoint` only at
//! the storage boundary.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A named step of a pipeline.
pub trait Phase:
    Copy + Eq + Ord + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Every phase, in execution order.
    const ORDER: &'static [Self];

    /// Whether completing this phase leaves an artifact in the blob store.
    fn produces_artifact(self) -> bool;

    /// Job progress reported when this phase starts.
    fn start_percent(self) -> u8;

    fn position(self) -> usize {
        Self::ORDER
            .iter()
            .position(|p| *p == self)
            .unwrap_or(Self::ORDER.len())
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("phase {0} is already completed")]
    AlreadyCompleted(String),
    #[error("phase {0} is completed but has no artifact")]
    MissingArtifact(String),
    #[error("artifact {key} for phase {phase} is missing from the store")]
    ArtifactGone { phase: String, key: String },
    #[error("checkpoint could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "P: Phase", rename_all = "camelCase")]
pub struct Checkpoint<P: Phase> {
    completed_phases: Vec<P>,
    #[serde(default)]
    last_phase: Option<P>,
    #[serde(default)]
    artifacts: BTreeMap<P, String>,
}

impl<P: Phase> Default for Checkpoint<P> {
    fn default() -> Self {
        Self {
            completed_phases: Vec::new(),
            last_phase: None,
            artifacts: BTreeMap::new(),
        }
    }
}

impl<P: Phase> Checkpoint<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.completed_phases.is_empty()
    }

    pub fn is_completed(&self, phase: P) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// Consulted at the start of every phase.
    pub fn should_skip(&self, phase: P) -> bool {
        self.is_completed(phase)
    }

    pub fn completed_phases(&self) -> &[P] {
        &self.completed_phases
    }

    pub fn last_phase(&self) -> Option<P> {
        self.last_phase
    }

    /// Artifact key for `phase`, trusted only once the phase is completed.
    pub fn artifact(&self, phase: P) -> Option<&str> {
        if !self.is_completed(phase) {
            return None;
        }
        self.artifacts.get(&phase).map(String::as_str)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = (P, &str)> {
        self.artifacts
            .iter()
            .filter(|(p, _)| self.is_completed(**p))
            .map(|(p, k)| (*p, k.as_str()))
    }

    /// The completed artifact furthest along the pipeline.
    pub fn latest_artifact(&self) -> Option<(P, &str)> {
        self.artifacts().max_by_key(|(p, _)| p.position())
    }

    /// First phase (in pipeline order) that has not completed.
    pub fn next_phase(&self) -> Option<P> {
        P::ORDER.iter().copied().find(|p| !self.is_completed(*p))
    }

    /// Append a completed phase. Completed phases are never rewritten.
    pub fn record(&mut self, phase: P, artifact: Option<String>) -> Result<(), CheckpointError> {
        if self.is_completed(phase) {
            return Err(CheckpointError::AlreadyCompleted(phase.to_string()));
        }
        if phase.produces_artifact() && artifact.is_none() {
            return Err(CheckpointError::MissingArtifact(phase.to_string()));
        }
        if let Some(key) = artifact {
            self.artifacts.insert(phase, key);
        }
        self.completed_phases.push(phase);
        self.last_phase = Some(phase);
        Ok(())
    }

    /// Every completed artifact-bearing phase must carry a key. Keys for
    /// unfinished phases are tolerated but never trusted.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        match self
            .completed_phases
            .iter()
            .find(|p| p.produces_artifact() && !self.artifacts.contains_key(*p))
        {
            Some(phase) => Err(CheckpointError::MissingArtifact(phase.to_string())),
            None => Ok(()),
        }
    }

    pub fn to_value(&self) -> Result<Value, CheckpointError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, CheckpointError> {
        let checkpoint: Self = serde_json::from_value(value)?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }
}

/// Prefix under which all checkpoint artifacts of a job live.
pub fn checkpoint_prefix(job_id: &str) -> String {
    format!("checkpoints/{job_id}/")
}

pub fn checkpoint_key(job_id: &str, phase: impl Display, file_name: &str) -> String {
    format!("checkpoints/{job_id}/{phase}/{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        strum::Display,
    )]
    #[serde(rename_all = "lowercase")]
    #[strum(serialize_all = "lowercase")]
    enum Step {
        Fetch,
        Check,
        Store,
    }

    impl Phase for Step {
        const ORDER: &'static [Self] = &[Step::Fetch, Step::Check, Step::Store];

        fn produces_artifact(self) -> bool {
            !matches!(self, Step::Check)
        }

        fn start_percent(self) -> u8 {
            match self {
                Step::Fetch => 0,
                Step::Check => 50,
                Step::Store => 75,
            }
        }
    }

    #[test]
    fn record_is_append_only() {
        let mut cp = Checkpoint::<Step>::new();
        cp.record(Step::Fetch, Some("k/fetch".into())).unwrap();
        let err = cp.record(Step::Fetch, Some("k/other".into())).unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyCompleted(_)));
        assert_eq!(cp.artifact(Step::Fetch), Some("k/fetch"));
        assert_eq!(cp.next_phase(), Some(Step::Check));
        assert_eq!(cp.last_phase(), Some(Step::Fetch));
    }

    #[test]
    fn artifact_phase_requires_key() {
        let mut cp = Checkpoint::<Step>::new();
        assert!(cp.record(Step::Fetch, None).is_err());
        cp.record(Step::Fetch, Some("a".into())).unwrap();
        cp.record(Step::Check, None).unwrap();
        assert!(cp.should_skip(Step::Check));
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut cp = Checkpoint::<Step>::new();
        cp.record(Step::Fetch, Some("a".into())).unwrap();
        let value = cp.to_value().unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "completedPhases": ["fetch"],
                "lastPhase": "fetch",
                "artifacts": {"fetch": "a"}
            })
        );
        assert_eq!(Checkpoint::<Step>::from_value(value).unwrap(), cp);
    }

    #[test]
    fn completed_phase_without_key_is_corrupt() {
        let value = serde_json::json!({"completedPhases": ["fetch"], "artifacts": {}});
        let err = Checkpoint::<Step>::from_value(value).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingArtifact(_)));
    }

    #[test]
    fn artifact_of_unfinished_phase_is_not_trusted() {
        let value = serde_json::json!({"completedPhases": ["fetch"], "artifacts": {"fetch": "a", "store": "x"}});
        let cp = Checkpoint::<Step>::from_value(value).unwrap();
        assert_eq!(cp.artifact(Step::Store), None);
        assert_eq!(cp.artifacts().count(), 1);
    }

    #[test]
    fn latest_artifact_follows_pipeline_order() {
        let mut cp = Checkpoint::<Step>::new();
        cp.record(Step::Fetch, Some("a".into())).unwrap();
        cp.record(Step::Check, None).unwrap();
        cp.record(Step::Store, Some("c".into())).unwrap();
        assert_eq!(cp.latest_artifact(), Some((Step::Store, "c")));
    }

    #[test]
    fn keys_are_namespaced_by_job() {
        assert_eq!(checkpoint_key("j1", Step::Fetch, "raw.mp4"), "checkpoints/j1/fetch/raw.mp4");
        assert!(checkpoint_key("j1", Step::Fetch, "x").starts_with(&checkpoint_prefix("j1")));
    }
}
