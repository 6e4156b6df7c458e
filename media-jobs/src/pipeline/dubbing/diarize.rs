//! Speaker-turn inference for the smart speaker mode.

use std::path::Path;

use async_trait::async_trait;

use crate::pipeline::PipelineResult;
use crate::pipeline::services::Segment;

#[async_trait]
pub trait Diarizer: Send + Sync {
    /// Label each segment's `speaker`.
    async fn diarize(&self, audio: &Path, segments: &mut [Segment]) -> PipelineResult<()>;
}

/// Infers turns from pauses: a long enough gap, or a question followed by
/// a shorter pause, hands the floor to the next speaker.
#[derive(Debug, Clone, Copy)]
pub struct GapDiarizer {
    pub turn_gap_ms: u64,
    pub max_speakers: usize,
}

impl Default for GapDiarizer {
    fn default() -> Self {
        Self {
            turn_gap_ms: 800,
            max_speakers: 2,
        }
    }
}

impl GapDiarizer {
    pub fn label(index: usize) -> String {
        format!("speaker_{}", index + 1)
    }

    fn is_turn(&self, previous: &Segment, next: &Segment) -> bool {
        let gap = next.start_ms.saturating_sub(previous.end_ms);
        gap >= self.turn_gap_ms
            || (previous.text.trim_end().ends_with('?') && gap >= self.turn_gap_ms / 2)
    }

    pub fn assign(&self, segments: &mut [Segment]) {
        let speakers = self.max_speakers.max(1);
        let mut current = 0;
        for i in 0..segments.len() {
            if i > 0 && self.is_turn(&segments[i - 1], &segments[i]) {
                current = (current + 1) % speakers;
            }
            segments[i].speaker = Some(Self::label(current));
        }
    }
}

#[async_trait]
impl Diarizer for GapDiarizer {
    async fn diarize(&self, _audio: &Path, segments: &mut [Segment]) -> PipelineResult<()> {
        self.assign(segments);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speakers(segments: &[Segment]) -> Vec<&str> {
        segments
            .iter()
            .map(|s| s.speaker.as_deref().unwrap_or("-"))
            .collect()
    }

    #[test]
    fn pauses_and_questions_switch_speakers() {
        let mut segs = vec![
            Segment::new(0, 1_000, "Where were you?"),
            Segment::new(1_500, 2_500, "Out."),
            Segment::new(2_600, 3_000, "Just out."),
            Segment::new(5_000, 6_000, "Fine."),
        ];
        GapDiarizer::default().assign(&mut segs);
        assert_eq!(
            speakers(&segs),
            vec!["speaker_1", "speaker_2", "speaker_2", "speaker_1"]
        );
    }

    #[test]
    fn single_speaker_cap_never_switches() {
        let mut segs = vec![Segment::new(0, 100, "a"), Segment::new(5_000, 5_100, "b")];
        GapDiarizer {
            turn_gap_ms: 800,
            max_speakers: 1,
        }
        .assign(&mut segs);
        assert_eq!(speakers(&segs), vec!["speaker_1", "speaker_1"]);
    }
}
