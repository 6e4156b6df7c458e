//! Per-segment voice selection for each speaker mode.

use std::collections::HashMap;

use crate::domain::{DubbingMetadata, SpeakerMode, SpeakerSpec, VoiceGender};
use crate::pipeline::services::{Segment, Voice};

fn opposite(gender: VoiceGender) -> VoiceGender {
    match gender {
        VoiceGender::Male => VoiceGender::Female,
        VoiceGender::Female | VoiceGender::Neutral => VoiceGender::Male,
    }
}

fn alternate(first: VoiceGender, index: usize) -> VoiceGender {
    if index % 2 == 0 { first } else { opposite(first) }
}

fn from_spec(spec: &SpeakerSpec) -> Voice {
    Voice {
        gender: spec.gender,
        name: spec.voice.clone(),
    }
}

/// Index of each speaker label in order of first appearance.
fn speaker_indices(segments: &[Segment]) -> HashMap<String, usize> {
    let mut indices = HashMap::new();
    for label in segments.iter().filter_map(|s| s.speaker.as_ref()) {
        let next = indices.len();
        indices.entry(label.clone()).or_insert(next);
    }
    indices
}

/// Tag diarized segments with a gender: the configured speaker's when
/// `speakers[]` has an entry for that turn order, otherwise alternating from
/// the job's default gender.
pub fn tag_genders(meta: &DubbingMetadata, segments: &mut [Segment]) {
    let indices = speaker_indices(segments);
    for segment in segments.iter_mut() {
        let index = segment
            .speaker
            .as_ref()
            .and_then(|label| indices.get(label))
            .copied()
            .unwrap_or(0);
        segment.gender = Some(match meta.speakers.get(index) {
            Some(spec) => spec.gender,
            None => alternate(meta.voice_gender, index),
        });
    }
}

/// One voice per segment.
pub fn assign_voices(meta: &DubbingMetadata, segments: &[Segment]) -> Vec<Voice> {
    let default = Voice::of(meta.voice_gender);
    match meta.speaker_mode {
        SpeakerMode::Single => vec![default; segments.len()],
        SpeakerMode::Alternating => (0..segments.len())
            .map(|i| Voice::of(alternate(meta.voice_gender, i)))
            .collect(),
        SpeakerMode::Multi if meta.speakers.is_empty() => vec![default; segments.len()],
        SpeakerMode::Multi => (0..segments.len())
            .map(|i| from_spec(&meta.speakers[i % meta.speakers.len()]))
            .collect(),
        SpeakerMode::Smart => {
            let indices = speaker_indices(segments);
            segments
                .iter()
                .map(|segment| {
                    let index = segment.speaker.as_ref().and_then(|l| indices.get(l)).copied();
                    match index.and_then(|i| meta.speakers.get(i)) {
                        Some(spec) => from_spec(spec),
                        None => Voice::of(
                            segment
                                .gender
                                .unwrap_or_else(|| alternate(meta.voice_gender, index.unwrap_or(0))),
                        ),
                    }
                })
                .collect()
        }
    }
}
