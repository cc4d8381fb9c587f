use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::splits::{TEST, TRAIN, VAL};
use crate::data::{Corpus, Record, RecordSet};
use crate::errors::CorpusError;
use crate::types::SpeakerId;

/// Logical corpus partitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitLabel {
    /// Training split.
    Train,
    /// Validation split.
    Validation,
    /// Test split.
    Test,
}

impl SplitLabel {
    /// Published split name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitLabel::Train => TRAIN,
            SplitLabel::Validation => VAL,
            SplitLabel::Test => TEST,
        }
    }
}

impl fmt::Display for SplitLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker allow-lists deciding which records leave the training split.
///
/// Owned by the caller and passed into [`split_records`]; two policies never
/// share state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SplitPolicy {
    /// Speakers routed to validation.
    pub validation_speakers: HashSet<SpeakerId>,
    /// Speakers routed to test, unless also listed for validation.
    pub test_speakers: HashSet<SpeakerId>,
}

impl SplitPolicy {
    /// Policy from the two speaker lists.
    pub fn new(
        validation_speakers: impl IntoIterator<Item = SpeakerId>,
        test_speakers: impl IntoIterator<Item = SpeakerId>,
    ) -> Self {
        Self {
            validation_speakers: validation_speakers.into_iter().collect(),
            test_speakers: test_speakers.into_iter().collect(),
        }
    }

    /// Speakers named in both held-out lists, sorted. They go to validation.
    pub fn overlapping_speakers(&self) -> Vec<&str> {
        let mut shared: Vec<&str> = self
            .validation_speakers
            .intersection(&self.test_speakers)
            .map(String::as_str)
            .collect();
        shared.sort_unstable();
        shared
    }

    /// Split for one speaker; validation wins over test, unknown speakers train.
    pub fn label_for(&self, speaker_id: Option<&str>) -> SplitLabel {
        match speaker_id {
            Some(id) if self.validation_speakers.contains(id) => SplitLabel::Validation,
            Some(id) if self.test_speakers.contains(id) => SplitLabel::Test,
            _ => SplitLabel::Train,
        }
    }
}

/// Partition a built table by speaker identity.
///
/// Empty validation or test splits are left out of the result. An empty
/// training split is a configuration error.
pub fn split_records(records: Vec<Record>, policy: &SplitPolicy) -> Result<Corpus, CorpusError> {
    let shared = policy.overlapping_speakers();
    if !shared.is_empty() {
        warn!(
            "[asr_corpus:splits] speakers listed for both validation and test go to validation: {}",
            shared.join(", ")
        );
    }

    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut test = Vec::new();
    for record in records {
        match policy.label_for(record.speaker_id.as_deref()) {
            SplitLabel::Train => train.push(record),
            SplitLabel::Validation => validation.push(record),
            SplitLabel::Test => test.push(record),
        }
    }

    info!(
        "[asr_corpus:splits] assigned train={} val={} test={}",
        train.len(),
        validation.len(),
        test.len()
    );

    if train.is_empty() {
        return Err(CorpusError::Configuration(
            "no records left for the train split after speaker assignment".to_string(),
        ));
    }

    let mut corpus = Corpus::single(SplitLabel::Train.as_str(), RecordSet::Table(train));
    for (label, records) in [(SplitLabel::Validation, validation), (SplitLabel::Test, test)] {
        if !records.is_empty() {
            corpus.insert(label.as_str(), RecordSet::Table(records));
        }
    }
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioHandle;

    fn spoken_by(id: &str, speaker: &str) -> Record {
        Record::new(id, AudioHandle::from_samples(vec![0.0; 8], 16_000), "hej").with_speaker(speaker)
    }

    fn policy(val: &[&str], test: &[&str]) -> SplitPolicy {
        SplitPolicy::new(
            val.iter().map(|s| s.to_string()),
            test.iter().map(|s| s.to_string()),
        )
    }

    #[test]
    fn assigns_by_speaker_lists() {
        let records = vec![
            spoken_by("r1", "alice"),
            spoken_by("r2", "bob"),
            spoken_by("r3", "carol"),
            spoken_by("r4", "alice"),
        ];
        let corpus = split_records(records, &policy(&["bob"], &["carol"])).unwrap();
        assert_eq!(corpus.split_names(), vec!["train", "val", "test"]);
        assert_eq!(corpus.get("train").and_then(RecordSet::len), Some(2));
        assert_eq!(corpus.get("val").and_then(RecordSet::len), Some(1));
        assert_eq!(corpus.get("test").and_then(RecordSet::len), Some(1));
    }

    #[test]
    fn empty_held_out_splits_are_omitted() {
        let corpus = split_records(vec![spoken_by("r1", "alice")], &policy(&["bob"], &[])).unwrap();
        assert_eq!(corpus.split_names(), vec!["train"]);
    }

    #[test]
    fn empty_train_is_fatal() {
        let err = split_records(vec![spoken_by("r1", "bob")], &policy(&["bob"], &[])).unwrap_err();
        assert!(matches!(err, CorpusError::Configuration(_)));
    }

    #[test]
    fn speaker_in_both_lists_lands_in_validation() {
        let p = policy(&["bob", "eve"], &["eve"]);
        assert_eq!(p.overlapping_speakers(), vec!["eve"]);
        let corpus = split_records(
            vec![spoken_by("r1", "alice"), spoken_by("r2", "eve")],
            &p,
        )
        .unwrap();
        assert_eq!(corpus.split_names(), vec!["train", "val"]);
        match corpus.get("val") {
            Some(RecordSet::Table(records)) => assert_eq!(records[0].id, "r2"),
            other => panic!("unexpected val split: {other:?}"),
        }
    }

    #[test]
    fn records_without_speaker_train() {
        let p = policy(&["bob"], &["carol"]);
        assert_eq!(p.label_for(None), SplitLabel::Train);
    }
}
