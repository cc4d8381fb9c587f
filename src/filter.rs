//! Duration and manual-validation filtering.

use serde::Deserialize;
use tracing::info;

use crate::data::{Corpus, Record, RecordSet, ValidationStatus};
use crate::errors::CorpusError;

/// Per-split filtering policy.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct ValidationPolicy {
    /// Records this short or shorter are dropped.
    pub min_duration_s: f64,
    /// Records this long or longer are dropped.
    pub max_duration_s: f64,
    /// Also drop records reviewed as `maybe`.
    pub remove_maybe: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_duration_s: 0.5,
            max_duration_s: 10.0,
            remove_maybe: false,
        }
    }
}

impl ValidationPolicy {
    /// Also drop `maybe` records.
    pub fn with_remove_maybe(mut self, remove_maybe: bool) -> Self {
        self.remove_maybe = remove_maybe;
        self
    }

    /// Decide whether `record` survives.
    ///
    /// Bounds are compared on frame counts, so a record lying exactly on
    /// either bound is dropped.
    pub fn keep(&self, record: &Record) -> Result<bool, CorpusError> {
        let info = record.audio.info()?;
        let frames = info.frames as f64;
        let rate = info.sample_rate as f64;
        if frames <= rate * self.min_duration_s || frames >= rate * self.max_duration_s {
            return Ok(false);
        }
        Ok(match record.validation {
            ValidationStatus::Rejected => false,
            ValidationStatus::Maybe => !self.remove_maybe,
            ValidationStatus::Approved | ValidationStatus::Absent => true,
        })
    }
}

/// Filter one record set. Removal counts are logged only for tables.
pub fn filter_records(records: RecordSet, policy: ValidationPolicy) -> Result<RecordSet, CorpusError> {
    filter_records_labeled(records, policy, None)
}

fn filter_records_labeled(
    records: RecordSet,
    policy: ValidationPolicy,
    split: Option<&str>,
) -> Result<RecordSet, CorpusError> {
    let before = records.len();
    let filtered = records.filter(move |record| policy.keep(record))?;
    if let (Some(before), Some(after)) = (before, filtered.len()) {
        let removed = before - after;
        match split {
            Some(split) => info!(
                "[asr_corpus:filter] removed {removed} samples from the {split} split"
            ),
            None => info!("[asr_corpus:filter] removed {removed} samples from the dataset"),
        }
    }
    Ok(filtered)
}

/// Filter every split of a corpus.
///
/// `maybe` records are kept only in `train_name`; every other split drops
/// them.
pub fn filter_corpus(
    corpus: Corpus,
    min_duration_s: f64,
    max_duration_s: f64,
    train_name: &str,
) -> Result<Corpus, CorpusError> {
    corpus.try_map_splits(|name, records| {
        let policy = ValidationPolicy {
            min_duration_s,
            max_duration_s,
            remove_maybe: name != train_name,
        };
        filter_records_labeled(records, policy, Some(name))
    })
}
