use std::collections::VecDeque;
use std::fmt;

use indexmap::IndexMap;
use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::audio::AudioHandle;
use crate::errors::CorpusError;
use crate::interleave::DeterministicRng;

pub use crate::types::{MetaValue, RecordId, SpeakerId, SplitName};

/// Manual-review outcome attached to a recording.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    /// Reviewed and accepted.
    Approved,
    /// Reviewed without a clear verdict.
    Maybe,
    /// Reviewed and refused.
    Rejected,
    /// The source carries no manual review for this record.
    #[default]
    Absent,
}

impl ValidationStatus {
    /// Parse a raw status string. Unknown labels are treated as unreviewed.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => ValidationStatus::Approved,
            "maybe" => ValidationStatus::Maybe,
            "rejected" => ValidationStatus::Rejected,
            "" => ValidationStatus::Absent,
            other => {
                debug!("[asr_corpus:data] unknown validation label '{other}' treated as absent");
                ValidationStatus::Absent
            }
        }
    }

    /// Parse a status from a loosely-typed row cell.
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(raw)) => Self::parse(raw),
            _ => ValidationStatus::Absent,
        }
    }

    /// Wire label, or `None` for [`ValidationStatus::Absent`].
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            ValidationStatus::Approved => Some("approved"),
            ValidationStatus::Maybe => Some("maybe"),
            ValidationStatus::Rejected => Some("rejected"),
            ValidationStatus::Absent => None,
        }
    }
}

/// One audio + transcript example.
#[derive(Clone, Debug)]
pub struct Record {
    /// Stable record identifier.
    pub id: RecordId,
    /// Lazy waveform handle.
    pub audio: AudioHandle,
    /// Transcript text.
    pub text: String,
    /// Manual-review outcome.
    pub validation: ValidationStatus,
    /// Speaker identity, when the source provides one.
    pub speaker_id: Option<SpeakerId>,
    /// Remaining source columns, in source order.
    pub metadata: IndexMap<String, MetaValue>,
}

impl Record {
    /// Unreviewed record without speaker or metadata.
    pub fn new(id: impl Into<RecordId>, audio: AudioHandle, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio,
            text: text.into(),
            validation: ValidationStatus::Absent,
            speaker_id: None,
            metadata: IndexMap::new(),
        }
    }

    /// Set the review status.
    pub fn with_validation(mut self, validation: ValidationStatus) -> Self {
        self.validation = validation;
        self
    }

    /// Set the speaker.
    pub fn with_speaker(mut self, speaker_id: impl Into<SpeakerId>) -> Self {
        self.speaker_id = Some(speaker_id.into());
        self
    }

    /// Add one metadata column.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Drop free-form metadata, keeping audio, text, and the typed review and
    /// speaker fields.
    pub fn retain_core_columns(mut self) -> Self {
        self.metadata.clear();
        self
    }
}

/// Lazily-pulled record stream. Errors travel in-band and stop the consumer.
pub type RecordStream = Box<dyn Iterator<Item = Result<Record, CorpusError>> + Send>;

/// A collection of records, either materialized or streamed.
///
/// Finite tables support random-access length and are processed on the
/// rayon worker pool with order preserved. Streams are processed lazily, one
/// record per pull, on the consuming thread.
pub enum RecordSet {
    /// Finite, in-memory records.
    Table(Vec<Record>),
    /// Lazy records of unknown length.
    Stream(RecordStream),
}

impl fmt::Debug for RecordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSet::Table(records) => f.debug_tuple("Table").field(&records.len()).finish(),
            RecordSet::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl RecordSet {
    /// Wrap any iterator of records as a stream.
    pub fn stream<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<Record, CorpusError>> + Send + 'static,
    {
        RecordSet::Stream(Box::new(iter))
    }

    /// Exact length for tables, `None` for streams.
    pub fn len(&self) -> Option<usize> {
        match self {
            RecordSet::Table(records) => Some(records.len()),
            RecordSet::Stream(_) => None,
        }
    }

    /// True only for a table with no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// True for tables.
    pub fn is_finite(&self) -> bool {
        matches!(self, RecordSet::Table(_))
    }

    /// Keep records for which `predicate` returns `Ok(true)`.
    ///
    /// Tables are filtered in parallel and any predicate error fails the
    /// whole call. Streams are filtered lazily and errors surface in-band.
    pub fn filter<F>(self, predicate: F) -> Result<RecordSet, CorpusError>
    where
        F: Fn(&Record) -> Result<bool, CorpusError> + Send + Sync + 'static,
    {
        match self {
            RecordSet::Table(records) => {
                let kept = records
                    .into_par_iter()
                    .map(|record| predicate(&record).map(|keep| keep.then_some(record)))
                    .collect::<Result<Vec<_>, CorpusError>>()?;
                Ok(RecordSet::Table(kept.into_iter().flatten().collect()))
            }
            RecordSet::Stream(stream) => Ok(RecordSet::stream(stream.filter_map(move |item| {
                match item {
                    Ok(record) => match predicate(&record) {
                        Ok(true) => Some(Ok(record)),
                        Ok(false) => None,
                        Err(err) => Some(Err(err)),
                    },
                    Err(err) => Some(Err(err)),
                }
            }))),
        }
    }

    /// Transform every record with a fallible function.
    pub fn map<F>(self, transform: F) -> Result<RecordSet, CorpusError>
    where
        F: Fn(Record) -> Result<Record, CorpusError> + Send + Sync + 'static,
    {
        match self {
            RecordSet::Table(records) => Ok(RecordSet::Table(
                records
                    .into_par_iter()
                    .map(&transform)
                    .collect::<Result<Vec<_>, CorpusError>>()?,
            )),
            RecordSet::Stream(stream) => Ok(RecordSet::stream(
                stream.map(move |item| item.and_then(&transform)),
            )),
        }
    }

    /// Transform every record with a function that cannot fail.
    pub fn map_infallible<F>(self, transform: F) -> RecordSet
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        match self {
            RecordSet::Table(records) => {
                RecordSet::Table(records.into_par_iter().map(&transform).collect())
            }
            RecordSet::Stream(stream) => {
                RecordSet::stream(stream.map(move |item| item.map(&transform)))
            }
        }
    }

    /// Seeded shuffle. Tables are permuted in full; streams go through a
    /// bounded shuffle buffer of `buffer_size` records.
    pub fn shuffle(self, seed: u64, buffer_size: usize) -> RecordSet {
        match self {
            RecordSet::Table(mut records) => {
                let mut rng = DeterministicRng::new(seed);
                records.shuffle(&mut rng);
                RecordSet::Table(records)
            }
            RecordSet::Stream(stream) => {
                RecordSet::stream(ShuffleBuffer::new(stream, seed, buffer_size.max(1)))
            }
        }
    }

    /// Pull every record into memory. The first stream error aborts.
    pub fn materialize(self) -> Result<Vec<Record>, CorpusError> {
        match self {
            RecordSet::Table(records) => Ok(records),
            RecordSet::Stream(stream) => stream.collect(),
        }
    }

    /// View the set as a stream regardless of its shape.
    pub fn into_stream(self) -> RecordStream {
        match self {
            RecordSet::Table(records) => Box::new(records.into_iter().map(Ok)),
            RecordSet::Stream(stream) => stream,
        }
    }
}

/// Bounded-memory stream shuffle: fill a buffer, then emit a random slot and
/// refill it from upstream.
struct ShuffleBuffer {
    upstream: RecordStream,
    buffer: Vec<Record>,
    pending_error: VecDeque<CorpusError>,
    capacity: usize,
    rng: DeterministicRng,
    upstream_done: bool,
}

impl ShuffleBuffer {
    fn new(upstream: RecordStream, seed: u64, capacity: usize) -> Self {
        Self {
            upstream,
            buffer: Vec::with_capacity(capacity),
            pending_error: VecDeque::new(),
            capacity,
            rng: DeterministicRng::new(seed),
            upstream_done: false,
        }
    }

    fn fill(&mut self) {
        while !self.upstream_done && self.buffer.len() < self.capacity {
            match self.upstream.next() {
                Some(Ok(record)) => self.buffer.push(record),
                Some(Err(err)) => {
                    self.pending_error.push_back(err);
                    return;
                }
                None => self.upstream_done = true,
            }
        }
    }
}

impl Iterator for ShuffleBuffer {
    type Item = Result<Record, CorpusError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fill();
        if let Some(err) = self.pending_error.pop_front() {
            return Some(Err(err));
        }
        if self.buffer.is_empty() {
            return None;
        }
        let slot = self.rng.random_range(0..self.buffer.len());
        Some(Ok(self.buffer.swap_remove(slot)))
    }
}

/// Mapping from split name to records, in insertion order.
#[derive(Debug, Default)]
pub struct Corpus {
    splits: IndexMap<SplitName, RecordSet>,
}

impl Corpus {
    /// Empty corpus.
    pub fn new() -> Self {
        Self::default()
    }

    /// One-entry corpus wrapping a single set.
    pub fn single(name: impl Into<SplitName>, records: RecordSet) -> Self {
        let mut corpus = Self::new();
        corpus.insert(name, records);
        corpus
    }

    /// Add or replace a split; a new split goes last.
    pub fn insert(&mut self, name: impl Into<SplitName>, records: RecordSet) {
        self.splits.insert(name.into(), records);
    }

    /// Borrow a split.
    pub fn get(&self, name: &str) -> Option<&RecordSet> {
        self.splits.get(name)
    }

    /// Take a split out, keeping the order of the rest.
    pub fn remove(&mut self, name: &str) -> Option<RecordSet> {
        self.splits.shift_remove(name)
    }

    /// Whether the split exists.
    pub fn contains(&self, name: &str) -> bool {
        self.splits.contains_key(name)
    }

    /// Split names in insertion order.
    pub fn split_names(&self) -> Vec<&str> {
        self.splits.keys().map(String::as_str).collect()
    }

    /// Number of splits.
    pub fn len(&self) -> usize {
        self.splits.len()
    }

    /// True with no splits.
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// (name, set) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RecordSet)> {
        self.splits.iter().map(|(name, set)| (name.as_str(), set))
    }

    /// Apply `transform` to every split, keeping split order.
    pub fn try_map_splits<F>(self, mut transform: F) -> Result<Corpus, CorpusError>
    where
        F: FnMut(&str, RecordSet) -> Result<RecordSet, CorpusError>,
    {
        let mut splits = IndexMap::with_capacity(self.splits.len());
        for (name, records) in self.splits {
            let mapped = transform(&name, records)?;
            splits.insert(name, mapped);
        }
        Ok(Corpus { splits })
    }
}

impl IntoIterator for Corpus {
    type Item = (SplitName, RecordSet);
    type IntoIter = indexmap::map::IntoIter<SplitName, RecordSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.splits.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(idx: usize) -> Record {
        Record::new(
            format!("r{idx}"),
            AudioHandle::from_samples(vec![0.0; 4], 16_000),
            format!("text {idx}"),
        )
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn validation_status_parses_known_labels() {
        assert_eq!(ValidationStatus::parse("approved"), ValidationStatus::Approved);
        assert_eq!(ValidationStatus::parse(" Maybe "), ValidationStatus::Maybe);
        assert_eq!(ValidationStatus::parse("rejected"), ValidationStatus::Rejected);
        assert_eq!(ValidationStatus::parse("unheard-of"), ValidationStatus::Absent);
        assert_eq!(ValidationStatus::from_value(None), ValidationStatus::Absent);
        assert_eq!(
            ValidationStatus::from_value(Some(&Value::Null)),
            ValidationStatus::Absent
        );
    }

    #[test]
    fn table_filter_preserves_row_order() {
        let table = RecordSet::Table((0..50).map(record).collect());
        let kept = table
            .filter(|r| Ok(r.id.trim_start_matches('r').parse::<usize>().unwrap() % 3 == 0))
            .unwrap()
            .materialize()
            .unwrap();
        let expected: Vec<String> = (0..50).filter(|i| i % 3 == 0).map(|i| format!("r{i}")).collect();
        assert_eq!(ids(&kept), expected);
    }

    #[test]
    fn table_filter_error_is_fatal() {
        let table = RecordSet::Table((0..5).map(record).collect());
        let err = table
            .filter(|r| {
                if r.id == "r3" {
                    Err(CorpusError::Configuration("boom".into()))
                } else {
                    Ok(true)
                }
            })
            .unwrap_err();
        assert!(matches!(err, CorpusError::Configuration(_)));
    }

    #[test]
    fn stream_filter_is_lazy() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = (0..1_000).map(move |idx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(record(idx))
        });
        let filtered = RecordSet::stream(upstream).filter(|_| Ok(true)).unwrap();
        let mut stream = filtered.into_stream();
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        stream.next();
        stream.next();
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stream_shuffle_is_seeded_and_complete() {
        let run = |seed| {
            RecordSet::stream((0..40).map(|i| Ok(record(i))))
                .shuffle(seed, 8)
                .materialize()
                .unwrap()
        };
        let first = ids(&run(3));
        assert_eq!(first, ids(&run(3)));
        let mut sorted = first.clone();
        sorted.sort();
        let mut expected: Vec<String> = (0..40).map(|i| format!("r{i}")).collect();
        expected.sort();
        assert_eq!(sorted, expected);
        assert_ne!(first, (0..40).map(|i| format!("r{i}")).collect::<Vec<_>>());
    }

    #[test]
    fn corpus_map_keeps_split_order() {
        let mut corpus = Corpus::new();
        corpus.insert("train", RecordSet::Table(vec![record(0)]));
        corpus.insert("val", RecordSet::Table(vec![record(1)]));
        let mapped = corpus
            .try_map_splits(|_, set| Ok(set.map_infallible(|r| r.retain_core_columns())))
            .unwrap();
        assert_eq!(mapped.split_names(), vec!["train", "val"]);
    }
}
