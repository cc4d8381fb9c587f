//! Record sources and the resolver that picks one per descriptor.
//!
//! Acquisition strategies:
//! - a directory on disk holding a pre-built table (`LocalTableSource`),
//! - a remote dataset repository (`HubSource`),
//! - records already in memory (`InMemorySource`), mostly for tests.
//!
//! The relational-store join used for one-time corpus construction lives in
//! [`crate::builder`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{HubAccess, PipelineConfig, SourceDescriptor};
use crate::data::{Record, RecordSet};
use crate::errors::CorpusError;
use crate::types::{SourceId, SplitName};

/// Remote repository source.
pub mod huggingface;
/// Local pre-built table source.
pub mod local;
/// Row decoding and column mapping.
pub mod rows;
/// Shard discovery and readers.
pub mod shards;

pub use huggingface::HubSource;
pub use local::LocalTableSource;
pub use rows::ColumnMapping;

/// Anything that can hand out named splits as record sets.
pub trait RecordSource: Send + Sync {
    /// Stable source identifier used in errors and logs.
    fn id(&self) -> &str;
    /// Load split `split`, lazily when `streaming` is set.
    fn load_split(&self, split: &str, streaming: bool) -> Result<RecordSet, CorpusError>;
}

/// Turns a descriptor into a concrete source.
pub trait SourceResolver: Send + Sync {
    /// Build the source named by `descriptor`.
    fn resolve(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn RecordSource>, CorpusError>;
}

/// Local directories first, then the remote repository.
#[derive(Clone, Debug, Default)]
pub struct DefaultResolver {
    hub: HubAccess,
    cache_dir: Option<PathBuf>,
}

impl DefaultResolver {
    /// Resolver with explicit hub access and download cache.
    pub fn new(hub: HubAccess, cache_dir: Option<PathBuf>) -> Self {
        Self { hub, cache_dir }
    }

    /// Resolver using the pipeline's hub access and cache.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.hub.clone(), config.cache_dir.clone())
    }
}

impl SourceResolver for DefaultResolver {
    fn resolve(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn RecordSource>, CorpusError> {
        let path = Path::new(&descriptor.id);
        if path.is_dir() {
            return Ok(Box::new(LocalTableSource::new(descriptor)));
        }
        if path.exists() {
            return Err(CorpusError::UnsupportedSourceType {
                source_id: descriptor.id.clone(),
                details: "path exists but is not a directory of table shards".to_string(),
            });
        }
        Ok(Box::new(HubSource::new(
            descriptor,
            self.hub.clone(),
            self.cache_dir.clone(),
        )))
    }
}

/// Splits held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    id: SourceId,
    splits: HashMap<SplitName, Vec<Record>>,
}

impl InMemorySource {
    /// Empty source called `id`.
    pub fn new(id: impl Into<SourceId>) -> Self {
        Self {
            id: id.into(),
            splits: HashMap::new(),
        }
    }

    /// Register the records of one split.
    pub fn with_split(mut self, name: impl Into<SplitName>, records: Vec<Record>) -> Self {
        self.splits.insert(name.into(), records);
        self
    }
}

impl RecordSource for InMemorySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn load_split(&self, split: &str, streaming: bool) -> Result<RecordSet, CorpusError> {
        let records = self
            .splits
            .get(split)
            .cloned()
            .ok_or_else(|| CorpusError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: format!("no split named '{split}'"),
            })?;
        Ok(if streaming {
            RecordSet::stream(records.into_iter().map(Ok))
        } else {
            RecordSet::Table(records)
        })
    }
}

/// Resolver over a fixed set of in-memory sources keyed by descriptor id.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResolver {
    sources: HashMap<SourceId, InMemorySource>,
}

impl InMemoryResolver {
    /// Resolver with no sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its id.
    pub fn with_source(mut self, source: InMemorySource) -> Self {
        self.sources.insert(source.id.clone(), source);
        self
    }
}

impl SourceResolver for InMemoryResolver {
    fn resolve(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn RecordSource>, CorpusError> {
        self.sources
            .get(&descriptor.id)
            .cloned()
            .map(|source| Box::new(source) as Box<dyn RecordSource>)
            .ok_or_else(|| CorpusError::SourceUnavailable {
                source_id: descriptor.id.clone(),
                reason: "not registered with the in-memory resolver".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioHandle;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn regular_file_is_an_unsupported_source() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("corpus.tar");
        fs::write(&file, b"not a table").unwrap();
        let descriptor = SourceDescriptor::new(file.to_string_lossy());
        let err = DefaultResolver::default().resolve(&descriptor).err().unwrap();
        assert!(matches!(err, CorpusError::UnsupportedSourceType { .. }));
    }

    #[test]
    fn directory_resolves_to_local_table() {
        let dir = tempdir().unwrap();
        let descriptor = SourceDescriptor::new(dir.path().to_string_lossy());
        let source = DefaultResolver::default().resolve(&descriptor).unwrap();
        assert_eq!(source.id(), descriptor.id);
        assert!(matches!(
            source.load_split("train", true),
            Err(CorpusError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn in_memory_source_honours_streaming_flag() {
        let record = Record::new("r", AudioHandle::from_samples(vec![0.0; 4], 16_000), "x");
        let source = InMemorySource::new("mem").with_split("train", vec![record]);
        assert!(source.load_split("train", true).unwrap().len().is_none());
        assert_eq!(source.load_split("train", false).unwrap().len(), Some(1));
        assert!(source.load_split("val", false).is_err());
    }
}
