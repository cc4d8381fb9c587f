use std::path::PathBuf;

use tracing::info;

use crate::config::SourceDescriptor;
use crate::data::RecordSet;
use crate::errors::CorpusError;
use crate::source::RecordSource;
use crate::source::rows::ColumnMapping;
use crate::source::shards::{ShardRecordStream, discover_local_shards};

/// Pre-built table stored as shard files in a local directory.
#[derive(Clone, Debug)]
pub struct LocalTableSource {
    root: PathBuf,
    subset: Option<String>,
    mapping: ColumnMapping,
}

impl LocalTableSource {
    /// Source rooted at the descriptor id, read as a directory.
    pub fn new(descriptor: &SourceDescriptor) -> Self {
        Self {
            root: PathBuf::from(&descriptor.id),
            subset: descriptor.subset.clone(),
            mapping: ColumnMapping::from_descriptor(descriptor),
        }
    }
}

impl RecordSource for LocalTableSource {
    fn id(&self) -> &str {
        &self.mapping.source_id
    }

    fn load_split(&self, split: &str, streaming: bool) -> Result<RecordSet, CorpusError> {
        let shards = discover_local_shards(&self.root, self.subset.as_deref(), split)?;
        if shards.is_empty() {
            return Err(CorpusError::SourceUnavailable {
                source_id: self.mapping.source_id.clone(),
                reason: format!(
                    "no shard files for split '{split}' under {}",
                    self.root.display()
                ),
            });
        }
        info!(
            "[asr_corpus:local] split '{split}' of {} has {} shard(s)",
            self.root.display(),
            shards.len()
        );
        let stream = ShardRecordStream::local(shards, self.mapping.clone());
        if streaming {
            Ok(RecordSet::Stream(stream.into_record_stream()))
        } else {
            Ok(RecordSet::Table(stream.collect::<Result<Vec<_>, _>>()?))
        }
    }
}
