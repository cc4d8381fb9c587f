//! One-time corpus construction from a metadata store and an audio tree.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::audio::AudioHandle;
use crate::config::BuilderConfig;
use crate::constants::builder::ID_COLUMNS;
use crate::constants::columns::{RECORD_ID, SPEAKER_ID, TEXT, VALIDATION};
use crate::data::{Corpus, Record, ValidationStatus};
use crate::errors::CorpusError;
use crate::splits::split_records;
use crate::transport::fs::{RetryPolicy, index_audio_files};
use crate::types::RecordId;

/// Relational metadata store access.
pub mod metadata;

pub use metadata::{MetadataRow, MetadataStore, projection_query};

/// Joins metadata rows to audio files and splits the result by speaker.
pub struct CorpusBuilder {
    config: BuilderConfig,
}

impl CorpusBuilder {
    /// Builder over `config`; nothing is read until a build call.
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Builder settings.
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.listing_attempts,
            Duration::from_millis(self.config.listing_backoff_ms),
        )
    }

    fn audio_root(&self) -> Result<PathBuf, CorpusError> {
        let root = self.config.audio_dir.join(&self.config.audio_subdir);
        if !root.is_dir() {
            return Err(CorpusError::Configuration(format!(
                "audio root {} is missing the required '{}' sub-directory",
                self.config.audio_dir.display(),
                self.config.audio_subdir
            )));
        }
        Ok(root)
    }

    /// Build the unified table: one record per metadata row with audio.
    pub fn build_table(&self) -> Result<Vec<Record>, CorpusError> {
        let audio_root = self.audio_root()?;
        let store = MetadataStore::open(&self.config.metadata_database_path)?;
        let upper_bound = store.count_recordings()?;
        info!("[asr_corpus:builder] metadata store holds {upper_bound} recordings");
        let rows = store.fetch_rows()?;
        let audio = index_audio_files(&audio_root, &self.retry_policy())?;

        let records = join_rows(rows, &audio)?;
        if records.is_empty() {
            return Err(CorpusError::Configuration(format!(
                "no metadata rows matched an audio file under {}",
                audio_root.display()
            )));
        }
        Ok(records)
    }

    /// Build the table and partition it with the configured speaker lists.
    pub fn build(&self) -> Result<Corpus, CorpusError> {
        let records = self.build_table()?;
        split_records(records, &self.config.split_policy())
    }
}

fn cell_string(row: &MetadataRow, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Inner-join rows to audio files on the recording id.
///
/// Rows without a matching file are dropped and counted.
pub fn join_rows(
    rows: Vec<MetadataRow>,
    audio: &HashMap<RecordId, PathBuf>,
) -> Result<Vec<Record>, CorpusError> {
    let total = rows.len();
    let mut records = Vec::with_capacity(total.min(audio.len()));
    for mut row in rows {
        let id = cell_string(&row, RECORD_ID).ok_or_else(|| CorpusError::SchemaMismatch {
            source_id: "metadata".to_string(),
            details: format!("row without a usable '{}' value", ID_COLUMNS[0]),
        })?;
        let Some(path) = audio.get(&id) else {
            continue;
        };
        let text = match row.shift_remove(TEXT) {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };
        let validation = ValidationStatus::from_value(row.get(VALIDATION));
        let speaker = cell_string(&row, SPEAKER_ID);

        let mut record = Record::new(id, AudioHandle::from_path(path.clone()), text).with_validation(validation);
        record.speaker_id = speaker;
        record.metadata = row;
        records.push(record);
    }
    let unmatched = total - records.len();
    if unmatched > 0 {
        warn!("[asr_corpus:builder] dropped {unmatched} of {total} metadata rows without audio");
    }
    info!(
        "[asr_corpus:builder] matched {} recordings to audio files",
        records.len()
    );
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, speaker: &str) -> MetadataRow {
        let mut row = MetadataRow::new();
        row.insert("id_recording".into(), json!(id));
        row.insert("id_speaker".into(), json!(speaker));
        row.insert("text".into(), json!("en sætning"));
        row.insert("validated".into(), json!("approved"));
        row
    }

    #[test]
    fn unmatched_rows_are_dropped() {
        let audio = HashMap::from([
            ("rec_1".to_string(), PathBuf::from("/a/rec_1.wav")),
            ("rec_3".to_string(), PathBuf::from("/a/rec_3.wav")),
        ]);
        let records = join_rows(
            vec![row("rec_1", "s1"), row("rec_2", "s1"), row("rec_3", "s2")],
            &audio,
        )
        .unwrap();
        assert_eq!(records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["rec_1", "rec_3"]);
        assert_eq!(records[1].speaker_id.as_deref(), Some("s2"));
        assert_eq!(records[0].validation, ValidationStatus::Approved);
        assert_eq!(records[0].text, "en sætning");
        assert!(!records[0].metadata.contains_key("text"));
    }

    #[test]
    fn missing_audio_subdirectory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CorpusBuilder::new(BuilderConfig {
            audio_dir: dir.path().to_path_buf(),
            ..BuilderConfig::default()
        });
        assert!(matches!(builder.build(), Err(CorpusError::Configuration(_))));
    }
}
