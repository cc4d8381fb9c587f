//! Row-level decoding shared by every table-backed source.
//!
//! A row is a JSON object as produced by the shard readers. Columns are
//! renamed to the canonical names on the way in, and the reverse mapping
//! writes records back out for publication.

use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::audio::AudioHandle;
use crate::config::SourceDescriptor;
use crate::constants::columns::{
    AUDIO, AUDIO_ARRAY_KEY, AUDIO_BYTES_KEY, AUDIO_PATH_KEY, AUDIO_SAMPLING_RATE_KEY, SPEAKER_ID,
    TEXT, VALIDATION,
};
use crate::data::{Record, ValidationStatus};
use crate::errors::CorpusError;
use crate::types::{ColumnName, SourceId};

/// One decoded row.
pub type Row = Map<String, Value>;

/// Source column names for the canonical fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMapping {
    /// Source the rows come from, for errors.
    pub source_id: SourceId,
    /// Column holding the audio cell.
    pub audio: ColumnName,
    /// Column holding the transcript.
    pub text: ColumnName,
    /// Record id column; ids are generated when absent.
    pub id: Option<ColumnName>,
    /// Speaker id column.
    pub speaker: Option<ColumnName>,
    /// Manual review column.
    pub validation: Option<ColumnName>,
}

impl ColumnMapping {
    /// Mapping taken from the descriptor's column overrides.
    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Self {
        Self {
            source_id: descriptor.id.clone(),
            audio: descriptor.audio_column.clone(),
            text: descriptor.text_column.clone(),
            id: descriptor.id_column.clone(),
            speaker: descriptor.speaker_column.clone(),
            validation: descriptor.validation_column.clone(),
        }
    }

    /// Fail when the renamed row would lack `audio` or `text`.
    pub fn check_columns(&self, row: &Row) -> Result<(), CorpusError> {
        let missing: Vec<&str> = [(&self.audio, AUDIO), (&self.text, TEXT)]
            .into_iter()
            .filter(|(column, _)| !row.contains_key(column.as_str()))
            .map(|(column, _)| column.as_str())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(CorpusError::SchemaMismatch {
            source_id: self.source_id.clone(),
            details: format!(
                "missing column(s) {missing:?}; available: {:?}",
                row.keys().collect::<Vec<_>>()
            ),
        })
    }

    /// Decode one row into a record.
    ///
    /// `index` is used for the synthetic id when the source has no id column.
    /// Relative audio paths resolve against `base_dir`.
    pub fn row_to_record(
        &self,
        mut row: Row,
        index: usize,
        base_dir: Option<&Path>,
    ) -> Result<Record, CorpusError> {
        self.check_columns(&row)?;
        let audio_cell = row.shift_remove(&self.audio).unwrap_or(Value::Null);
        let audio = parse_audio_cell(&audio_cell, base_dir).map_err(|reason| {
            CorpusError::SchemaMismatch {
                source_id: self.source_id.clone(),
                details: format!("row {index}: audio column '{}': {reason}", self.audio),
            }
        })?;
        let text = match row.shift_remove(&self.text) {
            Some(Value::String(text)) => text,
            Some(Value::Null) | None => String::new(),
            Some(other) => {
                return Err(CorpusError::SchemaMismatch {
                    source_id: self.source_id.clone(),
                    details: format!(
                        "row {index}: text column '{}' is not a string: {other}",
                        self.text
                    ),
                });
            }
        };
        let validation = match &self.validation {
            Some(column) => ValidationStatus::from_value(row.shift_remove(column).as_ref()),
            None => ValidationStatus::Absent,
        };
        let speaker_id = self
            .speaker
            .as_ref()
            .and_then(|column| row.shift_remove(column))
            .and_then(|value| scalar_string(&value));
        let id = self
            .id
            .as_ref()
            .and_then(|column| row.get(column))
            .and_then(scalar_string)
            .unwrap_or_else(|| format!("{}:{index}", self.source_id));

        let mut record = Record::new(id, audio, text).with_validation(validation);
        record.speaker_id = speaker_id;
        record.metadata = row.into_iter().collect::<IndexMap<_, _>>();
        Ok(record)
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(raw);
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

/// Decode an audio cell.
///
/// Accepted shapes: `{"bytes": <base64 or byte list>, "path": ..}`,
/// `{"path": ..}` with null bytes, `{"array": [..], "sampling_rate": n}`,
/// or a bare path string.
pub fn parse_audio_cell(cell: &Value, base_dir: Option<&Path>) -> Result<AudioHandle, String> {
    match cell {
        Value::String(path) if !path.is_empty() => Ok(AudioHandle::from_path(resolve_path(path, base_dir))),
        Value::Object(fields) => {
            let path = fields
                .get(AUDIO_PATH_KEY)
                .and_then(Value::as_str)
                .filter(|path| !path.is_empty());
            match fields.get(AUDIO_BYTES_KEY) {
                Some(Value::String(encoded)) if !encoded.is_empty() => {
                    let bytes = BASE64
                        .decode(encoded.as_bytes())
                        .map_err(|err| format!("invalid base64 audio bytes: {err}"))?;
                    return Ok(AudioHandle::from_bytes(bytes, path.map(str::to_string)));
                }
                Some(Value::Array(values)) if !values.is_empty() => {
                    let bytes = values
                        .iter()
                        .map(|value| {
                            value
                                .as_u64()
                                .and_then(|byte| u8::try_from(byte).ok())
                                .ok_or_else(|| format!("invalid audio byte {value}"))
                        })
                        .collect::<Result<Vec<u8>, String>>()?;
                    return Ok(AudioHandle::from_bytes(bytes, path.map(str::to_string)));
                }
                _ => {}
            }
            if let Some(Value::Array(samples)) = fields.get(AUDIO_ARRAY_KEY) {
                let sample_rate = fields
                    .get(AUDIO_SAMPLING_RATE_KEY)
                    .and_then(Value::as_u64)
                    .and_then(|rate| u32::try_from(rate).ok())
                    .ok_or_else(|| "decoded audio without a sampling_rate".to_string())?;
                let samples = samples
                    .iter()
                    .map(|value| {
                        value
                            .as_f64()
                            .map(|sample| sample as f32)
                            .ok_or_else(|| format!("invalid audio sample {value}"))
                    })
                    .collect::<Result<Vec<f32>, String>>()?;
                return Ok(AudioHandle::from_samples(samples, sample_rate));
            }
            match path {
                Some(path) => Ok(AudioHandle::from_path(resolve_path(path, base_dir))),
                None => Err("audio cell carries neither bytes, samples, nor a path".to_string()),
            }
        }
        other => Err(format!("unsupported audio cell {}", value_kind(other))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "empty string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Encode a record as a publishable row.
///
/// Metadata columns come first in their stored order, followed by speaker and
/// validation columns (when not already present), `text`, and `audio`.
pub fn record_to_row(record: &Record, embed_audio: bool) -> Result<Row, CorpusError> {
    let mut row = Row::new();
    for (key, value) in &record.metadata {
        row.insert(key.clone(), value.clone());
    }
    if let Some(speaker) = &record.speaker_id
        && !row.contains_key(SPEAKER_ID)
    {
        row.insert(SPEAKER_ID.to_string(), Value::String(speaker.clone()));
    }
    if !row.contains_key(VALIDATION) {
        row.insert(
            VALIDATION.to_string(),
            record
                .validation
                .as_str()
                .map(|label| Value::String(label.to_string()))
                .unwrap_or(Value::Null),
        );
    }
    row.insert(TEXT.to_string(), Value::String(record.text.clone()));
    row.insert(AUDIO.to_string(), record.audio.to_cell(embed_audio)?);
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping() -> ColumnMapping {
        ColumnMapping::from_descriptor(
            &SourceDescriptor::new("common_voice").with_columns("sentence", "audio"),
        )
    }

    fn object(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn renames_and_types_known_columns() {
        let row = object(json!({
            "id_recording": "rec_1",
            "sentence": "Hej med dig",
            "audio": {"bytes": null, "path": "clips/rec_1.wav"},
            "id_speaker": "spe_9",
            "validated": "maybe",
            "age": 42
        }));
        let record = mapping()
            .row_to_record(row, 0, Some(Path::new("/data/cv")))
            .unwrap();
        assert_eq!(record.id, "rec_1");
        assert_eq!(record.text, "Hej med dig");
        assert_eq!(record.speaker_id.as_deref(), Some("spe_9"));
        assert_eq!(record.validation, ValidationStatus::Maybe);
        assert_eq!(record.audio.location(), "/data/cv/clips/rec_1.wav");
        assert_eq!(record.metadata.keys().collect::<Vec<_>>(), vec!["id_recording", "age"]);
    }

    #[test]
    fn missing_text_column_is_a_schema_mismatch() {
        let row = object(json!({"text": "wrong name", "audio": "a.wav"}));
        let err = mapping().row_to_record(row, 3, None).unwrap_err();
        assert!(
            matches!(err, CorpusError::SchemaMismatch { ref details, .. } if details.contains("sentence"))
        );
    }

    #[test]
    fn synthetic_ids_fall_back_to_row_index() {
        let row = object(json!({"sentence": "x", "audio": "a.wav"}));
        let record = mapping().row_to_record(row, 17, None).unwrap();
        assert_eq!(record.id, "common_voice:17");
        assert_eq!(record.validation, ValidationStatus::Absent);
    }

    #[test]
    fn decoded_sample_cells_are_accepted() {
        let cell = json!({"array": [0.0, 0.5, -0.5], "sampling_rate": 8000});
        let handle = parse_audio_cell(&cell, None).unwrap();
        let info = handle.info().unwrap();
        assert_eq!(info.frames, 3);
        assert_eq!(info.sample_rate, 8_000);
    }

    #[test]
    fn unusable_audio_cells_are_rejected() {
        assert!(parse_audio_cell(&json!(null), None).is_err());
        assert!(parse_audio_cell(&json!({"bytes": null, "path": null}), None).is_err());
        assert!(parse_audio_cell(&json!({"bytes": "***"}), None).is_err());
    }

    #[test]
    fn record_rows_carry_typed_fields() {
        let record = Record::new("r1", AudioHandle::from_samples(vec![0.0; 2], 16_000), "hej")
            .with_speaker("spe_1")
            .with_validation(ValidationStatus::Approved)
            .with_meta("id_recording", "r1");
        let row = record_to_row(&record, true).unwrap();
        assert_eq!(
            row.keys().collect::<Vec<_>>(),
            vec!["id_recording", "id_speaker", "validated", "text", "audio"]
        );
        assert_eq!(row["validated"], json!("approved"));
    }
}
