use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use indexmap::IndexMap;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use tracing::info;

use crate::constants::builder::{COUNT_QUERY, ID_COLUMNS, NON_ID_COLUMNS};
use crate::errors::CorpusError;
use crate::types::{ColumnName, MetaValue};

/// One denormalized recording row, columns in projection order.
pub type MetadataRow = IndexMap<ColumnName, MetaValue>;

/// Table that owns each identifier column in the projection.
const ID_COLUMN_TABLES: [&str; 4] = ["Recordings", "Sentences", "Speakers", "Recordings"];

/// Fixed projection joining recordings to their sentence and speaker.
pub fn projection_query() -> String {
    let ids = ID_COLUMNS
        .iter()
        .zip(ID_COLUMN_TABLES)
        .map(|(column, table)| format!("{table}.{column}"));
    let columns: Vec<String> = ids
        .chain(NON_ID_COLUMNS.iter().map(|column| column.to_string()))
        .collect();
    format!(
        "SELECT {} FROM Recordings \
         INNER JOIN Sentences ON Recordings.id_sentence = Sentences.id_sentence \
         INNER JOIN Speakers ON Recordings.id_speaker = Speakers.id_speaker",
        columns.join(", ")
    )
}

/// Read-only handle on the relational metadata store.
pub struct MetadataStore {
    connection: Connection,
    path: PathBuf,
}

impl MetadataStore {
    /// Open read-only; a missing file is a metadata-store error.
    pub fn open(path: &Path) -> Result<Self, CorpusError> {
        if !path.is_file() {
            return Err(CorpusError::MetadataStore(format!(
                "metadata store {} does not exist",
                path.display()
            )));
        }
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            CorpusError::MetadataStore(format!("failed opening {}: {err}", path.display()))
        })?;
        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    /// Path the store was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upper bound on the row count; the join can only shrink it.
    pub fn count_recordings(&self) -> Result<u64, CorpusError> {
        let count: i64 = self.connection.query_row(COUNT_QUERY, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Project the recordings, sentences, and speakers join into rows.
    pub fn fetch_rows(&self) -> Result<Vec<MetadataRow>, CorpusError> {
        let names: Vec<&str> = ID_COLUMNS.iter().chain(NON_ID_COLUMNS.iter()).copied().collect();
        let mut statement = self.connection.prepare(&projection_query())?;
        let rows = statement
            .query_map([], |row| {
                let mut out = MetadataRow::with_capacity(names.len());
                for (idx, name) in names.iter().enumerate() {
                    out.insert(name.to_string(), sql_to_json(row.get_ref(idx)?));
                }
                Ok(out)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "[asr_corpus:builder] fetched {} metadata rows from {}",
            rows.len(),
            self.path.display()
        );
        Ok(rows)
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => Value::from(real),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(BASE64.encode(blob)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_qualifies_identifier_columns() {
        let query = projection_query();
        assert!(query.starts_with(
            "SELECT Recordings.id_recording, Sentences.id_sentence, Speakers.id_speaker, Recordings.id_validator, datetime_start"
        ));
        assert!(query.ends_with("Recordings.id_speaker = Speakers.id_speaker"));
    }

    #[test]
    fn missing_database_is_a_store_error() {
        let err = MetadataStore::open(Path::new("/definitely/not/here.db")).err().unwrap();
        assert!(matches!(err, CorpusError::MetadataStore(_)));
    }

    #[test]
    fn sql_values_map_to_json() {
        assert_eq!(sql_to_json(ValueRef::Integer(4)), Value::from(4));
        assert_eq!(sql_to_json(ValueRef::Text(b"hej")), Value::from("hej"));
        assert_eq!(sql_to_json(ValueRef::Null), Value::Null);
    }
}
