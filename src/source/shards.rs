//! Shard discovery and lazy row readers for parquet and JSON-lines files.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::reader::RowIter;
use serde_json::Value;
use walkdir::WalkDir;

use crate::constants::hub::SHARD_EXTENSIONS;
use crate::data::{Record, RecordStream};
use crate::errors::CorpusError;
use crate::source::rows::{ColumnMapping, Row};
use crate::types::SourceId;

/// On-disk shard encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardFormat {
    /// `.parquet`
    Parquet,
    /// `.jsonl` or `.ndjson`
    JsonLines,
}

impl ShardFormat {
    /// Format from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "parquet" => Some(ShardFormat::Parquet),
            "jsonl" | "ndjson" => Some(ShardFormat::JsonLines),
            _ => None,
        }
    }
}

/// True when `path` has one of the accepted shard extensions.
pub fn is_shard_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SHARD_EXTENSIONS
                .iter()
                .any(|accepted| accepted.eq_ignore_ascii_case(ext))
        })
}

/// Whether a repository-relative path belongs to `split`.
///
/// Matches `<split>/` directories, `-<split>-` infixes, and `<split>-` file
/// name prefixes.
pub fn path_mentions_split(path: &str, split: &str) -> bool {
    if split.is_empty() {
        return true;
    }
    let normalized = path.replace('\\', "/");
    normalized.starts_with(&format!("{split}/"))
        || normalized.contains(&format!("/{split}/"))
        || normalized.contains(&format!("-{split}-"))
        || Path::new(&normalized)
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&format!("{split}-")) || name.starts_with(&format!("{split}.")))
}

/// Whether a repository-relative path belongs to `subset`.
pub fn path_mentions_subset(path: &str, subset: Option<&str>) -> bool {
    match subset {
        None => true,
        Some(subset) => {
            let normalized = path.replace('\\', "/");
            normalized.starts_with(&format!("{subset}/")) || normalized.contains(&format!("/{subset}/"))
        }
    }
}

/// Locate local shard files of `split` under `root`.
///
/// `<root>/<subset>/<split>/` and `<root>/<split>/` are tried first; otherwise
/// every shard below `root` whose relative path mentions the split is used.
pub fn discover_local_shards(
    root: &Path,
    subset: Option<&str>,
    split: &str,
) -> Result<Vec<PathBuf>, CorpusError> {
    let mut preferred = Vec::new();
    if let Some(subset) = subset {
        preferred.push(root.join(subset).join(split));
    }
    preferred.push(root.join(split));

    for dir in preferred.into_iter().filter(|dir| dir.is_dir()) {
        let mut shards = shard_files_under(&dir, Some(1))?;
        if !shards.is_empty() {
            shards.sort();
            return Ok(shards);
        }
    }

    let mut shards: Vec<PathBuf> = shard_files_under(root, None)?
        .into_iter()
        .filter(|path| {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            path_mentions_split(&relative, split) && path_mentions_subset(&relative, subset)
        })
        .collect();
    shards.sort();
    Ok(shards)
}

fn shard_files_under(dir: &Path, max_depth: Option<usize>) -> Result<Vec<PathBuf>, CorpusError> {
    let mut walker = WalkDir::new(dir).follow_links(true);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }
    let mut shards = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|err| CorpusError::Io(err.into()))?;
        if entry.file_type().is_file() && ShardFormat::from_path(entry.path()).is_some() {
            shards.push(entry.path().to_path_buf());
        }
    }
    Ok(shards)
}

/// Lazily-read rows of one shard.
pub enum ShardRows {
    /// Parquet rows, decoded one row group at a time.
    Parquet {
        /// Open parquet file.
        reader: Arc<SerializedFileReader<File>>,
        /// Next row group to decode.
        next_group: usize,
        /// Rows of the current group not yet handed out.
        buffered: VecDeque<Row>,
        /// Shard path, for errors.
        path: PathBuf,
        /// Owning source, for errors.
        source_id: SourceId,
    },
    /// JSON-lines rows, parsed one line at a time.
    JsonLines {
        /// Remaining lines.
        lines: Lines<BufReader<File>>,
        /// Lines consumed so far.
        line_no: usize,
        /// Shard path, for errors.
        path: PathBuf,
        /// Owning source, for errors.
        source_id: SourceId,
    },
}

impl ShardRows {
    /// Open a shard for row-at-a-time reading.
    pub fn open(source_id: &str, path: &Path) -> Result<Self, CorpusError> {
        let format = ShardFormat::from_path(path).ok_or_else(|| CorpusError::UnsupportedSourceType {
            source_id: source_id.to_string(),
            details: format!("{} is not a parquet or JSON-lines shard", path.display()),
        })?;
        let file = File::open(path).map_err(|err| CorpusError::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: format!("failed opening shard {}: {err}", path.display()),
        })?;
        Ok(match format {
            ShardFormat::Parquet => {
                let reader =
                    SerializedFileReader::new(file).map_err(|err| CorpusError::SourceUnavailable {
                        source_id: source_id.to_string(),
                        reason: format!("failed reading parquet footer {}: {err}", path.display()),
                    })?;
                ShardRows::Parquet {
                    reader: Arc::new(reader),
                    next_group: 0,
                    buffered: VecDeque::new(),
                    path: path.to_path_buf(),
                    source_id: source_id.to_string(),
                }
            }
            ShardFormat::JsonLines => ShardRows::JsonLines {
                lines: BufReader::new(file).lines(),
                line_no: 0,
                path: path.to_path_buf(),
                source_id: source_id.to_string(),
            },
        })
    }
}

fn load_row_group(
    reader: &SerializedFileReader<File>,
    group: usize,
    path: &Path,
    source_id: &str,
) -> Result<VecDeque<Row>, CorpusError> {
    let unavailable = |reason: String| CorpusError::SourceUnavailable {
        source_id: source_id.to_string(),
        reason,
    };
    let row_group = reader.get_row_group(group).map_err(|err| {
        unavailable(format!(
            "failed opening parquet row group {group} for {}: {err}",
            path.display()
        ))
    })?;
    let iter = RowIter::from_row_group(None, row_group.as_ref()).map_err(|err| {
        unavailable(format!(
            "failed iterating parquet row group {group} for {}: {err}",
            path.display()
        ))
    })?;
    let mut rows = VecDeque::new();
    for (position, row) in iter.enumerate() {
        let row = row.map_err(|err| {
            unavailable(format!(
                "failed reading parquet row {position} in {} row_group {group}: {err}",
                path.display()
            ))
        })?;
        match row.to_json_value() {
            Value::Object(map) => rows.push_back(map),
            other => {
                return Err(CorpusError::SchemaMismatch {
                    source_id: source_id.to_string(),
                    details: format!("parquet row decoded to non-object {other}"),
                });
            }
        }
    }
    Ok(rows)
}

impl Iterator for ShardRows {
    type Item = Result<Row, CorpusError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ShardRows::Parquet {
                reader,
                next_group,
                buffered,
                path,
                source_id,
            } => loop {
                if let Some(row) = buffered.pop_front() {
                    return Some(Ok(row));
                }
                if *next_group >= reader.metadata().num_row_groups() {
                    return None;
                }
                let group = *next_group;
                *next_group += 1;
                match load_row_group(reader, group, path, source_id) {
                    Ok(rows) => *buffered = rows,
                    Err(err) => {
                        *next_group = usize::MAX;
                        return Some(Err(err));
                    }
                }
            },
            ShardRows::JsonLines {
                lines,
                line_no,
                path,
                source_id,
            } => loop {
                let line = match lines.next()? {
                    Ok(line) => line,
                    Err(err) => return Some(Err(CorpusError::Io(err))),
                };
                *line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                return Some(serde_json::from_str::<Row>(&line).map_err(|err| {
                    CorpusError::SchemaMismatch {
                        source_id: source_id.clone(),
                        details: format!("{}:{}: invalid JSON row: {err}", path.display(), line_no),
                    }
                }));
            },
        }
    }
}

/// Resolves a shard reference to a local file, downloading it if needed.
pub type ShardFetcher = Arc<dyn Fn(&str) -> Result<PathBuf, CorpusError> + Send + Sync>;

/// Record stream over a queue of shards, fetched and opened one at a time.
pub struct ShardRecordStream {
    pending: VecDeque<String>,
    fetch: ShardFetcher,
    mapping: Arc<ColumnMapping>,
    current: Option<(ShardRows, PathBuf)>,
    next_index: usize,
    failed: bool,
}

impl ShardRecordStream {
    /// Stream over `shards`, fetched one at a time with `fetch`.
    pub fn new(shards: Vec<String>, fetch: ShardFetcher, mapping: ColumnMapping) -> Self {
        Self {
            pending: shards.into(),
            fetch,
            mapping: Arc::new(mapping),
            current: None,
            next_index: 0,
            failed: false,
        }
    }

    /// Stream over local shard files.
    pub fn local(shards: Vec<PathBuf>, mapping: ColumnMapping) -> Self {
        let shards = shards
            .into_iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        Self::new(shards, Arc::new(|path: &str| Ok(PathBuf::from(path))), mapping)
    }

    /// Box as a record stream.
    pub fn into_record_stream(self) -> RecordStream {
        Box::new(self)
    }

    fn open_next(&mut self) -> Result<bool, CorpusError> {
        let Some(shard) = self.pending.pop_front() else {
            return Ok(false);
        };
        let path = (self.fetch)(&shard)?;
        let rows = ShardRows::open(&self.mapping.source_id, &path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.current = Some((rows, base_dir));
        Ok(true)
    }
}

impl Iterator for ShardRecordStream {
    type Item = Result<Record, CorpusError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((rows, base_dir)) = self.current.as_mut() {
                match rows.next() {
                    Some(Ok(row)) => {
                        let index = self.next_index;
                        self.next_index += 1;
                        let record = self.mapping.row_to_record(row, index, Some(base_dir));
                        if record.is_err() {
                            self.failed = true;
                        }
                        return Some(record);
                    }
                    Some(Err(err)) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }
            match self.open_next() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceDescriptor;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn split_matching_follows_repository_layouts() {
        assert!(path_mentions_split("read_aloud/train/data-00000-of-00002.parquet", "train"));
        assert!(path_mentions_split("data/train-00000-of-00001.parquet", "train"));
        assert!(path_mentions_split("train/a.jsonl", "train"));
        assert!(!path_mentions_split("data/val-00000-of-00001.parquet", "train"));
        assert!(!path_mentions_split("trainer/notes.jsonl", "train"));
    }

    #[test]
    fn subset_matching_requires_a_path_component() {
        assert!(path_mentions_subset("read_aloud/train/x.parquet", Some("read_aloud")));
        assert!(!path_mentions_subset("conversation/train/x.parquet", Some("read_aloud")));
        assert!(path_mentions_subset("anything", None));
    }

    #[test]
    fn discovery_prefers_subset_split_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("read_aloud").join("train");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("data-00001-of-00002.jsonl"), "").unwrap();
        fs::write(nested.join("data-00000-of-00002.jsonl"), "").unwrap();
        fs::write(nested.join("README.md"), "").unwrap();
        fs::create_dir_all(dir.path().join("train")).unwrap();
        fs::write(dir.path().join("train").join("data-00000-of-00001.jsonl"), "").unwrap();

        let shards = discover_local_shards(dir.path(), Some("read_aloud"), "train").unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data-00000-of-00002.jsonl", "data-00001-of-00002.jsonl"]);
    }

    #[test]
    fn discovery_falls_back_to_split_mentions() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data").join("test-00000-of-00001.jsonl"), "").unwrap();
        fs::write(dir.path().join("data").join("train-00000-of-00001.jsonl"), "").unwrap();
        let shards = discover_local_shards(dir.path(), None, "test").unwrap();
        assert_eq!(shards.len(), 1);
        assert!(shards[0].ends_with("data/test-00000-of-00001.jsonl"));
    }

    #[test]
    fn jsonl_stream_spans_shards_lazily() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("data-00000-of-00002.jsonl");
        let second = dir.path().join("data-00001-of-00002.jsonl");
        fs::write(
            &first,
            "{\"text\":\"a\",\"audio\":\"a.wav\"}\n\n{\"text\":\"b\",\"audio\":\"b.wav\"}\n",
        )
        .unwrap();
        fs::write(&second, "{\"text\":\"c\",\"audio\":\"/abs/c.wav\"}\n").unwrap();

        let mapping = ColumnMapping::from_descriptor(&SourceDescriptor::new("local"));
        let records: Vec<Record> = ShardRecordStream::local(vec![first, second], mapping)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            records.iter().map(|r| r.text.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(records[2].id, "local:2");
        assert_eq!(records[0].audio.location(), dir.path().join("a.wav").display().to_string());
        assert_eq!(records[2].audio.location(), "/abs/c.wav");
    }

    #[test]
    fn malformed_line_stops_the_stream() {
        let dir = tempdir().unwrap();
        let shard = dir.path().join("data-00000-of-00001.jsonl");
        fs::write(&shard, "{\"text\":\"a\",\"audio\":\"a.wav\"}\n{oops\n{\"text\":\"c\",\"audio\":\"c.wav\"}\n").unwrap();
        let mapping = ColumnMapping::from_descriptor(&SourceDescriptor::new("local"));
        let mut stream = ShardRecordStream::local(vec![shard], mapping);
        assert!(stream.next().unwrap().is_ok());
        assert!(matches!(stream.next(), Some(Err(CorpusError::SchemaMismatch { .. }))));
        assert!(stream.next().is_none());
    }
}
