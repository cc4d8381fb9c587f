/// Unique record identifier (stable across runs).
/// Example: `rec_00012345` (the recording id from the metadata store)
pub type RecordId = String;
/// Identifier for the source that produced a record.
/// Examples: `coral`, `common_voice`, `/data/nst-da`
pub type SourceId = String;
/// Opaque speaker identity used for split assignment.
/// Example: `spe_0aa9c2ff`
pub type SpeakerId = String;
/// Name of a corpus split.
/// Examples: `train`, `val`, `test`
pub type SplitName = String;
/// Name of a column in a source row.
/// Examples: `audio`, `sentence`, `validated`
pub type ColumnName = String;
/// Loosely-typed metadata value carried alongside a record.
/// Examples: `"2023-11-02T10:31:00"`, `"8200"`, `42`
pub type MetaValue = serde_json::Value;
/// Relative shard path inside a dataset repository.
/// Example: `read_aloud/train/data-00000-of-00004.parquet`
pub type ShardPath = String;
