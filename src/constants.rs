/// Canonical and default column names.
pub mod columns {
    /// Canonical audio column every source is renamed to.
    pub const AUDIO: &str = "audio";
    /// Canonical transcript column every source is renamed to.
    pub const TEXT: &str = "text";
    /// Default record identifier column (the metadata store's recording id).
    pub const RECORD_ID: &str = "id_recording";
    /// Default speaker identity column.
    pub const SPEAKER_ID: &str = "id_speaker";
    /// Default manual-validation status column.
    pub const VALIDATION: &str = "validated";
    /// Keys recognised inside a structured audio cell.
    pub const AUDIO_BYTES_KEY: &str = "bytes";
    /// Path key inside a structured audio cell.
    pub const AUDIO_PATH_KEY: &str = "path";
    /// Decoded-samples key inside a structured audio cell.
    pub const AUDIO_ARRAY_KEY: &str = "array";
    /// Sample-rate key inside a structured audio cell.
    pub const AUDIO_SAMPLING_RATE_KEY: &str = "sampling_rate";
}

/// Canonical split names.
pub mod splits {
    /// Training split name.
    pub const TRAIN: &str = "train";
    /// Validation split name.
    pub const VAL: &str = "val";
    /// Test split name.
    pub const TEST: &str = "test";
}

/// Constants used by the pipeline orchestration and its stages.
pub mod pipeline {
    /// Default seed for shuffling and interleaving.
    pub const DEFAULT_SEED: u64 = 4242;
    /// Tolerance used when checking that interleaving weights sum to one.
    pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
    /// Default shuffle buffer for streamed sources.
    pub const DEFAULT_SHUFFLE_BUFFER: usize = 1000;
    /// Environment variable that carries the distributed rank of the process.
    pub const RANK_ENV: &str = "RANK";
    /// Offset mixed into per-source shuffle seeds.
    pub const SHUFFLE_SEED_OFFSET: u64 = 0x5EED_5A11;
}

/// Constants used when talking to the remote dataset repository.
pub mod hub {
    /// Environment variable holding the bearer token.
    pub const TOKEN_ENV: &str = "HUGGINGFACE_HUB_TOKEN";
    /// Base endpoint of the dataset repository service.
    pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
    /// Shard file extensions understood by the row readers.
    pub const SHARD_EXTENSIONS: [&str; 3] = ["parquet", "jsonl", "ndjson"];
    /// Number of hf-hub request retries per call.
    pub const REQUEST_RETRIES: usize = 5;
    /// Revision used for commits.
    pub const DEFAULT_REVISION: &str = "main";
}

/// Constants used by the batch corpus builder.
pub mod builder {
    /// Row count checked before the projection query.
    pub const COUNT_QUERY: &str = "SELECT COUNT(*) FROM Recordings;";
    /// Identifier columns fetched ahead of the non-id features.
    pub const ID_COLUMNS: [&str; 4] = ["id_recording", "id_sentence", "id_speaker", "id_validator"];
    /// Non-identifier columns fetched from the joined tables.
    pub const NON_ID_COLUMNS: [&str; 19] = [
        "datetime_start",
        "datetime_end",
        "text",
        "location",
        "location_roomdim",
        "noise_level",
        "noise_type",
        "source_url",
        "age",
        "gender",
        "dialect",
        "language_native",
        "language_spoken",
        "country_birth",
        "zipcode_birth",
        "zip_school",
        "education",
        "occupation",
        "validated",
    ];
    /// Audio file extension expected inside session directories.
    pub const AUDIO_EXTENSION: &str = "wav";
    /// Default sub-directory of the audio root holding read-aloud sessions.
    pub const READ_ALOUD_SUBDIR: &str = "recordings";
    /// Default configuration name the read-aloud corpus is published under.
    pub const READ_ALOUD_CONFIG: &str = "read_aloud";
    /// Default number of directory-listing attempts.
    pub const LISTING_ATTEMPTS: usize = 10;
    /// Default delay between directory-listing attempts.
    pub const LISTING_BACKOFF_MS: u64 = 1000;
}

/// Constants used by corpus serialization and publication.
pub mod publish {
    /// Default maximum shard size.
    pub const DEFAULT_MAX_SHARD_SIZE: &str = "500MB";
    /// Prefix of every written shard file.
    pub const SHARD_PREFIX: &str = "data";
    /// Extension of written shard files.
    pub const SHARD_EXTENSION: &str = "jsonl";
    /// Extension of shard files still being written.
    pub const PARTIAL_EXTENSION: &str = "partial";
    /// Dataset card at the repository root.
    pub const DATASET_CARD: &str = "README.md";
}
