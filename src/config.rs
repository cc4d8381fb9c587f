use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::constants::{builder, columns, hub, pipeline, publish, splits};
use crate::errors::CorpusError;
use crate::filter::ValidationPolicy;
use crate::normalize::{ConversionTable, NormalizeOptions, TextNormalizer};
use crate::splits::SplitPolicy;
use crate::types::{SourceId, SpeakerId};

/// Default allowlist applied by character cleaning.
pub const DEFAULT_CHARACTERS_TO_KEEP: &str = "abcdefghijklmnopqrstuvwxyzæøå0123456789éü ";

/// Read-only description of one record source.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourceDescriptor {
    /// Repository id or local directory of the source.
    pub id: SourceId,
    /// Optional configuration (subset) name inside the source.
    pub subset: Option<String>,
    /// Name of the training split in this source.
    pub train_name: String,
    /// Name of the validation split in this source.
    pub val_name: String,
    /// Name of the test split in this source.
    pub test_name: String,
    /// Source column renamed to the canonical `text`.
    pub text_column: String,
    /// Source column renamed to the canonical `audio`.
    pub audio_column: String,
    /// Column holding the record identifier; a synthetic id is used when absent.
    pub id_column: Option<String>,
    /// Column holding the speaker identity, when the source has one.
    pub speaker_column: Option<String>,
    /// Column holding the manual-validation status, when the source has one.
    pub validation_column: Option<String>,
    /// Interleaving weight. Either every source sets one or none does.
    pub weight: Option<f64>,
}

impl Default for SourceDescriptor {
    fn default() -> Self {
        Self {
            id: String::new(),
            subset: None,
            train_name: splits::TRAIN.to_string(),
            val_name: splits::VAL.to_string(),
            test_name: splits::TEST.to_string(),
            text_column: columns::TEXT.to_string(),
            audio_column: columns::AUDIO.to_string(),
            id_column: Some(columns::RECORD_ID.to_string()),
            speaker_column: Some(columns::SPEAKER_ID.to_string()),
            validation_column: Some(columns::VALIDATION.to_string()),
            weight: None,
        }
    }
}

impl SourceDescriptor {
    /// Descriptor with canonical column names for `id`.
    pub fn new(id: impl Into<SourceId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Restrict to one named subset (config) of the source.
    pub fn with_subset(mut self, subset: impl Into<String>) -> Self {
        self.subset = Some(subset.into());
        self
    }

    /// Override the transcript and audio column names.
    pub fn with_columns(mut self, text_column: impl Into<String>, audio_column: impl Into<String>) -> Self {
        self.text_column = text_column.into();
        self.audio_column = audio_column.into();
        self
    }

    /// Interleaving weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Credentials and transport knobs for the remote dataset repository.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubAccess {
    /// Environment variable carrying the bearer token.
    pub token_env: String,
    /// Retry anonymously when the credentialed request is refused.
    pub allow_anonymous_fallback: bool,
    /// Show download progress bars.
    pub show_progress: bool,
    /// Base URL of the repository service.
    pub endpoint: String,
}

impl Default for HubAccess {
    fn default() -> Self {
        Self {
            token_env: hub::TOKEN_ENV.to_string(),
            allow_anonymous_fallback: false,
            show_progress: false,
            endpoint: hub::DEFAULT_ENDPOINT.to_string(),
        }
    }
}

impl HubAccess {
    /// Token from the configured environment variable; blank values count as unset.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }
}

/// Settings for the training and evaluation loaders.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Training sources keyed by a short name, interleaved in this order.
    pub sources: IndexMap<String, SourceDescriptor>,
    /// Key into `sources` whose validation split is used for evaluation.
    pub evaluation_source: Option<String>,
    /// Seed for shuffling and interleaving.
    pub seed: u64,
    /// Stream remote shards instead of materializing them up front.
    pub streaming: bool,
    /// Download cache; the hf-hub default cache is used when unset.
    pub cache_dir: Option<PathBuf>,
    /// Apply the validation filter during loading.
    pub filter_dataset: bool,
    /// Records at or below this duration are dropped.
    pub min_seconds_per_example: f64,
    /// Records at or above this duration are dropped.
    pub max_seconds_per_example: f64,
    /// Enforce `characters_to_keep` on transcripts.
    pub clean_text: bool,
    /// Lower-case transcripts before filtering characters.
    pub lower_case: bool,
    /// Allowlist applied when `clean_text` is set.
    pub characters_to_keep: String,
    /// Decode target for audio; `None` keeps native rates.
    pub sampling_rate: Option<u32>,
    /// Shuffle buffer used for streamed sources.
    pub shuffle_buffer_size: usize,
    /// Repository access.
    pub hub: HubAccess,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: IndexMap::new(),
            evaluation_source: None,
            seed: pipeline::DEFAULT_SEED,
            streaming: true,
            cache_dir: None,
            filter_dataset: true,
            min_seconds_per_example: 0.5,
            max_seconds_per_example: 10.0,
            clean_text: true,
            lower_case: true,
            characters_to_keep: DEFAULT_CHARACTERS_TO_KEEP.to_string(),
            sampling_rate: Some(16_000),
            shuffle_buffer_size: pipeline::DEFAULT_SHUFFLE_BUFFER,
            hub: HubAccess::default(),
        }
    }
}

impl PipelineConfig {
    /// Register a training source under `name`.
    pub fn with_source(mut self, name: impl Into<String>, source: SourceDescriptor) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Filtering policy derived from the duration bounds.
    pub fn validation_policy(&self, remove_maybe: bool) -> ValidationPolicy {
        ValidationPolicy {
            min_duration_s: self.min_seconds_per_example,
            max_duration_s: self.max_seconds_per_example,
            remove_maybe,
        }
    }

    /// Normalizer built from the cleaning options and the default table.
    ///
    /// `None` when `clean_text` is off: transcripts then pass through
    /// untouched, lower-casing included.
    pub fn text_normalizer(&self) -> Option<TextNormalizer> {
        self.clean_text.then(|| {
            TextNormalizer::new(
                ConversionTable::default(),
                NormalizeOptions {
                    lower_case: self.lower_case,
                    characters_to_keep: Some(self.characters_to_keep.clone()),
                },
            )
        })
    }

    /// Interleaving weights: all set, none set, or a configuration error.
    pub fn source_weights(&self) -> Result<Option<Vec<f64>>, CorpusError> {
        let weights: Vec<Option<f64>> = self.sources.values().map(|source| source.weight).collect();
        if weights.iter().all(Option::is_none) {
            return Ok(None);
        }
        weights
            .into_iter()
            .zip(self.sources.keys())
            .map(|(weight, name)| {
                weight.ok_or_else(|| {
                    CorpusError::Configuration(format!(
                        "source '{name}' has no weight while other sources do"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Descriptor whose validation split feeds evaluation. Defaults to the
    /// first configured source.
    pub fn evaluation_descriptor(&self) -> Result<&SourceDescriptor, CorpusError> {
        match &self.evaluation_source {
            Some(name) => self.sources.get(name).ok_or_else(|| {
                CorpusError::Configuration(format!("evaluation source '{name}' is not configured"))
            }),
            None => self
                .sources
                .values()
                .next()
                .ok_or_else(|| CorpusError::Configuration("no sources configured".to_string())),
        }
    }

    /// Load from a JSON file; absent keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        load_json(path.as_ref())
    }
}

/// Settings for the one-time corpus build and publication.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Root directory holding the audio sub-directories.
    pub audio_dir: PathBuf,
    /// Path to the SQLite metadata store.
    pub metadata_database_path: PathBuf,
    /// Destination repository id; `None` skips publication.
    pub hub_id: Option<String>,
    /// Subset name the shards are published under.
    pub config_name: String,
    /// Sub-directory of `audio_dir` holding per-session folders.
    pub audio_subdir: String,
    /// Speakers routed to `val`.
    pub validation_speakers: Vec<SpeakerId>,
    /// Speakers routed to `test`.
    pub test_speakers: Vec<SpeakerId>,
    /// Maximum shard size, e.g. `500MB`.
    pub max_shard_size: String,
    /// Message of the publication commit.
    pub commit_message: String,
    /// Create the repository as private.
    pub private: bool,
    /// Attempts per audio directory listing.
    pub listing_attempts: usize,
    /// Pause between listing attempts, in milliseconds.
    pub listing_backoff_ms: u64,
    /// Keep the written shards here instead of a temporary staging dir.
    pub output_dir: Option<PathBuf>,
    /// Repository access; publishing needs a token.
    pub hub: HubAccess,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            audio_dir: PathBuf::new(),
            metadata_database_path: PathBuf::new(),
            hub_id: None,
            config_name: builder::READ_ALOUD_CONFIG.to_string(),
            audio_subdir: builder::READ_ALOUD_SUBDIR.to_string(),
            validation_speakers: Vec::new(),
            test_speakers: Vec::new(),
            max_shard_size: publish::DEFAULT_MAX_SHARD_SIZE.to_string(),
            commit_message: "Add read-aloud data".to_string(),
            private: true,
            listing_attempts: builder::LISTING_ATTEMPTS,
            listing_backoff_ms: builder::LISTING_BACKOFF_MS,
            output_dir: None,
            hub: HubAccess::default(),
        }
    }
}

impl BuilderConfig {
    /// Speaker allow-lists as an owned split policy.
    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy::new(
            self.validation_speakers.iter().cloned(),
            self.test_speakers.iter().cloned(),
        )
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        load_json(path.as_ref())
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, CorpusError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        CorpusError::Configuration(format!("failed reading config {}: {err}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        CorpusError::Configuration(format!("failed parsing config {}: {err}", path.display()))
    })
}
