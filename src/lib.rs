//! Curation pipeline for multi-source speech recognition corpora.
//!
//! Records (audio, transcript, review status, speaker) are loaded from local
//! tables or a remote dataset repository, filtered by duration and manual
//! review, normalized to a controlled character set, conformed to a target
//! sample rate, and interleaved into one training stream. A separate batch
//! path builds the source table from a relational metadata store and a tree
//! of recorded audio, splits it by speaker, and publishes it.

#![warn(missing_docs)]

/// Runners behind the bundled binaries.
pub mod apps;
/// Lazy audio handles, resampling, and the sample-rate conformer.
pub mod audio;
/// One-time corpus construction from the metadata store.
pub mod builder;
/// Pipeline, source, and builder configuration.
pub mod config;
/// Centralized constants grouped by concern.
pub mod constants;
/// Records, record sets, and corpora.
pub mod data;
/// Duration and review-status filtering.
pub mod filter;
mod hash;
/// Seeded weighted interleaving.
pub mod interleave;
/// Transcript normalization.
pub mod normalize;
/// Trainer-facing loaders.
pub mod pipeline;
/// Shard writing and repository upload.
pub mod publish;
/// Scoped log suppression around noisy calls.
pub mod quiet;
/// Record sources and resolvers.
pub mod source;
/// Speaker-based split assignment.
pub mod splits;
/// Input transports used by the builder (filesystem today).
pub mod transport;
/// Shared type aliases.
pub mod types;

mod errors;

pub use audio::{AudioHandle, conform};
pub use builder::CorpusBuilder;
pub use config::{BuilderConfig, HubAccess, PipelineConfig, SourceDescriptor};
pub use data::{Corpus, Record, RecordSet, ValidationStatus};
pub use errors::CorpusError;
pub use filter::{ValidationPolicy, filter_corpus, filter_records};
pub use interleave::interleave;
pub use normalize::{ConversionTable, NormalizeOptions, TextNormalizer};
pub use pipeline::{load_data_for_finetuning, load_dataset_for_evaluation};
pub use publish::{HubPublisher, publish_corpus, write_corpus_shards};
pub use quiet::quietly;
pub use source::{DefaultResolver, RecordSource, SourceResolver};
pub use splits::{SplitLabel, SplitPolicy, split_records};
pub use types::{ColumnName, MetaValue, RecordId, SourceId, SpeakerId, SplitName};
