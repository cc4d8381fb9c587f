//! Trainer-facing loaders: resolve, filter, normalize, conform, interleave.

use std::sync::Arc;

use tracing::info;

use crate::audio::conform;
use crate::config::{PipelineConfig, SourceDescriptor};
use crate::constants::pipeline::{RANK_ENV, SHUFFLE_SEED_OFFSET};
use crate::constants::splits::{TRAIN, VAL};
use crate::data::{Corpus, RecordSet};
use crate::errors::CorpusError;
use crate::filter::filter_records;
use crate::hash::derive_seed;
use crate::interleave::interleave;
use crate::normalize::{TextNormalizer, normalize_records};
use crate::source::{DefaultResolver, SourceResolver};

/// True unless `RANK` names a non-zero distributed rank.
pub fn is_main_process() -> bool {
    match std::env::var(RANK_ENV) {
        Ok(rank) => rank.trim().parse::<i64>().map_or(true, |rank| rank == 0),
        Err(_) => true,
    }
}

/// Conform audio, then normalize transcripts when `clean_text` is set.
pub fn process_records(records: RecordSet, config: &PipelineConfig) -> RecordSet {
    process_with(records, config, config.text_normalizer().map(Arc::new))
}

fn process_with(
    records: RecordSet,
    config: &PipelineConfig,
    normalizer: Option<Arc<TextNormalizer>>,
) -> RecordSet {
    let conformed = conform(records, config.sampling_rate);
    match normalizer {
        Some(normalizer) => normalize_records(conformed, normalizer),
        None => conformed,
    }
}

fn load_training_source(
    name: &str,
    descriptor: &SourceDescriptor,
    config: &PipelineConfig,
    resolver: &dyn SourceResolver,
    normalizer: Option<&Arc<TextNormalizer>>,
) -> Result<RecordSet, CorpusError> {
    let source = resolver.resolve(descriptor)?;
    let records = source
        .load_split(&descriptor.train_name, config.streaming)?
        .map_infallible(|record| record.retain_core_columns())
        .shuffle(
            derive_seed(config.seed ^ SHUFFLE_SEED_OFFSET, name),
            config.shuffle_buffer_size,
        );
    let records = if config.filter_dataset {
        filter_records(records, config.validation_policy(false))?
    } else {
        records
    };
    Ok(process_with(records, config, normalizer.cloned()))
}

/// Build the `train` and `val` splits used for fine-tuning.
pub fn load_data_for_finetuning(config: &PipelineConfig) -> Result<Corpus, CorpusError> {
    load_data_for_finetuning_with(config, &DefaultResolver::from_config(config))
}

/// [`load_data_for_finetuning`] with an explicit resolver.
pub fn load_data_for_finetuning_with(
    config: &PipelineConfig,
    resolver: &dyn SourceResolver,
) -> Result<Corpus, CorpusError> {
    if config.sources.is_empty() {
        return Err(CorpusError::Configuration("no sources configured".to_string()));
    }
    let weights = config.source_weights()?;
    let normalizer = config.text_normalizer().map(Arc::new);
    let main = is_main_process();

    let mut train_sets = Vec::with_capacity(config.sources.len());
    for (name, descriptor) in &config.sources {
        if main {
            info!("[asr_corpus:pipeline] loading training source '{name}' ({})", descriptor.id);
        }
        train_sets.push(load_training_source(name, descriptor, config, resolver, normalizer.as_ref())?);
    }

    let train = if train_sets.len() > 1 {
        interleave(train_sets, weights.as_deref(), config.seed)?
    } else {
        train_sets.remove(0)
    };

    let eval_descriptor = config.evaluation_descriptor()?;
    let eval_source = resolver.resolve(eval_descriptor)?;
    let val = eval_source
        .load_split(&eval_descriptor.val_name, config.streaming)?
        .map_infallible(|record| record.retain_core_columns());
    let val = if config.filter_dataset {
        filter_records(val, config.validation_policy(true))?
    } else {
        val
    };
    let val = process_with(val, config, normalizer);

    let mut corpus = Corpus::new();
    corpus.insert(TRAIN, train);
    corpus.insert(VAL, val);
    Ok(corpus)
}

/// Load one split of the evaluation source as a finite, cleaned table.
pub fn load_dataset_for_evaluation(config: &PipelineConfig, split: &str) -> Result<RecordSet, CorpusError> {
    load_dataset_for_evaluation_with(config, split, &DefaultResolver::from_config(config))
}

/// [`load_dataset_for_evaluation`] with an explicit resolver.
pub fn load_dataset_for_evaluation_with(
    config: &PipelineConfig,
    split: &str,
    resolver: &dyn SourceResolver,
) -> Result<RecordSet, CorpusError> {
    let descriptor = config.evaluation_descriptor()?;
    let source = resolver.resolve(descriptor)?;
    let records = source.load_split(split, true)?;
    let records = filter_records(records, config.validation_policy(true))?;
    let records = process_records(records, config).materialize()?;
    if is_main_process() {
        info!(
            "[asr_corpus:pipeline] loaded {} evaluation records from '{}' split '{split}'",
            records.len(),
            descriptor.id
        );
    }
    Ok(RecordSet::Table(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioHandle;
    use crate::data::{Record, ValidationStatus};
    use crate::source::{InMemoryResolver, InMemorySource};

    const RATE: u32 = 1_000;

    fn record(id: &str, seconds: f64, status: ValidationStatus, text: &str) -> Record {
        Record::new(
            id,
            AudioHandle::from_samples(vec![0.0; (seconds * RATE as f64) as usize], RATE),
            text,
        )
        .with_validation(status)
        .with_meta("noise_level", "low")
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            sampling_rate: None,
            ..PipelineConfig::default()
        }
        .with_source("alpha", SourceDescriptor::new("alpha"))
    }

    fn resolver() -> InMemoryResolver {
        InMemoryResolver::new().with_source(
            InMemorySource::new("alpha")
                .with_split(
                    "train",
                    vec![
                        record("t1", 2.0, ValidationStatus::Approved, "Hej  VERDEN"),
                        record("t2", 2.0, ValidationStatus::Maybe, "måske"),
                        record("t3", 2.0, ValidationStatus::Rejected, "nej"),
                        record("t4", 20.0, ValidationStatus::Approved, "for lang"),
                    ],
                )
                .with_split(
                    "val",
                    vec![
                        record("v1", 2.0, ValidationStatus::Approved, "ja"),
                        record("v2", 2.0, ValidationStatus::Maybe, "måske"),
                    ],
                ),
        )
    }

    #[test]
    fn finetuning_corpus_applies_split_specific_policies() {
        let corpus = load_data_for_finetuning_with(&config(), &resolver()).unwrap();
        assert_eq!(corpus.split_names(), vec!["train", "val"]);
        let mut corpus = corpus;
        let mut train = corpus.remove("train").unwrap().materialize().unwrap();
        train.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(train.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["t1", "t2"]);
        assert_eq!(train[0].text, "hej verden");
        assert!(train[0].metadata.is_empty());

        let val = corpus.remove("val").unwrap().materialize().unwrap();
        assert_eq!(val.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["v1"]);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn unweighted_sources_warn_once() {
        let config = config().with_source("beta", SourceDescriptor::new("beta"));
        let resolver = resolver().with_source(
            InMemorySource::new("beta")
                .with_split("train", vec![record("b1", 2.0, ValidationStatus::Approved, "to")]),
        );
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            load_data_for_finetuning_with(&config, &resolver)
        })
        .unwrap();
        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("sampling uniformly").count(), 1);
    }

    #[test]
    fn evaluation_loader_returns_a_table() {
        let records = load_dataset_for_evaluation_with(&config(), "val", &resolver()).unwrap();
        assert_eq!(records.len(), Some(1));
    }

    #[test]
    fn empty_source_list_is_a_configuration_error() {
        let err = load_data_for_finetuning_with(&PipelineConfig::default(), &resolver()).unwrap_err();
        assert!(matches!(err, CorpusError::Configuration(_)));
    }

    #[test]
    fn disabled_cleaning_leaves_text_untouched() {
        let config = PipelineConfig {
            clean_text: false,
            ..PipelineConfig::default()
        };
        let out = process_records(
            RecordSet::Table(vec![record("x", 1.0, ValidationStatus::Absent, "Hej  Aase 50%")]),
            &config,
        )
        .materialize()
        .unwrap();
        assert_eq!(out[0].text, "Hej  Aase 50%");
        assert_eq!(out[0].audio.target_sample_rate(), Some(16_000));
    }

    #[test]
    fn conform_declares_target_rate() {
        let config = PipelineConfig::default();
        let out = process_records(
            RecordSet::Table(vec![record("x", 1.0, ValidationStatus::Absent, "Tekst")]),
            &config,
        )
        .materialize()
        .unwrap();
        assert_eq!(out[0].audio.target_sample_rate(), Some(16_000));
        assert_eq!(out[0].text, "tekst");
    }
}
