use std::collections::HashSet;

use asr_corpus::audio::AudioHandle;
use asr_corpus::pipeline::{load_data_for_finetuning_with, load_dataset_for_evaluation_with};
use asr_corpus::source::{InMemoryResolver, InMemorySource};
use asr_corpus::{
    ConversionTable, CorpusError, NormalizeOptions, PipelineConfig, Record, SourceDescriptor,
    SplitPolicy, TextNormalizer, ValidationStatus, split_records,
};

const RATE: u32 = 1_000;

fn record(id: String, speaker: &str, text: &str) -> Record {
    Record::new(id, AudioHandle::from_samples(vec![0.1; 2 * RATE as usize], RATE), text)
        .with_validation(ValidationStatus::Approved)
        .with_speaker(speaker)
}

fn source(name: &str, size: usize) -> InMemorySource {
    let train = (0..size)
        .map(|idx| record(format!("{name}-{idx}"), "spk", "Et  Eksempel"))
        .collect();
    let val = vec![record(format!("{name}-val"), "spk", "Validering")];
    InMemorySource::new(name).with_split("train", train).with_split("val", val)
}

fn three_source_config(seed: u64) -> (PipelineConfig, InMemoryResolver) {
    let mut config = PipelineConfig {
        seed,
        sampling_rate: None,
        ..PipelineConfig::default()
    };
    let mut resolver = InMemoryResolver::new();
    for (name, size) in [("alpha", 10), ("beta", 15), ("gamma", 20)] {
        config = config.with_source(name, SourceDescriptor::new(name));
        resolver = resolver.with_source(source(name, size));
    }
    (config, resolver)
}

fn train_ids(seed: u64) -> Vec<String> {
    let (config, resolver) = three_source_config(seed);
    let mut corpus = load_data_for_finetuning_with(&config, &resolver).unwrap();
    corpus
        .remove("train")
        .unwrap()
        .materialize()
        .unwrap()
        .into_iter()
        .map(|record| record.id)
        .collect()
}

#[test]
fn interleaved_training_stream_is_reproducible_and_exhaustive() {
    let first = train_ids(7);
    assert_eq!(first.len(), 45);
    assert_eq!(first, train_ids(7));
    assert_ne!(first, train_ids(8));
}

#[test]
fn evaluation_uses_the_first_source_by_default() {
    let (config, resolver) = three_source_config(1);
    let records = load_dataset_for_evaluation_with(&config, "val", &resolver)
        .unwrap()
        .materialize()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "alpha-val");
    assert_eq!(records[0].text, "validering");
}

#[test]
fn partially_weighted_sources_are_rejected() {
    let (mut config, resolver) = three_source_config(1);
    if let Some(first) = config.sources.get_mut("alpha") {
        first.weight = Some(0.5);
    }
    let err = load_data_for_finetuning_with(&config, &resolver).unwrap_err();
    assert!(matches!(err, CorpusError::Configuration(_)));
}

#[test]
fn speaker_splits_are_disjoint() {
    let records: Vec<Record> = (0..60)
        .map(|idx| record(format!("r{idx}"), &format!("spk{}", idx % 12), "x"))
        .collect();
    let policy = SplitPolicy::new(
        ["spk1", "spk2", "spk3"].map(String::from),
        ["spk4", "spk5"].map(String::from),
    );
    let corpus = split_records(records, &policy).unwrap();

    let speakers = |split: &str| -> HashSet<String> {
        match corpus.get(split) {
            Some(asr_corpus::RecordSet::Table(records)) => records
                .iter()
                .filter_map(|record| record.speaker_id.clone())
                .collect(),
            _ => HashSet::new(),
        }
    };
    let (train, val, test) = (speakers("train"), speakers("val"), speakers("test"));
    assert_eq!(val.len(), 3);
    assert_eq!(test.len(), 2);
    assert!(val.is_disjoint(&test));
    assert!(train.is_disjoint(&val));
    assert!(train.is_disjoint(&test));
}

#[test]
fn danish_normalization_is_idempotent_on_mixed_input() {
    let normalizer = TextNormalizer::new(
        ConversionTable::danish(),
        NormalizeOptions {
            lower_case: true,
            characters_to_keep: Some("abcdefghijklmnopqrstuvwxyzæøå0123456789éü ".to_string()),
        },
    );
    let raw = "Aarhus  -  50% af §3\u{200b} \u{2013} Zoë  ";
    let once = normalizer.normalize(raw);
    assert_eq!(normalizer.normalize(&once), once);
    assert!(once.contains("procent"));
    assert!(!once.contains("  "));
    assert_eq!(normalizer.normalize("aae"), "åe");
}
