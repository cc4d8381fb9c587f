use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, error::ErrorKind};
use tracing::info;

use crate::builder::CorpusBuilder;
use crate::config::BuilderConfig;
use crate::publish::{parse_shard_size, publish_corpus};

#[derive(Debug, Parser)]
#[command(
    name = "build-corpus",
    disable_help_subcommand = true,
    about = "Build the read-aloud corpus from a metadata store and audio tree",
    long_about = "Join the relational metadata store to the recorded audio files, split by speaker, and write or publish the result as sharded JSON lines.",
    after_help = "Without --hub-id and without a hub_id in the config file, shards are only written to --output-dir."
)]
/// CLI for `build-corpus`.
///
/// Common usage:
/// - Dry run that only reports split sizes: `build-corpus --config builder.json --dry-run`
/// - Keep shards locally: `build-corpus --config builder.json --output-dir /tmp/corpus`
/// - Publish: `build-corpus --config builder.json --hub-id org/read-aloud`
struct BuildCorpusCli {
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON builder configuration (audio_dir, metadata_database_path, speaker lists, ...)"
    )]
    config: PathBuf,
    #[arg(long = "hub-id", value_name = "REPO", help = "Destination dataset repository override")]
    hub_id: Option<String>,
    #[arg(
        long = "output-dir",
        value_name = "DIR",
        help = "Keep the written shards in this directory"
    )]
    output_dir: Option<PathBuf>,
    #[arg(
        long = "max-shard-size",
        value_name = "SIZE",
        value_parser = parse_shard_size_arg,
        help = "Maximum shard size such as 500MB or 1GiB"
    )]
    max_shard_size: Option<String>,
    #[arg(long, help = "Create the destination repository as public")]
    public: bool,
    #[arg(long = "dry-run", help = "Build and split, report sizes, write nothing")]
    dry_run: bool,
}

fn parse_shard_size_arg(raw: &str) -> Result<String, String> {
    parse_shard_size(raw)
        .map(|_| raw.trim().to_string())
        .map_err(|err| err.to_string())
}

/// Entry point of the `build-corpus` binary.
pub fn run_build_corpus<I>(args_iter: I) -> Result<(), Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let Some(cli) = parse_cli::<BuildCorpusCli, _>(
        std::iter::once("build-corpus".to_string()).chain(args_iter),
    )?
    else {
        return Ok(());
    };

    let mut config = BuilderConfig::from_json_file(&cli.config)?;
    if let Some(hub_id) = cli.hub_id {
        config.hub_id = Some(hub_id);
    }
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = Some(output_dir);
    }
    if let Some(max_shard_size) = cli.max_shard_size {
        config.max_shard_size = max_shard_size;
    }
    if cli.public {
        config.private = false;
    }
    if !cli.dry_run && config.hub_id.is_none() && config.output_dir.is_none() {
        return Err("nothing to do: set --hub-id or --output-dir (or use --dry-run)".into());
    }

    let builder = CorpusBuilder::new(config);
    let corpus = builder.build()?;
    for (split, records) in corpus.iter() {
        println!(
            "{split:<6} {:>10} records",
            records.len().map_or_else(|| "?".to_string(), |len| len.to_string())
        );
    }
    if cli.dry_run {
        return Ok(());
    }

    let report = publish_corpus(corpus, builder.config())?;
    let rows: usize = report.shards.iter().map(|shard| shard.rows).sum();
    info!(
        "[asr_corpus:apps] wrote {rows} rows across {} shard(s)",
        report.shards.len()
    );
    if let Some(dir) = &report.output_dir {
        println!("shards kept in {}", dir.display());
    }
    if report.uploaded
        && let Some(hub_id) = &builder.config().hub_id
    {
        println!("published to {hub_id}");
    }
    Ok(())
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> BuildCorpusCli {
        BuildCorpusCli::try_parse_from(
            std::iter::once("build-corpus").chain(args.iter().copied()),
        )
        .unwrap()
    }

    #[test]
    fn overrides_parse() {
        let cli = parse(&[
            "--config",
            "b.json",
            "--hub-id",
            "org/corpus",
            "--max-shard-size",
            "1GiB",
            "--public",
        ]);
        assert_eq!(cli.config, PathBuf::from("b.json"));
        assert_eq!(cli.hub_id.as_deref(), Some("org/corpus"));
        assert_eq!(cli.max_shard_size.as_deref(), Some("1GiB"));
        assert!(cli.public);
        assert!(!cli.dry_run);
    }

    #[test]
    fn bad_shard_size_is_rejected_at_parse_time() {
        let parsed = BuildCorpusCli::try_parse_from([
            "build-corpus",
            "--config",
            "b.json",
            "--max-shard-size",
            "huge",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn help_short_circuits() {
        let parsed = parse_cli::<BuildCorpusCli, _>(["build-corpus", "--help"]).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = run_build_corpus(
            ["--config", "/definitely/missing.json", "--dry-run"]
                .into_iter()
                .map(String::from),
        );
        assert!(err.is_err());
    }
}
