//! Remote dataset repository source backed by the hf-hub sync client.

use std::path::PathBuf;
use std::sync::Arc;

use hf_hub::api::sync::{Api, ApiBuilder, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::{info, warn};

use crate::config::{HubAccess, SourceDescriptor};
use crate::constants::hub::REQUEST_RETRIES;
use crate::data::RecordSet;
use crate::errors::CorpusError;
use crate::quiet::quietly;
use crate::source::RecordSource;
use crate::source::rows::ColumnMapping;
use crate::source::shards::{
    ShardFetcher, ShardRecordStream, is_shard_path, path_mentions_split, path_mentions_subset,
};
use crate::types::ShardPath;

/// Split of a dataset repository, read shard by shard.
pub struct HubSource {
    repo_id: String,
    subset: Option<String>,
    mapping: ColumnMapping,
    access: HubAccess,
    cache_dir: Option<PathBuf>,
}

impl HubSource {
    /// Remote source for the repository named by the descriptor id.
    pub fn new(descriptor: &SourceDescriptor, access: HubAccess, cache_dir: Option<PathBuf>) -> Self {
        Self {
            repo_id: descriptor.id.clone(),
            subset: descriptor.subset.clone(),
            mapping: ColumnMapping::from_descriptor(descriptor),
            access,
            cache_dir,
        }
    }

    fn build_api(&self, token: Option<String>) -> Result<Api, CorpusError> {
        let mut builder = ApiBuilder::new()
            .with_progress(self.access.show_progress)
            .with_retries(REQUEST_RETRIES)
            .with_endpoint(self.access.endpoint.clone())
            .with_token(token);
        if let Some(cache_dir) = &self.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        builder.build().map_err(|err| CorpusError::SourceUnavailable {
            source_id: self.repo_id.clone(),
            reason: format!("failed building hf-hub client: {err}"),
        })
    }

    fn repo(&self, token: Option<String>) -> Result<ApiRepo, CorpusError> {
        let api = self.build_api(token)?;
        Ok(api.repo(Repo::new(self.repo_id.clone(), RepoType::Dataset)))
    }

    /// Run `call` with the configured credential.
    ///
    /// The repository handle that succeeded is returned so later downloads
    /// use the same credential.
    fn with_credentials<T>(
        &self,
        operation: &str,
        call: impl Fn(&ApiRepo) -> Result<T, ApiError>,
    ) -> Result<(T, ApiRepo), CorpusError> {
        let token = self.access.token();
        with_anonymous_fallback(
            &self.repo_id,
            operation,
            token.is_some(),
            self.access.allow_anonymous_fallback,
            |anonymous| {
                let repo = self
                    .repo(if anonymous { None } else { token.clone() })
                    .map_err(|err| err.to_string())?;
                quietly(|| call(&repo))
                    .map(|value| (value, repo))
                    .map_err(|err| err.to_string())
            },
        )
    }
}

/// Call `attempt(false)` with credentials; on a refused credential, call
/// `attempt(true)` anonymously, but only when a token was used and
/// `allow_anonymous` is set. Any other failure is returned as is.
pub fn with_anonymous_fallback<T>(
    source_id: &str,
    operation: &str,
    had_token: bool,
    allow_anonymous: bool,
    mut attempt: impl FnMut(bool) -> Result<T, String>,
) -> Result<T, CorpusError> {
    let reason = match attempt(false) {
        Ok(value) => return Ok(value),
        Err(reason) => reason,
    };
    if had_token && allow_anonymous && is_credential_error(&reason) {
        warn!(
            "[asr_corpus:hub] {operation} for '{source_id}' was refused with the configured token; retrying anonymously"
        );
        return attempt(true).map_err(|err| CorpusError::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: format!("{operation} failed anonymously: {err}"),
        });
    }
    Err(CorpusError::SourceUnavailable {
        source_id: source_id.to_string(),
        reason: format!("{operation} failed: {reason}"),
    })
}

/// True for failures that look like a refused credential.
pub fn is_credential_error(reason: &str) -> bool {
    ["401", "403", "Unauthorized", "Forbidden", "unauthorized", "forbidden"]
        .iter()
        .any(|marker| reason.contains(marker))
}

/// Shard files of `split` (and `subset`, when given) among repository siblings.
pub fn select_shards(siblings: &[String], subset: Option<&str>, split: &str) -> Vec<ShardPath> {
    let mut shards: Vec<ShardPath> = siblings
        .iter()
        .filter(|path| is_shard_path(path))
        .filter(|path| path_mentions_subset(path, subset))
        .filter(|path| path_mentions_split(path, split))
        .cloned()
        .collect();
    shards.sort();
    shards
}

impl RecordSource for HubSource {
    fn id(&self) -> &str {
        &self.repo_id
    }

    fn load_split(&self, split: &str, streaming: bool) -> Result<RecordSet, CorpusError> {
        info!(
            "[asr_corpus:hub] reading remote file list for dataset {}",
            self.repo_id
        );
        let (siblings, repo) = self.with_credentials("listing repository files", |repo| {
            repo.info().map(|info| {
                info.siblings
                    .into_iter()
                    .map(|sibling| sibling.rfilename)
                    .collect::<Vec<_>>()
            })
        })?;
        let shards = select_shards(&siblings, self.subset.as_deref(), split);
        if shards.is_empty() {
            return Err(CorpusError::SourceUnavailable {
                source_id: self.repo_id.clone(),
                reason: format!(
                    "no shard files for subset {:?} split '{split}' among {} repository files",
                    self.subset,
                    siblings.len()
                ),
            });
        }
        info!(
            "[asr_corpus:hub] split '{split}' of {} has {} shard(s); streaming={streaming}",
            self.repo_id,
            shards.len()
        );

        let repo = Arc::new(repo);
        let source_id = self.repo_id.clone();
        let fetch: ShardFetcher = Arc::new(move |remote: &str| {
            quietly(|| repo.get(remote)).map_err(|err| CorpusError::SourceUnavailable {
                source_id: source_id.clone(),
                reason: format!("failed downloading '{remote}' from hf-hub: {err}"),
            })
        });
        let stream = ShardRecordStream::new(shards, fetch, self.mapping.clone());
        if streaming {
            Ok(RecordSet::Stream(stream.into_record_stream()))
        } else {
            Ok(RecordSet::Table(stream.collect::<Result<Vec<_>, _>>()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_selection_respects_subset_and_split() {
        let siblings: Vec<String> = [
            ".gitattributes",
            "README.md",
            "read_aloud/train/data-00001-of-00002.parquet",
            "read_aloud/train/data-00000-of-00002.parquet",
            "read_aloud/val/data-00000-of-00001.parquet",
            "conversation/train/data-00000-of-00001.parquet",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let shards = select_shards(&siblings, Some("read_aloud"), "train");
        assert_eq!(
            shards,
            vec![
                "read_aloud/train/data-00000-of-00002.parquet".to_string(),
                "read_aloud/train/data-00001-of-00002.parquet".to_string(),
            ]
        );
        assert_eq!(select_shards(&siblings, None, "val").len(), 1);
        assert!(select_shards(&siblings, Some("read_aloud"), "test").is_empty());
    }

    fn refused_then_open(calls: &mut Vec<bool>, anonymous: bool, failure: &str) -> Result<u32, String> {
        calls.push(anonymous);
        if anonymous { Ok(1) } else { Err(failure.to_string()) }
    }

    #[test]
    fn refused_token_falls_back_when_allowed() {
        let mut calls = Vec::new();
        let value = with_anonymous_fallback("org/data", "listing", true, true, |anonymous| {
            refused_then_open(&mut calls, anonymous, "status code 401")
        })
        .unwrap();
        assert_eq!(value, 1);
        assert_eq!(calls, vec![false, true]);
    }

    #[test]
    fn refused_token_is_fatal_without_permission() {
        let mut calls = Vec::new();
        let err = with_anonymous_fallback("org/data", "listing", true, false, |anonymous| {
            refused_then_open(&mut calls, anonymous, "status code 403")
        })
        .unwrap_err();
        assert!(matches!(err, CorpusError::SourceUnavailable { ref reason, .. } if reason.contains("403")));
        assert_eq!(calls, vec![false]);
    }

    #[test]
    fn other_failures_never_retry_anonymously() {
        let mut calls = Vec::new();
        let err = with_anonymous_fallback("org/data", "listing", true, true, |anonymous| {
            refused_then_open(&mut calls, anonymous, "connection reset")
        });
        assert!(err.is_err());
        assert_eq!(calls, vec![false]);

        let mut calls = Vec::new();
        let err = with_anonymous_fallback("org/data", "listing", false, true, |anonymous| {
            refused_then_open(&mut calls, anonymous, "status code 401")
        });
        assert!(err.is_err());
        assert_eq!(calls, vec![false]);
    }

    #[test]
    fn credential_failures_are_recognised() {
        assert!(is_credential_error("request error: status code 401"));
        assert!(is_credential_error("Forbidden: gated dataset"));
        assert!(!is_credential_error("connection refused"));
    }
}
