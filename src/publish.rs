//! Corpus serialization and upload to the dataset repository.
//!
//! Splits are written as JSON-lines shards laid out as
//! `<config>/<split>/data-XXXXX-of-YYYYY.jsonl`, each no larger than the
//! configured maximum unless a single row exceeds it. Shards left over from an
//! earlier publication of the same config are removed, locally and in the
//! repository, and the dataset card lists every config's data files. Uploads
//! go through the repository's large-file batch API followed by one commit.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{BuilderConfig, HubAccess};
use crate::constants::hub::DEFAULT_REVISION;
use crate::constants::publish::{DATASET_CARD, PARTIAL_EXTENSION, SHARD_EXTENSION, SHARD_PREFIX};
use crate::data::Corpus;
use crate::errors::CorpusError;
use crate::quiet::quietly;
use crate::source::rows::record_to_row;
use crate::source::shards::is_shard_path;

/// Parse a human shard size such as `500MB`, `1GiB`, or `1048576`.
///
/// Decimal units are powers of 1000; `KiB`/`MiB`/`GiB`/`TiB` are powers of 1024.
pub fn parse_shard_size(raw: &str) -> Result<u64, CorpusError> {
    let trimmed = raw.trim();
    let split_at = trimmed
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split_at);
    let value: f64 = number
        .parse()
        .map_err(|_| CorpusError::Configuration(format!("invalid shard size '{raw}'")))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1 << 40,
        other => {
            return Err(CorpusError::Configuration(format!(
                "unknown shard size unit '{other}' in '{raw}'"
            )));
        }
    };
    let bytes = (value * multiplier as f64) as u64;
    if bytes == 0 {
        return Err(CorpusError::Configuration(format!(
            "shard size '{raw}' must be positive"
        )));
    }
    Ok(bytes)
}

/// A shard file written to the staging directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenShard {
    /// Split the rows belong to.
    pub split: String,
    /// Path inside the repository, `/`-separated.
    pub repo_path: String,
    /// Where the shard sits on disk.
    pub local_path: PathBuf,
    /// Rows in the shard.
    pub rows: usize,
    /// Size on disk, in bytes.
    pub bytes: u64,
}

/// True for a file name or path whose last component is a `data-*` shard.
pub fn is_published_shard(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.starts_with(&format!("{SHARD_PREFIX}-")) && is_shard_path(name)
}

/// Remove shard files, including unfinished `.partial` ones, below `dir`.
fn remove_stale_shards(dir: &Path) -> Result<usize, CorpusError> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut stale = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|err| CorpusError::Io(err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let partial = name.starts_with(&format!("{SHARD_PREFIX}-"))
            && name.ends_with(&format!(".{PARTIAL_EXTENSION}"));
        if partial || is_published_shard(&name) {
            stale.push(entry.path().to_path_buf());
        }
    }
    for path in &stale {
        fs::remove_file(path)?;
    }
    if !stale.is_empty() {
        info!(
            "[asr_corpus:publish] removed {} stale shard(s) under {}",
            stale.len(),
            dir.display()
        );
    }
    Ok(stale.len())
}

/// Shards of `config_name` in the repository that the new upload does not replace.
pub fn stale_remote_shards(remote_files: &[String], config_name: &str, new_paths: &[&str]) -> Vec<String> {
    let prefix = format!("{config_name}/");
    let keep: HashSet<&str> = new_paths.iter().copied().collect();
    remote_files
        .iter()
        .filter(|path| path.starts_with(&prefix) && is_published_shard(path))
        .filter(|path| !keep.contains(path.as_str()))
        .cloned()
        .collect()
}

/// Render the dataset card with one `configs:` entry per config directory.
///
/// Every `<config>/<split>/data-*` shard in `repo_files` registers its split.
/// Any body below the front matter of `existing` is kept.
pub fn render_dataset_card(existing: Option<&str>, repo_files: &[String]) -> String {
    let mut configs: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for path in repo_files {
        let mut parts = path.split('/');
        if let (Some(config), Some(split), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
            && is_published_shard(path)
        {
            configs.entry(config).or_default().insert(split);
        }
    }

    let mut card = String::from("---\nconfigs:\n");
    for (config, splits) in &configs {
        card.push_str(&format!("- config_name: {config}\n  data_files:\n"));
        for split in splits {
            card.push_str(&format!(
                "  - split: {split}\n    path: {config}/{split}/{SHARD_PREFIX}-*\n"
            ));
        }
    }
    card.push_str("---\n");
    if let Some(body) = existing.map(card_body)
        && !body.trim().is_empty()
    {
        card.push('\n');
        card.push_str(body.trim_start_matches('\n'));
    }
    card
}

fn card_body(card: &str) -> &str {
    let Some(rest) = card.strip_prefix("---\n") else {
        return card;
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            after.strip_prefix('\n').unwrap_or(after)
        }
        None => card,
    }
}

fn relative_files(root: &Path) -> Result<Vec<String>, CorpusError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| CorpusError::Io(err.into()))?;
        if entry.file_type().is_file()
            && let Ok(relative) = entry.path().strip_prefix(root)
        {
            let parts: Vec<String> = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(parts.join("/"));
        }
    }
    files.sort();
    Ok(files)
}

struct ShardWriter {
    dir: PathBuf,
    max_bytes: u64,
    parts: Vec<(PathBuf, usize, u64)>,
    current: Option<(BufWriter<File>, PathBuf, usize, u64)>,
}

impl ShardWriter {
    fn new(dir: PathBuf, max_bytes: u64) -> Self {
        Self {
            dir,
            max_bytes,
            parts: Vec::new(),
            current: None,
        }
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), CorpusError> {
        let len = line.len() as u64 + 1;
        let full = self
            .current
            .as_ref()
            .is_some_and(|(_, _, rows, bytes)| *rows > 0 && bytes + len > self.max_bytes);
        if full {
            self.close_current()?;
        }
        if self.current.is_none() {
            let path = self
                .dir
                .join(format!("{SHARD_PREFIX}-{:05}.{PARTIAL_EXTENSION}", self.parts.len()));
            let file = File::create(&path)?;
            self.current = Some((BufWriter::new(file), path, 0, 0));
        }
        if let Some((writer, _, rows, bytes)) = self.current.as_mut() {
            writer.write_all(line)?;
            writer.write_all(b"\n")?;
            *rows += 1;
            *bytes += len;
        }
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), CorpusError> {
        if let Some((mut writer, path, rows, bytes)) = self.current.take() {
            writer.flush()?;
            self.parts.push((path, rows, bytes));
        }
        Ok(())
    }

    /// Rename partial files to their final `-of-` names.
    fn finish(mut self) -> Result<Vec<(PathBuf, usize, u64)>, CorpusError> {
        self.close_current()?;
        let total = self.parts.len();
        let mut finished = Vec::with_capacity(total);
        for (idx, (partial, rows, bytes)) in self.parts.into_iter().enumerate() {
            let target = self.dir.join(format!(
                "{SHARD_PREFIX}-{idx:05}-of-{total:05}.{SHARD_EXTENSION}"
            ));
            fs::rename(&partial, &target)?;
            finished.push((target, rows, bytes));
        }
        Ok(finished)
    }
}

/// Write every split of `corpus` under `out_dir/<config_name>/<split>/`.
///
/// Shards already under `out_dir/<config_name>/` are removed first. Streamed
/// splits are consumed lazily. Audio files are embedded as base64 bytes.
/// Splits that turn out empty produce no shards.
pub fn write_corpus_shards(
    corpus: Corpus,
    out_dir: &Path,
    config_name: &str,
    max_shard_bytes: u64,
) -> Result<Vec<WrittenShard>, CorpusError> {
    remove_stale_shards(&out_dir.join(config_name))?;
    let mut written = Vec::new();
    for (split, records) in corpus {
        let split_dir = out_dir.join(config_name).join(&split);
        fs::create_dir_all(&split_dir)?;
        let mut writer = ShardWriter::new(split_dir, max_shard_bytes);
        for record in records.into_stream() {
            let row = record_to_row(&record?, true)?;
            let line = serde_json::to_vec(&row).map_err(|err| {
                CorpusError::Publish(format!("failed encoding row for split '{split}': {err}"))
            })?;
            writer.write_line(&line)?;
        }
        let parts = writer.finish()?;
        info!(
            "[asr_corpus:publish] wrote {} shard(s) for split '{split}'",
            parts.len()
        );
        for (local_path, rows, bytes) in parts {
            let file_name = local_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            written.push(WrittenShard {
                repo_path: format!("{config_name}/{split}/{file_name}"),
                split: split.clone(),
                local_path,
                rows,
                bytes,
            });
        }
    }
    Ok(written)
}

/// Content address of a file as used by the large-file store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LfsPointer {
    /// Hex SHA-256 of the contents.
    pub oid: String,
    /// Length in bytes.
    pub size: u64,
}

/// Hash and size of `path`, streamed.
pub fn lfs_pointer(path: &Path) -> Result<LfsPointer, CorpusError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    let oid = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    Ok(LfsPointer { oid, size })
}

#[derive(Debug, Deserialize)]
struct LfsBatchResponse {
    #[serde(default)]
    objects: Vec<LfsObject>,
}

#[derive(Debug, Deserialize)]
struct LfsObject {
    oid: String,
    #[serde(default)]
    actions: Option<LfsActions>,
    #[serde(default)]
    error: Option<LfsObjectError>,
}

#[derive(Debug, Deserialize)]
struct LfsActions {
    upload: Option<LfsAction>,
    verify: Option<LfsAction>,
}

#[derive(Debug, Deserialize)]
struct LfsAction {
    href: String,
    #[serde(default)]
    header: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LfsObjectError {
    code: i64,
    message: String,
}

/// Dataset repository writer.
pub struct HubPublisher {
    endpoint: String,
    repo_id: String,
    token: String,
    private: bool,
    show_progress: bool,
}

impl HubPublisher {
    /// Writes need a token; a missing one is a configuration error.
    pub fn new(repo_id: impl Into<String>, access: &HubAccess, private: bool) -> Result<Self, CorpusError> {
        let token = access.token().ok_or_else(|| {
            CorpusError::Configuration(format!(
                "publishing needs a token in the {} environment variable",
                access.token_env
            ))
        })?;
        Ok(Self {
            endpoint: access.endpoint.trim_end_matches('/').to_string(),
            repo_id: repo_id.into(),
            token,
            private,
            show_progress: access.show_progress,
        })
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn publish_err(&self, step: &str, err: impl std::fmt::Display) -> CorpusError {
        CorpusError::Publish(format!("{step} for '{}' failed: {err}", self.repo_id))
    }

    /// Create the dataset repository; an existing repository is fine.
    pub fn ensure_repo(&self) -> Result<(), CorpusError> {
        let (organization, name) = match self.repo_id.split_once('/') {
            Some((org, name)) => (Some(org), name),
            None => (None, self.repo_id.as_str()),
        };
        let body = json!({
            "type": "dataset",
            "name": name,
            "organization": organization,
            "private": self.private,
        });
        let url = format!("{}/api/repos/create", self.endpoint);
        match ureq::post(&url)
            .header("Authorization", &self.auth())
            .header("Content-Type", "application/json")
            .send(body.to_string())
        {
            Ok(_) => {
                info!("[asr_corpus:publish] created dataset repository {}", self.repo_id);
                Ok(())
            }
            Err(ureq::Error::StatusCode(409)) => Ok(()),
            Err(err) => Err(self.publish_err("creating repository", err)),
        }
    }

    /// Upload `shards` and commit them in one revision.
    ///
    /// Shards of `config_name` already in the repository and not overwritten
    /// are deleted in the same commit, and the dataset card is rewritten.
    pub fn upload(
        &self,
        shards: &[WrittenShard],
        config_name: &str,
        commit_message: &str,
    ) -> Result<(), CorpusError> {
        if shards.is_empty() {
            return Err(CorpusError::Publish("no shards to upload".to_string()));
        }
        self.ensure_repo()?;
        let repo = self.hub_repo()?;
        let remote = self.remote_files(&repo)?;
        let new_paths: Vec<&str> = shards.iter().map(|shard| shard.repo_path.as_str()).collect();
        let deleted = stale_remote_shards(&remote, config_name, &new_paths);
        let existing_card = if remote.iter().any(|path| path == DATASET_CARD) {
            Some(self.fetch_card(&repo)?)
        } else {
            None
        };
        let mut after: Vec<String> = remote
            .into_iter()
            .filter(|path| !deleted.contains(path))
            .collect();
        after.extend(new_paths.iter().map(|path| path.to_string()));
        let card = render_dataset_card(existing_card.as_deref(), &after);

        let pointers = shards
            .iter()
            .map(|shard| lfs_pointer(&shard.local_path))
            .collect::<Result<Vec<_>, _>>()?;
        self.upload_lfs_objects(shards, &pointers)?;
        self.commit(&commit_lines(shards, &pointers, &deleted, &card, commit_message))?;
        info!(
            "[asr_corpus:publish] committed {} shard(s) and removed {} stale shard(s) in {}",
            shards.len(),
            deleted.len(),
            self.repo_id
        );
        Ok(())
    }

    fn hub_repo(&self) -> Result<ApiRepo, CorpusError> {
        let api = ApiBuilder::new()
            .with_progress(self.show_progress)
            .with_endpoint(self.endpoint.clone())
            .with_token(Some(self.token.clone()))
            .build()
            .map_err(|err| self.publish_err("building hf-hub client", err))?;
        Ok(api.repo(Repo::new(self.repo_id.clone(), RepoType::Dataset)))
    }

    fn remote_files(&self, repo: &ApiRepo) -> Result<Vec<String>, CorpusError> {
        let info = quietly(|| repo.info()).map_err(|err| self.publish_err("listing repository files", err))?;
        Ok(info.siblings.into_iter().map(|sibling| sibling.rfilename).collect())
    }

    fn fetch_card(&self, repo: &ApiRepo) -> Result<String, CorpusError> {
        let path = quietly(|| repo.download(DATASET_CARD))
            .map_err(|err| self.publish_err("fetching the dataset card", err))?;
        Ok(fs::read_to_string(path)?)
    }

    fn upload_lfs_objects(&self, shards: &[WrittenShard], pointers: &[LfsPointer]) -> Result<(), CorpusError> {
        let url = format!("{}/datasets/{}.git/info/lfs/objects/batch", self.endpoint, self.repo_id);
        let request = json!({
            "operation": "upload",
            "transfers": ["basic", "multipart"],
            "hash_algo": "sha256",
            "objects": pointers
                .iter()
                .map(|pointer| json!({"oid": pointer.oid, "size": pointer.size}))
                .collect::<Vec<_>>(),
        });
        let response = ureq::post(&url)
            .header("Authorization", &self.auth())
            .header("Accept", "application/vnd.git-lfs+json")
            .header("Content-Type", "application/vnd.git-lfs+json")
            .send(request.to_string())
            .map_err(|err| self.publish_err("large-file batch request", err))?;
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|err| self.publish_err("reading large-file batch response", err))?;
        let batch: LfsBatchResponse = serde_json::from_str(&body)
            .map_err(|err| self.publish_err("parsing large-file batch response", err))?;

        for object in batch.objects {
            if let Some(error) = object.error {
                return Err(self.publish_err(
                    "large-file upload",
                    format!("object {} rejected ({}): {}", object.oid, error.code, error.message),
                ));
            }
            let Some(idx) = pointers.iter().position(|pointer| pointer.oid == object.oid) else {
                warn!("[asr_corpus:publish] ignoring unexpected object {} in batch response", object.oid);
                continue;
            };
            let Some(actions) = object.actions else {
                info!("[asr_corpus:publish] {} already stored", shards[idx].repo_path);
                continue;
            };
            if let Some(upload) = actions.upload {
                info!(
                    "[asr_corpus:publish] uploading {} ({} bytes)",
                    shards[idx].repo_path, pointers[idx].size
                );
                self.put_object(&upload, &shards[idx].local_path, &pointers[idx])?;
            }
            if let Some(verify) = actions.verify {
                let mut request = ureq::post(&verify.href);
                for (key, value) in &verify.header {
                    request = request.header(key, value);
                }
                request
                    .header("Authorization", &self.auth())
                    .header("Content-Type", "application/vnd.git-lfs+json")
                    .send(json!({"oid": pointers[idx].oid, "size": pointers[idx].size}).to_string())
                    .map_err(|err| self.publish_err("large-file verification", err))?;
            }
        }
        Ok(())
    }

    fn put_object(&self, action: &LfsAction, path: &Path, pointer: &LfsPointer) -> Result<(), CorpusError> {
        let Some(chunk_size) = action
            .header
            .get("chunk_size")
            .and_then(|size| size.parse::<usize>().ok())
        else {
            let mut request = ureq::put(&action.href);
            for (key, value) in &action.header {
                request = request.header(key, value);
            }
            request
                .send(File::open(path)?)
                .map_err(|err| self.publish_err("large-file upload", err))?;
            return Ok(());
        };

        // Multipart: numbered part URLs in the header, then a completion call.
        let mut part_urls: Vec<(usize, &String)> = action
            .header
            .iter()
            .filter_map(|(key, url)| key.parse::<usize>().ok().map(|part| (part, url)))
            .collect();
        part_urls.sort_by_key(|(part, _)| *part);
        let mut file = File::open(path)?;
        let mut parts = Vec::with_capacity(part_urls.len());
        for (part, url) in part_urls {
            let mut chunk = Vec::with_capacity(chunk_size);
            (&mut file).take(chunk_size as u64).read_to_end(&mut chunk)?;
            let response = ureq::put(url)
                .send(chunk)
                .map_err(|err| self.publish_err("large-file part upload", err))?;
            let etag = response
                .headers()
                .get("etag")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            parts.push(json!({"partNumber": part, "etag": etag}));
        }
        ureq::post(&action.href)
            .header("Content-Type", "application/vnd.git-lfs+json")
            .send(json!({"oid": pointer.oid, "parts": parts}).to_string())
            .map_err(|err| self.publish_err("large-file multipart completion", err))?;
        Ok(())
    }

    fn commit(&self, lines: &[Value]) -> Result<(), CorpusError> {
        let body = lines
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        let url = format!(
            "{}/api/datasets/{}/commit/{DEFAULT_REVISION}",
            self.endpoint, self.repo_id
        );
        ureq::post(&url)
            .header("Authorization", &self.auth())
            .header("Content-Type", "application/x-ndjson")
            .send(body)
            .map_err(|err| self.publish_err("commit", err))?;
        Ok(())
    }
}

/// NDJSON commit operations: header, new shards, deletions, dataset card.
fn commit_lines(
    shards: &[WrittenShard],
    pointers: &[LfsPointer],
    deleted: &[String],
    card: &str,
    message: &str,
) -> Vec<Value> {
    let mut lines = vec![json!({
        "key": "header",
        "value": {"summary": message, "description": ""},
    })];
    for (shard, pointer) in shards.iter().zip(pointers) {
        lines.push(json!({
            "key": "lfsFile",
            "value": {
                "path": shard.repo_path,
                "algo": "sha256",
                "oid": pointer.oid,
                "size": pointer.size,
            },
        }));
    }
    for path in deleted {
        lines.push(json!({"key": "deletedFile", "value": {"path": path}}));
    }
    lines.push(json!({
        "key": "file",
        "value": {
            "path": DATASET_CARD,
            "content": BASE64.encode(card),
            "encoding": "base64",
        },
    }));
    lines
}

/// Outcome of [`publish_corpus`].
#[derive(Debug)]
pub struct PublishReport {
    /// Shards written by this run.
    pub shards: Vec<WrittenShard>,
    /// Directory that still holds the shards, when they were kept.
    pub output_dir: Option<PathBuf>,
    /// Whether a commit reached the repository.
    pub uploaded: bool,
}

/// Write the corpus to shards and upload them when a repository is configured.
///
/// Without an output directory the shards are staged in a temporary directory
/// that is removed on return, including on error.
pub fn publish_corpus(corpus: Corpus, config: &BuilderConfig) -> Result<PublishReport, CorpusError> {
    let max_bytes = parse_shard_size(&config.max_shard_size)?;
    let publisher = config
        .hub_id
        .as_ref()
        .map(|hub_id| HubPublisher::new(hub_id.clone(), &config.hub, config.private))
        .transpose()?;

    let staging = match &config.output_dir {
        Some(_) => None,
        None => Some(TempDir::new()?),
    };
    let out_dir = match (&config.output_dir, &staging) {
        (Some(dir), _) => {
            fs::create_dir_all(dir)?;
            dir.clone()
        }
        (None, Some(temp)) => temp.path().to_path_buf(),
        (None, None) => {
            return Err(CorpusError::Publish("no output directory available".to_string()));
        }
    };

    let shards = write_corpus_shards(corpus, &out_dir, &config.config_name, max_bytes)?;
    let card_path = out_dir.join(DATASET_CARD);
    let existing_card = match fs::read_to_string(&card_path) {
        Ok(card) => Some(card),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };
    let card = render_dataset_card(existing_card.as_deref(), &relative_files(&out_dir)?);
    fs::write(&card_path, card)?;

    let uploaded = match &publisher {
        Some(publisher) => {
            publisher.upload(&shards, &config.config_name, &config.commit_message)?;
            true
        }
        None => false,
    };
    Ok(PublishReport {
        shards,
        output_dir: config.output_dir.clone(),
        uploaded,
    })
}
