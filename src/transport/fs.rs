use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::constants::builder::{AUDIO_EXTENSION, LISTING_ATTEMPTS, LISTING_BACKOFF_MS};
use crate::errors::CorpusError;
use crate::types::RecordId;

/// Bounded fixed-delay retry for transient filesystem failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one.
    pub attempts: usize,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: LISTING_ATTEMPTS,
            backoff: Duration::from_millis(LISTING_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Policy with at least one attempt.
    pub fn new(attempts: usize, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `operation` until it succeeds or the attempts are spent.
    pub fn run<T, E, F>(&self, label: &str, mut operation: F) -> Result<T, CorpusError>
    where
        E: std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_error = err.to_string();
                    if attempt < attempts {
                        warn!(
                            "[asr_corpus:fs] {label} failed (attempt {attempt}/{attempts}): {last_error}; retrying"
                        );
                        thread::sleep(self.backoff);
                    }
                }
            }
        }
        Err(CorpusError::RetriesExhausted {
            operation: label.to_string(),
            attempts,
            reason: last_error,
        })
    }
}

fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(AUDIO_EXTENSION))
}

/// List every `.wav` file below `dir`, retrying transient listing failures.
pub fn list_audio_files(dir: &Path, retry: &RetryPolicy) -> Result<Vec<PathBuf>, CorpusError> {
    retry.run(&format!("listing {}", dir.display()), || {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry?;
            if entry.file_type().is_file() && has_audio_extension(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        Ok::<_, walkdir::Error>(files)
    })
}

/// Map recording id (file stem) to audio path for every session directory
/// under `root`.
///
/// Each session directory is listed on the rayon pool. Files placed directly
/// in `root` are included as well.
pub fn index_audio_files(
    root: &Path,
    retry: &RetryPolicy,
) -> Result<HashMap<RecordId, PathBuf>, CorpusError> {
    let entries = retry.run(&format!("reading {}", root.display()), || {
        fs::read_dir(root)?.collect::<Result<Vec<_>, std::io::Error>>()
    })?;
    let mut sessions = Vec::new();
    let mut loose = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            sessions.push(path);
        } else if has_audio_extension(&path) {
            loose.push(path);
        }
    }
    sessions.sort();

    let listed = sessions
        .par_iter()
        .map(|session| list_audio_files(session, retry))
        .collect::<Result<Vec<_>, CorpusError>>()?;

    let mut index = HashMap::new();
    for path in loose.into_iter().chain(listed.into_iter().flatten()) {
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(previous) = index.insert(stem.to_string(), path.clone()) {
            warn!(
                "[asr_corpus:fs] duplicate recording id '{stem}': {} replaces {}",
                path.display(),
                previous.display()
            );
        }
    }
    info!(
        "[asr_corpus:fs] indexed {} audio files in {} session directories under {}",
        index.len(),
        sessions.len(),
        root.display()
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    fn quick(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let value = quick(3)
            .run("flaky", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 { Err("busy") } else { Ok(7) }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_escalates_when_attempts_are_spent() {
        let err = quick(2).run("doomed", || Err::<(), _>("io timeout")).unwrap_err();
        assert!(matches!(
            err,
            CorpusError::RetriesExhausted { attempts: 2, ref reason, .. } if reason == "io timeout"
        ));
    }

    #[test]
    fn index_maps_stems_across_sessions() {
        let dir = tempdir().unwrap();
        for (session, file) in [("s1", "rec_a.wav"), ("s1", "notes.txt"), ("s2", "rec_b.WAV")] {
            let session_dir = dir.path().join(session);
            fs::create_dir_all(&session_dir).unwrap();
            fs::write(session_dir.join(file), b"").unwrap();
        }
        let index = index_audio_files(dir.path(), &quick(1)).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index["rec_a"].ends_with("s1/rec_a.wav"));
        assert!(index["rec_b"].ends_with("s2/rec_b.WAV"));
    }

    #[test]
    fn missing_root_exhausts_retries() {
        let dir = tempdir().unwrap();
        let err = index_audio_files(&dir.path().join("absent"), &quick(2)).unwrap_err();
        assert!(matches!(err, CorpusError::RetriesExhausted { .. }));
    }
}
