/// Filesystem listing with bounded retries.
pub mod fs;

pub use fs::{RetryPolicy, index_audio_files, list_audio_files};
