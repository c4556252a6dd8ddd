//! Post-run relocation of ingested input files

use std::path::{Path, PathBuf};

use chrono::Utc;
use ingestor_common::{IngestorError, Result};
use tracing::info;

/// Move `input` into `archive_dir`, creating the directory if needed
///
/// An existing file of the same name is never overwritten; the moved file gets a
/// UTC timestamp suffix instead. Falls back to copy-and-delete when a rename is not
/// possible (e.g. across filesystems).
pub async fn archive_input(input: &Path, archive_dir: &Path) -> Result<PathBuf> {
    let file_name = input
        .file_name()
        .ok_or_else(|| IngestorError::config(format!("{} is not a file", input.display())))?;

    tokio::fs::create_dir_all(archive_dir).await?;

    let mut target = archive_dir.join(file_name);
    if tokio::fs::try_exists(&target).await? {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        target = archive_dir.join(format!("{}.{}", file_name.to_string_lossy(), stamp));
    }

    if tokio::fs::rename(input, &target).await.is_err() {
        tokio::fs::copy(input, &target).await?;
        tokio::fs::remove_file(input).await?;
    }

    info!(from = %input.display(), to = %target.display(), "Input file archived");
    Ok(target)
}
