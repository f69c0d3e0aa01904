use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::Destination,
    device::{DeviceError, Uploader},
    reading::Reading,
    storage::write_atomically,
};

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum UploadCacheError {
    #[error("upload cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode cached reading: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("upload failed after {uploaded} readings, {remaining} still pending: {source}")]
    UploadFailed {
        uploaded: usize,
        remaining: usize,
        #[source]
        source: DeviceError,
    },
}

/// Readings waiting for upload, one file each, named so that directory order
/// is chronological. An entry is deleted only after its upload is confirmed.
#[derive(Debug, Clone)]
pub struct UploadCache {
    dir: PathBuf,
}

impl UploadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Readings sharing a timestamp get increasing sequence numbers, so
    /// nothing already queued is ever overwritten.
    pub fn append(&self, reading: &Reading) -> Result<PathBuf, UploadCacheError> {
        let path = self.next_entry_path(reading)?;
        let body = serde_json::to_vec(reading)?;
        write_atomically(&path, &body)?;
        debug!("cached reading {}", path.display());
        Ok(path)
    }

    pub fn pending_count(&self) -> Result<usize, UploadCacheError> {
        Ok(self.entry_paths()?.len())
    }

    pub fn batch_ready(&self, threshold: u32) -> Result<bool, UploadCacheError> {
        let threshold = usize::try_from(threshold.max(1)).unwrap_or(usize::MAX);
        Ok(self.pending_count()? >= threshold)
    }

    /// Pending readings, oldest first. Unreadable entries are quarantined.
    pub fn pending(&self) -> Result<Vec<(PathBuf, Reading)>, UploadCacheError> {
        let mut entries = Vec::new();
        for path in self.entry_paths()? {
            let parsed = fs::read(&path)
                .map_err(UploadCacheError::from)
                .and_then(|raw| serde_json::from_slice::<Reading>(&raw).map_err(Into::into));

            match parsed {
                Ok(reading) => entries.push((path, reading)),
                Err(err) => {
                    warn!("quarantining unreadable cache entry {}: {err}", path.display());
                    let mut bad = path.clone().into_os_string();
                    bad.push(".bad");
                    fs::rename(&path, bad)?;
                }
            }
        }
        Ok(entries)
    }

    /// Uploads every pending reading in order, deleting each entry as soon as
    /// the destination confirms it. Stops at the first failure; entries not yet
    /// confirmed stay cached for the next cycle.
    pub fn upload_all(
        &self,
        uploader: &mut dyn Uploader,
        destination: &Destination,
    ) -> Result<usize, UploadCacheError> {
        let entries = self.pending()?;
        let total = entries.len();
        info!("uploading {total} cached readings to {destination}");

        for (uploaded, (path, reading)) in entries.into_iter().enumerate() {
            if let Err(source) = uploader.upload(destination, &reading) {
                return Err(UploadCacheError::UploadFailed {
                    uploaded,
                    remaining: total - uploaded,
                    source,
                });
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(total)
    }

    /// `<timestamp>-<seq>.json`, one past the highest sequence pending for
    /// that timestamp.
    fn next_entry_path(&self, reading: &Reading) -> Result<PathBuf, UploadCacheError> {
        let key = reading.key();
        let prefix = format!("{key}-");
        let next = self
            .entry_paths()?
            .iter()
            .filter_map(|path| {
                path.file_stem()?
                    .to_str()?
                    .strip_prefix(&prefix)?
                    .parse::<u32>()
                    .ok()
            })
            .max()
            .map_or(0, |last| last.saturating_add(1));
        Ok(self
            .dir
            .join(format!("{key}-{next:04}.{ENTRY_EXTENSION}")))
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>, UploadCacheError> {
        let mut paths = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
                .collect::<Vec<_>>(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        paths.sort();
        Ok(paths)
    }
}
