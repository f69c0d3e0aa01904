use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One duty cycle's measurements, keyed by sensor name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: NaiveDateTime,
    pub values: BTreeMap<String, f64>,
}

impl Reading {
    pub fn new(timestamp: NaiveDateTime, values: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            timestamp,
            values: values.into_iter().collect(),
        }
    }

    /// Filesystem-safe key, sortable in chronological order.
    pub fn key(&self) -> String {
        self.timestamp.format("%Y-%m-%dT%H-%M-%SZ").to_string()
    }
}

#[derive(Debug, Error)]
pub enum ReadingStoreError {
    #[error("reading store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode reading: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Local append-only log used when no upload destination is configured:
/// one JSON line per reading, one file per day.
#[derive(Debug, Clone)]
pub struct ReadingStore {
    dir: PathBuf,
}

impl ReadingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, reading: &Reading) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", reading.timestamp.format("%Y-%m-%d")))
    }

    pub fn append(&self, reading: &Reading) -> Result<PathBuf, ReadingStoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_for(reading);

        let mut line = serde_json::to_vec(reading)?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(path)
    }

    /// Every stored reading, oldest first.
    pub fn read_all(&self) -> Result<Vec<Reading>, ReadingStoreError> {
        let mut files = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
                .collect::<Vec<_>>(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        files.sort();

        let mut readings = Vec::new();
        for path in files {
            let text = fs::read_to_string(&path)?;
            for line in text.lines().filter(|line| !line.trim().is_empty()) {
                readings.push(serde_json::from_str(line)?);
            }
        }
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::testing::scratch_dir;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn appends_one_line_per_reading_grouped_by_day() {
        let store = ReadingStore::new(scratch_dir("reading-store"));
        let first = Reading::new(at(1, 8), [("temperature".to_string(), 21.5)]);
        let second = Reading::new(at(1, 9), [("temperature".to_string(), 22.0)]);
        let third = Reading::new(at(2, 8), [("humidity".to_string(), 40.0)]);

        let path = store.append(&first).unwrap();
        store.append(&second).unwrap();
        store.append(&third).unwrap();

        assert!(path.ends_with("2024-05-01.jsonl"));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
        assert_eq!(store.read_all().unwrap(), vec![first, second, third]);
    }

    #[test]
    fn empty_store_reads_nothing() {
        let store = ReadingStore::new(scratch_dir("reading-store-empty").join("missing"));
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn key_sorts_chronologically() {
        let early = Reading::new(at(1, 9), []);
        let late = Reading::new(at(1, 10), []);
        assert!(early.key() < late.key());
        assert_eq!(early.key(), "2024-05-01T09-00-00Z");
    }
}
