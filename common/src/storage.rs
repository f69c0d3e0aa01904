use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Block counts reported by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub free_blocks: u64,
    pub total_blocks: u64,
}

impl DiskUsage {
    pub fn free_fraction(&self) -> Option<f64> {
        if self.total_blocks == 0 {
            return None;
        }
        Some(self.free_blocks as f64 / self.total_blocks as f64)
    }
}

/// Replaces `path` with `contents` so that a power loss leaves either the old
/// or the new file, never a truncated one.
pub fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp = temp_path(path);
    {
        let mut file = File::create(&temp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(err) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(err);
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scratch_dir;

    #[test]
    fn free_fraction_handles_empty_filesystem() {
        let usage = DiskUsage {
            free_blocks: 0,
            total_blocks: 0,
        };
        assert_eq!(usage.free_fraction(), None);
    }

    #[test]
    fn atomic_write_replaces_contents_and_leaves_no_temp_file() {
        let dir = scratch_dir("atomic-write");
        let path = dir.join("nested").join("config.txt");

        write_atomically(&path, b"first").unwrap();
        write_atomically(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.join("nested").join("config.txt.tmp").exists());
    }
}
