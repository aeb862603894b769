//! Core type definitions for Burrow
//!
//! File metadata as exchanged between the bridge and editor clients.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Type of filesystem entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn from_file_type(ft: std::fs::FileType) -> Self {
        if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }
}

/// Result of a `stat` request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch
    pub mtime: u64,
    /// Creation time in milliseconds since the Unix epoch (0 if unknown)
    pub ctime: u64,
    pub readonly: bool,
}

impl FileStat {
    /// Build from `std::fs::Metadata`; `kind` is passed separately so
    /// symlinks reported by `symlink_metadata` keep their kind.
    pub fn from_metadata(name: impl Into<String>, kind: FileKind, meta: &std::fs::Metadata) -> Self {
        Self {
            name: name.into(),
            kind,
            size: meta.len(),
            mtime: meta.modified().map(system_time_ms).unwrap_or(0),
            ctime: meta.created().map(system_time_ms).unwrap_or(0),
            readonly: meta.permissions().readonly(),
        }
    }
}

/// One entry of a `readDirectory` response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub mtime: u64,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileKind, size: u64, mtime: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            mtime,
        }
    }
}

impl From<FileStat> for DirEntry {
    fn from(stat: FileStat) -> Self {
        Self {
            name: stat.name,
            kind: stat.kind,
            size: stat.size,
            mtime: stat.mtime,
        }
    }
}

/// Milliseconds since the Unix epoch, saturating at 0 for pre-epoch times
pub fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in milliseconds
pub fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_from_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        let stat = FileStat::from_metadata("a.txt", FileKind::from_file_type(meta.file_type()), &meta);
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 5);
        assert!(stat.mtime > 0);
    }

    #[test]
    fn test_stat_serializes_camel_case() {
        let stat = FileStat {
            name: "x".into(),
            kind: FileKind::Directory,
            size: 0,
            mtime: 1,
            ctime: 2,
            readonly: false,
        };
        let json = serde_json::to_value(&stat).unwrap();
        assert_eq!(json["kind"], "directory");
        assert_eq!(json["mtime"], 1);
    }
}
