//! File-system backends
//!
//! The router only ever talks to [`FsBackend`]; paths handed to it have
//! already been resolved and validated against a mount root.

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use burrow_core::{DirEntry, ErrorCode, FileKind, FileStat, FsError};

/// Operations over a file tree
#[async_trait]
pub trait FsBackend: Send + Sync + 'static {
    async fn stat(&self, path: &Path) -> Result<FileStat, FsError>;

    async fn read_directory(&self, path: &Path) -> Result<Vec<DirEntry>, FsError>;

    async fn read_file(&self, path: &Path) -> Result<Bytes, FsError>;

    /// Write `contents`, creating the file if `create` and replacing an
    /// existing one only if `overwrite`
    async fn write_file(
        &self,
        path: &Path,
        contents: Bytes,
        create: bool,
        overwrite: bool,
    ) -> Result<(), FsError>;

    async fn create(&self, path: &Path, overwrite: bool) -> Result<(), FsError> {
        self.write_file(path, Bytes::new(), true, overwrite).await
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<(), FsError>;

    async fn rename(&self, from: &Path, to: &Path, overwrite: bool) -> Result<(), FsError>;

    async fn mkdir(&self, path: &Path) -> Result<(), FsError>;
}

/// Backend over the local disk
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `symlink_metadata`, mapping "missing" to `None`
async fn existing_metadata(path: &Path) -> Result<Option<std::fs::Metadata>, FsError> {
    match fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl FsBackend for LocalBackend {
    async fn stat(&self, path: &Path) -> Result<FileStat, FsError> {
        let link_meta = fs::symlink_metadata(path).await?;
        let kind = FileKind::from_file_type(link_meta.file_type());

        // Report the target's size and times for links that resolve
        let meta = if kind == FileKind::Symlink {
            fs::metadata(path).await.unwrap_or(link_meta)
        } else {
            link_meta
        };

        Ok(FileStat::from_metadata(file_name(path), kind, &meta))
    }

    async fn read_directory(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        let mut dir = fs::read_dir(path).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            let stat = FileStat::from_metadata(name, FileKind::from_file_type(meta.file_type()), &meta);
            entries.push(DirEntry::from(stat));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes, FsError> {
        let meta = fs::metadata(path).await?;
        if meta.is_dir() {
            return Err(FsError::new(
                ErrorCode::IsADirectory,
                format!("{} is a directory", file_name(path)),
            ));
        }
        Ok(Bytes::from(fs::read(path).await?))
    }

    async fn write_file(
        &self,
        path: &Path,
        contents: Bytes,
        create: bool,
        overwrite: bool,
    ) -> Result<(), FsError> {
        match existing_metadata(path).await? {
            Some(meta) if meta.is_dir() => {
                return Err(FsError::new(
                    ErrorCode::IsADirectory,
                    format!("{} is a directory", file_name(path)),
                ));
            }
            Some(_) if !overwrite => {
                return Err(FsError::new(
                    ErrorCode::AlreadyExists,
                    format!("{} already exists", file_name(path)),
                ));
            }
            None if !create => {
                return Err(FsError::not_found(format!("{} does not exist", file_name(path))));
            }
            _ => {}
        }

        fs::write(path, &contents).await?;
        debug!("Wrote {} bytes to {:?}", contents.len(), path);
        Ok(())
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<(), FsError> {
        let meta = fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path).await?;
            } else {
                fs::remove_dir(path).await?;
            }
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path, overwrite: bool) -> Result<(), FsError> {
        if existing_metadata(from).await?.is_none() {
            return Err(FsError::not_found(format!("{} does not exist", file_name(from))));
        }
        if !overwrite && existing_metadata(to).await?.is_some() {
            return Err(FsError::new(
                ErrorCode::AlreadyExists,
                format!("{} already exists", file_name(to)),
            ));
        }
        fs::rename(from, to).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &Path) -> Result<(), FsError> {
        fs::create_dir(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stat_file_and_dir() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();

        let backend = LocalBackend::new();
        let stat = backend.stat(&file).await.unwrap();
        assert_eq!(stat.name, "hello.txt");
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 5);

        let stat = backend.stat(temp.path()).await.unwrap();
        assert_eq!(stat.kind, FileKind::Directory);

        let err = backend.stat(&temp.path().join("nope")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn test_read_directory_sorted() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(temp.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();

        let entries = LocalBackend.read_directory(temp.path()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[1].size, 2);
        assert_eq!(entries[2].kind, FileKind::Directory);
    }

    #[tokio::test]
    async fn test_write_flags() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("f.txt");
        let backend = LocalBackend;

        let err = backend
            .write_file(&path, Bytes::from_static(b"x"), false, true)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);

        backend
            .write_file(&path, Bytes::from_static(b"one"), true, false)
            .await
            .unwrap();

        let err = backend
            .write_file(&path, Bytes::from_static(b"two"), true, false)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);

        backend
            .write_file(&path, Bytes::from_static(b"two"), false, true)
            .await
            .unwrap();
        assert_eq!(backend.read_file(&path).await.unwrap(), Bytes::from_static(b"two"));

        let err = backend
            .write_file(temp.path(), Bytes::new(), true, true)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IsADirectory);
    }

    #[tokio::test]
    async fn test_create_mkdir_delete() {
        let temp = tempfile::tempdir().unwrap();
        let backend = LocalBackend;

        let dir = temp.path().join("d");
        backend.mkdir(&dir).await.unwrap();
        assert_eq!(
            backend.mkdir(&dir).await.unwrap_err().code,
            ErrorCode::AlreadyExists
        );

        let file = dir.join("empty");
        backend.create(&file, false).await.unwrap();
        assert_eq!(backend.stat(&file).await.unwrap().size, 0);

        let err = backend.delete(&dir, false).await.unwrap_err();
        assert_ne!(err.code, ErrorCode::FileNotFound);

        backend.delete(&dir, true).await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_rename_respects_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let backend = LocalBackend;
        let err = backend.rename(&a, &b, false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);

        backend.rename(&a, &b, true).await.unwrap();
        assert!(!a.exists());
        assert_eq!(std::fs::read(&b).unwrap(), b"a");

        let err = backend.rename(&a, &b, true).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn test_read_directory_on_file() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(LocalBackend.read_directory(&file).await.is_err());
        assert_eq!(
            LocalBackend.read_file(temp.path()).await.unwrap_err().code,
            ErrorCode::IsADirectory
        );
    }
}
