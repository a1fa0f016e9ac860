//! File-system storage rooted at a directory.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{join_path, Directory, File, FileStat, StorageError};
use crate::lock;

#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn root(&self) -> Arc<dyn Directory> {
        Arc::new(DiskDirectory {
            root: self.root.clone(),
            path: String::new(),
        })
    }
}

struct DiskDirectory {
    root: PathBuf,
    path: String,
}

impl DiskDirectory {
    fn full_path(&self) -> PathBuf {
        if self.path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.path)
        }
    }
}

impl Directory for DiskDirectory {
    fn path(&self) -> &str {
        &self.path
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let dir = self.full_path();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn get_or_create_file(&self, name: &str) -> Result<Arc<dyn File>, StorageError> {
        let dir = self.full_path();
        fs::create_dir_all(&dir)?;
        let full = dir.join(name);
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full)?;
        Ok(Arc::new(DiskFile {
            path: join_path(&self.path, name),
            full,
            handle: Mutex::new(Some(handle)),
        }))
    }

    fn create_directory(&self, name: &str) -> Arc<dyn Directory> {
        Arc::new(DiskDirectory {
            root: self.root.clone(),
            path: join_path(&self.path, name),
        })
    }

    fn delete(&self) -> Result<(), StorageError> {
        let dir = self.full_path();
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

struct DiskFile {
    path: String,
    full: PathBuf,
    handle: Mutex<Option<fs::File>>,
}

impl DiskFile {
    fn with_handle<T>(
        &self,
        op: impl FnOnce(&mut fs::File) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = lock(&self.handle);
        match guard.as_mut() {
            Some(handle) => op(handle),
            None => Err(StorageError::Deleted(self.path.clone())),
        }
    }
}

impl File for DiskFile {
    fn filename(&self) -> &str {
        &self.path
    }

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        self.with_handle(|handle| {
            let size = handle.metadata()?.len();
            if offset.saturating_add(length as u64) > size {
                return Err(StorageError::OutOfRange {
                    file: self.path.clone(),
                    offset,
                    length,
                    size,
                });
            }
            let mut buf = vec![0u8; length];
            handle.seek(SeekFrom::Start(offset))?;
            handle.read_exact(&mut buf)?;
            Ok(buf)
        })
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.with_handle(|handle| {
            handle.seek(SeekFrom::Start(offset))?;
            handle.write_all(data)?;
            handle.flush()?;
            Ok(())
        })
    }

    fn stat(&self) -> Result<FileStat, StorageError> {
        self.with_handle(|handle| {
            Ok(FileStat {
                size: handle.metadata()?.len(),
            })
        })
    }

    fn truncate(&self, length: u64) -> Result<(), StorageError> {
        self.with_handle(|handle| {
            handle.set_len(length)?;
            Ok(())
        })
    }

    fn delete(&self) -> Result<(), StorageError> {
        let mut guard = lock(&self.handle);
        guard.take();
        if self.full.exists() {
            fs::remove_file(&self.full)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::exercise_directory;
    use tempfile::tempdir;

    #[test]
    fn test_disk_blueprint() {
        let dir = tempdir().unwrap();
        exercise_directory(DiskStorage::new(dir.path()).root());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = DiskStorage::new(dir.path());
            let file = storage.root().get_or_create_file("meta").unwrap();
            file.write(0, b"persisted").unwrap();
        }
        let storage = DiskStorage::new(dir.path());
        let file = storage.root().get_or_create_file("meta").unwrap();
        assert_eq!(file.read_all().unwrap(), b"persisted");
    }

    #[test]
    fn test_deleted_handle_rejects_io() {
        let dir = tempdir().unwrap();
        let file = DiskStorage::new(dir.path())
            .root()
            .get_or_create_file("gone")
            .unwrap();
        file.delete().unwrap();
        assert!(matches!(file.write(0, b"x"), Err(StorageError::Deleted(_))));
    }
}
