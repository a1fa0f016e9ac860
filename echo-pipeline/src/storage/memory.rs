//! In-memory storage. Files are shared by path, so re-opening a directory
//! from the same `MemoryStorage` sees earlier writes (restart simulation).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{join_path, Directory, File, FileStat, StorageError};
use crate::lock;

type FileMap = Arc<Mutex<BTreeMap<String, Arc<MemoryFile>>>>;

#[derive(Clone, Default)]
pub struct MemoryStorage {
    files: FileMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root directory.
    pub fn root(&self) -> Arc<dyn Directory> {
        Arc::new(MemoryDirectory {
            path: String::new(),
            files: self.files.clone(),
        })
    }

    /// Total bytes held across all files.
    pub fn size(&self) -> usize {
        lock(&self.files)
            .values()
            .map(|f| lock(&f.data).len())
            .sum()
    }
}

struct MemoryDirectory {
    path: String,
    files: FileMap,
}

impl Directory for MemoryDirectory {
    fn path(&self) -> &str {
        &self.path
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let prefix = join_path(&self.path, "");
        let files = lock(&self.files);
        Ok(files
            .keys()
            .filter_map(|path| {
                let rest = if self.path.is_empty() {
                    path.as_str()
                } else {
                    path.strip_prefix(&prefix)?
                };
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    fn get_or_create_file(&self, name: &str) -> Result<Arc<dyn File>, StorageError> {
        let path = join_path(&self.path, name);
        let mut files = lock(&self.files);
        let file = files
            .entry(path.clone())
            .or_insert_with(|| {
                Arc::new(MemoryFile {
                    path,
                    data: Mutex::new(Vec::new()),
                    files: self.files.clone(),
                })
            })
            .clone();
        Ok(file)
    }

    fn create_directory(&self, name: &str) -> Arc<dyn Directory> {
        Arc::new(MemoryDirectory {
            path: join_path(&self.path, name),
            files: self.files.clone(),
        })
    }

    fn delete(&self) -> Result<(), StorageError> {
        let prefix = join_path(&self.path, "");
        lock(&self.files).retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }
}

struct MemoryFile {
    path: String,
    data: Mutex<Vec<u8>>,
    files: FileMap,
}

impl File for MemoryFile {
    fn filename(&self) -> &str {
        &self.path
    }

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let data = lock(&self.data);
        let start = offset as usize;
        let end = start.checked_add(length).filter(|&end| end <= data.len());
        match end {
            Some(end) => Ok(data[start..end].to_vec()),
            None => Err(StorageError::OutOfRange {
                file: self.path.clone(),
                offset,
                length,
                size: data.len() as u64,
            }),
        }
    }

    fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let mut data = lock(&self.data);
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn stat(&self) -> Result<FileStat, StorageError> {
        Ok(FileStat {
            size: lock(&self.data).len() as u64,
        })
    }

    fn truncate(&self, length: u64) -> Result<(), StorageError> {
        lock(&self.data).truncate(length as usize);
        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        lock(&self.data).clear();
        lock(&self.files).remove(&self.path);
        Ok(())
    }
}
