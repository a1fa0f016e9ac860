//! Instrumented wrappers that report every call to a [`StorageMonitor`].

use std::sync::Arc;

use super::{Directory, File, FileStat, StorageError};
use crate::monitor::{OpType, StorageMonitor};

pub struct MonitoredDirectory {
    inner: Arc<dyn Directory>,
    monitor: StorageMonitor,
}

impl MonitoredDirectory {
    pub fn new(inner: Arc<dyn Directory>, monitor: StorageMonitor) -> Arc<dyn Directory> {
        Arc::new(Self { inner, monitor })
    }

    fn resource(&self) -> String {
        if self.inner.path().is_empty() {
            "/".to_string()
        } else {
            self.inner.path().to_string()
        }
    }
}

impl Directory for MonitoredDirectory {
    fn path(&self) -> &str {
        self.inner.path()
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let op = self.monitor.begin_op(&self.resource(), OpType::Other, 0);
        let result = self.inner.list();
        op.end();
        result
    }

    fn get_or_create_file(&self, name: &str) -> Result<Arc<dyn File>, StorageError> {
        let file = self.inner.get_or_create_file(name)?;
        Ok(Arc::new(MonitoredFile {
            inner: file,
            monitor: self.monitor.clone(),
        }))
    }

    fn create_directory(&self, name: &str) -> Arc<dyn Directory> {
        MonitoredDirectory::new(self.inner.create_directory(name), self.monitor.clone())
    }

    fn delete(&self) -> Result<(), StorageError> {
        let op = self.monitor.begin_op(&self.resource(), OpType::Other, 0);
        let result = self.inner.delete();
        op.end();
        result
    }
}

pub struct MonitoredFile {
    inner: Arc<dyn File>,
    monitor: StorageMonitor,
}

impl MonitoredFile {
    fn timed<T>(
        &self,
        op_type: OpType,
        size: u64,
        call: impl FnOnce(&dyn File) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let op = self.monitor.begin_op(self.inner.filename(), op_type, size);
        let result = call(self.inner.as_ref());
        op.end();
        result
    }
}

impl File for MonitoredFile {
    fn filename(&self) -> &str {
        self.inner.filename()
    }

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        self.timed(OpType::Read, length as u64, |f| f.read(offset, length))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.timed(OpType::Write, data.len() as u64, |f| f.write(offset, data))
    }

    fn stat(&self) -> Result<FileStat, StorageError> {
        self.timed(OpType::Other, 0, |f| f.stat())
    }

    fn truncate(&self, length: u64) -> Result<(), StorageError> {
        self.timed(OpType::Other, 0, |f| f.truncate(length))
    }

    fn delete(&self) -> Result<(), StorageError> {
        self.timed(OpType::Other, 0, |f| f.delete())
    }
}
