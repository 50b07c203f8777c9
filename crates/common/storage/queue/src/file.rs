// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared memory-mapped files using mmap-io.
//!
//! Every file the queue touches (base info, carriages, group cursors) goes
//! through [`MappedFile`]. Mappings are always shared, so stores and CAS
//! operations on the atomic views are visible to every thread and process
//! that maps the same file.

use std::{
    fmt::Display,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, AtomicU64},
};

use mmap_io::{MemoryMappedFile, atomic::AtomicView};
use snafu::{ResultExt, ensure};

use crate::{
    QueueError, Result,
    error::{IoSnafu, MmapSnafu, ReadOnlySnafu},
};

/// How a file is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadWrite,
    ReadOnly,
}

/// A shared memory mapping of a whole file.
pub struct MappedFile {
    mmap: MemoryMappedFile,
    path: PathBuf,
    len:  u64,
    mode: MapMode,
}

impl MappedFile {
    /// Map `path` read-write, creating it with `len` bytes if absent.
    ///
    /// An existing file is never truncated, only grown to `len`, so several
    /// processes may race to create the same file without losing data.
    pub fn open_or_create<P: AsRef<Path>>(path: P, len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        let current = file.metadata().context(IoSnafu { path: &path })?.len();
        if current < len {
            file.set_len(len).context(IoSnafu { path: &path })?;
        }
        drop(file);

        let mmap = MemoryMappedFile::open_rw(&path).map_err(mmap_failed(&path))?;
        let len = mmap.len();

        Ok(Self {
            mmap,
            path,
            len,
            mode: MapMode::ReadWrite,
        })
    }

    /// Map an existing file read-only.
    ///
    /// Returns `Ok(None)` when the file does not exist or is still empty.
    pub fn open_ro<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(IoSnafu { path }),
        };
        if len == 0 {
            return Ok(None);
        }

        let mmap = match MemoryMappedFile::open_ro(&path) {
            Ok(mmap) => mmap,
            // Deleted between the metadata probe and the mapping.
            Err(_) if !path.exists() => return Ok(None),
            Err(e) => return Err(mmap_failed(&path)(e)),
        };
        let len = mmap.len();

        Ok(Some(Self {
            mmap,
            path,
            len,
            mode: MapMode::ReadOnly,
        }))
    }

    /// Write `data` at `offset`.
    #[inline]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(
            self.mode == MapMode::ReadWrite,
            ReadOnlySnafu { path: &self.path }
        );
        self.mmap
            .update_region(offset, data)
            .map_err(mmap_failed(&self.path))
    }

    /// Read `buf.len()` bytes starting at `offset`.
    #[inline]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap
            .read_into(offset, buf)
            .map_err(mmap_failed(&self.path))
    }

    /// Atomic view of the 4-byte word at `offset`.
    ///
    /// Only loads are allowed through views of a read-only mapping. A view of
    /// a read-write mapping holds the mapping's read lock, which
    /// [`write_at`](Self::write_at) needs exclusively: drop every view before
    /// writing through the same `MappedFile`.
    #[inline]
    pub fn atomic_u32(&self, offset: u64) -> Result<AtomicView<'_, AtomicU32>> {
        self.mmap
            .atomic_u32(offset)
            .map_err(mmap_failed(&self.path))
    }

    /// Atomic view of the 8-byte word at `offset`. Same locking rules as
    /// [`atomic_u32`](Self::atomic_u32).
    #[inline]
    pub fn atomic_u64(&self, offset: u64) -> Result<AtomicView<'_, AtomicU64>> {
        self.mmap
            .atomic_u64(offset)
            .map_err(mmap_failed(&self.path))
    }

    /// Flush dirty pages to disk. No-op for read-only mappings.
    pub fn flush(&self) -> Result<()> {
        if self.mode == MapMode::ReadOnly {
            return Ok(());
        }
        self.mmap.flush().map_err(mmap_failed(&self.path))
    }

    pub const fn len(&self) -> u64 { self.len }

    pub const fn is_empty(&self) -> bool { self.len == 0 }

    pub const fn mode(&self) -> MapMode { self.mode }

    pub const fn is_writable(&self) -> bool { matches!(self.mode, MapMode::ReadWrite) }

    pub fn path(&self) -> &Path { &self.path }
}

fn mmap_failed<E: Display>(path: &Path) -> impl FnOnce(E) -> QueueError + '_ {
    move |e| {
        MmapSnafu {
            path,
            message: e.to_string(),
        }
        .build()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn test_open_or_create_sizes_new_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("test.base");

        let file = MappedFile::open_or_create(&path, 4096).unwrap();
        assert_eq!(file.len(), 4096);
        assert!(file.is_writable());
        assert!(path.exists());
    }

    #[test]
    fn test_open_or_create_keeps_existing_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.carriage");

        {
            let file = MappedFile::open_or_create(&path, 4096).unwrap();
            file.write_at(100, b"persisted").unwrap();
            file.flush().unwrap();
        }

        let file = MappedFile::open_or_create(&path, 4096).unwrap();
        let mut buf = [0u8; 9];
        file.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }

    #[test]
    fn test_open_ro_missing_file_is_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("absent.carriage");

        assert!(MappedFile::open_ro(&path).unwrap().is_none());
    }

    #[test]
    fn test_read_only_mapping_rejects_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.carriage");
        MappedFile::open_or_create(&path, 1024).unwrap();

        let file = MappedFile::open_ro(&path).unwrap().unwrap();
        assert_eq!(file.mode(), MapMode::ReadOnly);
        assert!(matches!(
            file.write_at(0, b"nope"),
            Err(QueueError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_atomics_are_shared_between_mappings() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("counter.base");

        let writer = MappedFile::open_or_create(&path, 4096).unwrap();
        let other = MappedFile::open_or_create(&path, 4096).unwrap();
        let reader = MappedFile::open_ro(&path).unwrap().unwrap();

        let counter = writer.atomic_u64(8).unwrap();
        assert!(
            counter
                .compare_exchange(0, 7, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        );

        assert_eq!(other.atomic_u64(8).unwrap().load(Ordering::Acquire), 7);
        assert_eq!(reader.atomic_u64(8).unwrap().load(Ordering::Acquire), 7);

        other.atomic_u32(0).unwrap().store(2, Ordering::Release);
        assert_eq!(reader.atomic_u32(0).unwrap().load(Ordering::Acquire), 2);
    }
}
