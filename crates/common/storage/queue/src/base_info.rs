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

//! Per-topic offset counter and sizing, shared by every producer and reader.
//!
//! ## Base File Format
//!
//! ```text
//! ┌────────────────────┬────────────────────┬──────────────────┬──────────┐
//! │ total offset (8B)  │ capacity (8B)      │ max size (4B)    │ reserved │
//! │ next offset to     │ segments per       │ payload bytes    │ to 4096  │
//! │ allocate           │ carriage           │ per segment      │          │
//! └────────────────────┴────────────────────┴──────────────────┴──────────┘
//! ```
//!
//! Initialization is a one-shot CAS on the capacity word from `0` to a
//! sentinel. The winner stores the max size and then publishes the capacity
//! with release ordering. Everybody else waits until a real capacity shows up,
//! and from then on the persisted sizing wins over whatever they asked for.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use crossbeam::utils::Backoff;
use mmap_io::atomic::AtomicView;
use snafu::ensure;
use tracing::{debug, info, warn};

use crate::{
    Result,
    carriage::CarriageLayout,
    error::{CorruptedHeaderSnafu, ReadOnlySnafu},
    file::MappedFile,
    path::TopicPaths,
};

/// Size of the base file in bytes.
pub const BASE_FILE_SIZE: u64 = 4096;

const TOTAL_OFFSET_POS: u64 = 0;
const CAPACITY_POS: u64 = 8;
const MAX_MESSAGE_SIZE_POS: u64 = 16;
const HEADER_END: u64 = 20;

/// Capacity value while the initializer is still writing the header.
const INITIALIZING: u64 = u64::MAX;

/// How long to wait for another initializer before giving up.
const INIT_WAIT: Duration = Duration::from_secs(1);

/// Sizing fixed when a topic is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSizing {
    pub carriage_capacity: u64,
    pub max_message_size:  u32,
}

/// Mapped `<topic>.base` file.
pub struct BaseInfo {
    file:   MappedFile,
    sizing: TopicSizing,
}

impl BaseInfo {
    /// Open the base file read-write, creating and initializing it if needed.
    ///
    /// With `overwrite` the header is rewritten and the offset counter reset;
    /// removing stale carriage and cursor files is up to the caller.
    pub fn open_write(paths: &TopicPaths, requested: TopicSizing, overwrite: bool) -> Result<Self> {
        let path = paths.base_file();
        let file = MappedFile::open_or_create(&path, BASE_FILE_SIZE)?;
        let sizing = if overwrite {
            file.atomic_u64(CAPACITY_POS)?
                .store(INITIALIZING, Ordering::Release);
            file.atomic_u64(TOTAL_OFFSET_POS)?
                .store(0, Ordering::Release);
            publish(&file, requested)?;
            info!(topic = paths.topic(), ?requested, "overwrote topic");
            requested
        } else if file
            .atomic_u64(CAPACITY_POS)?
            .compare_exchange(0, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            publish(&file, requested)?;
            info!(topic = paths.topic(), ?requested, "created topic");
            requested
        } else {
            let persisted = wait_published(&file)?;
            if persisted != requested {
                warn!(
                    topic = paths.topic(),
                    ?requested,
                    ?persisted,
                    "topic already exists with different sizing, using persisted sizing"
                );
            }
            debug!(topic = paths.topic(), ?persisted, "opened topic");
            persisted
        };

        Ok(Self { file, sizing })
    }

    /// Map the base file read-only.
    ///
    /// `Ok(None)` while the file is absent or not initialized yet.
    pub fn open_read(paths: &TopicPaths) -> Result<Option<Self>> {
        let Some(file) = MappedFile::open_ro(paths.base_file())? else {
            return Ok(None);
        };
        if file.len() < HEADER_END {
            return Ok(None);
        }
        Ok(read_sizing(&file)?.map(|sizing| Self { file, sizing }))
    }

    /// Hand out the next offset.
    pub fn allocate_offset(&self) -> Result<u64> {
        ensure!(
            self.file.is_writable(),
            ReadOnlySnafu {
                path: self.file.path(),
            }
        );
        let total = self.total()?;
        let mut current = total.load(Ordering::Acquire);
        loop {
            match total.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(offset) => return Ok(offset),
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of offsets allocated so far.
    pub fn current_offset(&self) -> Result<u64> { Ok(self.total()?.load(Ordering::Acquire)) }

    pub const fn sizing(&self) -> TopicSizing { self.sizing }

    pub const fn carriage_capacity(&self) -> u64 { self.sizing.carriage_capacity }

    pub const fn max_message_size(&self) -> u32 { self.sizing.max_message_size }

    pub fn layout(&self) -> Result<CarriageLayout> {
        CarriageLayout::new(
            self.sizing.carriage_capacity,
            self.sizing.max_message_size,
        )
    }

    pub fn flush(&self) -> Result<()> { self.file.flush() }

    fn total(&self) -> Result<AtomicView<'_, AtomicU64>> {
        self.file.atomic_u64(TOTAL_OFFSET_POS)
    }
}

fn publish(file: &MappedFile, sizing: TopicSizing) -> Result<()> {
    file.atomic_u32(MAX_MESSAGE_SIZE_POS)?
        .store(sizing.max_message_size, Ordering::Relaxed);
    file.atomic_u64(CAPACITY_POS)?
        .store(sizing.carriage_capacity, Ordering::Release);
    Ok(())
}

fn read_sizing(file: &MappedFile) -> Result<Option<TopicSizing>> {
    let carriage_capacity = file.atomic_u64(CAPACITY_POS)?.load(Ordering::Acquire);
    if carriage_capacity == 0 || carriage_capacity == INITIALIZING {
        return Ok(None);
    }
    let max_message_size = file
        .atomic_u32(MAX_MESSAGE_SIZE_POS)?
        .load(Ordering::Relaxed);
    Ok(Some(TopicSizing {
        carriage_capacity,
        max_message_size,
    }))
}

fn wait_published(file: &MappedFile) -> Result<TopicSizing> {
    let started = Instant::now();
    let backoff = Backoff::new();
    loop {
        if let Some(sizing) = read_sizing(file)? {
            return Ok(sizing);
        }
        ensure!(
            started.elapsed() < INIT_WAIT,
            CorruptedHeaderSnafu {
                path:   file.path(),
                reason: "topic initialization never completed",
            }
        );
        if backoff.is_completed() {
            thread::sleep(Duration::from_millis(1));
        } else {
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;
    use crate::QueueError;

    const SIZING: TopicSizing = TopicSizing {
        carriage_capacity: 4,
        max_message_size:  16,
    };

    fn paths() -> (tempfile::TempDir, TopicPaths) {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = TopicPaths::new(temp_dir.path(), "orders").unwrap();
        (temp_dir, paths)
    }

    #[test]
    fn test_fresh_topic_starts_at_zero() {
        let (_dir, paths) = paths();
        let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();

        assert_eq!(base.sizing(), SIZING);
        assert_eq!(base.current_offset().unwrap(), 0);
        assert_eq!(base.allocate_offset().unwrap(), 0);
        assert_eq!(base.allocate_offset().unwrap(), 1);
        assert_eq!(base.current_offset().unwrap(), 2);
    }

    #[test]
    fn test_persisted_sizing_wins() {
        let (_dir, paths) = paths();
        BaseInfo::open_write(&paths, SIZING, false)
            .unwrap()
            .allocate_offset()
            .unwrap();

        let other = TopicSizing {
            carriage_capacity: 1024,
            max_message_size:  1016,
        };
        let base = BaseInfo::open_write(&paths, other, false).unwrap();
        assert_eq!(base.sizing(), SIZING);
        assert_eq!(base.current_offset().unwrap(), 1);
    }

    #[test]
    fn test_overwrite_resets_counter_and_sizing() {
        let (_dir, paths) = paths();
        let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();
        base.allocate_offset().unwrap();
        base.allocate_offset().unwrap();
        drop(base);

        let other = TopicSizing {
            carriage_capacity: 8,
            max_message_size:  32,
        };
        let base = BaseInfo::open_write(&paths, other, true).unwrap();
        assert_eq!(base.sizing(), other);
        assert_eq!(base.current_offset().unwrap(), 0);
    }

    #[test]
    fn test_open_read_before_creation() {
        let (_dir, paths) = paths();
        assert!(BaseInfo::open_read(&paths).unwrap().is_none());

        BaseInfo::open_write(&paths, SIZING, false).unwrap();
        let reader = BaseInfo::open_read(&paths).unwrap().unwrap();
        assert_eq!(reader.sizing(), SIZING);
    }

    #[test]
    fn test_read_only_cannot_allocate() {
        let (_dir, paths) = paths();
        let writer = BaseInfo::open_write(&paths, SIZING, false).unwrap();
        let reader = BaseInfo::open_read(&paths).unwrap().unwrap();

        assert!(matches!(
            reader.allocate_offset(),
            Err(QueueError::ReadOnly { .. })
        ));
        writer.allocate_offset().unwrap();
        assert_eq!(reader.current_offset().unwrap(), 1);
    }

    #[test]
    fn test_stuck_initialization_is_reported() {
        let (_dir, paths) = paths();
        paths.ensure_dir().unwrap();
        let file = MappedFile::open_or_create(paths.base_file(), BASE_FILE_SIZE).unwrap();
        file.atomic_u64(CAPACITY_POS)
            .unwrap()
            .store(INITIALIZING, Ordering::Release);

        assert!(BaseInfo::open_read(&paths).unwrap().is_none());
        assert!(matches!(
            BaseInfo::open_write(&paths, SIZING, false),
            Err(QueueError::CorruptedHeader { .. })
        ));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let (_dir, paths) = paths();
        let paths = Arc::new(paths);
        const THREADS: usize = 4;
        const PER_THREAD: usize = 500;

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let paths = Arc::clone(&paths);
                std::thread::spawn(move || {
                    let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();
                    (0..PER_THREAD)
                        .map(|_| base.allocate_offset().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for offset in handle.join().unwrap() {
                assert!(seen.insert(offset), "offset {offset} issued twice");
            }
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
        assert!(seen.iter().all(|&o| o < (THREADS * PER_THREAD) as u64));
    }
}
