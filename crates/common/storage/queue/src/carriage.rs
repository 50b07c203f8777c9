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

//! Carriage files: fixed-capacity arrays of segments.
//!
//! Carriage `i` stores offsets `[i * capacity, (i + 1) * capacity)`.
//!
//! ## Carriage File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Header (64 bytes)                       │
//! ├──────────────────┬─────────────┬─────────────┬───────────────┤
//! │ segment size (4B)│ pad (4B)    │ capacity(8B)│ index (8B)    │
//! └──────────────────┴─────────────┴─────────────┴───────────────┘
//! ┌──────────────────────────────────────────────────────────────┐
//! │             capacity × segment (segment size each)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The segment size word doubles as the "header published" flag: capacity
//! and index are written first, then the segment size is stored with
//! release ordering. A reader that sees a zero segment size treats the
//! carriage as not ready yet.

use std::path::Path;

use chrono::Utc;
use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    Result,
    error::{CorruptedHeaderSnafu, IndexMismatchSnafu, InvalidConfigSnafu},
    file::MappedFile,
    path::TopicPaths,
    retention::{TimeToLive, sweep},
    segment::{SEGMENT_OVERHEAD, Segment, slot_size_for},
};

/// Size of the carriage header in bytes.
pub const CARRIAGE_HEADER_SIZE: u64 = 64;

const SEGMENT_SIZE_POS: u64 = 0;
const CAPACITY_POS: u64 = 8;
const INDEX_POS: u64 = 16;

/// Index of the carriage holding `offset`.
#[inline]
pub const fn carriage_index(offset: u64, capacity: u64) -> u64 { offset / capacity }

/// Where an offset lies relative to a carriage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarriagePosition {
    /// The carriage is older than the one owning the offset; rotate forward.
    OlderIndexNeeded,
    /// The offset belongs to this carriage.
    Current,
    /// The offset belongs to an older carriage than this one.
    CallerOffsetStale,
}

/// Result of opening a carriage for reading.
pub enum CarriageStatus {
    Open(Carriage),
    /// The file exists but its producer has not finished sizing or
    /// publishing the header.
    NotReady,
    /// No file: never written, or removed by retention.
    NotExisting,
}

/// Capacity and slot size shared by every carriage of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarriageLayout {
    capacity:  u64,
    slot_size: u32,
}

impl CarriageLayout {
    pub fn new(capacity: u64, max_message_size: u32) -> Result<Self> {
        let slot_size = slot_size_for(max_message_size).ok_or_else(|| {
            InvalidConfigSnafu {
                message: format!("max message size {max_message_size} is too large"),
            }
            .build()
        })?;
        Self::with_slot_size(capacity, slot_size)
    }

    fn with_slot_size(capacity: u64, slot_size: u32) -> Result<Self> {
        ensure!(
            capacity > 0,
            InvalidConfigSnafu {
                message: "carriage capacity must be positive",
            }
        );
        ensure!(
            capacity
                .checked_mul(u64::from(slot_size))
                .and_then(|body| body.checked_add(CARRIAGE_HEADER_SIZE))
                .is_some(),
            InvalidConfigSnafu {
                message: format!("carriage of {capacity} x {slot_size} bytes is too large"),
            }
        );
        Ok(Self {
            capacity,
            slot_size,
        })
    }

    pub const fn capacity(&self) -> u64 { self.capacity }

    pub const fn slot_size(&self) -> u32 { self.slot_size }

    /// Payload bytes a slot can hold.
    pub const fn content_capacity(&self) -> u32 { self.slot_size - SEGMENT_OVERHEAD }

    /// Total file length, header included. Overflow is ruled out at
    /// construction.
    pub const fn file_len(&self) -> u64 {
        CARRIAGE_HEADER_SIZE + self.capacity * self.slot_size as u64
    }
}

/// A mapped carriage file.
pub struct Carriage {
    file:      MappedFile,
    paths:     TopicPaths,
    index:     u64,
    layout:    CarriageLayout,
    retention: Option<TimeToLive>,
}

impl Carriage {
    /// Open the carriage owning `offset` read-write, creating it if needed.
    pub fn open_write(
        paths: &TopicPaths,
        layout: CarriageLayout,
        offset: u64,
        retention: Option<TimeToLive>,
    ) -> Result<Self> {
        let index = carriage_index(offset, layout.capacity);
        let path = paths.carriage_file(index);
        let file = MappedFile::open_or_create(&path, layout.file_len())?;

        let published = file
            .atomic_u32(SEGMENT_SIZE_POS)?
            .load(std::sync::atomic::Ordering::Acquire);
        match published {
            0 => {
                // Racing creators write identical values. The segment size
                // view is fetched again because `write_at` cannot run while
                // one is alive.
                file.write_at(CAPACITY_POS, &layout.capacity.to_ne_bytes())?;
                file.write_at(INDEX_POS, &index.to_ne_bytes())?;
                file.atomic_u32(SEGMENT_SIZE_POS)?
                    .store(layout.slot_size, std::sync::atomic::Ordering::Release);
                debug!(topic = paths.topic(), index, "created carriage");
            }
            existing => {
                ensure!(
                    existing == layout.slot_size,
                    CorruptedHeaderSnafu {
                        path: &path,
                        reason: format!(
                            "segment size {existing} does not match topic segment size {}",
                            layout.slot_size
                        ),
                    }
                );
                debug!(topic = paths.topic(), index, "reopened carriage for writing");
            }
        }

        Ok(Self {
            file,
            paths: paths.clone(),
            index,
            layout,
            retention,
        })
    }

    /// Open the carriage owning `offset` read-only.
    ///
    /// The segment size comes from the carriage header, so payload limits
    /// are those of the producer that created the file.
    pub fn open_read(
        paths: &TopicPaths,
        capacity: u64,
        offset: u64,
        retention: Option<TimeToLive>,
    ) -> Result<CarriageStatus> {
        let index = carriage_index(offset, capacity);
        let path = paths.carriage_file(index);

        let Some(file) = MappedFile::open_ro(&path)? else {
            // A producer may sit between creating the file and sizing it.
            return Ok(if path.exists() {
                CarriageStatus::NotReady
            } else {
                CarriageStatus::NotExisting
            });
        };
        if file.len() < CARRIAGE_HEADER_SIZE {
            return Ok(CarriageStatus::NotReady);
        }

        let slot_size = file
            .atomic_u32(SEGMENT_SIZE_POS)?
            .load(std::sync::atomic::Ordering::Acquire);
        if slot_size == 0 {
            return Ok(CarriageStatus::NotReady);
        }

        let mut word = [0u8; 8];
        file.read_at(CAPACITY_POS, &mut word)?;
        let header_capacity = u64::from_ne_bytes(word);
        file.read_at(INDEX_POS, &mut word)?;
        let header_index = u64::from_ne_bytes(word);

        let corrupted = |reason: String| CorruptedHeaderSnafu { path: &path, reason }.fail();
        if header_capacity != capacity || header_index != index {
            return corrupted(format!(
                "header says carriage {header_index} of {header_capacity}, expected carriage \
                 {index} of {capacity}"
            ));
        }
        if slot_size < SEGMENT_OVERHEAD || slot_size % 8 != 0 {
            return corrupted(format!("invalid segment size {slot_size}"));
        }
        let layout = CarriageLayout::with_slot_size(capacity, slot_size)?;
        if file.len() < layout.file_len() {
            return corrupted(format!(
                "file is {} bytes, layout needs {}",
                file.len(),
                layout.file_len()
            ));
        }

        debug!(topic = paths.topic(), index, "opened carriage for reading");
        Ok(CarriageStatus::Open(Self {
            file,
            paths: paths.clone(),
            index,
            layout,
            retention,
        }))
    }

    pub const fn index(&self) -> u64 { self.index }

    pub const fn layout(&self) -> CarriageLayout { self.layout }

    /// First offset stored in this carriage.
    pub const fn first_offset(&self) -> u64 { self.index * self.layout.capacity }

    pub fn path(&self) -> &Path { self.file.path() }

    pub const fn compare(&self, offset: u64) -> CarriagePosition {
        let wanted = carriage_index(offset, self.layout.capacity);
        if self.index < wanted {
            CarriagePosition::OlderIndexNeeded
        } else if self.index == wanted {
            CarriagePosition::Current
        } else {
            CarriagePosition::CallerOffsetStale
        }
    }

    /// Segment storing `offset`.
    pub fn segment(&self, offset: u64) -> Result<Segment<'_>> {
        ensure!(
            matches!(self.compare(offset), CarriagePosition::Current),
            IndexMismatchSnafu {
                offset,
                index: self.index,
            }
        );
        let slot = offset % self.layout.capacity;
        let start = CARRIAGE_HEADER_SIZE + slot * u64::from(self.layout.slot_size);
        Ok(Segment::new(
            &self.file,
            start,
            self.layout.slot_size,
            offset,
        ))
    }

    /// Release the mapping, then run the retention sweep for the topic.
    ///
    /// Carriages with index `keep_from` or above are spared. Returns the
    /// removed carriage indices.
    pub fn close(self, keep_from: u64) -> Vec<u64> {
        if let Err(e) = self.file.flush() {
            warn!(path = %self.file.path().display(), error = %e, "failed to flush carriage");
        }

        let Self {
            file,
            paths,
            retention,
            ..
        } = self;
        drop(file);

        retention.map_or_else(Vec::new, |ttl| sweep(&paths, ttl, keep_from, Utc::now()))
    }
}
