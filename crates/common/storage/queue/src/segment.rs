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

//! Fixed-size message slots inside a carriage.
//!
//! ## Slot Format
//!
//! ```text
//! ┌─────────────┬─────────────┬────────────────────────────┬─────────────┐
//! │ state (4B)  │ size (4B)   │ content (up to capacity)   │ CRC32 (4B)  │
//! │ atomic word │ native u32  │ raw bytes                  │ last word   │
//! └─────────────┴─────────────┴────────────────────────────┴─────────────┘
//! ```
//!
//! A slot belongs to exactly one offset forever. It starts `Idle` (zeroed
//! file pages), is written once by the producer that allocated the offset,
//! and becomes `Readable` with a release store as the very last step. Readers
//! only look at size, content and CRC after an acquire load observed
//! `Readable`, so they never see a half-written message.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use mmap_io::atomic::AtomicView;
use snafu::ensure;

use crate::{
    Result,
    crc::{segment_crc, verify_segment_crc},
    error::{CorruptedMessageSnafu, PayloadTooLargeSnafu, SlotOccupiedSnafu},
    file::MappedFile,
};

pub(crate) const STATE_OFFSET: u64 = 0;
pub(crate) const SIZE_OFFSET: u64 = 4;
pub(crate) const CONTENT_OFFSET: u64 = 8;
pub(crate) const CRC_SIZE: u64 = 4;

/// Bytes of every slot not available to the payload.
pub const SEGMENT_OVERHEAD: u32 = 12;

/// Slot state word values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentState {
    Idle     = 0,
    Readable = 2,
}

impl SegmentState {
    const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            2 => Some(Self::Readable),
            _ => None,
        }
    }
}

/// Slot size holding up to `max_message_size` payload bytes, rounded up to
/// 8 bytes so every state word stays aligned.
pub fn slot_size_for(max_message_size: u32) -> Option<u32> {
    max_message_size
        .checked_add(SEGMENT_OVERHEAD)?
        .checked_next_multiple_of(8)
}

/// View of one slot of a mapped carriage.
pub struct Segment<'a> {
    file:      &'a MappedFile,
    start:     u64,
    slot_size: u32,
    offset:    u64,
}

impl<'a> Segment<'a> {
    pub(crate) const fn new(file: &'a MappedFile, start: u64, slot_size: u32, offset: u64) -> Self {
        Self {
            file,
            start,
            slot_size,
            offset,
        }
    }

    /// Global offset this slot stores.
    pub const fn offset(&self) -> u64 { self.offset }

    /// Largest payload this slot accepts.
    pub const fn content_capacity(&self) -> usize {
        (self.slot_size - SEGMENT_OVERHEAD) as usize
    }

    pub fn state(&self) -> Result<SegmentState> {
        let raw = self.state_word()?.load(Ordering::Acquire);
        SegmentState::from_raw(raw).map_or_else(
            || {
                CorruptedMessageSnafu {
                    offset: self.offset,
                }
                .fail()
            },
            Ok,
        )
    }

    pub fn is_readable(&self) -> Result<bool> {
        Ok(self.state_word()?.load(Ordering::Acquire) == SegmentState::Readable as u32)
    }

    /// CAS on the state word, valid across processes sharing the mapping.
    pub fn compare_and_set_state(&self, expected: SegmentState, new: SegmentState) -> Result<bool> {
        Ok(self
            .state_word()?
            .compare_exchange(
                expected as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }

    /// Write the payload and publish the slot.
    ///
    /// An oversized payload is rejected before anything in the slot changes.
    pub fn write_content(&self, payload: &[u8]) -> Result<()> {
        let max = self.content_capacity();
        ensure!(
            payload.len() <= max,
            PayloadTooLargeSnafu {
                size: payload.len(),
                max,
            }
        );
        let size = u32::try_from(payload.len()).map_err(|_| {
            PayloadTooLargeSnafu {
                size: payload.len(),
                max,
            }
            .build()
        })?;

        // Views hold the mapping's read lock and `write_at` needs it
        // exclusively, so no view may live across the writes below.
        ensure!(
            self.state_word()?.load(Ordering::Acquire) == SegmentState::Idle as u32,
            SlotOccupiedSnafu {
                offset: self.offset,
            }
        );

        self.file
            .write_at(self.start + SIZE_OFFSET, &size.to_ne_bytes())?;
        self.file.write_at(self.start + CONTENT_OFFSET, payload)?;
        self.file
            .write_at(self.crc_position(), &segment_crc(size, payload).to_ne_bytes())?;

        self.state_word()?
            .store(SegmentState::Readable as u32, Ordering::Release);
        Ok(())
    }

    /// Read the payload. The state is left untouched.
    ///
    /// Callers check [`is_readable`](Self::is_readable) first.
    pub fn read_content(&self) -> Result<Bytes> {
        let mut word = [0u8; 4];
        self.file.read_at(self.start + SIZE_OFFSET, &mut word)?;
        let size = u32::from_ne_bytes(word);

        ensure!(
            size as usize <= self.content_capacity(),
            CorruptedMessageSnafu {
                offset: self.offset,
            }
        );

        let mut payload = vec![0u8; size as usize];
        self.file
            .read_at(self.start + CONTENT_OFFSET, &mut payload)?;
        self.file.read_at(self.crc_position(), &mut word)?;

        ensure!(
            verify_segment_crc(size, &payload, u32::from_ne_bytes(word)),
            CorruptedMessageSnafu {
                offset: self.offset,
            }
        );

        Ok(Bytes::from(payload))
    }

    fn state_word(&self) -> Result<AtomicView<'a, AtomicU32>> {
        self.file.atomic_u32(self.start + STATE_OFFSET)
    }

    const fn crc_position(&self) -> u64 { self.start + self.slot_size as u64 - CRC_SIZE }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::QueueError;

    const SLOT: u32 = 32;

    fn slot_file(dir: &tempfile::TempDir, slots: u64) -> MappedFile {
        MappedFile::open_or_create(dir.path().join("slots.carriage"), slots * u64::from(SLOT))
            .unwrap()
    }

    #[test_case(0, 16 ; "empty payload")]
    #[test_case(4, 16 ; "already aligned")]
    #[test_case(16, 32 ; "rounds up")]
    #[test_case(1016, 1032 ; "one kilobyte preset")]
    fn test_slot_size_for(max: u32, expected: u32) {
        assert_eq!(slot_size_for(max), Some(expected));
    }

    #[test]
    fn test_slot_size_overflow() {
        assert_eq!(slot_size_for(u32::MAX - 4), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = slot_file(&dir, 2);
        let segment = Segment::new(&file, u64::from(SLOT), SLOT, 7);

        assert_eq!(segment.state().unwrap(), SegmentState::Idle);
        assert!(!segment.is_readable().unwrap());

        segment.write_content(b"hello").unwrap();

        assert!(segment.is_readable().unwrap());
        assert_eq!(segment.read_content().unwrap(), Bytes::from("hello"));
        // Reading does not consume the slot.
        assert!(segment.is_readable().unwrap());
        assert_eq!(segment.read_content().unwrap(), Bytes::from("hello"));
    }

    #[test]
    fn test_oversized_payload_leaves_slot_idle() {
        let dir = tempfile::tempdir().unwrap();
        let file = slot_file(&dir, 1);
        let segment = Segment::new(&file, 0, SLOT, 0);

        assert_eq!(segment.content_capacity(), 20);
        let err = segment.write_content(&[1u8; 21]).unwrap_err();
        assert!(matches!(
            err,
            QueueError::PayloadTooLarge { size: 21, max: 20 }
        ));
        assert_eq!(segment.state().unwrap(), SegmentState::Idle);

        segment.write_content(&[1u8; 20]).unwrap();
        assert_eq!(segment.read_content().unwrap().len(), 20);
    }

    #[test]
    fn test_slot_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = slot_file(&dir, 1);
        let segment = Segment::new(&file, 0, SLOT, 3);

        segment.write_content(b"first").unwrap();
        assert!(matches!(
            segment.write_content(b"second"),
            Err(QueueError::SlotOccupied { offset: 3 })
        ));
        assert_eq!(segment.read_content().unwrap(), Bytes::from("first"));
    }

    #[test]
    fn test_compare_and_set_state() {
        let dir = tempfile::tempdir().unwrap();
        let file = slot_file(&dir, 1);
        let segment = Segment::new(&file, 0, SLOT, 0);

        assert!(
            segment
                .compare_and_set_state(SegmentState::Idle, SegmentState::Readable)
                .unwrap()
        );
        assert!(
            !segment
                .compare_and_set_state(SegmentState::Idle, SegmentState::Readable)
                .unwrap()
        );
        assert_eq!(segment.state().unwrap(), SegmentState::Readable);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let file = slot_file(&dir, 1);
        let segment = Segment::new(&file, 0, SLOT, 11);

        segment.write_content(b"intact").unwrap();
        file.write_at(CONTENT_OFFSET, b"X").unwrap();

        assert!(matches!(
            segment.read_content(),
            Err(QueueError::CorruptedMessage { offset: 11 })
        ));
    }

    #[test]
    fn test_impossible_size_detected() {
        let dir = tempfile::tempdir().unwrap();
        let file = slot_file(&dir, 1);
        let segment = Segment::new(&file, 0, SLOT, 5);

        segment.write_content(b"ok").unwrap();
        file.write_at(SIZE_OFFSET, &999u32.to_ne_bytes()).unwrap();

        assert!(matches!(
            segment.read_content(),
            Err(QueueError::CorruptedMessage { offset: 5 })
        ));
    }
}
