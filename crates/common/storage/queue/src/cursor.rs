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

//! Consumer group cursor: one shared `next offset` word per group.
//!
//! Every member of a group maps `<group>.reader` and claims offsets by CAS,
//! so each offset is handed to exactly one member.

use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use mmap_io::atomic::AtomicView;

use crate::{Result, file::MappedFile, path::TopicPaths};

/// Size of a cursor file in bytes.
pub const CURSOR_FILE_SIZE: u64 = 4096;

const NEXT_OFFSET_POS: u64 = 0;

pub struct GroupCursor {
    file:  MappedFile,
    group: String,
}

impl GroupCursor {
    /// Map the cursor of `group`, creating it at offset 0 if absent.
    pub fn open(paths: &TopicPaths, group: &str) -> Result<Self> {
        let file = MappedFile::open_or_create(paths.reader_file(group)?, CURSOR_FILE_SIZE)?;
        Ok(Self {
            file,
            group: group.to_string(),
        })
    }

    /// Read a cursor file without creating it.
    pub fn peek(path: &Path) -> Result<Option<u64>> {
        let Some(file) = MappedFile::open_ro(path)? else {
            return Ok(None);
        };
        if file.len() < 8 {
            return Ok(None);
        }
        Ok(Some(
            file.atomic_u64(NEXT_OFFSET_POS)?
                .load(Ordering::Acquire),
        ))
    }

    pub fn group(&self) -> &str { &self.group }

    pub fn path(&self) -> &Path { self.file.path() }

    /// Next offset the group will deliver.
    pub fn next_offset(&self) -> Result<u64> { Ok(self.word()?.load(Ordering::Acquire)) }

    /// Move the cursor from `current` to `new` if nobody else moved it.
    pub fn compare_exchange(&self, current: u64, new: u64) -> Result<bool> {
        Ok(self
            .word()?
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Unconditionally set the cursor.
    pub fn store(&self, offset: u64) -> Result<()> {
        self.word()?.store(offset, Ordering::Release);
        Ok(())
    }

    /// Claim the cursor value if it is below `limit`, advancing it by one.
    pub fn claim_next(&self, limit: u64) -> Result<Option<u64>> {
        let word = self.word()?;
        let mut current = word.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return Ok(None);
            }
            match word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(claimed) => return Ok(Some(claimed)),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn flush(&self) -> Result<()> { self.file.flush() }

    fn word(&self) -> Result<AtomicView<'_, AtomicU64>> {
        self.file.atomic_u64(NEXT_OFFSET_POS)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Barrier},
    };

    use super::*;

    fn paths() -> (tempfile::TempDir, TopicPaths) {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = TopicPaths::new(temp_dir.path(), "orders").unwrap();
        (temp_dir, paths)
    }

    #[test]
    fn test_new_cursor_starts_at_zero() {
        let (_dir, paths) = paths();
        let cursor = GroupCursor::open(&paths, "billing").unwrap();

        assert_eq!(cursor.group(), "billing");
        assert_eq!(cursor.next_offset().unwrap(), 0);
        assert_eq!(cursor.path(), paths.reader_file("billing").unwrap());
    }

    #[test]
    fn test_claim_next_respects_limit() {
        let (_dir, paths) = paths();
        let cursor = GroupCursor::open(&paths, "g").unwrap();

        assert_eq!(cursor.claim_next(2).unwrap(), Some(0));
        assert_eq!(cursor.claim_next(2).unwrap(), Some(1));
        assert_eq!(cursor.claim_next(2).unwrap(), None);
        assert_eq!(cursor.next_offset().unwrap(), 2);
    }

    #[test]
    fn test_compare_exchange_and_store() {
        let (_dir, paths) = paths();
        let cursor = GroupCursor::open(&paths, "g").unwrap();

        assert!(cursor.compare_exchange(0, 4).unwrap());
        assert!(!cursor.compare_exchange(0, 8).unwrap());
        cursor.store(1).unwrap();
        assert_eq!(cursor.next_offset().unwrap(), 1);
    }

    #[test]
    fn test_cursor_survives_reopen_and_peek() {
        let (_dir, paths) = paths();
        let path = paths.reader_file("g").unwrap();
        assert_eq!(GroupCursor::peek(&path).unwrap(), None);

        {
            let cursor = GroupCursor::open(&paths, "g").unwrap();
            cursor.store(42).unwrap();
            cursor.flush().unwrap();
        }

        assert_eq!(GroupCursor::peek(&path).unwrap(), Some(42));
        assert_eq!(
            GroupCursor::open(&paths, "g")
                .unwrap()
                .next_offset()
                .unwrap(),
            42
        );
    }

    #[test]
    fn test_members_claim_disjoint_offsets() {
        let (_dir, paths) = paths();
        let paths = Arc::new(paths);
        const MEMBERS: usize = 4;
        const LIMIT: u64 = 2000;
        let barrier = Arc::new(Barrier::new(MEMBERS));

        let handles: Vec<_> = (0..MEMBERS)
            .map(|_| {
                let paths = Arc::clone(&paths);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let cursor = GroupCursor::open(&paths, "shared").unwrap();
                    barrier.wait();
                    let mut claimed = Vec::new();
                    while let Some(offset) = cursor.claim_next(LIMIT).unwrap() {
                        claimed.push(offset);
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for offset in handle.join().unwrap() {
                assert!(seen.insert(offset));
            }
        }
        assert_eq!(seen, (0..LIMIT).collect());
    }
}
