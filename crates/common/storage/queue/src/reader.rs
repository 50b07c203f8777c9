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

//! Consumer group member.
//!
//! Members of one group share a cursor file and compete for offsets, so every
//! message is delivered to exactly one of them. Different groups have
//! different cursors and each sees the whole topic.
//!
//! ## Dequeue
//!
//! A member looks at the offset the cursor points to and only claims it (CAS
//! `n -> n + 1`) once the segment is readable. An offset whose producer has
//! not finished writing is never claimed, so it cannot be lost. The cost is
//! head-of-line blocking: the group waits for that segment, unless the
//! reader runs with [`GapPolicy::SkipAfter`].
//!
//! Carriages removed by retention are skipped by moving the cursor to the
//! first offset of the next carriage.

use std::{
    thread,
    time::{Duration, Instant},
};

use crossbeam::utils::Backoff;
use snafu::OptionExt;
use tracing::{debug, warn};

use crate::{
    GapPolicy, Result,
    base_info::BaseInfo,
    carriage::{Carriage, CarriagePosition, CarriageStatus, carriage_index},
    cursor::GroupCursor,
    error::ClosedSnafu,
    message::Message,
    path::TopicPaths,
    retention::TimeToLive,
};

/// Default for how long a missing carriage behind the tail must stay missing
/// before it is treated as retired. Covers a producer that allocated the
/// carriage's offsets but has not created its file yet.
pub const RETIRED_CARRIAGE_GRACE: Duration = Duration::from_millis(50);

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one look at the cursor.
enum Step {
    Deliver(Message),
    Empty,
    Retry,
}

/// Whether the carriage for an offset could be mapped.
enum Lookup {
    Ready,
    Pending,
    Missing,
}

/// A member of a consumer group.
pub struct Reader {
    paths:         TopicPaths,
    group:         String,
    /// Delete the cursor file on close.
    owns_cursor:   bool,
    /// Mapped lazily: the topic may have no producer yet.
    base:          Option<BaseInfo>,
    cursor:        Option<GroupCursor>,
    carriage:      Option<Carriage>,
    retention:     Option<TimeToLive>,
    gap_policy:    GapPolicy,
    retired_grace: Duration,
    /// Offset the reader is waiting on and since when.
    stalled:       Option<(u64, Instant)>,
}

impl Reader {
    pub(crate) fn open(
        paths: TopicPaths,
        group: &str,
        ephemeral: bool,
        retention: Option<TimeToLive>,
        gap_policy: GapPolicy,
        retired_grace: Duration,
    ) -> Result<Self> {
        let cursor = GroupCursor::open(&paths, group)?;
        let base = BaseInfo::open_read(&paths)?;
        debug!(topic = paths.topic(), group, ephemeral, "opened reader");
        Ok(Self {
            paths,
            group: group.to_string(),
            owns_cursor: ephemeral,
            base,
            cursor: Some(cursor),
            carriage: None,
            retention,
            gap_policy,
            retired_grace,
            stalled: None,
        })
    }

    pub fn group(&self) -> &str { &self.group }

    pub fn topic(&self) -> &str { self.paths.topic() }

    /// Whether the cursor file is removed when this reader closes.
    pub const fn is_ephemeral(&self) -> bool { self.owns_cursor }

    /// Deliver the next message of the group, or `None` if there is nothing
    /// readable right now.
    pub fn dequeue(&mut self) -> Result<Option<Message>> {
        loop {
            match self.step()? {
                Step::Deliver(message) => return Ok(Some(message)),
                Step::Empty => return Ok(None),
                Step::Retry => {}
            }
        }
    }

    /// Like [`dequeue`](Self::dequeue), but keep polling until a message
    /// arrives or `timeout` elapses.
    pub fn dequeue_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(message) = self.dequeue()? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if backoff.is_completed() {
                thread::sleep(MAX_POLL_INTERVAL.min(deadline - now));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Claim the next allocated offset for this member without reading it.
    ///
    /// Unlike [`dequeue`](Self::dequeue) this does not wait for the segment
    /// to be written.
    pub fn claim_next(&mut self) -> Result<Option<u64>> {
        let Some(total) = self.total_offset()? else {
            return Ok(None);
        };
        self.cursor()?.claim_next(total)
    }

    /// Move the group cursor, backwards to replay or forwards to skip.
    pub fn commit_offset(&mut self, offset: u64) -> Result<()> {
        self.cursor()?.store(offset)?;
        self.stalled = None;
        debug!(topic = self.paths.topic(), group = %self.group, offset, "committed offset");
        Ok(())
    }

    /// Next offset the group will deliver.
    pub fn offset(&self) -> Result<u64> { self.cursor()?.next_offset() }

    /// Allocated offsets the group has not consumed yet.
    pub fn lag(&mut self) -> Result<u64> {
        let total = self.total_offset()?.unwrap_or(0);
        Ok(total.saturating_sub(self.offset()?))
    }

    /// Another member of the same group. Clones never remove the cursor file.
    pub fn try_clone(&self) -> Result<Self> {
        Self::open(
            self.paths.clone(),
            &self.group,
            false,
            self.retention,
            self.gap_policy,
            self.retired_grace,
        )
    }

    /// Release the mappings. An ephemeral group's cursor file is removed.
    pub fn close(mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn step(&mut self) -> Result<Step> {
        let Some(total) = self.total_offset()? else {
            return Ok(Step::Empty);
        };
        let Some(capacity) = self.base.as_ref().map(BaseInfo::carriage_capacity) else {
            return Ok(Step::Empty);
        };

        let next = self.offset()?;
        if next >= total {
            self.stalled = None;
            return Ok(Step::Empty);
        }

        match self.lookup_carriage(next, capacity, total)? {
            Lookup::Ready => {}
            Lookup::Pending => return Ok(Step::Empty),
            Lookup::Missing => {
                let tail = carriage_index(total - 1, capacity);
                let index = carriage_index(next, capacity);
                if index < tail && stalled_for(&mut self.stalled, next) >= self.retired_grace {
                    let target = ((index + 1) * capacity).min(total);
                    if self.cursor()?.compare_exchange(next, target)? {
                        warn!(
                            topic = self.paths.topic(),
                            group = %self.group,
                            from = next,
                            to = target,
                            "carriage {index} is gone, skipped its offsets"
                        );
                    }
                    self.stalled = None;
                }
                return Ok(Step::Empty);
            }
        }

        let Some(carriage) = self.carriage.as_ref() else {
            return Ok(Step::Empty);
        };
        let segment = carriage.segment(next)?;

        if !segment.is_readable()? {
            if let GapPolicy::SkipAfter(limit) = self.gap_policy
                && next + 1 < total
                && stalled_for(&mut self.stalled, next) >= limit
            {
                self.stalled = None;
                if self.cursor()?.compare_exchange(next, next + 1)? {
                    warn!(
                        topic = self.paths.topic(),
                        group = %self.group,
                        offset = next,
                        "skipped offset that was never written"
                    );
                }
                return Ok(Step::Retry);
            }
            return Ok(Step::Empty);
        }

        self.stalled = None;
        if !self.cursor()?.compare_exchange(next, next + 1)? {
            // Another member claimed it first.
            return Ok(Step::Retry);
        }

        let payload = segment.read_content()?;
        Ok(Step::Deliver(Message {
            offset: next,
            payload,
        }))
    }

    fn lookup_carriage(&mut self, offset: u64, capacity: u64, total: u64) -> Result<Lookup> {
        if self
            .carriage
            .as_ref()
            .is_some_and(|carriage| carriage.compare(offset) == CarriagePosition::Current)
        {
            return Ok(Lookup::Ready);
        }

        match Carriage::open_read(&self.paths, capacity, offset, self.retention)? {
            CarriageStatus::Open(carriage) => {
                debug!(
                    topic = self.paths.topic(),
                    group = %self.group,
                    index = carriage.index(),
                    "reader switched carriage"
                );
                if let Some(previous) = self.carriage.replace(carriage) {
                    previous.close(carriage_index(total - 1, capacity));
                }
                Ok(Lookup::Ready)
            }
            CarriageStatus::NotReady => Ok(Lookup::Pending),
            CarriageStatus::NotExisting => Ok(Lookup::Missing),
        }
    }

    fn total_offset(&mut self) -> Result<Option<u64>> {
        if self.base.is_none() {
            self.base = BaseInfo::open_read(&self.paths)?;
        }
        self.base
            .as_ref()
            .map(BaseInfo::current_offset)
            .transpose()
    }

    fn cursor(&self) -> Result<&GroupCursor> { self.cursor.as_ref().context(ClosedSnafu) }

    fn shutdown(&mut self) {
        if let Some(carriage) = self.carriage.take() {
            let keep_from = self
                .base
                .as_ref()
                .and_then(|base| {
                    let total = base.current_offset().ok()?;
                    Some(carriage_index(
                        total.saturating_sub(1),
                        base.carriage_capacity(),
                    ))
                })
                .unwrap_or_else(|| carriage.index());
            carriage.close(keep_from);
        }

        let Some(cursor) = self.cursor.take() else {
            return;
        };
        if let Err(e) = cursor.flush() {
            warn!(group = %self.group, error = %e, "failed to flush cursor");
        }
        if self.owns_cursor {
            let path = cursor.path().to_path_buf();
            drop(cursor);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(group = %self.group, "removed ephemeral cursor"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove ephemeral cursor"),
            }
        }
    }
}

/// How long the reader has been stuck on `offset`, starting the clock if it
/// was stuck on something else.
fn stalled_for(stalled: &mut Option<(u64, Instant)>, offset: u64) -> Duration {
    match *stalled {
        Some((current, since)) if current == offset => since.elapsed(),
        _ => {
            *stalled = Some((offset, Instant::now()));
            Duration::ZERO
        }
    }
}

impl Iterator for Reader {
    type Item = Result<Message>;

    /// Yields messages until the group has caught up.
    fn next(&mut self) -> Option<Self::Item> { self.dequeue().transpose() }
}

impl Drop for Reader {
    fn drop(&mut self) { self.shutdown(); }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{base_info::TopicSizing, producer::Producer};

    const SIZING: TopicSizing = TopicSizing {
        carriage_capacity: 4,
        max_message_size:  16,
    };

    fn producer(paths: &TopicPaths) -> Producer {
        let base = BaseInfo::open_write(paths, SIZING, false).unwrap();
        Producer::new(paths.clone(), base, None).unwrap()
    }

    fn reader(paths: &TopicPaths, group: &str, policy: GapPolicy) -> Reader {
        Reader::open(
            paths.clone(),
            group,
            false,
            None,
            policy,
            RETIRED_CARRIAGE_GRACE,
        )
        .unwrap()
    }

    fn setup() -> (tempfile::TempDir, TopicPaths) {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = TopicPaths::new(temp_dir.path(), "orders").unwrap();
        (temp_dir, paths)
    }

    #[test]
    fn test_reader_before_any_producer() {
        let (_dir, paths) = setup();
        let mut reader = reader(&paths, "g", GapPolicy::Stall);

        assert!(reader.dequeue().unwrap().is_none());
        assert_eq!(reader.lag().unwrap(), 0);
        assert_eq!(reader.claim_next().unwrap(), None);

        let mut producer = producer(&paths);
        producer.enqueue("late").unwrap();
        let message = reader.dequeue().unwrap().unwrap();
        assert_eq!(message.offset, 0);
        assert_eq!(message.payload, Bytes::from("late"));
    }

    #[test]
    fn test_unwritten_offset_stalls_the_group() {
        let (_dir, paths) = setup();
        let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();
        // A producer that died between allocation and write.
        base.allocate_offset().unwrap();

        let mut producer = producer(&paths);
        producer.enqueue("after gap").unwrap();

        let mut reader = reader(&paths, "g", GapPolicy::Stall);
        assert!(reader.dequeue().unwrap().is_none());
        assert_eq!(reader.offset().unwrap(), 0);
        assert_eq!(reader.lag().unwrap(), 2);
    }

    #[test]
    fn test_gap_skipped_after_limit() {
        let (_dir, paths) = setup();
        let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();
        base.allocate_offset().unwrap();

        let mut producer = producer(&paths);
        producer.enqueue("after gap").unwrap();

        let mut reader = reader(
            &paths,
            "g",
            GapPolicy::SkipAfter(Duration::from_millis(20)),
        );
        assert!(reader.dequeue().unwrap().is_none());
        thread::sleep(Duration::from_millis(40));

        let message = reader.dequeue().unwrap().unwrap();
        assert_eq!(message.offset, 1);
        assert_eq!(message.payload, Bytes::from("after gap"));
    }

    #[test]
    fn test_empty_carriage_file_is_not_retired() {
        let (_dir, paths) = setup();
        let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();
        for _ in 0..5 {
            base.allocate_offset().unwrap();
        }
        // Created by a producer that has not sized it yet.
        std::fs::File::create(paths.carriage_file(0)).unwrap();

        let mut reader = reader(&paths, "g", GapPolicy::Stall);
        assert!(reader.dequeue().unwrap().is_none());
        thread::sleep(RETIRED_CARRIAGE_GRACE * 2);
        assert!(reader.dequeue().unwrap().is_none());
        assert_eq!(reader.offset().unwrap(), 0);
    }

    #[test]
    fn test_retired_carriage_waits_for_configured_grace() {
        let (_dir, paths) = setup();
        let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();
        // Carriage 0 is never created.
        for _ in 0..4 {
            base.allocate_offset().unwrap();
        }
        let mut producer = producer(&paths);
        producer.enqueue("tail").unwrap();

        let mut reader = Reader::open(
            paths.clone(),
            "g",
            false,
            None,
            GapPolicy::Stall,
            Duration::from_millis(300),
        )
        .unwrap();
        assert!(reader.dequeue().unwrap().is_none());
        thread::sleep(RETIRED_CARRIAGE_GRACE * 2);
        assert!(reader.dequeue().unwrap().is_none());
        assert_eq!(reader.offset().unwrap(), 0);

        let message = reader
            .dequeue_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(message.offset, 4);
        assert_eq!(message.payload, Bytes::from("tail"));
    }

    #[test]
    fn test_claim_next_does_not_wait_for_content() {
        let (_dir, paths) = setup();
        let base = BaseInfo::open_write(&paths, SIZING, false).unwrap();
        base.allocate_offset().unwrap();

        let mut reader = reader(&paths, "g", GapPolicy::Stall);
        assert_eq!(reader.claim_next().unwrap(), Some(0));
        assert_eq!(reader.claim_next().unwrap(), None);
    }

    #[test]
    fn test_commit_offset_replays() {
        let (_dir, paths) = setup();
        let mut producer = producer(&paths);
        producer.enqueue_batch(["a", "b"]).unwrap();

        let mut reader = reader(&paths, "g", GapPolicy::Stall);
        let drained: Vec<u64> = reader.by_ref().map(|m| m.unwrap().offset).collect();
        assert_eq!(drained, vec![0, 1]);

        reader.commit_offset(1).unwrap();
        assert_eq!(reader.lag().unwrap(), 1);
        assert_eq!(
            reader.dequeue().unwrap().unwrap().payload,
            Bytes::from("b")
        );
    }

    #[test]
    fn test_ephemeral_cursor_removed_but_not_by_clones() {
        let (_dir, paths) = setup();
        let reader = Reader::open(
            paths.clone(),
            "tmp-group",
            true,
            None,
            GapPolicy::Stall,
            RETIRED_CARRIAGE_GRACE,
        )
        .unwrap();
        let cursor_file = paths.reader_file("tmp-group").unwrap();

        let clone = reader.try_clone().unwrap();
        assert!(!clone.is_ephemeral());
        clone.close().unwrap();
        assert!(cursor_file.exists());

        reader.close().unwrap();
        assert!(!cursor_file.exists());
    }

    #[test]
    fn test_dequeue_timeout_expires() {
        let (_dir, paths) = setup();
        let mut reader = reader(&paths, "g", GapPolicy::Stall);

        let started = Instant::now();
        assert!(
            reader
                .dequeue_timeout(Duration::from_millis(30))
                .unwrap()
                .is_none()
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
