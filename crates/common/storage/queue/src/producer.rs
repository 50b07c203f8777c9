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

//! Message writer for a topic.
//!
//! A [`Producer`] allocates an offset from the shared base file and writes
//! the payload straight into the segment owning that offset. Any number of
//! producers, in any number of threads or processes, may write to one topic
//! at once; each keeps its own mapping of the carriage it last wrote to.
//!
//! ## Concurrency
//!
//! `Producer` is `Send` but not meant to be shared. Give each thread its own
//! via [`Producer::try_clone`] or [`Queue::create_producer`](crate::Queue).

use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    Result,
    base_info::BaseInfo,
    carriage::{Carriage, CarriageLayout, CarriagePosition},
    error::PayloadTooLargeSnafu,
    path::TopicPaths,
    retention::TimeToLive,
};

/// A writer appending messages to one topic.
pub struct Producer {
    paths:     TopicPaths,
    base:      BaseInfo,
    layout:    CarriageLayout,
    /// Carriage of the last written offset.
    carriage:  Option<Carriage>,
    retention: Option<TimeToLive>,
    closed:    bool,
}

impl Producer {
    pub(crate) fn new(
        paths: TopicPaths,
        base: BaseInfo,
        retention: Option<TimeToLive>,
    ) -> Result<Self> {
        let layout = base.layout()?;
        Ok(Self {
            paths,
            base,
            layout,
            carriage: None,
            retention,
            closed: false,
        })
    }

    /// Append one message and return its offset.
    ///
    /// Payloads above the topic's max message size are rejected before an
    /// offset is allocated, so they never leave a hole in the topic.
    pub fn enqueue(&mut self, payload: impl AsRef<[u8]>) -> Result<u64> {
        let payload = payload.as_ref();
        let max = self.base.max_message_size() as usize;
        ensure!(
            payload.len() <= max,
            PayloadTooLargeSnafu {
                size: payload.len(),
                max,
            }
        );

        let offset = self.base.allocate_offset()?;
        let carriage = self.carriage_for(offset)?;
        if let Err(e) = carriage
            .segment(offset)
            .and_then(|segment| segment.write_content(payload))
        {
            warn!(
                topic = self.paths.topic(),
                offset,
                error = %e,
                "allocated offset left unwritten"
            );
            return Err(e);
        }

        Ok(offset)
    }

    /// Append every item in order and return their offsets.
    ///
    /// Not atomic: each item gets its own offset, and items from other
    /// producers may interleave. Stops at the first failure.
    pub fn enqueue_batch<I>(&mut self, items: I) -> Result<Vec<u64>>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        items
            .into_iter()
            .map(|item| self.enqueue(item))
            .collect()
    }

    /// Number of offsets allocated in the topic so far, by any producer.
    pub fn total_offset(&self) -> Result<u64> { self.base.current_offset() }

    pub fn topic(&self) -> &str { self.paths.topic() }

    /// Largest payload [`enqueue`](Self::enqueue) accepts.
    pub const fn max_message_size(&self) -> u32 { self.base.max_message_size() }

    /// Another producer for the same topic with its own mappings.
    pub fn try_clone(&self) -> Result<Self> {
        let base = BaseInfo::open_write(&self.paths, self.base.sizing(), false)?;
        Self::new(self.paths.clone(), base, self.retention)
    }

    /// Release the carriage mapping, running the retention sweep, and flush
    /// the base file.
    pub fn close(mut self) -> Result<()> {
        self.shutdown();
        self.base.flush()
    }

    fn carriage_for(&mut self, offset: u64) -> Result<&Carriage> {
        match self.carriage.take() {
            Some(carriage) if carriage.compare(offset) == CarriagePosition::Current => {
                Ok(self.carriage.insert(carriage))
            }
            previous => {
                let next = Carriage::open_write(&self.paths, self.layout, offset, self.retention)?;
                if let Some(previous) = previous {
                    debug!(
                        topic = self.paths.topic(),
                        from = previous.index(),
                        to = next.index(),
                        "producer rotated carriage"
                    );
                    previous.close(next.index());
                }
                Ok(self.carriage.insert(next))
            }
        }
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(carriage) = self.carriage.take() {
            let index = carriage.index();
            carriage.close(index);
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) { self.shutdown(); }
}
