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

use std::{path::PathBuf, time::Duration};

use crate::{
    Result, base_info::TopicSizing, carriage::CarriageLayout, path, reader::RETIRED_CARRIAGE_GRACE,
    retention::TimeToLive,
};

/// Default number of segments per carriage.
pub const DEFAULT_CARRIAGE_CAPACITY: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub root:                   PathBuf,
    pub topic:                  String,
    /// Largest payload a producer accepts. Fixed when the topic is created.
    pub max_message_size:       u32,
    /// Segments per carriage file. Fixed when the topic is created.
    pub carriage_capacity:      u64,
    /// `None` keeps carriages forever.
    pub retention:              Option<TimeToLive>,
    /// Drop any existing data of the topic when the queue is opened.
    pub overwrite:              bool,
    pub gap_policy:             GapPolicy,
    /// How long a reader waits on a missing carriage behind the tail before
    /// skipping it as retired. A producer descheduled longer than this
    /// between allocating an offset and creating that carriage loses the
    /// carriage to readers.
    pub retired_carriage_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root:                   path::default_root(),
            topic:                  "default".to_string(),
            max_message_size:       ContentSize::Kb1.max_message_size(),
            carriage_capacity:      DEFAULT_CARRIAGE_CAPACITY,
            retention:              Some(TimeToLive::default()),
            overwrite:              false,
            gap_policy:             GapPolicy::Stall,
            retired_carriage_grace: RETIRED_CARRIAGE_GRACE,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        path::validate_name(&self.topic)?;
        CarriageLayout::new(self.carriage_capacity, self.max_message_size)?;
        Ok(())
    }

    pub const fn sizing(&self) -> TopicSizing {
        TopicSizing {
            carriage_capacity: self.carriage_capacity,
            max_message_size:  self.max_message_size,
        }
    }
}

/// Segment size presets. The payload limit of each is the preset size
/// minus 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSize {
    B512,
    Kb1,
    Kb2,
    Kb4,
}

impl ContentSize {
    pub const fn max_message_size(self) -> u32 {
        let segment = match self {
            Self::B512 => 512,
            Self::Kb1 => 1024,
            Self::Kb2 => 2 * 1024,
            Self::Kb4 => 4 * 1024,
        };
        segment - 8
    }
}

/// What a reader does about an offset that was allocated but never written,
/// typically because its producer died between allocation and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GapPolicy {
    /// Wait until the segment is filled. Nothing is ever skipped.
    #[default]
    Stall,
    /// Skip the offset once it has stayed unwritten for this long while later
    /// offsets were already allocated.
    SkipAfter(Duration),
}
