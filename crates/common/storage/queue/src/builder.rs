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

use crate::{ContentSize, GapPolicy, Queue, QueueConfig, Result, retention::TimeToLive};

pub struct QueueBuilder {
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>, T: Into<String>>(root: P, topic: T) -> Self {
        Self {
            config: QueueConfig {
                root: root.into(),
                topic: topic.into(),
                ..Default::default()
            },
        }
    }

    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn content_size(mut self, preset: ContentSize) -> Self {
        self.config.max_message_size = preset.max_message_size();
        self
    }

    pub fn carriage_capacity(mut self, capacity: u64) -> Self {
        self.config.carriage_capacity = capacity;
        self
    }

    pub fn retention(mut self, ttl: Duration) -> Self {
        self.config.retention = Some(TimeToLive::new(ttl));
        self
    }

    /// Keep carriages forever.
    pub fn no_retention(mut self) -> Self {
        self.config.retention = None;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.config.overwrite = overwrite;
        self
    }

    pub fn gap_policy(mut self, policy: GapPolicy) -> Self {
        self.config.gap_policy = policy;
        self
    }

    /// See [`QueueConfig::retired_carriage_grace`].
    pub fn retired_carriage_grace(mut self, grace: Duration) -> Self {
        self.config.retired_carriage_grace = grace;
        self
    }

    pub fn build(self) -> Result<Queue> { Queue::new(self.config) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default_config() {
        let builder = QueueBuilder::new("/tmp/test_queue", "orders");
        assert_eq!(builder.config.root, PathBuf::from("/tmp/test_queue"));
        assert_eq!(builder.config.topic, "orders");
        assert_eq!(builder.config.max_message_size, 1016);
        assert_eq!(builder.config.carriage_capacity, 1024 * 1024);
        assert!(builder.config.retention.is_some());
        assert!(!builder.config.overwrite);
    }

    #[test]
    fn test_builder_custom_config() {
        let builder = QueueBuilder::new("/tmp/test_queue", "orders")
            .content_size(ContentSize::Kb4)
            .carriage_capacity(64)
            .retention(Duration::from_secs(60))
            .overwrite(true)
            .gap_policy(GapPolicy::SkipAfter(Duration::from_millis(10)))
            .retired_carriage_grace(Duration::from_secs(2));

        assert_eq!(builder.config.max_message_size, 4088);
        assert_eq!(builder.config.carriage_capacity, 64);
        assert_eq!(
            builder.config.retention,
            Some(TimeToLive::from_secs(60))
        );
        assert!(builder.config.overwrite);
        assert_eq!(
            builder.config.gap_policy,
            GapPolicy::SkipAfter(Duration::from_millis(10))
        );
        assert_eq!(
            builder.config.retired_carriage_grace,
            Duration::from_secs(2)
        );

        let builder = builder.max_message_size(16).no_retention();
        assert_eq!(builder.config.max_message_size, 16);
        assert!(builder.config.retention.is_none());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(
            QueueBuilder::new(temp_dir.path(), "orders")
                .carriage_capacity(0)
                .build()
                .is_err()
        );
        assert!(QueueBuilder::new(temp_dir.path(), "..").build().is_err());
    }
}
