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

//! Topic handle and lifecycle management.
//!
//! The [`Queue`] is the entry point of the library. It owns no threads and
//! no mappings of its own; it validates the configuration, lays out the
//! topic directory and hands out [`Producer`]s and [`Reader`]s.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/path/to/root", "orders").build()?;
//!
//! let mut producer = queue.create_producer()?;
//! producer.enqueue(b"hello")?;
//!
//! let mut reader = queue.create_reader(Some("billing"))?;
//! while let Some(message) = reader.dequeue()? {
//!     println!("{}: {:?}", message.offset, message.payload);
//! }
//! ```

use std::{io, path::PathBuf, sync::Arc};

use chrono::Utc;
use snafu::ResultExt;
use tracing::{info, warn};

use crate::{
    QueueConfig, Result,
    base_info::{BaseInfo, TopicSizing},
    carriage::carriage_index,
    cursor::GroupCursor,
    error::IoSnafu,
    path::TopicPaths,
    producer::Producer,
    reader::Reader,
    retention,
};

/// Snapshot of a topic's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStat {
    pub topic:        String,
    pub dir:          PathBuf,
    /// `None` until a producer has created the topic.
    pub sizing:       Option<TopicSizing>,
    pub total_offset: u64,
    /// Carriage indices present on disk.
    pub carriages:    Vec<u64>,
    pub groups:       Vec<GroupStat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStat {
    pub group:       String,
    pub next_offset: u64,
    pub lag:         u64,
}

/// A topic under a root directory.
///
/// `Queue` is `Send + Sync`; producers and readers it creates are owned by
/// one thread each.
pub struct Queue {
    config: Arc<QueueConfig>,
    paths:  TopicPaths,
}

impl Queue {
    /// Open a topic, creating its directory if needed.
    ///
    /// With `overwrite` set, existing carriages and group cursors are removed
    /// and the offset counter starts again at zero.
    pub(crate) fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let paths = TopicPaths::new(&config.root, &config.topic)?;
        paths.ensure_dir()?;

        if config.overwrite {
            remove_topic_data(&paths)?;
            BaseInfo::open_write(&paths, config.sizing(), true)?.flush()?;
        }

        info!(
            topic = paths.topic(),
            dir = %paths.dir().display(),
            overwrite = config.overwrite,
            "Queue initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            paths,
        })
    }

    /// Create a producer. The first producer of a topic fixes its sizing.
    pub fn create_producer(&self) -> Result<Producer> {
        let base = BaseInfo::open_write(&self.paths, self.config.sizing(), false)?;
        Producer::new(self.paths.clone(), base, self.config.retention)
    }

    /// Join consumer group `group`, or a fresh ephemeral group when `None`.
    ///
    /// Ephemeral groups are named by a random UUID and their cursor file is
    /// removed when the reader closes.
    pub fn create_reader(&self, group: Option<&str>) -> Result<Reader> {
        let (name, ephemeral) = group.map_or_else(
            || (uuid::Uuid::new_v4().to_string(), true),
            |group| (group.to_string(), false),
        );
        Reader::open(
            self.paths.clone(),
            &name,
            ephemeral,
            self.config.retention,
            self.config.gap_policy,
            self.config.retired_carriage_grace,
        )
    }

    pub fn stat(&self) -> Result<TopicStat> {
        let base = BaseInfo::open_read(&self.paths)?;
        let total_offset = base
            .as_ref()
            .map(BaseInfo::current_offset)
            .transpose()?
            .unwrap_or(0);

        let carriages = self
            .paths
            .scan_carriages()?
            .into_iter()
            .map(|(index, _)| index)
            .collect();

        let mut groups = Vec::new();
        for (group, path) in self.paths.scan_readers()? {
            let next_offset = GroupCursor::peek(&path)?.unwrap_or(0);
            groups.push(GroupStat {
                group,
                next_offset,
                lag: total_offset.saturating_sub(next_offset),
            });
        }

        Ok(TopicStat {
            topic: self.paths.topic().to_string(),
            dir: self.paths.dir().to_path_buf(),
            sizing: base.as_ref().map(BaseInfo::sizing),
            total_offset,
            carriages,
            groups,
        })
    }

    /// Run the retention sweep now. Returns the removed carriage indices.
    ///
    /// The carriage holding the newest offset is always kept.
    pub fn sweep(&self) -> Result<Vec<u64>> {
        let Some(ttl) = self.config.retention else {
            return Ok(Vec::new());
        };
        let Some(base) = BaseInfo::open_read(&self.paths)? else {
            return Ok(Vec::new());
        };
        let total = base.current_offset()?;
        let keep_from = carriage_index(total.saturating_sub(1), base.carriage_capacity());
        drop(base);

        let removed = retention::sweep(&self.paths, ttl, keep_from, Utc::now());
        info!(topic = self.paths.topic(), ?removed, "retention sweep finished");
        Ok(removed)
    }

    /// Remove the topic directory with everything in it.
    pub fn delete_topic(self) -> Result<()> {
        match std::fs::remove_dir_all(self.paths.dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(IoSnafu { path: self.paths.dir() }),
        }
        info!(topic = self.paths.topic(), "deleted topic");
        Ok(())
    }

    pub fn config(&self) -> &QueueConfig { &self.config }

    pub fn topic(&self) -> &str { self.paths.topic() }

    pub fn dir(&self) -> &std::path::Path { self.paths.dir() }
}

fn remove_topic_data(paths: &TopicPaths) -> Result<()> {
    let carriages = paths.scan_carriages()?.into_iter().map(|(_, path)| path);
    let readers = paths.scan_readers()?.into_iter().map(|(_, path)| path);
    for path in carriages.chain(readers) {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove file on overwrite");
                return Err(e).context(IoSnafu { path });
            }
        }
    }
    Ok(())
}
