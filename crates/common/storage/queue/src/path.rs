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

//! On-disk layout of a topic.
//!
//! ```text
//! <root>/<topic>/<topic>.base          offset counter and sizing
//! <root>/<topic>/<index>.carriage      segments of one offset range
//! <root>/<topic>/<group>.reader        cursor of one consumer group
//! ```

use std::{
    io,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};

use crate::{
    Result,
    error::{InvalidNameSnafu, IoSnafu},
};

pub const BASE_EXTENSION: &str = "base";
pub const CARRIAGE_EXTENSION: &str = "carriage";
pub const READER_EXTENSION: &str = "reader";

/// Default root directory: `$TMPDIR/shmq`.
pub fn default_root() -> PathBuf { std::env::temp_dir().join("shmq") }

/// Checks that `name` can be used as a single file name component.
pub fn validate_name(name: &str) -> Result<()> {
    ensure!(
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']),
        InvalidNameSnafu { name }
    );
    Ok(())
}

/// Resolves every file of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPaths {
    topic: String,
    dir:   PathBuf,
}

impl TopicPaths {
    pub fn new<P: AsRef<Path>>(root: P, topic: &str) -> Result<Self> {
        validate_name(topic)?;
        Ok(Self {
            topic: topic.to_string(),
            dir:   root.as_ref().join(topic),
        })
    }

    pub fn topic(&self) -> &str { &self.topic }

    pub fn dir(&self) -> &Path { &self.dir }

    /// Creates the topic directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context(IoSnafu { path: &self.dir })
    }

    /// `<topic>.base`
    pub fn base_file(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{BASE_EXTENSION}", self.topic))
    }

    /// `<index>.carriage`
    pub fn carriage_file(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{index}.{CARRIAGE_EXTENSION}"))
    }

    /// `<group>.reader`
    pub fn reader_file(&self, group: &str) -> Result<PathBuf> {
        validate_name(group)?;
        Ok(self.dir.join(format!("{group}.{READER_EXTENSION}")))
    }

    /// Lists carriage files as `(index, path)`, sorted by index.
    ///
    /// Files whose stem is not a number are ignored.
    pub fn scan_carriages(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut carriages: Vec<_> = self
            .scan_extension(CARRIAGE_EXTENSION)?
            .into_iter()
            .filter_map(|(stem, path)| stem.parse::<u64>().ok().map(|index| (index, path)))
            .collect();
        carriages.sort_unstable_by_key(|(index, _)| *index);
        Ok(carriages)
    }

    /// Lists consumer group cursor files as `(group, path)`, sorted by name.
    pub fn scan_readers(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut readers = self.scan_extension(READER_EXTENSION)?;
        readers.sort();
        Ok(readers)
    }

    fn scan_extension(&self, extension: &str) -> Result<Vec<(String, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(IoSnafu { path: &self.dir }),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.context(IoSnafu { path: &self.dir })?.path();
            if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some(extension) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((stem.to_string(), path.clone()));
            }
        }

        Ok(files)
    }
}
