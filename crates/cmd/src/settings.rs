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

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File, Map};
use serde::{Deserialize, Serialize};
use shmq_common_telemetry::LoggingOptions;
use shmq_queue::{ContentSize, GapPolicy, QueueBuilder, config::DEFAULT_CARRIAGE_CAPACITY};
use smart_default::SmartDefault;

/// Prefix of environment overrides, e.g. `SHMQ__ROOT=/dev/shm/shmq`.
pub const ENV_PREFIX: &str = "SHMQ";

/// CLI settings, layered: built-in defaults, then the config file, then
/// `SHMQ__*` environment variables, then command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, SmartDefault)]
#[serde(default)]
pub struct Settings {
    #[default(_code = "shmq_queue::path::default_root()")]
    pub root:              PathBuf,
    #[default(_code = "ContentSize::Kb1.max_message_size()")]
    pub max_message_size:  u32,
    #[default(DEFAULT_CARRIAGE_CAPACITY)]
    pub carriage_capacity: u64,
    /// Carriage retention in seconds. `0` keeps carriages forever.
    #[default = 604_800]
    pub retention_secs:    u64,
    /// Skip an offset that stayed unwritten this many milliseconds. `0`
    /// waits forever.
    pub gap_skip_ms:       u64,
    /// Wait this many milliseconds on a missing carriage behind the tail
    /// before skipping it as retired.
    #[default = 50]
    pub retired_grace_ms:  u64,
    #[default(_code = "default_logging()")]
    pub logging:           LoggingOptions,
}

fn default_logging() -> LoggingOptions {
    LoggingOptions {
        level: Some("warn".to_string()),
        console_stderr: true,
        ..Default::default()
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> { Self::load_from(path, None) }

    /// `env` replaces the process environment, for tests.
    pub(crate) fn load_from(
        path: Option<&Path>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = path
            && !path.exists()
        {
            return Err(ConfigError::Message(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }

        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        builder.build()?.try_deserialize()
    }

    pub fn queue_builder(&self, topic: &str) -> QueueBuilder {
        let builder = QueueBuilder::new(&self.root, topic)
            .max_message_size(self.max_message_size)
            .carriage_capacity(self.carriage_capacity);

        let builder = match self.retention_secs {
            0 => builder.no_retention(),
            secs => builder.retention(Duration::from_secs(secs)),
        };

        builder
            .gap_policy(match self.gap_skip_ms {
                0 => GapPolicy::Stall,
                ms => GapPolicy::SkipAfter(Duration::from_millis(ms)),
            })
            .retired_carriage_grace(Duration::from_millis(self.retired_grace_ms))
    }
}
