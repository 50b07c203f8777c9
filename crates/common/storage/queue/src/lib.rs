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

//! Topic-based message queue over shared memory-mapped files.
//!
//! Producers and consumer groups in any number of threads or processes on
//! one host exchange messages through files under `<root>/<topic>/`:
//!
//! - a base file with the offset counter and the topic sizing,
//! - carriage files, each a fixed array of segments,
//! - one cursor file per consumer group.
//!
//! Coordination between producers and readers is done with atomic operations
//! on words inside those mappings, and there are no background threads. The
//! only lock is the in-process `RwLock` mmap-io keeps per mapping, taken by
//! atomic views and region writes. Every `Producer` and `Reader` owns its own
//! mappings, so that lock is never contended between threads.

mod base_info;
pub mod builder;
mod carriage;
pub mod config;
mod crc;
mod cursor;
pub mod error;
mod file;
pub mod message;
pub mod path;
mod producer;
mod queue;
mod reader;
pub mod retention;
mod segment;

pub use base_info::TopicSizing;
pub use builder::QueueBuilder;
pub use config::{ContentSize, GapPolicy, QueueConfig};
pub use error::{QueueError, Result};
pub use message::Message;
pub use producer::Producer;
pub use queue::{GroupStat, Queue, TopicStat};
pub use reader::{RETIRED_CARRIAGE_GRACE, Reader};
pub use retention::TimeToLive;
