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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Queue operation errors.
///
/// "No data yet" is never an error: read paths report it as `Ok(None)`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error on {}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation failed on {}: {message}", path.display()))]
    Mmap { path: PathBuf, message: String },

    /// A write was attempted through a read-only mapping.
    #[snafu(display("{} is mapped read-only", path.display()))]
    ReadOnly { path: PathBuf },

    /// Payload does not fit into a segment.
    #[snafu(display("Payload of {size} bytes exceeds the limit of {max} bytes"))]
    PayloadTooLarge { size: usize, max: usize },

    /// A segment was requested from a carriage that does not own the offset.
    ///
    /// This is a carriage resolution bug in the caller, never a "rotate and
    /// retry" signal.
    #[snafu(display("Offset {offset} does not belong to carriage {index}"))]
    IndexMismatch { offset: u64, index: u64 },

    /// A producer found its freshly allocated slot already written.
    #[snafu(display("Segment for offset {offset} was already written"))]
    SlotOccupied { offset: u64 },

    /// CRC mismatch or impossible length detected during read.
    #[snafu(display("Corrupted message at offset {offset}"))]
    CorruptedMessage { offset: u64 },

    /// A base, carriage or cursor file header is unusable.
    #[snafu(display("Corrupted header in {}: {reason}", path.display()))]
    CorruptedHeader { path: PathBuf, reason: String },

    /// Topic or group name that cannot be used as a file name.
    #[snafu(display("Invalid name: {name:?}"))]
    InvalidName { name: String },

    /// Rejected queue configuration.
    #[snafu(display("Invalid config: {message}"))]
    InvalidConfig { message: String },

    /// The producer or reader has already been closed.
    #[snafu(display("Handle already closed"))]
    Closed,
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
