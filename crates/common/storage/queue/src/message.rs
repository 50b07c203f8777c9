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

use bytes::Bytes;

/// A message delivered to a consumer group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Offset assigned by the producer. Unique within the topic and never
    /// reused.
    pub offset: u64,

    /// Copy of the segment content.
    pub payload: Bytes,
}
