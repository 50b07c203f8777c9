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

//! CRC32 (IEEE) over a segment's size word and payload, via crc32fast.

use crc32fast::Hasher;

/// Checksum stored in the trailing word of a segment.
///
/// Covering the size word as well as the payload catches a torn or
/// corrupted length, not just corrupted content.
#[inline]
pub(crate) fn segment_crc(size: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&size.to_ne_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[inline]
pub(crate) fn verify_segment_crc(size: u32, payload: &[u8], stored: u32) -> bool {
    segment_crc(size, payload) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_depends_on_size_and_payload() {
        let payload = b"carriage payload";
        let size = u32::try_from(payload.len()).unwrap();

        let crc = segment_crc(size, payload);
        assert_eq!(crc, segment_crc(size, payload));
        assert_ne!(crc, segment_crc(size + 1, payload));
        assert_ne!(crc, segment_crc(size, b"carriage paylo4d"));
    }

    #[test]
    fn test_verify_segment_crc() {
        let payload = b"verify me";
        let crc = segment_crc(9, payload);

        assert!(verify_segment_crc(9, payload, crc));
        assert!(!verify_segment_crc(9, payload, crc ^ 1));
        assert!(verify_segment_crc(0, b"", segment_crc(0, b"")));
    }
}
