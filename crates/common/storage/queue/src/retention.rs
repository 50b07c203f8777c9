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

//! Time-based retention of carriage files.
//!
//! Sweeps are opportunistic: they run whenever a carriage handle is closed
//! and can be forced through [`Queue::sweep`](crate::Queue::sweep). Deletion
//! is best-effort; a file that cannot be removed (typically still mapped by
//! another process on a platform that forbids it) is logged and picked up
//! again by a later sweep.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::path::TopicPaths;

/// Default retention window: 7 days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long carriage files are kept after their last modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToLive(Duration);

impl TimeToLive {
    pub const fn new(duration: Duration) -> Self { Self(duration) }

    pub const fn from_secs(secs: u64) -> Self { Self(Duration::from_secs(secs)) }

    pub const fn duration(&self) -> Duration { self.0 }

    /// Anything last modified before this instant is expired.
    pub fn clean_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.0)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_expired(&self, modified: SystemTime, now: DateTime<Utc>) -> bool {
        DateTime::<Utc>::from(modified) < self.clean_before(now)
    }
}

impl Default for TimeToLive {
    fn default() -> Self { Self(DEFAULT_RETENTION) }
}

impl From<Duration> for TimeToLive {
    fn from(duration: Duration) -> Self { Self(duration) }
}

/// Delete expired carriage files of a topic.
///
/// Carriages with an index of `keep_from` or above are never touched, so the
/// carriage currently receiving writes survives even if its mtime is stale.
/// Returns the indices that were removed.
pub fn sweep(paths: &TopicPaths, ttl: TimeToLive, keep_from: u64, now: DateTime<Utc>) -> Vec<u64> {
    let carriages = match paths.scan_carriages() {
        Ok(carriages) => carriages,
        Err(e) => {
            warn!(topic = paths.topic(), error = %e, "retention sweep could not list carriages");
            return Vec::new();
        }
    };

    let mut removed = Vec::new();
    for (index, path) in carriages {
        if index >= keep_from {
            break;
        }

        let modified = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping carriage without mtime");
                continue;
            }
        };
        if !ttl.is_expired(modified, now) {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(topic = paths.topic(), index, "removed expired carriage");
                removed.push(index);
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to remove expired carriage, retrying on next sweep"
                );
            }
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use chrono::TimeZone;

    use super::*;

    fn touch(path: &std::path::Path, modified: SystemTime) {
        let file = File::create(path).unwrap();
        file.set_modified(modified).unwrap();
    }

    #[test]
    fn test_clean_before() {
        let now = Utc.with_ymd_and_hms(2026, 1, 14, 12, 0, 0).unwrap();
        let ttl = TimeToLive::from_secs(3600);
        assert_eq!(
            ttl.clean_before(now),
            Utc.with_ymd_and_hms(2026, 1, 14, 11, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let ttl = TimeToLive::new(Duration::MAX);
        assert_eq!(ttl.clean_before(Utc::now()), DateTime::<Utc>::MIN_UTC);
        assert!(!ttl.is_expired(SystemTime::UNIX_EPOCH, Utc::now()));
    }

    #[test]
    fn test_default_is_seven_days() {
        assert_eq!(
            TimeToLive::default().duration(),
            Duration::from_secs(604_800)
        );
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = TopicPaths::new(temp_dir.path(), "orders").unwrap();
        paths.ensure_dir().unwrap();

        let now = SystemTime::now();
        touch(&paths.carriage_file(0), now - Duration::from_secs(7200));
        touch(&paths.carriage_file(1), now - Duration::from_secs(60));
        touch(&paths.carriage_file(2), now - Duration::from_secs(7200));

        let removed = sweep(&paths, TimeToLive::from_secs(3600), 2, Utc::now());

        assert_eq!(removed, vec![0]);
        assert!(!paths.carriage_file(0).exists());
        assert!(paths.carriage_file(1).exists());
        // Protected by `keep_from` despite being old.
        assert!(paths.carriage_file(2).exists());
    }

    #[test]
    fn test_sweep_missing_topic_is_noop() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = TopicPaths::new(temp_dir.path(), "ghost").unwrap();

        assert!(sweep(&paths, TimeToLive::from_secs(1), u64::MAX, Utc::now()).is_empty());
    }
}
