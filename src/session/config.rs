// Non-blocking network I/O framework with filter-chain pipelines
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

/// Default size of the read buffer allocated for a session.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;
/// Lower bound for the adaptive read buffer size.
pub const DEFAULT_MIN_READ_BUFFER_SIZE: usize = 64;
/// Upper bound for the adaptive read buffer size.
pub const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 65536;
/// Time after which a write request which can't make progress is failed.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle status of a session: which direction of the traffic has stalled.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(lowercase)]
pub enum IdleStatus {
    /// Nothing was read for the configured reader idle time.
    ReaderIdle,
    /// Nothing was written for the configured writer idle time.
    WriterIdle,
    /// Neither reads nor writes happened for the configured idle time.
    BothIdle,
}

impl IdleStatus {
    pub const ALL: [IdleStatus; 3] = [IdleStatus::BothIdle, IdleStatus::ReaderIdle, IdleStatus::WriterIdle];

    pub(crate) fn index(self) -> usize {
        match self {
            IdleStatus::ReaderIdle => 0,
            IdleStatus::WriterIdle => 1,
            IdleStatus::BothIdle => 2,
        }
    }
}

/// Per-session configuration. Services hold a default copy which is cloned
/// into every new session; the copy may be updated on a live session.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct SessionConfig {
    pub read_buffer_size: usize,
    pub min_read_buffer_size: usize,
    pub max_read_buffer_size: usize,
    pub reader_idle_time: Option<Duration>,
    pub writer_idle_time: Option<Duration>,
    pub both_idle_time: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Whether received messages are also queued for [`crate::IoSession::read`].
    pub use_read_operation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            min_read_buffer_size: DEFAULT_MIN_READ_BUFFER_SIZE,
            max_read_buffer_size: DEFAULT_MAX_READ_BUFFER_SIZE,
            reader_idle_time: None,
            writer_idle_time: None,
            both_idle_time: None,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            use_read_operation: false,
        }
    }
}

impl SessionConfig {
    pub fn idle_time(&self, status: IdleStatus) -> Option<Duration> {
        match status {
            IdleStatus::ReaderIdle => self.reader_idle_time,
            IdleStatus::WriterIdle => self.writer_idle_time,
            IdleStatus::BothIdle => self.both_idle_time,
        }
    }

    pub fn with_idle_time(mut self, status: IdleStatus, time: Duration) -> Self {
        let time = if time.is_zero() { None } else { Some(time) };
        match status {
            IdleStatus::ReaderIdle => self.reader_idle_time = time,
            IdleStatus::WriterIdle => self.writer_idle_time = time,
            IdleStatus::BothIdle => self.both_idle_time = time,
        }
        self
    }

    /// Sets the current read buffer size, clamping it into the min/max range.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(self.min_read_buffer_size, self.max_read_buffer_size);
        self
    }

    /// Sets the bounds of the adaptive read buffer. The bounds are swapped if
    /// given in the wrong order and the current size is clamped into them.
    pub fn with_read_buffer_bounds(mut self, min: usize, max: usize) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        self.min_read_buffer_size = min.max(1);
        self.max_read_buffer_size = max.max(1);
        self.read_buffer_size = self.read_buffer_size.clamp(self.min_read_buffer_size, self.max_read_buffer_size);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_read_operation(mut self, enabled: bool) -> Self {
        self.use_read_operation = enabled;
        self
    }

    /// Maximum number of bytes written to a single session during one
    /// processor pass before the processor switches to other sessions.
    pub fn max_written_per_flush(&self) -> usize {
        self.max_read_buffer_size + self.max_read_buffer_size / 2
    }

    /// Computes the read buffer size for the next read: halves it when the
    /// last read used less than half of it, doubles it when the read has
    /// filled it up.
    pub(crate) fn adapt_read_buffer(&mut self, read: usize) {
        let size = self.read_buffer_size;
        let new_size = if read.saturating_mul(2) < size {
            size / 2
        } else if read == size {
            size.saturating_mul(2)
        } else {
            size
        };
        self.read_buffer_size = new_size.clamp(self.min_read_buffer_size, self.max_read_buffer_size);
    }
}

#[cfg(test)]
mod test {
    use quickcheck_macros::quickcheck;

    use super::*;

    #[test]
    fn buffer_adaptation() {
        let mut config = SessionConfig::default().with_read_buffer_bounds(64, 256).with_read_buffer_size(128);
        config.adapt_read_buffer(128);
        assert_eq!(config.read_buffer_size, 256);
        config.adapt_read_buffer(256);
        assert_eq!(config.read_buffer_size, 256);
        config.adapt_read_buffer(100);
        assert_eq!(config.read_buffer_size, 128);
        config.adapt_read_buffer(64);
        assert_eq!(config.read_buffer_size, 128);
        config.adapt_read_buffer(1);
        config.adapt_read_buffer(1);
        config.adapt_read_buffer(1);
        assert_eq!(config.read_buffer_size, 64);
    }

    #[test]
    fn idle_times() {
        let config = SessionConfig::default()
            .with_idle_time(IdleStatus::ReaderIdle, Duration::from_secs(3))
            .with_idle_time(IdleStatus::BothIdle, Duration::ZERO);
        assert_eq!(config.idle_time(IdleStatus::ReaderIdle), Some(Duration::from_secs(3)));
        assert_eq!(config.idle_time(IdleStatus::WriterIdle), None);
        assert_eq!(config.idle_time(IdleStatus::BothIdle), None);
        assert_eq!(SessionConfig::default().max_written_per_flush(), 98304);
    }

    #[quickcheck]
    fn adaptation_stays_in_bounds(min: u16, max: u16, reads: Vec<u16>) -> bool {
        let mut config = SessionConfig::default().with_read_buffer_bounds(min as usize, max as usize);
        reads.into_iter().all(|read| {
            let read = (read as usize).min(config.read_buffer_size);
            config.adapt_read_buffer(read);
            config.read_buffer_size >= config.min_read_buffer_size
                && config.read_buffer_size <= config.max_read_buffer_size
        })
    }
}
