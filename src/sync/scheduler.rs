//! Adaptive poll scheduling.
//!
//! Each engine owns a [`PollScheduler`] walking one backoff table. Polls that
//! bring new posts snap the delay back to the shortest entry; quiet polls step
//! one entry further, saturating at the last one.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{
    PollingConfig, SourceKind, DEFAULT_ARCHIVE_POLL_DELAYS_SECS, DEFAULT_LIVE_POLL_DELAYS_SECS,
};

/// Non-empty, ordered list of poll delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffTable(Vec<Duration>);

impl BackoffTable {
    /// Build from delays in seconds. An empty list falls back to a single
    /// delay of `fallback_secs`.
    pub fn from_secs(delays: &[u64], fallback_secs: u64) -> Self {
        if delays.is_empty() {
            return Self(vec![Duration::from_secs(fallback_secs)]);
        }
        Self(delays.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Delay at `index`, clamped to the last entry
    pub fn delay(&self, index: usize) -> Duration {
        let last = self.0.len().saturating_sub(1);
        self.0.get(index.min(last)).copied().unwrap_or_default()
    }
}

/// The live and archive tables, selected per descriptor by source kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffTables {
    pub live: BackoffTable,
    pub archive: BackoffTable,
}

impl BackoffTables {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            live: BackoffTable::from_secs(
                &config.live_delays_seconds,
                DEFAULT_LIVE_POLL_DELAYS_SECS[0],
            ),
            archive: BackoffTable::from_secs(
                &config.archive_delays_seconds,
                DEFAULT_ARCHIVE_POLL_DELAYS_SECS[0],
            ),
        }
    }

    pub fn for_kind(&self, kind: SourceKind) -> &BackoffTable {
        match kind {
            SourceKind::Live => &self.live,
            SourceKind::Archive => &self.archive,
        }
    }
}

impl Default for BackoffTables {
    fn default() -> Self {
        Self {
            live: BackoffTable::from_secs(&DEFAULT_LIVE_POLL_DELAYS_SECS, 0),
            archive: BackoffTable::from_secs(&DEFAULT_ARCHIVE_POLL_DELAYS_SECS, 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollScheduler {
    table: BackoffTable,
    index: usize,
    /// Highest post count seen so far
    high_water: usize,
    last_success: Option<Instant>,
}

impl PollScheduler {
    pub fn new(tables: &BackoffTables, kind: SourceKind) -> Self {
        Self::with_table(tables.for_kind(kind).clone())
    }

    pub fn with_table(table: BackoffTable) -> Self {
        Self {
            table,
            index: 0,
            high_water: 0,
            last_success: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current_delay(&self) -> Duration {
        self.table.delay(self.index)
    }

    /// Back to the shortest delay. The high-water post count is kept.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// Record a successful poll that produced `post_count` posts.
    pub fn record_poll(&mut self, post_count: usize, now: Instant) {
        self.last_success = Some(now);

        if post_count > self.high_water {
            self.high_water = post_count;
            self.index = 0;
        } else {
            self.index = (self.index + 1).min(self.table.len().saturating_sub(1));
        }
    }

    /// Time left until the next poll is due.
    ///
    /// Zero while a request is in flight, before the first success, and once
    /// the deadline has passed.
    pub fn time_until_next_poll(&self, now: Instant, in_flight: bool) -> Duration {
        if in_flight {
            return Duration::ZERO;
        }
        match self.last_success {
            Some(at) => (at + self.current_delay()).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.time_until_next_poll(now, false).is_zero()
    }
}
