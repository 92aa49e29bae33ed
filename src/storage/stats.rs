//! Global server statistics.
//!
//! Everything runs on one thread, so the counters are plain integers rather
//! than atomics. The item store updates the item/byte counters, connections
//! update the connection and traffic counters, and the `stats` command reads
//! them all.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Stats {
    /// Items currently linked
    pub curr_items: u64,
    /// Items ever linked
    pub total_items: u64,
    /// Accounted bytes of linked items
    pub curr_bytes: u64,
    /// Items evicted to make room for new ones
    pub evictions: u64,
    /// Currently open client connections
    pub curr_conns: u64,
    /// Connections ever accepted
    pub total_conns: u64,
    /// Connection records ever created
    pub conn_structs: u64,
    /// Keys requested by `get`
    pub get_cmds: u64,
    /// Store commands whose payload was received
    pub set_cmds: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    started: Instant,
    started_unix: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            curr_items: 0,
            total_items: 0,
            curr_bytes: 0,
            evictions: 0,
            curr_conns: 0,
            total_conns: 0,
            conn_structs: 0,
            get_cmds: 0,
            set_cmds: 0,
            get_hits: 0,
            get_misses: 0,
            bytes_read: 0,
            bytes_written: 0,
            started: Instant::now(),
            started_unix: unix_now(),
        }
    }

    /// Clears the cumulative counters. Point-in-time values (current items,
    /// bytes and connections) are kept.
    pub fn reset(&mut self) {
        self.total_items = 0;
        self.total_conns = 0;
        self.evictions = 0;
        self.get_cmds = 0;
        self.set_cmds = 0;
        self.get_hits = 0;
        self.get_misses = 0;
        self.bytes_read = 0;
        self.bytes_written = 0;
    }

    /// Seconds since the server started.
    pub fn uptime(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Converts a monotonic instant into UNIX seconds.
    pub fn unix_time(&self, at: Instant) -> u64 {
        self.started_unix + at.saturating_duration_since(self.started).as_secs()
    }
}

/// Current UNIX time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_current_values() {
        let mut stats = Stats::new();
        stats.curr_items = 3;
        stats.curr_conns = 2;
        stats.total_items = 10;
        stats.get_hits = 7;
        stats.bytes_read = 100;

        stats.reset();

        assert_eq!(stats.curr_items, 3);
        assert_eq!(stats.curr_conns, 2);
        assert_eq!(stats.total_items, 0);
        assert_eq!(stats.get_hits, 0);
        assert_eq!(stats.bytes_read, 0);
    }

    #[test]
    fn test_unix_time_is_monotonic_offset() {
        let stats = Stats::new();
        let now = Instant::now();
        assert!(stats.unix_time(now) >= stats.started_unix);
    }
}
