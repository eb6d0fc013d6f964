/*!
 * Bandwidth Monitor
 * Windowed MB/s sampling of bulk memory traffic
 */

use crate::core::limits::{BANDWIDTH_SAMPLE_CAPACITY, BANDWIDTH_SAMPLE_INTERVAL};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandwidthSample {
    pub read_mbps: f64,
    pub write_mbps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandwidthStats {
    pub current_read_mbps: f64,
    pub current_write_mbps: f64,
    pub peak_read_mbps: f64,
    pub peak_write_mbps: f64,
    pub average_read_mbps: f64,
    pub average_write_mbps: f64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub samples: usize,
}

#[derive(Debug)]
struct MonitorState {
    window_start: Instant,
    window_read: u64,
    window_written: u64,
    samples: VecDeque<BandwidthSample>,
    peak_read: f64,
    peak_write: f64,
    total_read: u64,
    total_written: u64,
}

/// Accumulates bytes moved by bulk operations and closes a sample every
/// interval into a bounded ring.
#[derive(Debug)]
pub struct BandwidthMonitor {
    interval: Duration,
    capacity: usize,
    state: Mutex<MonitorState>,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self::with_interval(BANDWIDTH_SAMPLE_INTERVAL, BANDWIDTH_SAMPLE_CAPACITY)
    }

    pub fn with_interval(interval: Duration, capacity: usize) -> Self {
        Self {
            interval,
            capacity: capacity.max(1),
            state: Mutex::new(MonitorState {
                window_start: Instant::now(),
                window_read: 0,
                window_written: 0,
                samples: VecDeque::with_capacity(capacity.max(1)),
                peak_read: 0.0,
                peak_write: 0.0,
                total_read: 0,
                total_written: 0,
            }),
        }
    }

    pub fn record_read(&self, bytes: usize) {
        self.record(bytes as u64, 0);
    }

    pub fn record_write(&self, bytes: usize) {
        self.record(0, bytes as u64);
    }

    /// A copy reads and writes the same number of bytes
    pub fn record_copy(&self, bytes: usize) {
        self.record(bytes as u64, bytes as u64);
    }

    fn record(&self, read: u64, written: u64) {
        let mut state = self.state.lock();
        state.window_read += read;
        state.window_written += written;
        state.total_read += read;
        state.total_written += written;

        let elapsed = state.window_start.elapsed();
        if elapsed >= self.interval {
            let seconds = elapsed.as_secs_f64().max(1e-9);
            let sample = BandwidthSample {
                read_mbps: state.window_read as f64 / BYTES_PER_MB / seconds,
                write_mbps: state.window_written as f64 / BYTES_PER_MB / seconds,
            };
            state.peak_read = state.peak_read.max(sample.read_mbps);
            state.peak_write = state.peak_write.max(sample.write_mbps);
            if state.samples.len() == self.capacity {
                state.samples.pop_front();
            }
            state.samples.push_back(sample);
            state.window_start = Instant::now();
            state.window_read = 0;
            state.window_written = 0;
        }
    }

    pub fn stats(&self) -> BandwidthStats {
        let state = self.state.lock();
        let current = state.samples.back().copied().unwrap_or(BandwidthSample {
            read_mbps: 0.0,
            write_mbps: 0.0,
        });
        let count = state.samples.len();
        let (read_sum, write_sum) = state
            .samples
            .iter()
            .fold((0.0, 0.0), |(r, w), s| (r + s.read_mbps, w + s.write_mbps));
        let divisor = count.max(1) as f64;

        BandwidthStats {
            current_read_mbps: current.read_mbps,
            current_write_mbps: current.write_mbps,
            peak_read_mbps: state.peak_read,
            peak_write_mbps: state.peak_write,
            average_read_mbps: read_sum / divisor,
            average_write_mbps: write_sum / divisor,
            total_bytes_read: state.total_read,
            total_bytes_written: state.total_written,
            samples: count,
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.window_start = Instant::now();
        state.window_read = 0;
        state.window_written = 0;
        state.samples.clear();
        state.peak_read = 0.0;
        state.peak_write = 0.0;
        state.total_read = 0;
        state.total_written = 0;
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
