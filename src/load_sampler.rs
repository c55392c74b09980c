use std::collections::VecDeque;

use crate::constants::MIN_SAMPLE_WINDOW_US;

/// Outcome of closing one sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// Window shorter than [`MIN_SAMPLE_WINDOW_US`]; no decision must be taken.
    TooShort { delta_time_us: u64 },
    Load {
        load_percent: u8,
        delta_time_us: u64,
        delta_idle_us: u64,
    },
}

/// Busy/idle accounting of one CPU between two sample points.
#[derive(Debug, Clone)]
pub struct LoadSampler {
    // 0 means no baseline yet
    last_sample_time: u64,
    last_idle_time: u64,
    recent: VecDeque<u8>,
    capacity: usize,
}

impl LoadSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            last_sample_time: 0,
            last_idle_time: 0,
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Starts a new window at (`idle_us`, `now_us`).
    pub fn rebase(&mut self, idle_us: u64, now_us: u64) {
        self.last_idle_time = idle_us;
        self.last_sample_time = now_us;
    }

    /// Forgets the baseline; the next sample is dropped until [`rebase`](Self::rebase).
    pub fn invalidate(&mut self) {
        self.last_sample_time = 0;
        self.last_idle_time = 0;
    }

    pub fn has_baseline(&self) -> bool {
        self.last_sample_time != 0
    }

    pub fn last_sample_time(&self) -> u64 {
        self.last_sample_time
    }

    pub fn last_idle_time(&self) -> u64 {
        self.last_idle_time
    }

    /// Closes the window ending at (`idle_us`, `now_us`).
    ///
    /// Idle time larger than wall time (accounting skew) counts as zero load.
    pub fn sample(&mut self, idle_us: u64, now_us: u64) -> Sample {
        let delta_time_us = now_us.saturating_sub(self.last_sample_time);
        let delta_idle_us = idle_us.saturating_sub(self.last_idle_time);

        if delta_time_us < MIN_SAMPLE_WINDOW_US {
            return Sample::TooShort { delta_time_us };
        }

        let load_percent = if delta_idle_us > delta_time_us {
            0
        } else {
            let busy = u128::from(delta_time_us - delta_idle_us);
            (100 * busy / u128::from(delta_time_us)).min(100) as u8
        };

        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(load_percent);

        Sample::Load {
            load_percent,
            delta_time_us,
            delta_idle_us,
        }
    }

    /// Mean of the most recent loads, for reporting only.
    pub fn average_load(&self) -> f32 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().map(|&l| f32::from(l)).sum::<f32>() / self.recent.len() as f32
    }
}
