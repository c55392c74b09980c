// Public modules
pub mod config;
pub mod decision;
pub mod executor;
pub mod freq_table;
pub mod governor;
pub mod load_sampler;
pub mod platform;
pub mod status;
pub mod suspend;
pub mod throughput;
pub mod tunables;
pub mod workqueue;

// Re-export constants commonly used
pub mod constants {
    // Hz
    pub const DEFAULT_AWAKE_IDEAL_FREQ: u64 = 800_000_000;
    pub const DEFAULT_SLEEP_IDEAL_FREQ: u64 = 120_000_000;
    pub const DEFAULT_RAMP_UP_STEP: u64 = 100_000_000;
    pub const DEFAULT_RAMP_DOWN_STEP: u64 = 100_000_000;
    pub const DEFAULT_SLEEP_WAKEUP_FREQ: u64 = 1_400_000_000;

    // percent
    pub const DEFAULT_MAX_CPU_LOAD: u8 = 50;
    pub const DEFAULT_MIN_CPU_LOAD: u8 = 25;

    // us
    pub const DEFAULT_UP_RATE_US: u64 = 48_000;
    pub const DEFAULT_DOWN_RATE_US: u64 = 66_000;
    pub const MAX_RATE_LIMIT_US: u64 = 100_000_000;
    pub const DEFAULT_SAMPLE_INTERVAL_US: u64 = 20_000;
    pub const MIN_SAMPLE_INTERVAL_US: u64 = 1_000;
    pub const MAX_SAMPLE_INTERVAL_US: u64 = 10_000_000;
    pub const MIN_SAMPLE_WINDOW_US: u64 = 1_000;

    pub const LOAD_HISTORY_SIZE: usize = 16;

    pub const EARLY_SUSPEND_LEVEL_BLANK_SCREEN: i32 = 50;
    pub const EARLY_SUSPEND_LEVEL_STOP_DRAWING: i32 = 100;
    pub const EARLY_SUSPEND_LEVEL_DISABLE_FB: i32 = 150;
}
