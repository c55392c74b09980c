use std::fmt;

use crate::constants::*;

/// Runtime-adjustable governor parameters.
///
/// Frequencies are in Hz. Every setter validates its input and leaves the
/// current value untouched when rejecting it.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Tunables {
    awake_ideal_freq: u64,
    sleep_ideal_freq: u64,
    ramp_up_step: u64,
    ramp_down_step: u64,
    max_cpu_load: u8,
    min_cpu_load: u8,
    up_rate_us: u64,
    down_rate_us: u64,
    sample_interval_us: u64,
    sleep_wakeup_freq: u64,
}

/// Names accepted by [`Tunables::store`] and [`Tunables::show`].
pub const TUNABLE_NAMES: &[&str] = &[
    "awake_ideal_freq",
    "sleep_ideal_freq",
    "ramp_up_step",
    "ramp_down_step",
    "max_cpu_load",
    "min_cpu_load",
    "up_rate_us",
    "down_rate_us",
    "sample_interval_us",
    "sleep_wakeup_freq",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunableError {
    Unknown(String),
    Parse { name: &'static str, input: String },
    OutOfRange { name: &'static str, value: u64, allowed: String },
}

impl fmt::Display for TunableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunableError::Unknown(name) => write!(f, "unknown tunable {name:?}"),
            TunableError::Parse { name, input } => {
                write!(f, "{name}: {input:?} is not a non-negative integer")
            }
            TunableError::OutOfRange {
                name,
                value,
                allowed,
            } => write!(f, "{name}: {value} is out of range ({allowed})"),
        }
    }
}

impl std::error::Error for TunableError {}

fn check(name: &'static str, value: u64, ok: bool, allowed: impl FnOnce() -> String) -> Result<(), TunableError> {
    if ok {
        Ok(())
    } else {
        Err(TunableError::OutOfRange {
            name,
            value,
            allowed: allowed(),
        })
    }
}

impl Tunables {
    pub fn awake_ideal_freq(&self) -> u64 {
        self.awake_ideal_freq
    }

    /// 0 disables sleep tracking.
    pub fn sleep_ideal_freq(&self) -> u64 {
        self.sleep_ideal_freq
    }

    /// 0 jumps straight to the policy max.
    pub fn ramp_up_step(&self) -> u64 {
        self.ramp_up_step
    }

    /// 0 uses the load-proportional heuristic.
    pub fn ramp_down_step(&self) -> u64 {
        self.ramp_down_step
    }

    pub fn max_cpu_load(&self) -> u8 {
        self.max_cpu_load
    }

    pub fn min_cpu_load(&self) -> u8 {
        self.min_cpu_load
    }

    pub fn up_rate_us(&self) -> u64 {
        self.up_rate_us
    }

    pub fn down_rate_us(&self) -> u64 {
        self.down_rate_us
    }

    pub fn sample_interval_us(&self) -> u64 {
        self.sample_interval_us
    }

    pub fn sleep_wakeup_freq(&self) -> u64 {
        self.sleep_wakeup_freq
    }

    pub fn set_awake_ideal_freq(&mut self, hz: u64) -> Result<(), TunableError> {
        self.awake_ideal_freq = hz;
        Ok(())
    }

    pub fn set_sleep_ideal_freq(&mut self, hz: u64) -> Result<(), TunableError> {
        self.sleep_ideal_freq = hz;
        Ok(())
    }

    pub fn set_ramp_up_step(&mut self, hz: u64) -> Result<(), TunableError> {
        self.ramp_up_step = hz;
        Ok(())
    }

    pub fn set_ramp_down_step(&mut self, hz: u64) -> Result<(), TunableError> {
        self.ramp_down_step = hz;
        Ok(())
    }

    pub fn set_sleep_wakeup_freq(&mut self, hz: u64) -> Result<(), TunableError> {
        self.sleep_wakeup_freq = hz;
        Ok(())
    }

    pub fn set_max_cpu_load(&mut self, percent: u64) -> Result<(), TunableError> {
        let min = u64::from(self.min_cpu_load);
        check("max_cpu_load", percent, percent > min && percent <= 100, || {
            format!("{} to 100", min + 1)
        })?;
        self.max_cpu_load = percent as u8;
        Ok(())
    }

    pub fn set_min_cpu_load(&mut self, percent: u64) -> Result<(), TunableError> {
        let max = u64::from(self.max_cpu_load);
        check("min_cpu_load", percent, percent >= 1 && percent < 100 && percent < max, || {
            format!("1 to {}", (max - 1).min(99))
        })?;
        self.min_cpu_load = percent as u8;
        Ok(())
    }

    pub fn set_up_rate_us(&mut self, us: u64) -> Result<(), TunableError> {
        check("up_rate_us", us, us <= MAX_RATE_LIMIT_US, || {
            format!("0 to {MAX_RATE_LIMIT_US}")
        })?;
        self.up_rate_us = us;
        Ok(())
    }

    pub fn set_down_rate_us(&mut self, us: u64) -> Result<(), TunableError> {
        check("down_rate_us", us, us <= MAX_RATE_LIMIT_US, || {
            format!("0 to {MAX_RATE_LIMIT_US}")
        })?;
        self.down_rate_us = us;
        Ok(())
    }

    pub fn set_sample_interval_us(&mut self, us: u64) -> Result<(), TunableError> {
        let range = MIN_SAMPLE_INTERVAL_US..=MAX_SAMPLE_INTERVAL_US;
        check("sample_interval_us", us, range.contains(&us), || {
            format!("{MIN_SAMPLE_INTERVAL_US} to {MAX_SAMPLE_INTERVAL_US}")
        })?;
        self.sample_interval_us = us;
        Ok(())
    }

    /// Sets a tunable by name from its text form. Frequencies are read in
    /// kHz, the unit cpufreq uses; everything else in its own unit.
    pub fn store(&mut self, name: &str, input: &str) -> Result<(), TunableError> {
        let key = TUNABLE_NAMES
            .iter()
            .copied()
            .find(|n| *n == name)
            .ok_or_else(|| TunableError::Unknown(name.to_string()))?;
        let value: u64 = input.trim().parse().map_err(|_| TunableError::Parse {
            name: key,
            input: input.to_string(),
        })?;
        let khz = || value.saturating_mul(1000);

        match key {
            "awake_ideal_freq" => self.set_awake_ideal_freq(khz()),
            "sleep_ideal_freq" => self.set_sleep_ideal_freq(khz()),
            "ramp_up_step" => self.set_ramp_up_step(khz()),
            "ramp_down_step" => self.set_ramp_down_step(khz()),
            "max_cpu_load" => self.set_max_cpu_load(value),
            "min_cpu_load" => self.set_min_cpu_load(value),
            "up_rate_us" => self.set_up_rate_us(value),
            "down_rate_us" => self.set_down_rate_us(value),
            "sample_interval_us" => self.set_sample_interval_us(value),
            "sleep_wakeup_freq" => self.set_sleep_wakeup_freq(khz()),
            _ => Err(TunableError::Unknown(name.to_string())),
        }
    }

    /// Text form of a tunable, the inverse of [`store`](Self::store).
    pub fn show(&self, name: &str) -> Result<String, TunableError> {
        let value = match name {
            "awake_ideal_freq" => self.awake_ideal_freq / 1000,
            "sleep_ideal_freq" => self.sleep_ideal_freq / 1000,
            "ramp_up_step" => self.ramp_up_step / 1000,
            "ramp_down_step" => self.ramp_down_step / 1000,
            "max_cpu_load" => u64::from(self.max_cpu_load),
            "min_cpu_load" => u64::from(self.min_cpu_load),
            "up_rate_us" => self.up_rate_us,
            "down_rate_us" => self.down_rate_us,
            "sample_interval_us" => self.sample_interval_us,
            "sleep_wakeup_freq" => self.sleep_wakeup_freq / 1000,
            _ => return Err(TunableError::Unknown(name.to_string())),
        };
        Ok(value.to_string())
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            awake_ideal_freq: DEFAULT_AWAKE_IDEAL_FREQ,
            sleep_ideal_freq: DEFAULT_SLEEP_IDEAL_FREQ,
            ramp_up_step: DEFAULT_RAMP_UP_STEP,
            ramp_down_step: DEFAULT_RAMP_DOWN_STEP,
            max_cpu_load: DEFAULT_MAX_CPU_LOAD,
            min_cpu_load: DEFAULT_MIN_CPU_LOAD,
            up_rate_us: DEFAULT_UP_RATE_US,
            down_rate_us: DEFAULT_DOWN_RATE_US,
            sample_interval_us: DEFAULT_SAMPLE_INTERVAL_US,
            sleep_wakeup_freq: DEFAULT_SLEEP_WAKEUP_FREQ,
        }
    }
}
