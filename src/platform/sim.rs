use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{CpuPolicy, Domain, IdleTime, Platform, PlatformError};

#[derive(Debug, Clone)]
struct SimCpu {
    policy: CpuPolicy,
    idle_us: u64,
    available: Vec<u64>,
}

#[derive(Debug)]
struct SimState {
    now_us: u64,
    cpus: Vec<SimCpu>,
    devices: BTreeMap<String, u64>,
    set_calls: Vec<(Domain, u64)>,
    failures: usize,
}

/// Deterministic platform with a manual clock.
///
/// Records every `set_frequency` call and can be told to reject the next
/// ones. Used by the tests and by the daemon's `--simulate` mode.
#[derive(Debug)]
pub struct SimulatedPlatform {
    state: Mutex<SimState>,
}

impl SimulatedPlatform {
    /// `ncpus` CPUs, all starting at the lowest of `frequencies` (Hz) with
    /// the policy spanning the whole list.
    pub fn new(ncpus: usize, frequencies: &[u64]) -> Self {
        let min = frequencies.iter().copied().min().unwrap_or(0);
        let max = frequencies.iter().copied().max().unwrap_or(0);
        let cpu = SimCpu {
            policy: CpuPolicy { min, max, cur: min },
            idle_us: 0,
            available: frequencies.to_vec(),
        };
        Self {
            state: Mutex::new(SimState {
                now_us: 1,
                cpus: vec![cpu; ncpus],
                devices: BTreeMap::new(),
                set_calls: Vec::new(),
                failures: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advances the clock; every CPU is `busy_percent` busy meanwhile.
    pub fn advance(&self, delta_us: u64, busy_percent: u8) {
        let mut state = self.lock();
        state.now_us += delta_us;
        let idle = delta_us * u64::from(100 - busy_percent.min(100)) / 100;
        for cpu in &mut state.cpus {
            cpu.idle_us += idle;
        }
    }

    pub fn now_us(&self) -> u64 {
        self.lock().now_us
    }

    pub fn set_policy(&self, cpu: usize, min: u64, max: u64) {
        if let Some(c) = self.lock().cpus.get_mut(cpu) {
            c.policy.min = min;
            c.policy.max = max;
        }
    }

    /// Changes a CPU's frequency behind the governor's back.
    pub fn force_frequency(&self, cpu: usize, hz: u64) {
        if let Some(c) = self.lock().cpus.get_mut(cpu) {
            c.policy.cur = hz;
        }
    }

    /// Rejects the next `count` frequency changes.
    pub fn fail_next_sets(&self, count: usize) {
        self.lock().failures = count;
    }

    pub fn set_calls(&self) -> Vec<(Domain, u64)> {
        self.lock().set_calls.clone()
    }
}

impl Platform for SimulatedPlatform {
    fn set_frequency(&self, domain: &Domain, hz: u64) -> Result<u64, PlatformError> {
        let mut state = self.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(PlatformError::Rejected {
                domain: domain.clone(),
                frequency: hz,
            });
        }
        match domain {
            Domain::Cpu(cpu) => {
                let c = state
                    .cpus
                    .get_mut(*cpu)
                    .ok_or_else(|| PlatformError::UnknownDomain(domain.clone()))?;
                c.policy.cur = hz;
            }
            Domain::Device(name) => {
                state.devices.insert(name.clone(), hz);
            }
        }
        state.set_calls.push((domain.clone(), hz));
        Ok(hz)
    }

    fn get_frequency(&self, domain: &Domain) -> Result<u64, PlatformError> {
        let state = self.lock();
        match domain {
            Domain::Cpu(cpu) => state.cpus.get(*cpu).map(|c| c.policy.cur),
            Domain::Device(name) => state.devices.get(name).copied(),
        }
        .ok_or_else(|| PlatformError::UnknownDomain(domain.clone()))
    }

    fn idle_time(&self, cpu: usize) -> Result<IdleTime, PlatformError> {
        let state = self.lock();
        let c = state
            .cpus
            .get(cpu)
            .ok_or(PlatformError::UnknownDomain(Domain::Cpu(cpu)))?;
        Ok(IdleTime {
            idle_us: c.idle_us,
            timestamp_us: state.now_us,
        })
    }

    fn cpu_policy(&self, cpu: usize) -> Result<CpuPolicy, PlatformError> {
        self.lock()
            .cpus
            .get(cpu)
            .map(|c| c.policy)
            .ok_or(PlatformError::UnknownDomain(Domain::Cpu(cpu)))
    }

    fn cpus(&self) -> Result<Vec<usize>, PlatformError> {
        Ok((0..self.lock().cpus.len()).collect())
    }

    fn available_frequencies(&self, cpu: usize) -> Result<Vec<u64>, PlatformError> {
        self.lock()
            .cpus
            .get(cpu)
            .map(|c| c.available.clone())
            .ok_or(PlatformError::UnknownDomain(Domain::Cpu(cpu)))
    }
}
