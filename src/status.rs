use std::fs::{self, File};
use std::io::{Error as IoError, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::decision::RampDirection;
use crate::governor::{CpuGovernorState, Governor};
use crate::suspend::{Phase, SuspendCoordinator, SuspendState};
use crate::throughput::{ThroughputDomain, ThroughputSnapshot};
use crate::tunables::Tunables;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStatus {
    pub cpu: usize,
    pub policy_min: u64,
    pub policy_max: u64,
    pub ideal_speed: u64,
    pub frequency: u64,
    pub load_percent: u8,
    pub average_load: f32,
    pub ramp_direction: RampDirection,
    pub timer_armed: bool,
}

impl From<&CpuGovernorState> for CpuStatus {
    fn from(st: &CpuGovernorState) -> Self {
        Self {
            cpu: st.cpu,
            policy_min: st.policy_min,
            policy_max: st.policy_max,
            ideal_speed: st.ideal_speed,
            frequency: st.old_frequency,
            load_percent: st.current_load_percent,
            average_load: st.average_load(),
            ramp_direction: st.ramp_direction,
            timer_armed: st.timer_armed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendStatus {
    pub requested: SuspendState,
    pub phase: Phase,
    pub wake_lock_held: bool,
    pub filesystem_syncs: u64,
}

/// Everything the daemon reports, as one JSON document.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// seconds since the epoch
    pub timestamp: u64,
    pub suspended: bool,
    pub suspend: Option<SuspendStatus>,
    pub tunables: Tunables,
    pub cpus: Vec<CpuStatus>,
    pub throughput: Vec<ThroughputSnapshot>,
}

impl StatusSnapshot {
    pub fn capture(
        governor: &Governor,
        coordinator: Option<&SuspendCoordinator>,
        domains: &[ThroughputDomain],
    ) -> Self {
        let cpus = governor
            .attached_cpus()
            .into_iter()
            .filter_map(|cpu| governor.cpu_state(cpu))
            .map(|st| CpuStatus::from(&st))
            .collect();
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            suspended: governor.is_suspended(),
            suspend: coordinator.map(|c| SuspendStatus {
                requested: c.requested_state(),
                phase: c.phase(),
                wake_lock_held: c.wake_lock().is_held(),
                filesystem_syncs: c.filesystem_syncs(),
            }),
            tunables: governor.tunables(),
            cpus,
            throughput: domains.iter().map(ThroughputDomain::snapshot).collect(),
        }
    }
}

/// Writes snapshots to a fixed path, replacing it atomically.
pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Runtime directory if there is one, the cache directory otherwise.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("ideal-speed-governor");
        path.push("status.json");
        path
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, snapshot: &StatusSnapshot) -> Result<(), IoError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot).map_err(IoError::other)?;

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        fs::rename(&temp_path, &self.path)
    }
}
