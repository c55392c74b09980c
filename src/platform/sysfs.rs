use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, trace};

use super::{CpuPolicy, Domain, IdleTime, Platform, PlatformError};

// /proc/stat counts in USER_HZ, which is 100 on every Linux ABI
const USER_HZ: u64 = 100;

/// Linux cpufreq / devfreq backend.
///
/// CPUs must run the `userspace` cpufreq governor so that `scaling_setspeed`
/// is writable. Device domains are programmed through devfreq `min_freq`.
pub struct SysfsPlatform {
    sysfs_root: PathBuf,
    procfs_root: PathBuf,
    origin: Instant,
}

fn read_trimmed(path: &Path) -> Result<String, PlatformError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| PlatformError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn read_u64(path: &Path) -> Result<u64, PlatformError> {
    let content = read_trimmed(path)?;
    content.parse().map_err(|_| PlatformError::Parse {
        path: path.display().to_string(),
        content,
    })
}

fn write_value(path: &Path, value: u64) -> Result<(), PlatformError> {
    let io_err = |source| PlatformError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(value.to_string().as_bytes()).map_err(io_err)
}

impl SysfsPlatform {
    pub fn new(sysfs_root: impl Into<PathBuf>, procfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            procfs_root: procfs_root.into(),
            origin: Instant::now(),
        }
    }

    fn cpufreq_dir(&self, cpu: usize) -> PathBuf {
        self.sysfs_root
            .join("devices/system/cpu")
            .join(format!("cpu{cpu}"))
            .join("cpufreq")
    }

    fn devfreq_dir(&self, name: &str) -> PathBuf {
        self.sysfs_root.join("class/devfreq").join(name)
    }

    /// Residency of every cpuidle state, in µs. `None` without cpuidle.
    fn cpuidle_time_us(&self, cpu: usize) -> Result<Option<u64>, PlatformError> {
        let dir = self
            .sysfs_root
            .join("devices/system/cpu")
            .join(format!("cpu{cpu}"))
            .join("cpuidle");
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(None);
        };

        let mut total = 0u64;
        let mut states = 0;
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| n.starts_with("state")) {
                continue;
            }
            total = total.saturating_add(read_u64(&entry.path().join("time"))?);
            states += 1;
        }
        Ok((states > 0).then_some(total))
    }

    // 10 ms resolution, only used when cpuidle is unavailable
    fn proc_stat_idle_us(&self, cpu: usize) -> Result<u64, PlatformError> {
        let path = self.procfs_root.join("stat");
        let content = read_trimmed(&path)?;
        let label = format!("cpu{cpu}");

        let line = content
            .lines()
            .find(|l| l.split_whitespace().next() == Some(label.as_str()))
            .ok_or_else(|| PlatformError::UnknownDomain(Domain::Cpu(cpu)))?;
        // cpuN user nice system idle iowait ...
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map_while(|v| v.parse().ok())
            .collect();
        if fields.len() < 5 {
            return Err(PlatformError::Parse {
                path: path.display().to_string(),
                content: line.to_string(),
            });
        }
        let idle_ticks = fields[3].saturating_add(fields[4]);
        Ok(idle_ticks.saturating_mul(1_000_000 / USER_HZ))
    }

    // +1 keeps the timestamp non-zero, 0 means "no baseline" upstream
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64 + 1
    }
}

impl Default for SysfsPlatform {
    fn default() -> Self {
        Self::new("/sys", "/proc")
    }
}

impl Platform for SysfsPlatform {
    fn set_frequency(&self, domain: &Domain, hz: u64) -> Result<u64, PlatformError> {
        match domain {
            Domain::Cpu(cpu) => {
                let khz = hz / 1000;
                if khz == 0 {
                    return Err(PlatformError::Rejected {
                        domain: domain.clone(),
                        frequency: hz,
                    });
                }
                write_value(&self.cpufreq_dir(*cpu).join("scaling_setspeed"), khz)?;
                debug!("{domain}: scaling_setspeed <- {khz} kHz");
                Ok(khz * 1000)
            }
            Domain::Device(name) => {
                write_value(&self.devfreq_dir(name).join("min_freq"), hz)?;
                debug!("{domain}: min_freq <- {hz} Hz");
                Ok(hz)
            }
        }
    }

    fn get_frequency(&self, domain: &Domain) -> Result<u64, PlatformError> {
        match domain {
            Domain::Cpu(cpu) => {
                Ok(read_u64(&self.cpufreq_dir(*cpu).join("scaling_cur_freq"))? * 1000)
            }
            Domain::Device(name) => read_u64(&self.devfreq_dir(name).join("cur_freq")),
        }
    }

    fn idle_time(&self, cpu: usize) -> Result<IdleTime, PlatformError> {
        let timestamp_us = self.now_us();
        let idle_us = match self.cpuidle_time_us(cpu)? {
            Some(us) => us,
            None => self.proc_stat_idle_us(cpu)?,
        };
        trace!("cpu{cpu}: idle {idle_us} us at {timestamp_us}");

        Ok(IdleTime {
            idle_us,
            timestamp_us,
        })
    }

    fn cpu_policy(&self, cpu: usize) -> Result<CpuPolicy, PlatformError> {
        let dir = self.cpufreq_dir(cpu);
        Ok(CpuPolicy {
            min: read_u64(&dir.join("scaling_min_freq"))? * 1000,
            max: read_u64(&dir.join("scaling_max_freq"))? * 1000,
            cur: read_u64(&dir.join("scaling_cur_freq"))? * 1000,
        })
    }

    fn cpus(&self) -> Result<Vec<usize>, PlatformError> {
        let dir = self.sysfs_root.join("devices/system/cpu");
        let entries = fs::read_dir(&dir).map_err(|source| PlatformError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut cpus: Vec<usize> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name();
                let cpu = name.to_str()?.strip_prefix("cpu")?.parse().ok()?;
                e.path().join("cpufreq").is_dir().then_some(cpu)
            })
            .collect();
        cpus.sort_unstable();
        Ok(cpus)
    }

    fn available_frequencies(&self, cpu: usize) -> Result<Vec<u64>, PlatformError> {
        let path = self.cpufreq_dir(cpu).join("scaling_available_frequencies");
        let content = read_trimmed(&path)?;
        content
            .split_whitespace()
            .map(|v| {
                v.parse::<u64>()
                    .map(|khz| khz * 1000)
                    .map_err(|_| PlatformError::Parse {
                        path: path.display().to_string(),
                        content: content.clone(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, SysfsPlatform) {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("sys");
        let proc = dir.path().join("proc");
        for cpu in 0..2 {
            let freq = sys.join(format!("devices/system/cpu/cpu{cpu}/cpufreq"));
            fs::create_dir_all(&freq).unwrap();
            fs::write(freq.join("scaling_min_freq"), "300000\n").unwrap();
            fs::write(freq.join("scaling_max_freq"), "1000000\n").unwrap();
            fs::write(freq.join("scaling_cur_freq"), "600000\n").unwrap();
            fs::write(freq.join("scaling_setspeed"), "<unsupported>\n").unwrap();
            fs::write(
                freq.join("scaling_available_frequencies"),
                "300000 600000 800000 1000000 \n",
            )
            .unwrap();
        }
        fs::create_dir_all(sys.join("devices/system/cpu/cpuidle")).unwrap();
        // only cpu0 has per-state residencies
        for (state, us) in [("state0", "1234\n"), ("state1", "2000000\n")] {
            let dir = sys.join("devices/system/cpu/cpu0/cpuidle").join(state);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("time"), us).unwrap();
        }
        fs::create_dir_all(sys.join("class/devfreq/l3")).unwrap();
        fs::write(sys.join("class/devfreq/l3/min_freq"), "0\n").unwrap();
        fs::write(sys.join("class/devfreq/l3/cur_freq"), "166000000\n").unwrap();
        fs::create_dir_all(&proc).unwrap();
        fs::write(
            proc.join("stat"),
            "cpu  10 0 10 900 100 0 0 0 0 0\n\
             cpu0 5 0 5 450 50 0 0 0 0 0\n\
             cpu1 5 0 5 450 50 0 0 0 0 0\n\
             intr 12345\n",
        )
        .unwrap();
        let platform = SysfsPlatform::new(&sys, &proc);
        (dir, platform)
    }

    #[test]
    fn test_reads_policy_and_table() {
        let (_dir, p) = fixture();
        assert_eq!(p.cpus().unwrap(), vec![0, 1]);
        assert_eq!(
            p.cpu_policy(1).unwrap(),
            CpuPolicy {
                min: 300_000_000,
                max: 1_000_000_000,
                cur: 600_000_000
            }
        );
        assert_eq!(
            p.available_frequencies(0).unwrap(),
            vec![300_000_000, 600_000_000, 800_000_000, 1_000_000_000]
        );
        assert_eq!(p.get_frequency(&Domain::Device("l3".into())).unwrap(), 166_000_000);
    }

    #[test]
    fn test_idle_time_sums_cpuidle_states() {
        let (dir, p) = fixture();
        let idle = p.idle_time(0).unwrap();
        assert_eq!(idle.idle_us, 2_001_234);
        assert!(idle.timestamp_us > 0);

        // residencies keep µs resolution between two reads
        let state1 = dir.path().join("sys/devices/system/cpu/cpu0/cpuidle/state1/time");
        fs::write(&state1, "2000750\n").unwrap();
        assert_eq!(p.idle_time(0).unwrap().idle_us - idle.idle_us, 750);

        fs::write(&state1, "garbage\n").unwrap();
        assert!(matches!(p.idle_time(0), Err(PlatformError::Parse { .. })));
    }

    #[test]
    fn test_idle_time_falls_back_to_proc_stat() {
        let (_dir, p) = fixture();
        // idle + iowait jiffies
        assert_eq!(p.idle_time(1).unwrap().idle_us, 500 * 10_000);
        assert!(matches!(p.idle_time(7), Err(PlatformError::UnknownDomain(_))));
    }

    #[test]
    fn test_set_frequency_writes_khz() {
        let (dir, p) = fixture();
        assert_eq!(p.set_frequency(&Domain::Cpu(0), 800_000_000).unwrap(), 800_000_000);
        let written = fs::read_to_string(
            dir.path()
                .join("sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed"),
        )
        .unwrap();
        assert!(written.starts_with("800000"));
        assert!(matches!(
            p.set_frequency(&Domain::Cpu(0), 999),
            Err(PlatformError::Rejected { .. })
        ));
        assert!(p.set_frequency(&Domain::Cpu(9), 800_000_000).is_err());
    }
}
