//! Narrow interface to the hardware the governor drives.
//!
//! The governor never touches clocks or registers itself; it asks a
//! [`Platform`] to program a domain and to report idle accounting.

use std::fmt;
use std::io::Error as IoError;

pub mod sim;
pub mod sysfs;

pub use sim::SimulatedPlatform;
pub use sysfs::SysfsPlatform;

/// A frequency domain the platform can program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Domain {
    Cpu(usize),
    /// Interconnect or accelerator, by device name.
    Device(String),
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Cpu(cpu) => write!(f, "cpu{cpu}"),
            Domain::Device(name) => f.write_str(name),
        }
    }
}

/// Idle accounting snapshot of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTime {
    pub idle_us: u64,
    /// Monotonic, µs. Never 0 once the platform is running.
    pub timestamp_us: u64,
}

/// Frequency bounds and current frequency of a CPU, in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuPolicy {
    pub min: u64,
    pub max: u64,
    pub cur: u64,
}

#[derive(Debug)]
pub enum PlatformError {
    Io { path: String, source: IoError },
    Parse { path: String, content: String },
    Rejected { domain: Domain, frequency: u64 },
    UnknownDomain(Domain),
    Unsupported(&'static str),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Io { path, source } => write!(f, "{path}: {source}"),
            PlatformError::Parse { path, content } => {
                write!(f, "{path}: unexpected content {content:?}")
            }
            PlatformError::Rejected { domain, frequency } => {
                write!(f, "{domain} rejected {frequency} Hz")
            }
            PlatformError::UnknownDomain(domain) => write!(f, "unknown domain {domain}"),
            PlatformError::Unsupported(what) => write!(f, "{what} is not supported"),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Frequency-change and idle-accounting services.
///
/// `set_frequency` may block and is only called from worker threads.
pub trait Platform: Send + Sync {
    /// Programs `domain` and returns the frequency actually applied.
    fn set_frequency(&self, domain: &Domain, hz: u64) -> Result<u64, PlatformError>;

    fn get_frequency(&self, domain: &Domain) -> Result<u64, PlatformError>;

    fn idle_time(&self, cpu: usize) -> Result<IdleTime, PlatformError>;

    fn cpu_policy(&self, cpu: usize) -> Result<CpuPolicy, PlatformError>;

    /// CPUs the governor may attach to.
    fn cpus(&self) -> Result<Vec<usize>, PlatformError>;

    /// Frequencies (Hz) the CPU supports, when the platform can tell.
    fn available_frequencies(&self, _cpu: usize) -> Result<Vec<u64>, PlatformError> {
        Err(PlatformError::Unsupported("listing available frequencies"))
    }
}
