use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::platform::{Domain, Platform, PlatformError};

/// How per-device requests combine into a domain's target level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    /// Bandwidth adds up; the domain is re-programmed on every request.
    Sum,
    /// Highest request wins; the domain is re-programmed only when it changes.
    Max,
}

impl FromStr for AggregationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(AggregationPolicy::Sum),
            "max" => Ok(AggregationPolicy::Max),
            other => Err(format!("unknown aggregation '{other}', expected sum or max")),
        }
    }
}

/// Level to Hz conversion, `hz = level * numerator / denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelScale {
    pub numerator: u64,
    pub denominator: u64,
}

impl LevelScale {
    pub const IDENTITY: LevelScale = LevelScale {
        numerator: 1,
        denominator: 1,
    };

    /// Interconnect bandwidth in KiB/s to bus clock in Hz.
    pub const KIB_PER_SEC_TO_BUS_HZ: LevelScale = LevelScale {
        numerator: 1000,
        denominator: 4,
    };

    pub fn new(numerator: u64, denominator: u64) -> Result<Self, ThroughputError> {
        if denominator == 0 {
            return Err(ThroughputError::ZeroDenominator);
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn to_hz(&self, level: u64) -> u64 {
        let hz = u128::from(level) * u128::from(self.numerator) / u128::from(self.denominator);
        u64::try_from(hz).unwrap_or(u64::MAX)
    }
}

impl Default for LevelScale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug)]
pub enum ThroughputError {
    UnknownRequester { domain: String, device: String },
    ZeroDenominator,
    Platform(PlatformError),
}

impl fmt::Display for ThroughputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThroughputError::UnknownRequester { domain, device } => {
                write!(f, "{domain}: '{device}' holds no throughput request")
            }
            ThroughputError::ZeroDenominator => write!(f, "level scale denominator must not be 0"),
            ThroughputError::Platform(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ThroughputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ThroughputError::Platform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PlatformError> for ThroughputError {
    fn from(e: PlatformError) -> Self {
        ThroughputError::Platform(e)
    }
}

#[derive(Debug, Default)]
struct Requests {
    levels: BTreeMap<String, u64>,
    aggregate: u64,
}

impl Requests {
    fn recompute(&mut self, policy: AggregationPolicy) {
        self.aggregate = match policy {
            AggregationPolicy::Sum => self.levels.values().fold(0u64, |acc, l| acc.saturating_add(*l)),
            AggregationPolicy::Max => self.levels.values().copied().max().unwrap_or(0),
        };
    }
}

/// Reported state of one throughput domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThroughputSnapshot {
    pub name: String,
    pub target: Domain,
    pub aggregation: AggregationPolicy,
    pub level: u64,
    pub hz: u64,
    pub requests: BTreeMap<String, u64>,
}

/// Minimum-throughput constraint of one bus or interconnect, aggregated
/// over the devices that asked for one.
pub struct ThroughputDomain {
    name: String,
    target: Domain,
    policy: AggregationPolicy,
    scale: LevelScale,
    platform: Arc<dyn Platform>,
    requests: Mutex<Requests>,
}

impl ThroughputDomain {
    pub fn new(
        name: &str,
        target: Domain,
        policy: AggregationPolicy,
        scale: LevelScale,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            name: name.to_string(),
            target,
            policy,
            scale,
            platform,
            requests: Mutex::new(Requests::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Requests> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds or replaces `device`'s request and returns the new aggregate level.
    pub fn request(&self, device: &str, level: u64) -> Result<u64, ThroughputError> {
        let mut requests = self.lock();
        let before = requests.aggregate;
        requests.levels.insert(device.to_string(), level);
        requests.recompute(self.policy);
        debug!(
            "{}: {device} requests {level}, aggregate {} -> {}",
            self.name, before, requests.aggregate
        );
        self.apply(before, requests.aggregate)?;
        Ok(requests.aggregate)
    }

    /// Drops `device`'s request and returns the new aggregate level.
    pub fn release(&self, device: &str) -> Result<u64, ThroughputError> {
        let mut requests = self.lock();
        let before = requests.aggregate;
        if requests.levels.remove(device).is_none() {
            return Err(ThroughputError::UnknownRequester {
                domain: self.name.clone(),
                device: device.to_string(),
            });
        }
        requests.recompute(self.policy);
        debug!(
            "{}: {device} released, aggregate {} -> {}",
            self.name, before, requests.aggregate
        );
        self.apply(before, requests.aggregate)?;
        Ok(requests.aggregate)
    }

    // called with the request lock held so programming follows request order
    fn apply(&self, before: u64, after: u64) -> Result<(), ThroughputError> {
        if self.policy == AggregationPolicy::Max && before == after {
            return Ok(());
        }
        let hz = self.scale.to_hz(after);
        self.platform.set_frequency(&self.target, hz).map_err(|e| {
            error!("{}: unable to change {} to {hz} Hz: {e}", self.name, self.target);
            ThroughputError::from(e)
        })?;
        Ok(())
    }

    pub fn aggregate_level(&self) -> u64 {
        self.lock().aggregate
    }

    pub fn level_of(&self, device: &str) -> Option<u64> {
        self.lock().levels.get(device).copied()
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        let requests = self.lock();
        ThroughputSnapshot {
            name: self.name.clone(),
            target: self.target.clone(),
            aggregation: self.policy,
            level: requests.aggregate,
            hz: self.scale.to_hz(requests.aggregate),
            requests: requests.levels.clone(),
        }
    }
}
