use std::fmt;
use std::io::Error as IoError;
use std::path::{Path, PathBuf};

use log::{info, warn};
use toml::{Table, Value};

use crate::constants::{
    EARLY_SUSPEND_LEVEL_BLANK_SCREEN, EARLY_SUSPEND_LEVEL_DISABLE_FB, EARLY_SUSPEND_LEVEL_STOP_DRAWING,
};
use crate::freq_table::{FrequencyTable, OperatingPoint, TableError};
use crate::platform::{Platform, PlatformError};
use crate::throughput::{AggregationPolicy, LevelScale};
use crate::tunables::{TunableError, Tunables};

const APP_DIR: &str = "ideal-speed-governor";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: IoError },
    Toml(toml::de::Error),
    Invalid(String),
    Table(TableError),
    Platform(PlatformError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            ConfigError::Toml(e) => write!(f, "{e}"),
            ConfigError::Invalid(msg) => write!(f, "{msg}"),
            ConfigError::Table(e) => write!(f, "frequency table: {e}"),
            ConfigError::Platform(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml(e) => Some(e),
            ConfigError::Table(e) => Some(e),
            ConfigError::Platform(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<TableError> for ConfigError {
    fn from(e: TableError) -> Self {
        ConfigError::Table(e)
    }
}

impl From<PlatformError> for ConfigError {
    fn from(e: PlatformError) -> Self {
        ConfigError::Platform(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuspendConfig {
    /// Early-suspend level of the governor's own hook.
    pub level: i32,
    /// Polled file whose contents (`mem` / `on`) request a suspend state.
    pub trigger_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformConfig {
    pub sysfs_root: PathBuf,
    pub procfs_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusConfig {
    pub path: Option<PathBuf>,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputDomainConfig {
    pub name: String,
    /// devfreq device programmed with the aggregate
    pub device: String,
    pub aggregation: AggregationPolicy,
    pub scale: LevelScale,
    /// Requests placed once at startup, `(device, level)`.
    pub requests: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tunables: Tunables,
    /// `None` means the platform's available frequencies.
    pub operating_points: Option<Vec<OperatingPoint>>,
    pub suspend: SuspendConfig,
    pub platform: PlatformConfig,
    pub status: StatusConfig,
    pub throughput_domains: Vec<ThroughputDomainConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunables: Tunables::default(),
            operating_points: None,
            suspend: SuspendConfig {
                level: 0,
                trigger_file: None,
            },
            platform: PlatformConfig {
                sysfs_root: PathBuf::from("/sys"),
                procfs_root: PathBuf::from("/proc"),
            },
            status: StatusConfig {
                path: None,
                interval_ms: 1000,
            },
            throughput_domains: Vec::new(),
        }
    }
}

/// User config file if present, then the system-wide one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
        .into_iter()
        .chain(std::iter::once(Path::new("/etc").join(APP_DIR).join(CONFIG_FILE)))
        .find(|path| path.is_file())
}

impl Config {
    /// Loads `path`, or the default location, or falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => {
                    info!("no configuration file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        info!("loading configuration from {}", path.display());
        Self::parse(&text)
    }

    /// The configured operating points, or the frequencies `cpu` advertises.
    pub fn frequency_table(&self, platform: &dyn Platform, cpu: usize) -> Result<FrequencyTable, ConfigError> {
        match &self.operating_points {
            Some(points) => Ok(FrequencyTable::new(points.clone())?),
            None => Ok(FrequencyTable::from_frequencies(platform.available_frequencies(cpu)?)?),
        }
    }

    /// Invalid tunables are reported and replaced by their default;
    /// malformed tables and domains are errors.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config = text.parse::<Table>()?;
        let defaults = Self::default();

        let governor = config.get("governor").and_then(|t| t.as_table());
        let mut tunables = Tunables::default();
        // max must stay above min; lower the pair min first
        let max_below_min = governor
            .and_then(|t| t.get("max-cpu-load"))
            .and_then(|v| v.as_integer())
            .is_some_and(|v| v <= i64::from(tunables.min_cpu_load()));
        if max_below_min {
            read_tunable(governor, "min-cpu-load", 1, &mut tunables, Tunables::set_min_cpu_load);
            read_tunable(governor, "max-cpu-load", 1, &mut tunables, Tunables::set_max_cpu_load);
        } else {
            read_tunable(governor, "max-cpu-load", 1, &mut tunables, Tunables::set_max_cpu_load);
            read_tunable(governor, "min-cpu-load", 1, &mut tunables, Tunables::set_min_cpu_load);
        }
        read_tunable(governor, "awake-ideal-freq", 1000, &mut tunables, Tunables::set_awake_ideal_freq);
        read_tunable(governor, "sleep-ideal-freq", 1000, &mut tunables, Tunables::set_sleep_ideal_freq);
        read_tunable(governor, "sleep-wakeup-freq", 1000, &mut tunables, Tunables::set_sleep_wakeup_freq);
        read_tunable(governor, "ramp-up-step", 1000, &mut tunables, Tunables::set_ramp_up_step);
        read_tunable(governor, "ramp-down-step", 1000, &mut tunables, Tunables::set_ramp_down_step);
        read_tunable(governor, "up-rate-us", 1, &mut tunables, Tunables::set_up_rate_us);
        read_tunable(governor, "down-rate-us", 1, &mut tunables, Tunables::set_down_rate_us);
        read_tunable(governor, "sample-interval-us", 1, &mut tunables, Tunables::set_sample_interval_us);

        let operating_points = match config.get("operating-points") {
            Some(value) => Some(parse_operating_points(value)?),
            None => {
                info!("operating-points undefined, using the platform's available frequencies");
                None
            }
        };

        let suspend = config.get("suspend").and_then(|t| t.as_table());
        let level = suspend
            .and_then(|t| t.get("level"))
            .ok_or("is missing")
            .and_then(|v| match v.as_str() {
                Some(name) => named_suspend_level(name)
                    .ok_or("must be an integer, blank-screen, stop-drawing or disable-fb"),
                None => v
                    .as_integer()
                    .ok_or("must be an integer")
                    .and_then(|v| {
                        i32::try_from(v)
                            .map_err(|_| &*format!("must fit in {} bits", i32::BITS).leak())
                    }),
            })
            .unwrap_or_else(|s| {
                if suspend.is_some_and(|t| t.contains_key("level")) {
                    warn!("suspend.level {s}, replaced with the default value of 0");
                }
                defaults.suspend.level
            });
        let trigger_file = optional_path(suspend, "suspend.trigger-file")?;

        let platform = config.get("platform").and_then(|t| t.as_table());
        let sysfs_root =
            optional_path(platform, "platform.sysfs-root")?.unwrap_or(defaults.platform.sysfs_root);
        let procfs_root =
            optional_path(platform, "platform.procfs-root")?.unwrap_or(defaults.platform.procfs_root);

        let status = config.get("status").and_then(|t| t.as_table());
        let status_path = optional_path(status, "status.path")?;
        let interval_ms = status
            .and_then(|t| t.get("interval-ms"))
            .ok_or("is missing")
            .and_then(|v| v.as_integer().ok_or("must be an integer"))
            .and_then(|v| v.is_positive().then_some(v).ok_or("must be positive"))
            .map(|v| v.unsigned_abs())
            .unwrap_or_else(|s| {
                if status.is_some_and(|t| t.contains_key("interval-ms")) {
                    warn!("status.interval-ms {s}, replaced with the default value of 1000");
                }
                defaults.status.interval_ms
            });

        let throughput_domains = match config.get("throughput-domains") {
            Some(value) => parse_throughput_domains(value)?,
            None => Vec::new(),
        };

        Ok(Self {
            tunables,
            operating_points,
            suspend: SuspendConfig {
                level,
                trigger_file,
            },
            platform: PlatformConfig {
                sysfs_root,
                procfs_root,
            },
            status: StatusConfig {
                path: status_path,
                interval_ms,
            },
            throughput_domains,
        })
    }
}

/// Reads `governor.<key>` scaled by `unit` into `tunables`, leaving the
/// default in place when missing or invalid.
fn read_tunable(
    governor: Option<&Table>,
    key: &str,
    unit: u64,
    tunables: &mut Tunables,
    set: fn(&mut Tunables, u64) -> Result<(), TunableError>,
) {
    let Some(value) = governor.and_then(|t| t.get(key)) else {
        return;
    };
    let result = value
        .as_integer()
        .ok_or_else(|| "must be an integer".to_string())
        .and_then(|v| u64::try_from(v).map_err(|_| "must not be negative".to_string()))
        .and_then(|v| {
            v.checked_mul(unit)
                .ok_or_else(|| format!("cannot be greater than {}", u64::MAX / unit))
        })
        .and_then(|v| set(tunables, v).map_err(|e| e.to_string()));
    if let Err(s) = result {
        warn!("governor.{key} {s}, keeping the default value");
    }
}

fn named_suspend_level(name: &str) -> Option<i32> {
    match name {
        "blank-screen" => Some(EARLY_SUSPEND_LEVEL_BLANK_SCREEN),
        "stop-drawing" => Some(EARLY_SUSPEND_LEVEL_STOP_DRAWING),
        "disable-fb" => Some(EARLY_SUSPEND_LEVEL_DISABLE_FB),
        _ => None,
    }
}

fn optional_path(table: Option<&Table>, name: &str) -> Result<Option<PathBuf>, ConfigError> {
    let key = name.rsplit('.').next().unwrap_or(name);
    match table.and_then(|t| t.get(key)) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(PathBuf::from(s)))
            .ok_or_else(|| ConfigError::Invalid(format!("{name} must be a string"))),
    }
}

fn integer(t: &Table, name: &str, key: &str) -> Result<i64, ConfigError> {
    t.get(key)
        .ok_or_else(|| ConfigError::Invalid(format!("{name}.{key} must exist")))?
        .as_integer()
        .ok_or_else(|| ConfigError::Invalid(format!("{name}.{key} must be an integer")))
}

fn unsigned(t: &Table, name: &str, key: &str) -> Result<u64, ConfigError> {
    let v = integer(t, name, key)?;
    u64::try_from(v).map_err(|_| ConfigError::Invalid(format!("{name}.{key} must not be negative")))
}

fn string(t: &Table, name: &str, key: &str) -> Result<String, ConfigError> {
    t.get(key)
        .ok_or_else(|| ConfigError::Invalid(format!("{name}.{key} must exist")))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Invalid(format!("{name}.{key} must be a string")))
}

fn parse_operating_points(value: &Value) -> Result<Vec<OperatingPoint>, ConfigError> {
    let array = value
        .as_array()
        .ok_or_else(|| ConfigError::Invalid("operating-points must be an array of tables".into()))?;
    if array.is_empty() {
        return Err(ConfigError::Invalid("operating-points must not be empty".into()));
    }
    let mut points = Vec::with_capacity(array.len());
    for (i, t) in array.iter().enumerate() {
        let name = format!("operating-points[{i}]");
        let t = t
            .as_table()
            .ok_or_else(|| ConfigError::Invalid(format!("{name} must be a table")))?;

        // kHz
        let frequency = unsigned(t, &name, "frequency")?
            .checked_mul(1000)
            .ok_or_else(|| ConfigError::Invalid(format!("{name}.frequency is too large")))?;
        // uV
        let voltage = u32::try_from(unsigned(t, &name, "voltage")?).map_err(|_| {
            ConfigError::Invalid(format!(
                "{name}.voltage must be between 0 and {} inclusive",
                u32::MAX
            ))
        })?;
        let enabled = match t.get("enabled") {
            None => true,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| ConfigError::Invalid(format!("{name}.enabled must be a boolean")))?,
        };

        let previous = points.last().map(|p: &OperatingPoint| p.frequency);
        if let Some(prev) = previous.filter(|&prev| frequency <= prev) {
            return Err(ConfigError::Invalid(format!(
                "{name}.frequency {} kHz is not above the previous {} kHz",
                frequency / 1000,
                prev / 1000
            )));
        }
        points.push(OperatingPoint {
            frequency,
            voltage,
            enabled,
        });
    }
    if points.iter().all(|p| !p.enabled) {
        return Err(ConfigError::Invalid(
            "at least one operating point must be enabled".into(),
        ));
    }
    Ok(points)
}

fn parse_throughput_domains(value: &Value) -> Result<Vec<ThroughputDomainConfig>, ConfigError> {
    let array = value
        .as_array()
        .ok_or_else(|| ConfigError::Invalid("throughput-domains must be an array of tables".into()))?;
    let mut domains: Vec<ThroughputDomainConfig> = Vec::with_capacity(array.len());
    for (i, t) in array.iter().enumerate() {
        let name = format!("throughput-domains[{i}]");
        let t = t
            .as_table()
            .ok_or_else(|| ConfigError::Invalid(format!("{name} must be a table")))?;

        let domain_name = string(t, &name, "name")?;
        if domains.iter().any(|d| d.name == domain_name) {
            return Err(ConfigError::Invalid(format!(
                "throughput domain '{domain_name}' is defined twice"
            )));
        }
        let device = string(t, &name, "device")?;
        let aggregation = string(t, &name, "aggregation")?
            .parse::<AggregationPolicy>()
            .map_err(|e| ConfigError::Invalid(format!("{name}.aggregation: {e}")))?;

        let scale = match t.get("scale") {
            None => LevelScale::IDENTITY,
            Some(v) => {
                let pair = v
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .and_then(|a| Some((a[0].as_integer()?, a[1].as_integer()?)))
                    .and_then(|(n, d)| Some((u64::try_from(n).ok()?, u64::try_from(d).ok()?)))
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "{name}.scale must be [numerator, denominator] of non-negative integers"
                        ))
                    })?;
                LevelScale::new(pair.0, pair.1)
                    .map_err(|e| ConfigError::Invalid(format!("{name}.scale: {e}")))?
            }
        };

        let mut requests = Vec::new();
        if let Some(v) = t.get("requests") {
            let array = v
                .as_array()
                .ok_or_else(|| ConfigError::Invalid(format!("{name}.requests must be an array")))?;
            for (j, r) in array.iter().enumerate() {
                let rname = format!("{name}.requests[{j}]");
                let r = r
                    .as_table()
                    .ok_or_else(|| ConfigError::Invalid(format!("{rname} must be a table")))?;
                requests.push((string(r, &rname, "device")?, unsigned(r, &rname, "level")?));
            }
        }

        domains.push(ThroughputDomainConfig {
            name: domain_name,
            device,
            aggregation,
            scale,
            requests,
        });
    }
    Ok(domains)
}
