use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, warn};

use ideal_speed_governor::config::Config;
use ideal_speed_governor::governor::Governor;
use ideal_speed_governor::platform::{Domain, Platform, SimulatedPlatform, SysfsPlatform};
use ideal_speed_governor::status::{StatusSnapshot, StatusWriter};
use ideal_speed_governor::suspend::{SuspendCoordinator, SuspendState};
use ideal_speed_governor::throughput::ThroughputDomain;

// Hz, operating points of the simulated CPUs when the config has none
const SIMULATED_FREQUENCIES: [u64; 6] = [
    120_000_000,
    245_760_000,
    368_640_000,
    768_000_000,
    1_024_000_000,
    1_400_000_000,
];

// busy percent per simulated second, cycled
const SIMULATED_LOAD: [u8; 8] = [5, 5, 40, 90, 100, 100, 60, 20];

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Load-driven CPU frequency governor with awake and asleep ideal speeds.
#[derive(Debug, Parser)]
struct Opts {
    /// Configuration file. Defaults to the user configuration directory,
    /// then /etc/ideal-speed-governor/config.toml.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Drive a simulated platform with this many CPUs instead of sysfs.
    #[clap(long)]
    simulate: Option<usize>,

    /// Only govern these CPUs (default: every CPU with cpufreq).
    #[clap(long, num_args = 1..)]
    cpus: Vec<usize>,

    /// Status file, overriding the configured one.
    #[clap(short = 's', long)]
    status: Option<PathBuf>,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn spawn_simulated_load(
    platform: Arc<SimulatedPlatform>,
    step: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("simulated-load".into())
        .spawn(move || {
            let start = Instant::now();
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(step);
                let second = start.elapsed().as_secs() as usize;
                let busy = SIMULATED_LOAD[second % SIMULATED_LOAD.len()];
                platform.advance(step.as_micros() as u64, busy);
            }
        })?;
    Ok(handle)
}

fn poll_trigger(path: &Path, last: &mut Option<SuspendState>, coordinator: &SuspendCoordinator) {
    let state = match std::fs::read_to_string(path) {
        Ok(text) => match text.parse::<SuspendState>() {
            Ok(state) => state,
            Err(e) => {
                warn!("{}: {e}", path.display());
                return;
            }
        },
        // no file, no request
        Err(_) => return,
    };
    if *last != Some(state) {
        info!("{}: requesting {state:?}", path.display());
        coordinator.request_suspend_state(state);
        *last = Some(state);
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let config = Config::load(opts.config.as_deref()).context("Failed to load configuration")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut simulated_load = None;
    let platform: Arc<dyn Platform> = match opts.simulate {
        Some(0) => bail!("--simulate needs at least one CPU"),
        Some(ncpus) => {
            let frequencies = match &config.operating_points {
                Some(points) => points.iter().map(|p| p.frequency).collect(),
                None => SIMULATED_FREQUENCIES.to_vec(),
            };
            let sim = Arc::new(SimulatedPlatform::new(ncpus, &frequencies));
            let step = Duration::from_micros(config.tunables.sample_interval_us() / 2);
            simulated_load = Some(spawn_simulated_load(sim.clone(), step, shutdown.clone())?);
            info!("simulating {ncpus} CPUs");
            sim
        }
        None => Arc::new(SysfsPlatform::new(
            &config.platform.sysfs_root,
            &config.platform.procfs_root,
        )),
    };

    let cpus = if opts.cpus.is_empty() {
        platform.cpus().context("Failed to enumerate CPUs")?
    } else {
        opts.cpus.clone()
    };
    if cpus.is_empty() {
        bail!("no CPU with frequency scaling found");
    }
    let ncpus = cpus.iter().max().map_or(0, |&cpu| cpu + 1);

    let governor = Governor::new(platform.clone(), config.tunables.clone(), ncpus);
    for &cpu in &cpus {
        let table = config
            .frequency_table(&*platform, cpu)
            .with_context(|| format!("Failed to build the frequency table of cpu{cpu}"))?;
        let policy = platform
            .cpu_policy(cpu)
            .with_context(|| format!("Failed to read the policy of cpu{cpu}"))?;
        governor
            .attach(cpu, policy, Arc::new(table))
            .with_context(|| format!("Failed to attach to cpu{cpu}"))?;
    }

    let coordinator = SuspendCoordinator::new();
    coordinator.register(governor.sleep_hook(config.suspend.level));
    coordinator.start().context("Failed to start the suspend worker")?;

    let mut domains = Vec::with_capacity(config.throughput_domains.len());
    for d in &config.throughput_domains {
        let domain = ThroughputDomain::new(
            &d.name,
            Domain::Device(d.device.clone()),
            d.aggregation,
            d.scale,
            platform.clone(),
        );
        for (device, level) in &d.requests {
            if let Err(e) = domain.request(device, *level) {
                warn!("{}: request from {device} failed: {e}", d.name);
            }
        }
        domains.push(domain);
    }

    governor.start().context("Failed to start the governor")?;
    info!("governing cpus {cpus:?}");

    let status = StatusWriter::new(
        opts.status
            .clone()
            .or_else(|| config.status.path.clone())
            .unwrap_or_else(StatusWriter::default_path),
    );
    let status_interval = Duration::from_millis(config.status.interval_ms);
    let mut next_status = Instant::now();
    let mut last_trigger = None;

    while !shutdown.load(Ordering::Relaxed) {
        if let Some(path) = &config.suspend.trigger_file {
            poll_trigger(path, &mut last_trigger, &coordinator);
        }
        if Instant::now() >= next_status {
            let snapshot = StatusSnapshot::capture(&governor, Some(&coordinator), &domains);
            match status.write(&snapshot) {
                Ok(()) => debug!("status written to {}", status.path().display()),
                Err(e) => warn!("{}: {e}", status.path().display()),
            }
            next_status += status_interval;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    info!("shutting down");
    governor.stop();
    for &cpu in &cpus {
        governor.detach(cpu);
    }
    coordinator.stop();
    if let Some(handle) = simulated_load {
        if handle.join().is_err() {
            warn!("simulated load thread panicked");
        }
    }
    Ok(())
}
