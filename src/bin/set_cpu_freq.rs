use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;

use ideal_speed_governor::config::Config;
use ideal_speed_governor::executor::{TransitionContext, TransitionExecutor};
use ideal_speed_governor::freq_table::Relation;
use ideal_speed_governor::platform::{Domain, Platform, SysfsPlatform};

/// Programs one CPU frequency once, after checking it against the
/// frequency table and the CPU's policy.
#[derive(Debug, Parser)]
struct Opts {
    /// Target frequency in kHz.
    frequency_khz: u64,

    /// CPU to program.
    #[clap(short = 'C', long, default_value = "0")]
    cpu: usize,

    /// Configuration file (default: same lookup as the daemon).
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = Config::load(opts.config.as_deref()).context("Failed to load configuration")?;
    let platform: Arc<dyn Platform> = Arc::new(SysfsPlatform::new(
        &config.platform.sysfs_root,
        &config.platform.procfs_root,
    ));

    let cpu = opts.cpu;
    let target = opts
        .frequency_khz
        .checked_mul(1000)
        .context("frequency is too large")?;
    let table = config
        .frequency_table(&*platform, cpu)
        .with_context(|| format!("Failed to build the frequency table of cpu{cpu}"))?;
    let policy = platform
        .cpu_policy(cpu)
        .with_context(|| format!("Failed to read the policy of cpu{cpu}"))?;

    if !table.contains(target) {
        let available: Vec<u64> = table
            .points()
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.frequency / 1000)
            .collect();
        bail!(
            "{} kHz is not an enabled operating point of cpu{cpu}, available: {available:?} kHz",
            opts.frequency_khz
        );
    }
    if target < policy.min || target > policy.max {
        bail!(
            "{} kHz is outside the cpu{cpu} policy [{} - {}] kHz",
            opts.frequency_khz,
            policy.min / 1000,
            policy.max / 1000
        );
    }

    let executor = TransitionExecutor::new(platform.clone());
    let ctx = TransitionContext {
        current: policy.cur,
        policy_min: policy.min,
        policy_max: policy.max,
        table: &table,
    };
    match executor
        .execute(&Domain::Cpu(cpu), &ctx, target, Relation::AtLeast)
        .with_context(|| format!("Failed to program cpu{cpu}"))?
    {
        Some(applied) => println!("cpu{cpu} frequency set to {} kHz", applied / 1000),
        None => println!("cpu{cpu} already runs at {} kHz", policy.cur / 1000),
    }
    Ok(())
}
