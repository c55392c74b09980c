use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::freq_table::{FrequencyTable, Relation};
use crate::platform::{Domain, Platform, PlatformError};

/// Where a transition starts from and what bounds it must respect.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    /// Hz, as last applied
    pub current: u64,
    pub policy_min: u64,
    pub policy_max: u64,
    pub table: &'a FrequencyTable,
}

#[derive(Debug)]
pub enum TransitionError {
    NotAttached(usize),
    NoOperatingPoint { min: u64, max: u64 },
    Platform(PlatformError),
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::NotAttached(cpu) => write!(f, "governor is not attached to cpu{cpu}"),
            TransitionError::NoOperatingPoint { min, max } => {
                write!(f, "no enabled operating point between {min} and {max} Hz")
            }
            TransitionError::Platform(e) => write!(f, "frequency change failed: {e}"),
        }
    }
}

impl std::error::Error for TransitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransitionError::Platform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PlatformError> for TransitionError {
    fn from(e: PlatformError) -> Self {
        TransitionError::Platform(e)
    }
}

/// Turns a requested frequency into a platform call.
///
/// Callers serialize transitions per domain; the executor itself holds no
/// state besides the platform handle.
pub struct TransitionExecutor {
    platform: Arc<dyn Platform>,
}

impl TransitionExecutor {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Clamps `target` to the policy, resolves it on the table with
    /// `relation` and programs the domain.
    ///
    /// Returns `Ok(None)` without touching the platform when the resolved
    /// point is the current frequency. If the preferred relation only finds
    /// the current point while moving, the opposite relation is tried so a
    /// ramp never gets stuck between two table entries.
    pub fn execute(
        &self,
        domain: &Domain,
        ctx: &TransitionContext<'_>,
        target: u64,
        relation: Relation,
    ) -> Result<Option<u64>, TransitionError> {
        let old = ctx.current;
        if target == old {
            return Ok(None);
        }
        let validated = target.clamp(ctx.policy_min, ctx.policy_max.max(ctx.policy_min));
        if validated == old {
            return Ok(None);
        }

        let resolve = |relation| {
            ctx.table
                .resolve(validated, ctx.policy_min, ctx.policy_max, relation)
                .map(|p| p.frequency)
                .ok_or(TransitionError::NoOperatingPoint {
                    min: ctx.policy_min,
                    max: ctx.policy_max,
                })
        };

        let mut resolved = resolve(relation)?;
        if resolved == old {
            let moving_up = validated > old && relation == Relation::AtMost;
            let moving_down = validated < old && relation == Relation::AtLeast;
            if moving_up || moving_down {
                resolved = resolve(relation.flipped())?;
            }
        }
        if resolved == old {
            warn!("{domain}: frequency change failed: {old} to {validated} => {resolved}");
            return Ok(None);
        }

        let applied = self.platform.set_frequency(domain, resolved)?;
        debug!(
            target: "governor::jumps",
            "{domain}: jumping from {old} to {validated} => {applied}"
        );
        Ok(Some(applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq_table::OperatingPoint;
    use crate::platform::SimulatedPlatform;

    const MHZ: u64 = 1_000_000;

    fn setup() -> (Arc<SimulatedPlatform>, TransitionExecutor, FrequencyTable) {
        let freqs = [100 * MHZ, 200 * MHZ, 400 * MHZ, 800 * MHZ];
        let platform = Arc::new(SimulatedPlatform::new(1, &freqs));
        let executor = TransitionExecutor::new(platform.clone());
        let table = FrequencyTable::new(freqs.iter().map(|&f| OperatingPoint::new(f, 0)).collect()).unwrap();
        (platform, executor, table)
    }

    fn ctx(table: &FrequencyTable, current: u64) -> TransitionContext<'_> {
        TransitionContext {
            current,
            policy_min: 100 * MHZ,
            policy_max: 800 * MHZ,
            table,
        }
    }

    #[test]
    fn test_same_frequency_is_noop() {
        let (platform, executor, table) = setup();
        let cpu = Domain::Cpu(0);
        assert_eq!(executor.execute(&cpu, &ctx(&table, 200 * MHZ), 200 * MHZ, Relation::AtLeast).unwrap(), None);
        // clamped onto the current frequency
        assert_eq!(executor.execute(&cpu, &ctx(&table, 800 * MHZ), 900 * MHZ, Relation::AtMost).unwrap(), None);
        assert!(platform.set_calls().is_empty());
    }

    #[test]
    fn test_ramp_up_retries_at_least() {
        let (platform, executor, table) = setup();
        // nothing at most 300 MHz above 200 MHz
        let applied = executor
            .execute(&Domain::Cpu(0), &ctx(&table, 200 * MHZ), 300 * MHZ, Relation::AtMost)
            .unwrap();
        assert_eq!(applied, Some(400 * MHZ));
        assert_eq!(platform.set_calls(), vec![(Domain::Cpu(0), 400 * MHZ)]);
    }

    #[test]
    fn test_ramp_down_retries_at_most() {
        let (_platform, executor, table) = setup();
        let applied = executor
            .execute(&Domain::Cpu(0), &ctx(&table, 400 * MHZ), 300 * MHZ, Relation::AtLeast)
            .unwrap();
        assert_eq!(applied, Some(200 * MHZ));
    }

    #[test]
    fn test_top_enabled_point_cannot_ramp_further() {
        let (platform, executor, table) = setup();
        table.set_enabled(400 * MHZ, false).unwrap();
        table.set_enabled(800 * MHZ, false).unwrap();
        // only 100 and 200 MHz left; moving up from 200 MHz has nowhere to go
        let c = TransitionContext {
            policy_max: 800 * MHZ,
            ..ctx(&table, 200 * MHZ)
        };
        assert_eq!(executor.execute(&Domain::Cpu(0), &c, 800 * MHZ, Relation::AtMost).unwrap(), None);
        assert!(platform.set_calls().is_empty());
    }

    #[test]
    fn test_platform_failure_is_reported() {
        let (platform, executor, table) = setup();
        platform.fail_next_sets(1);
        let err = executor
            .execute(&Domain::Cpu(0), &ctx(&table, 100 * MHZ), 200 * MHZ, Relation::AtLeast)
            .unwrap_err();
        assert!(matches!(err, TransitionError::Platform(PlatformError::Rejected { .. })));
        assert_eq!(platform.get_frequency(&Domain::Cpu(0)).unwrap(), 100 * MHZ);
    }

    #[test]
    fn test_no_point_within_policy() {
        let (_platform, executor, table) = setup();
        let c = TransitionContext {
            current: 250 * MHZ,
            policy_min: 250 * MHZ,
            policy_max: 350 * MHZ,
            table: &table,
        };
        assert!(matches!(
            executor.execute(&Domain::Cpu(0), &c, 300 * MHZ, Relation::AtLeast),
            Err(TransitionError::NoOperatingPoint { .. })
        ));
    }
}
