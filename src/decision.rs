use crate::freq_table::Relation;
use crate::tunables::Tunables;

/// Per-sample outcome of the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum RampDirection {
    Up,
    Down,
    #[default]
    None,
}

/// What the timer saw for one CPU during the last window.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub load_percent: u8,
    pub delta_idle_us: u64,
    /// Hz
    pub current: u64,
    pub ideal_speed: u64,
    pub policy_min: u64,
    pub policy_max: u64,
    /// Time spent at the current frequency.
    pub since_change_us: u64,
}

/// Decides the ramp direction for one sample.
///
/// A window without any idle time means the CPU is saturated and ramps up
/// regardless of the rate limit. Below the ideal speed ramping up ignores
/// the up rate limit, above it ramping down ignores the down rate limit.
pub fn decide(obs: &Observation, tunables: &Tunables) -> RampDirection {
    let saturated = obs.delta_idle_us == 0;

    if obs.load_percent > tunables.max_cpu_load() || saturated {
        let may_ramp = obs.current < obs.ideal_speed
            || saturated
            || obs.since_change_us >= tunables.up_rate_us();
        if obs.current < obs.policy_max && may_ramp {
            return RampDirection::Up;
        }
        return RampDirection::None;
    }

    if obs.load_percent < tunables.min_cpu_load()
        && obs.current > obs.policy_min
        && (obs.current > obs.ideal_speed || obs.since_change_us >= tunables.down_rate_us())
    {
        return RampDirection::Down;
    }

    RampDirection::None
}

/// Picks the next frequency to request for a ramp, with the table relation
/// to resolve it with. `None` means stay.
///
/// Up: jump to the ideal speed when below it, else add the step (or go to
/// the policy max when no step is set) with at-most resolution. Down mirrors
/// this, falling back to [`proportional_ramp_down`] without a step.
pub fn ramp_target(
    direction: RampDirection,
    old: u64,
    ideal_speed: u64,
    load_percent: u8,
    policy_max: u64,
    tunables: &Tunables,
) -> Option<(u64, Relation)> {
    match direction {
        RampDirection::Up => Some(if old < ideal_speed {
            (ideal_speed, Relation::AtLeast)
        } else if tunables.ramp_up_step() > 0 {
            (old.saturating_add(tunables.ramp_up_step()), Relation::AtMost)
        } else {
            (policy_max, Relation::AtMost)
        }),
        RampDirection::Down => Some(if old > ideal_speed {
            (ideal_speed, Relation::AtMost)
        } else if tunables.ramp_down_step() > 0 {
            (old.saturating_sub(tunables.ramp_down_step()), Relation::AtLeast)
        } else {
            (
                proportional_ramp_down(old, load_percent, tunables.max_cpu_load()),
                Relation::AtLeast,
            )
        }),
        RampDirection::None => None,
    }
}

/// `old * (load + 100 - max_load) / 100`, never above `old - 1`.
pub fn proportional_ramp_down(old: u64, load_percent: u8, max_load: u8) -> u64 {
    let factor = (u128::from(load_percent) + 100).saturating_sub(u128::from(max_load));
    let scaled = u128::from(old) * factor / 100;
    let ceiling = old.saturating_sub(1);
    if scaled >= u128::from(old) {
        ceiling
    } else {
        // scaled < old <= u64::MAX
        scaled as u64
    }
}

/// `preferred` bounded by the policy.
pub fn ideal_speed(preferred: u64, policy_min: u64, policy_max: u64) -> u64 {
    preferred.min(policy_max).max(policy_min)
}
