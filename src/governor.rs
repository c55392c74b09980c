use std::fmt;
use std::io::Error as IoError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::constants::LOAD_HISTORY_SIZE;
use crate::decision::{self, Observation, RampDirection};
use crate::executor::{TransitionContext, TransitionError, TransitionExecutor};
use crate::freq_table::{FrequencyTable, Relation};
use crate::load_sampler::{LoadSampler, Sample};
use crate::platform::{CpuPolicy, Domain, IdleTime, Platform, PlatformError};
use crate::suspend::EarlySuspend;
use crate::tunables::{TunableError, Tunables};
use crate::workqueue::WorkQueue;

/// Governor bookkeeping for one CPU.
#[derive(Debug, Clone)]
pub struct CpuGovernorState {
    pub cpu: usize,
    pub enabled: bool,
    pub policy_min: u64,
    pub policy_max: u64,
    pub ideal_speed: u64,
    pub current_load_percent: u8,
    /// Frequency seen at the last sample, or applied by the last transition.
    pub old_frequency: u64,
    pub ramp_direction: RampDirection,
    /// Timestamp (µs) of the last transition.
    pub change_time: u64,
    pub timer_armed: bool,
    pub work_pending: bool,
    sampler: LoadSampler,
    table: Option<Arc<FrequencyTable>>,
}

impl CpuGovernorState {
    fn new(cpu: usize) -> Self {
        Self {
            cpu,
            enabled: false,
            policy_min: 0,
            policy_max: 0,
            ideal_speed: 0,
            current_load_percent: 0,
            old_frequency: 0,
            ramp_direction: RampDirection::None,
            change_time: 0,
            timer_armed: false,
            work_pending: false,
            sampler: LoadSampler::new(LOAD_HISTORY_SIZE),
            table: None,
        }
    }

    pub fn last_sample_time(&self) -> u64 {
        self.sampler.last_sample_time()
    }

    pub fn last_idle_time(&self) -> u64 {
        self.sampler.last_idle_time()
    }

    pub fn average_load(&self) -> f32 {
        self.sampler.average_load()
    }

    fn reset_timer(&mut self, idle: IdleTime) {
        self.sampler.rebase(idle.idle_us, idle.timestamp_us);
        self.timer_armed = true;
    }
}

/// What one timer tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not attached, no usable sample, or work already queued.
    Skipped,
    /// Timer disarmed and the CPU has not been idle since.
    Disarmed,
    /// Timer re-armed after the CPU went through idle.
    IdleExit,
    /// Window too short to judge; timer re-armed.
    TooShort,
    Decided(RampDirection),
}

#[derive(Debug)]
pub enum AttachError {
    UnknownCpu(usize),
    NotAttached(usize),
    NoCurrentFrequency(usize),
    InvertedPolicy { cpu: usize, min: u64, max: u64 },
    NoOperatingPoint { cpu: usize, min: u64, max: u64 },
    Platform(PlatformError),
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::UnknownCpu(cpu) => write!(f, "cpu{cpu} is not managed by this governor"),
            AttachError::NotAttached(cpu) => write!(f, "governor is not attached to cpu{cpu}"),
            AttachError::NoCurrentFrequency(cpu) => {
                write!(f, "cpu{cpu} reports no current frequency")
            }
            AttachError::InvertedPolicy { cpu, min, max } => {
                write!(f, "cpu{cpu}: policy min {min} Hz is above max {max} Hz")
            }
            AttachError::NoOperatingPoint { cpu, min, max } => write!(
                f,
                "cpu{cpu}: frequency table has no point between {min} and {max} Hz"
            ),
            AttachError::Platform(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttachError::Platform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PlatformError> for AttachError {
    fn from(e: PlatformError) -> Self {
        AttachError::Platform(e)
    }
}

struct TimerThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct CpuSlot {
    state: Mutex<CpuGovernorState>,
    // held for the whole of a transition, sampler- or suspend-initiated
    transition: Mutex<()>,
    timer: Mutex<Option<TimerThread>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared {
    platform: Arc<dyn Platform>,
    executor: TransitionExecutor,
    tunables: RwLock<Tunables>,
    suspended: AtomicBool,
    cpus: Vec<CpuSlot>,
    up_queue: Arc<WorkQueue<usize>>,
    down_queue: Arc<WorkQueue<usize>>,
    running: AtomicBool,
    active_count: AtomicUsize,
}

impl Shared {
    fn tunables(&self) -> Tunables {
        self.tunables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ideal_for(&self, tunables: &Tunables, min: u64, max: u64) -> u64 {
        let preferred = if self.suspended.load(Ordering::Acquire) {
            tunables.sleep_ideal_freq()
        } else {
            tunables.awake_ideal_freq()
        };
        decision::ideal_speed(preferred, min, max)
    }

    fn update_ideal_all(&self) {
        let tunables = self.tunables();
        for slot in &self.cpus {
            let mut st = lock(&slot.state);
            if st.enabled {
                st.ideal_speed = self.ideal_for(&tunables, st.policy_min, st.policy_max);
            }
        }
    }

    fn tick(&self, cpu: usize) -> TickOutcome {
        let Some(slot) = self.cpus.get(cpu) else {
            return TickOutcome::Skipped;
        };
        let tunables = self.tunables();
        let idle = match self.platform.idle_time(cpu) {
            Ok(idle) => idle,
            Err(e) => {
                warn!("cpu{cpu}: cannot read idle time: {e}");
                return TickOutcome::Skipped;
            }
        };

        let mut st = lock(&slot.state);
        if !st.enabled {
            return TickOutcome::Skipped;
        }
        if !st.timer_armed {
            if st.work_pending {
                return TickOutcome::Skipped;
            }
            if !st.sampler.has_baseline() || idle.idle_us > st.sampler.last_idle_time() {
                st.reset_timer(idle);
                return TickOutcome::IdleExit;
            }
            return TickOutcome::Disarmed;
        }

        // the timer is one-shot, whoever wants more samples re-arms it
        st.timer_armed = false;
        if !st.sampler.has_baseline() || idle.timestamp_us == st.sampler.last_sample_time() {
            return TickOutcome::Skipped;
        }
        let old_freq = match self.platform.get_frequency(&Domain::Cpu(cpu)) {
            Ok(freq) => freq,
            Err(e) => {
                warn!("cpu{cpu}: cannot read current frequency: {e}");
                st.reset_timer(idle);
                return TickOutcome::Skipped;
            }
        };

        let (load_percent, delta_time_us, delta_idle_us) =
            match st.sampler.sample(idle.idle_us, idle.timestamp_us) {
                Sample::TooShort { .. } => {
                    st.reset_timer(idle);
                    return TickOutcome::TooShort;
                }
                Sample::Load {
                    load_percent,
                    delta_time_us,
                    delta_idle_us,
                } => (load_percent, delta_time_us, delta_idle_us),
            };
        debug!(
            target: "governor::load",
            "cpu{cpu} @ {old_freq}: load {load_percent} (delta_time {delta_time_us})"
        );

        st.current_load_percent = load_percent;
        st.old_frequency = old_freq;

        let obs = Observation {
            load_percent,
            delta_idle_us,
            current: old_freq,
            ideal_speed: st.ideal_speed,
            policy_min: st.policy_min,
            policy_max: st.policy_max,
            since_change_us: idle.timestamp_us.saturating_sub(st.change_time),
        };
        let direction = decision::decide(&obs, &tunables);
        st.ramp_direction = direction;

        match direction {
            RampDirection::Up => {
                debug!(
                    target: "governor::alg",
                    "cpu{cpu} @ {old_freq} ramp up: load {load_percent} (delta_idle {delta_idle_us})"
                );
                st.work_pending = true;
                self.up_queue.queue(cpu);
            }
            RampDirection::Down => {
                debug!(
                    target: "governor::alg",
                    "cpu{cpu} @ {old_freq} ramp down: load {load_percent} (delta_idle {delta_idle_us})"
                );
                st.work_pending = true;
                self.down_queue.queue(cpu);
            }
            RampDirection::None => {
                if old_freq < st.policy_max {
                    st.reset_timer(idle);
                }
            }
        }
        TickOutcome::Decided(direction)
    }

    /// Performs a transition; the caller holds `slot.transition`.
    fn transition_locked(
        &self,
        cpu: usize,
        slot: &CpuSlot,
        target: u64,
        relation: Relation,
    ) -> Result<Option<u64>, TransitionError> {
        let (current, policy_min, policy_max, table) = {
            let st = lock(&slot.state);
            let table = match (&st.table, st.enabled) {
                (Some(table), true) => Arc::clone(table),
                _ => return Err(TransitionError::NotAttached(cpu)),
            };
            (st.old_frequency, st.policy_min, st.policy_max, table)
        };
        let ctx = TransitionContext {
            current,
            policy_min,
            policy_max,
            table: &table,
        };

        let applied = self
            .executor
            .execute(&Domain::Cpu(cpu), &ctx, target, relation)?;
        if let Some(freq) = applied {
            let idle = self.platform.idle_time(cpu);
            let mut st = lock(&slot.state);
            st.old_frequency = freq;
            match idle {
                Ok(idle) => {
                    st.change_time = idle.timestamp_us;
                }
                Err(e) => warn!("cpu{cpu}: cannot timestamp transition: {e}"),
            }
        }
        Ok(applied)
    }

    /// Deferred half of a ramp decision; runs on a work queue.
    fn scale(&self, cpu: usize) {
        let Some(slot) = self.cpus.get(cpu) else {
            return;
        };
        let _transition = lock(&slot.transition);
        let tunables = self.tunables();

        let (direction, old_freq, ideal_speed, load, policy_max) = {
            let mut st = lock(&slot.state);
            st.work_pending = false;
            if !st.enabled {
                return;
            }
            let direction = std::mem::take(&mut st.ramp_direction);
            (
                direction,
                st.old_frequency,
                st.ideal_speed,
                st.current_load_percent,
                st.policy_max,
            )
        };

        let plan = match self.platform.get_frequency(&Domain::Cpu(cpu)) {
            Ok(cur) if cur != old_freq => {
                warn!("cpu{cpu}: frequency changed by 3rd party: {old_freq} to {cur}");
                None
            }
            Ok(_) => {
                let plan = decision::ramp_target(
                    direction,
                    old_freq,
                    ideal_speed,
                    load,
                    policy_max,
                    &tunables,
                );
                debug!(
                    target: "governor::alg",
                    "cpu{cpu} @ {old_freq} {direction:?}: ideal {ideal_speed} => {plan:?}"
                );
                plan
            }
            Err(e) => {
                warn!("cpu{cpu}: cannot read current frequency: {e}");
                None
            }
        };

        let applied = match plan {
            Some((target, relation)) => {
                match self.transition_locked(cpu, slot, target, relation) {
                    Ok(applied) => applied,
                    Err(e) => {
                        warn!("cpu{cpu}: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let idle = self.platform.idle_time(cpu);
        let mut st = lock(&slot.state);
        if !st.enabled {
            return;
        }
        // at max the timer is pointless; idle exit re-arms it
        if applied.unwrap_or(0) < st.policy_max {
            match idle {
                Ok(idle) => st.reset_timer(idle),
                Err(e) => warn!("cpu{cpu}: cannot read idle time: {e}"),
            }
        } else {
            st.timer_armed = false;
        }
    }

    fn suspend_cpu(&self, cpu: usize, suspend: bool, tunables: &Tunables) {
        let Some(slot) = self.cpus.get(cpu) else {
            return;
        };
        let _transition = lock(&slot.transition);
        let (policy_min, policy_max) = {
            let mut st = lock(&slot.state);
            if !st.enabled {
                return;
            }
            st.ideal_speed = self.ideal_for(tunables, st.policy_min, st.policy_max);
            (st.policy_min, st.policy_max)
        };

        if !suspend {
            let wake = tunables
                .sleep_wakeup_freq()
                .clamp(policy_min, policy_max.max(policy_min));
            debug!(target: "governor::jumps", "cpu{cpu}: awaking at {wake}");
            if let Err(e) = self.transition_locked(cpu, slot, wake, Relation::AtLeast) {
                warn!("cpu{cpu}: wake-up transition failed: {e}");
            }
        }

        let idle = match self.platform.idle_time(cpu) {
            Ok(idle) => idle,
            Err(e) => {
                warn!("cpu{cpu}: cannot read idle time: {e}");
                return;
            }
        };
        let mut st = lock(&slot.state);
        if suspend {
            // frequency stays; restart the statistics so the timer lowers it gradually
            st.change_time = idle.timestamp_us;
            debug!(target: "governor::jumps", "cpu{cpu}: suspending at {}", st.old_frequency);
        }
        st.reset_timer(idle);
    }

    fn enabled_cpus(&self) -> Vec<usize> {
        self.cpus
            .iter()
            .enumerate()
            .filter(|(_, slot)| lock(&slot.state).enabled)
            .map(|(cpu, _)| cpu)
            .collect()
    }

    fn early_suspend(&self) {
        let tunables = self.tunables();
        // sleep_ideal_freq == 0 disables sleep tracking
        if tunables.sleep_ideal_freq() == 0 || self.suspended.swap(true, Ordering::AcqRel) {
            return;
        }
        for cpu in self.enabled_cpus() {
            self.suspend_cpu(cpu, true, &tunables);
        }
    }

    fn late_resume(&self) {
        if !self.suspended.swap(false, Ordering::AcqRel) {
            return;
        }
        let tunables = self.tunables();
        for cpu in self.enabled_cpus() {
            self.suspend_cpu(cpu, false, &tunables);
        }
    }
}

fn spawn_timer(shared: &Arc<Shared>, cpu: usize) -> Result<TimerThread, IoError> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let shared = Arc::clone(shared);
    let handle = std::thread::Builder::new()
        .name(format!("governor-cpu{cpu}"))
        .spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                let interval = shared.tunables().sample_interval_us();
                std::thread::park_timeout(Duration::from_micros(interval));
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }
                shared.tick(cpu);
            }
        })?;
    Ok(TimerThread { stop, handle })
}

fn stop_timer(slot: &CpuSlot) {
    if let Some(timer) = lock(&slot.timer).take() {
        timer.stop.store(true, Ordering::Release);
        timer.handle.thread().unpark();
        if timer.handle.join().is_err() {
            warn!("cpu{}: timer thread panicked", lock(&slot.state).cpu);
        }
    }
}

/// Load-driven frequency governor with awake/asleep ideal speeds.
///
/// Each attached CPU is sampled by its own timer. Ramp decisions are handed
/// to a ramp-up and a ramp-down work queue whose workers perform the actual
/// frequency change, so the timer never blocks on the platform.
///
/// Without [`start`](Self::start) nothing runs on its own: call
/// [`tick`](Self::tick) and [`run_queued_work`](Self::run_queued_work).
pub struct Governor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Governor {
    /// `ncpus` is one past the highest CPU id that may be attached.
    pub fn new(platform: Arc<dyn Platform>, tunables: Tunables, ncpus: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                executor: TransitionExecutor::new(Arc::clone(&platform)),
                platform,
                tunables: RwLock::new(tunables),
                suspended: AtomicBool::new(false),
                cpus: (0..ncpus)
                    .map(|cpu| CpuSlot {
                        state: Mutex::new(CpuGovernorState::new(cpu)),
                        transition: Mutex::new(()),
                        timer: Mutex::new(None),
                    })
                    .collect(),
                up_queue: WorkQueue::new("governor-up"),
                down_queue: WorkQueue::new("governor-down"),
                running: AtomicBool::new(false),
                active_count: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the ramp workers and a sampling timer per attached CPU.
    pub fn start(&self) -> Result<(), IoError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut workers = lock(&self.workers);
        for queue in [&self.shared.up_queue, &self.shared.down_queue] {
            let shared = Arc::clone(&self.shared);
            workers.push(queue.spawn_worker(move |cpu| shared.scale(cpu))?);
        }
        for cpu in self.shared.enabled_cpus() {
            let slot = &self.shared.cpus[cpu];
            let mut timer = lock(&slot.timer);
            if timer.is_none() {
                *timer = Some(spawn_timer(&self.shared, cpu)?);
            }
        }
        info!("governor started");
        Ok(())
    }

    /// Stops timers and workers. Attached CPUs stay at their frequency.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for slot in &self.shared.cpus {
            stop_timer(slot);
        }
        self.shared.up_queue.shutdown();
        self.shared.down_queue.shutdown();
        for handle in lock(&self.workers).drain(..) {
            if handle.join().is_err() {
                warn!("governor worker panicked");
            }
        }
        info!("governor stopped");
    }

    /// Starts governing `cpu` (policy start event).
    pub fn attach(&self, cpu: usize, policy: CpuPolicy, table: Arc<FrequencyTable>) -> Result<(), AttachError> {
        let slot = self.shared.cpus.get(cpu).ok_or(AttachError::UnknownCpu(cpu))?;
        if policy.cur == 0 {
            return Err(AttachError::NoCurrentFrequency(cpu));
        }
        if policy.min > policy.max {
            return Err(AttachError::InvertedPolicy {
                cpu,
                min: policy.min,
                max: policy.max,
            });
        }
        if table
            .resolve(policy.min, policy.min, policy.max, Relation::AtLeast)
            .is_none()
        {
            return Err(AttachError::NoOperatingPoint {
                cpu,
                min: policy.min,
                max: policy.max,
            });
        }
        let idle = self.shared.platform.idle_time(cpu)?;
        let tunables = self.shared.tunables();

        let was_enabled = {
            let mut st = lock(&slot.state);
            let was_enabled = st.enabled;
            st.enabled = true;
            st.policy_min = policy.min;
            st.policy_max = policy.max;
            st.ideal_speed = self.shared.ideal_for(&tunables, policy.min, policy.max);
            st.old_frequency = policy.cur;
            st.table = Some(table);
            if !was_enabled {
                st.change_time = idle.timestamp_us;
            }
            if policy.cur < policy.max && !st.timer_armed {
                st.reset_timer(idle);
            }
            was_enabled
        };
        if !was_enabled && self.shared.active_count.fetch_add(1, Ordering::AcqRel) == 0 {
            info!("governor active");
        }
        info!(
            "cpu{cpu}: attached, policy {}..{} Hz, ideal {} Hz",
            policy.min,
            policy.max,
            lock(&slot.state).ideal_speed
        );

        if self.shared.running.load(Ordering::Acquire) {
            let mut timer = lock(&slot.timer);
            if timer.is_none() {
                match spawn_timer(&self.shared, cpu) {
                    Ok(t) => *timer = Some(t),
                    Err(e) => warn!("cpu{cpu}: cannot start sampling timer: {e}"),
                }
            }
        }
        Ok(())
    }

    /// Applies new policy bounds (policy limits event), moving the CPU inside them.
    pub fn update_limits(&self, cpu: usize, min: u64, max: u64) -> Result<(), AttachError> {
        let slot = self.shared.cpus.get(cpu).ok_or(AttachError::UnknownCpu(cpu))?;
        if min > max {
            return Err(AttachError::InvertedPolicy { cpu, min, max });
        }
        let tunables = self.shared.tunables();
        let current = self.shared.platform.get_frequency(&Domain::Cpu(cpu))?;
        let _transition = lock(&slot.transition);
        {
            let mut st = lock(&slot.state);
            if !st.enabled {
                return Err(AttachError::NotAttached(cpu));
            }
            st.policy_min = min;
            st.policy_max = max;
            st.ideal_speed = self.shared.ideal_for(&tunables, min, max);
            st.old_frequency = current;
        }

        let jump = if current > max {
            Some((max, Relation::AtMost))
        } else if current < min {
            Some((min, Relation::AtLeast))
        } else {
            None
        };
        let mut now_at = current;
        if let Some((target, relation)) = jump {
            debug!(target: "governor::jumps", "cpu{cpu}: jumping to new limit {target}");
            match self.shared.transition_locked(cpu, slot, target, relation) {
                Ok(Some(applied)) => now_at = applied,
                Ok(None) => {}
                Err(e) => warn!("cpu{cpu}: cannot move into new limits: {e}"),
            }
        }

        let mut st = lock(&slot.state);
        if now_at < max && !st.timer_armed {
            let idle = self.shared.platform.idle_time(cpu)?;
            st.reset_timer(idle);
        }
        Ok(())
    }

    /// Stops governing `cpu` (policy stop event), dropping its queued work.
    pub fn detach(&self, cpu: usize) {
        let Some(slot) = self.shared.cpus.get(cpu) else {
            return;
        };
        let was_enabled = {
            let mut st = lock(&slot.state);
            let was_enabled = st.enabled;
            st.enabled = false;
            st.timer_armed = false;
            st.work_pending = false;
            st.ramp_direction = RampDirection::None;
            st.sampler.invalidate();
            was_enabled
        };
        stop_timer(slot);
        self.shared.up_queue.cancel(|c| *c == cpu);
        self.shared.down_queue.cancel(|c| *c == cpu);
        // wait for an in-flight transition
        drop(lock(&slot.transition));

        if was_enabled {
            info!("cpu{cpu}: detached");
            if self.shared.active_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                info!("governor idle");
            }
        }
    }

    /// One sampling-timer expiry for `cpu`.
    pub fn tick(&self, cpu: usize) -> TickOutcome {
        self.shared.tick(cpu)
    }

    /// Runs queued ramp work on the calling thread, ramp-ups first.
    pub fn run_queued_work(&self) -> usize {
        let shared = &self.shared;
        shared.up_queue.run_pending(|cpu| shared.scale(cpu))
            + shared.down_queue.run_pending(|cpu| shared.scale(cpu))
    }

    /// Moves `cpu` towards `target`, serialized with every other transition
    /// of that CPU. `Ok(None)` means nothing had to change.
    pub fn request_transition(&self, cpu: usize, target: u64, relation: Relation) -> Result<Option<u64>, TransitionError> {
        let slot = self
            .shared
            .cpus
            .get(cpu)
            .ok_or(TransitionError::NotAttached(cpu))?;
        let _transition = lock(&slot.transition);
        self.shared.transition_locked(cpu, slot, target, relation)
    }

    pub fn tunables(&self) -> Tunables {
        self.shared.tunables()
    }

    /// Sets a tunable from its text form (see [`Tunables::store`]) and
    /// refreshes every CPU's ideal speed.
    pub fn set_tunable(&self, name: &str, value: &str) -> Result<(), TunableError> {
        self.update_tunables(|t| t.store(name, value))
    }

    pub fn update_tunables(
        &self,
        update: impl FnOnce(&mut Tunables) -> Result<(), TunableError>,
    ) -> Result<(), TunableError> {
        {
            let mut tunables = self
                .shared
                .tunables
                .write()
                .unwrap_or_else(|e| e.into_inner());
            let mut candidate = tunables.clone();
            update(&mut candidate)?;
            *tunables = candidate;
        }
        self.shared.update_ideal_all();
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Switches every CPU to the sleep ideal speed.
    pub fn early_suspend(&self) {
        self.shared.early_suspend();
    }

    /// Switches back to the awake ideal speed and jumps to the wake-up frequency.
    pub fn late_resume(&self) {
        self.shared.late_resume();
    }

    /// Early-suspend participant driving this governor.
    pub fn sleep_hook(&self, level: i32) -> Arc<dyn EarlySuspend> {
        Arc::new(GovernorSleepHook {
            governor: Arc::downgrade(&self.shared),
            level,
        })
    }

    pub fn cpu_state(&self, cpu: usize) -> Option<CpuGovernorState> {
        self.shared.cpus.get(cpu).map(|slot| lock(&slot.state).clone())
    }

    pub fn attached_cpus(&self) -> Vec<usize> {
        self.shared.enabled_cpus()
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct GovernorSleepHook {
    governor: Weak<Shared>,
    level: i32,
}

impl EarlySuspend for GovernorSleepHook {
    fn level(&self) -> i32 {
        self.level
    }

    fn suspend(&self) {
        if let Some(governor) = self.governor.upgrade() {
            governor.early_suspend();
        }
    }

    fn resume(&self) {
        if let Some(governor) = self.governor.upgrade() {
            governor.late_resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq_table::OperatingPoint;
    use crate::platform::SimulatedPlatform;
    use crate::suspend::{SuspendCoordinator, SuspendState};

    const MHZ: u64 = 1_000_000;

    fn table(freqs: &[u64]) -> Arc<FrequencyTable> {
        Arc::new(FrequencyTable::new(freqs.iter().map(|&f| OperatingPoint::new(f, 0)).collect()).unwrap())
    }

    /// One CPU over `freqs`, awake ideal speed `ideal`, attached at `start`.
    fn setup(freqs: &[u64], ideal: u64, start: u64) -> (Arc<SimulatedPlatform>, Governor) {
        let platform = Arc::new(SimulatedPlatform::new(1, freqs));
        platform.force_frequency(0, start);
        let mut tunables = Tunables::default();
        tunables.set_awake_ideal_freq(ideal).unwrap();
        let governor = Governor::new(platform.clone(), tunables, 1);
        let policy = platform.cpu_policy(0).unwrap();
        governor.attach(0, policy, table(freqs)).unwrap();
        (platform, governor)
    }

    const FOUR: [u64; 4] = [100 * MHZ, 200 * MHZ, 400 * MHZ, 800 * MHZ];
    const SIX: [u64; 6] = [100 * MHZ, 200 * MHZ, 400 * MHZ, 600 * MHZ, 800 * MHZ, 1000 * MHZ];

    #[test]
    fn test_high_load_below_ideal_jumps_to_ideal() {
        let (platform, governor) = setup(&FOUR, 200 * MHZ, 100 * MHZ);
        platform.advance(20_000, 90);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Up));
        assert!(platform.set_calls().is_empty());
        assert_eq!(governor.run_queued_work(), 1);
        assert_eq!(platform.set_calls(), vec![(Domain::Cpu(0), 200 * MHZ)]);

        let st = governor.cpu_state(0).unwrap();
        assert_eq!(st.old_frequency, 200 * MHZ);
        assert_eq!(st.current_load_percent, 90);
        assert_eq!(st.change_time, platform.now_us());
        assert!(st.timer_armed);
    }

    #[test]
    fn test_short_window_takes_no_decision() {
        let (platform, governor) = setup(&FOUR, 200 * MHZ, 100 * MHZ);
        platform.advance(500, 100);
        assert_eq!(governor.tick(0), TickOutcome::TooShort);
        assert_eq!(governor.run_queued_work(), 0);
        let st = governor.cpu_state(0).unwrap();
        assert_eq!(st.current_load_percent, 0);
        assert!(st.timer_armed);
        assert_eq!(st.last_sample_time(), platform.now_us());
        assert!(platform.set_calls().is_empty());
    }

    #[test]
    fn test_up_rate_limit_above_ideal() {
        let (platform, governor) = setup(&SIX, 200 * MHZ, 400 * MHZ);
        // attaching counts as a change
        platform.advance(20_000, 90);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::None));
        platform.advance(28_000, 90);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Up));
        governor.run_queued_work();
        // at most 500 MHz finds 400 MHz again, at least 500 MHz moves on
        assert_eq!(platform.set_calls(), vec![(Domain::Cpu(0), 600 * MHZ)]);

        platform.advance(10_000, 90);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::None));
        governor.run_queued_work();
        assert_eq!(platform.set_calls().len(), 1);

        platform.advance(48_000, 90);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Up));
        governor.run_queued_work();
        assert_eq!(platform.set_calls().last(), Some(&(Domain::Cpu(0), 800 * MHZ)));
    }

    #[test]
    fn test_saturated_cpu_ignores_rate_limit() {
        let (platform, governor) = setup(&SIX, 200 * MHZ, 400 * MHZ);
        platform.advance(48_000, 90);
        governor.tick(0);
        governor.run_queued_work();
        platform.advance(5_000, 100);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Up));
        governor.run_queued_work();
        assert_eq!(platform.set_calls().len(), 2);
    }

    #[test]
    fn test_ramp_down_steps_and_reaches_ideal() {
        let (platform, governor) = setup(&SIX, 200 * MHZ, 800 * MHZ);
        platform.advance(20_000, 5);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Down));
        governor.run_queued_work();
        assert_eq!(platform.set_calls(), vec![(Domain::Cpu(0), 200 * MHZ)]);

        // at ideal speed the down rate limit applies
        platform.advance(20_000, 5);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::None));
        platform.advance(66_000, 5);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Down));
        governor.run_queued_work();
        assert_eq!(platform.set_calls().last(), Some(&(Domain::Cpu(0), 100 * MHZ)));

        // policy min: nothing left to do
        platform.advance(100_000, 5);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::None));
    }

    #[test]
    fn test_third_party_change_is_left_alone() {
        let (platform, governor) = setup(&FOUR, 200 * MHZ, 100 * MHZ);
        platform.advance(20_000, 90);
        governor.tick(0);
        platform.force_frequency(0, 400 * MHZ);
        governor.run_queued_work();
        assert!(platform.set_calls().is_empty());
        let st = governor.cpu_state(0).unwrap();
        assert_eq!(st.old_frequency, 100 * MHZ);
        assert!(st.timer_armed);
    }

    #[test]
    fn test_platform_failure_retries_next_sample() {
        let (platform, governor) = setup(&FOUR, 200 * MHZ, 100 * MHZ);
        let attached_at = platform.now_us();
        platform.fail_next_sets(1);
        platform.advance(20_000, 90);
        governor.tick(0);
        governor.run_queued_work();
        let st = governor.cpu_state(0).unwrap();
        assert_eq!(st.old_frequency, 100 * MHZ);
        assert_eq!(st.change_time, attached_at);
        assert!(st.timer_armed);

        platform.advance(20_000, 90);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Up));
        governor.run_queued_work();
        assert_eq!(platform.set_calls(), vec![(Domain::Cpu(0), 200 * MHZ)]);
    }

    #[test]
    fn test_timer_disarms_at_max_and_rearms_on_idle_exit() {
        let (platform, governor) = setup(&FOUR, 800 * MHZ, 400 * MHZ);
        platform.advance(20_000, 100);
        governor.tick(0);
        governor.run_queued_work();
        assert_eq!(platform.get_frequency(&Domain::Cpu(0)).unwrap(), 800 * MHZ);
        assert!(!governor.cpu_state(0).unwrap().timer_armed);

        platform.advance(20_000, 100);
        assert_eq!(governor.tick(0), TickOutcome::Disarmed);
        platform.advance(20_000, 50);
        assert_eq!(governor.tick(0), TickOutcome::IdleExit);
        platform.advance(66_000, 5);
        assert_eq!(governor.tick(0), TickOutcome::Decided(RampDirection::Down));
    }

    #[test]
    fn test_pending_work_is_not_queued_twice() {
        let (platform, governor) = setup(&FOUR, 200 * MHZ, 100 * MHZ);
        platform.advance(20_000, 90);
        governor.tick(0);
        platform.advance(20_000, 90);
        assert_eq!(governor.tick(0), TickOutcome::Skipped);
        assert_eq!(governor.run_queued_work(), 1);
    }

    #[test]
    fn test_request_transition_to_current_is_noop() {
        let (platform, governor) = setup(&FOUR, 200 * MHZ, 400 * MHZ);
        let attached_at = platform.now_us();
        assert_eq!(governor.request_transition(0, 400 * MHZ, Relation::AtLeast).unwrap(), None);
        assert!(platform.set_calls().is_empty());
        assert_eq!(governor.cpu_state(0).unwrap().change_time, attached_at);

        assert_eq!(
            governor.request_transition(0, 300 * MHZ, Relation::AtMost).unwrap(),
            Some(200 * MHZ)
        );
        assert!(matches!(
            governor.request_transition(3, 300 * MHZ, Relation::AtMost),
            Err(TransitionError::NotAttached(3))
        ));
    }

    #[test]
    fn test_suspend_and_resume_through_coordinator() {
        let (platform, governor) = setup(&FOUR, 400 * MHZ, 400 * MHZ);
        governor
            .update_tunables(|t| {
                t.set_sleep_ideal_freq(150 * MHZ)?;
                t.set_sleep_wakeup_freq(1_400 * MHZ)
            })
            .unwrap();
        let coordinator = SuspendCoordinator::new();
        coordinator.register(governor.sleep_hook(0));

        coordinator.request_suspend_state(SuspendState::Mem);
        coordinator.run_pending();
        assert!(governor.is_suspended());
        let st = governor.cpu_state(0).unwrap();
        assert_eq!(st.ideal_speed, 150 * MHZ);
        assert_eq!(st.change_time, platform.now_us());
        assert!(platform.set_calls().is_empty());

        coordinator.request_suspend_state(SuspendState::On);
        coordinator.run_pending();
        assert!(!governor.is_suspended());
        assert_eq!(governor.cpu_state(0).unwrap().ideal_speed, 400 * MHZ);
        // wake-up frequency bounded by the policy max
        assert_eq!(platform.set_calls(), vec![(Domain::Cpu(0), 800 * MHZ)]);
    }

    #[test]
    fn test_zero_sleep_ideal_disables_sleep_tracking() {
        let (_platform, governor) = setup(&FOUR, 400 * MHZ, 400 * MHZ);
        governor.set_tunable("sleep_ideal_freq", "0").unwrap();
        governor.early_suspend();
        assert!(!governor.is_suspended());
        assert_eq!(governor.cpu_state(0).unwrap().ideal_speed, 400 * MHZ);
    }

    #[test]
    fn test_awake_ideal_change_applies_immediately() {
        let (_platform, governor) = setup(&FOUR, 400 * MHZ, 400 * MHZ);
        governor.set_tunable("awake_ideal_freq", "2000000").unwrap();
        assert_eq!(governor.cpu_state(0).unwrap().ideal_speed, 800 * MHZ);
        assert!(governor.set_tunable("max_cpu_load", "0").is_err());
        assert_eq!(governor.tunables().max_cpu_load(), 50);
    }

    #[test]
    fn test_update_limits_moves_inside() {
        let (platform, governor) = setup(&FOUR, 400 * MHZ, 800 * MHZ);
        platform.set_policy(0, 100 * MHZ, 400 * MHZ);
        governor.update_limits(0, 100 * MHZ, 400 * MHZ).unwrap();
        assert_eq!(platform.set_calls(), vec![(Domain::Cpu(0), 400 * MHZ)]);
        let st = governor.cpu_state(0).unwrap();
        assert_eq!((st.policy_min, st.policy_max, st.ideal_speed), (100 * MHZ, 400 * MHZ, 400 * MHZ));
        assert!(matches!(
            governor.update_limits(0, 500 * MHZ, 400 * MHZ),
            Err(AttachError::InvertedPolicy { .. })
        ));
    }

    #[test]
    fn test_detach_drops_pending_work() {
        let (platform, governor) = setup(&FOUR, 200 * MHZ, 100 * MHZ);
        platform.advance(20_000, 90);
        governor.tick(0);
        governor.detach(0);
        assert_eq!(governor.run_queued_work(), 0);
        assert_eq!(governor.tick(0), TickOutcome::Skipped);
        assert!(governor.attached_cpus().is_empty());
        assert!(platform.set_calls().is_empty());
    }

    #[test]
    fn test_attach_refuses_bad_policy() {
        let platform = Arc::new(SimulatedPlatform::new(1, &FOUR));
        let governor = Governor::new(platform.clone(), Tunables::default(), 1);
        let t = table(&FOUR);
        let policy = CpuPolicy {
            min: 100 * MHZ,
            max: 800 * MHZ,
            cur: 0,
        };
        assert!(matches!(
            governor.attach(0, policy, t.clone()),
            Err(AttachError::NoCurrentFrequency(0))
        ));
        let policy = CpuPolicy { cur: 100 * MHZ, ..policy };
        assert!(matches!(governor.attach(1, policy, t.clone()), Err(AttachError::UnknownCpu(1))));
        let narrow = CpuPolicy {
            min: 250 * MHZ,
            max: 350 * MHZ,
            cur: 300 * MHZ,
        };
        assert!(matches!(
            governor.attach(0, narrow, t),
            Err(AttachError::NoOperatingPoint { .. })
        ));
        assert!(governor.attached_cpus().is_empty());
    }

    #[test]
    fn test_start_and_stop_threads() {
        let (_platform, governor) = setup(&FOUR, 200 * MHZ, 100 * MHZ);
        governor.start().unwrap();
        governor.start().unwrap();
        governor.detach(0);
        governor.stop();
        assert!(governor.attached_cpus().is_empty());
    }
}
