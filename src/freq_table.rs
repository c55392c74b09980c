use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A (frequency, voltage) pair a domain may run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperatingPoint {
    /// Hz
    pub frequency: u64,
    /// µV, opaque calibration data
    pub voltage: u32,
    pub enabled: bool,
}

impl OperatingPoint {
    pub fn new(frequency: u64, voltage: u32) -> Self {
        Self {
            frequency,
            voltage,
            enabled: true,
        }
    }
}

/// How a target frequency is matched against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Lowest frequency at or above the target.
    AtLeast,
    /// Highest frequency at or below the target.
    AtMost,
}

impl Relation {
    pub fn flipped(self) -> Self {
        match self {
            Relation::AtLeast => Relation::AtMost,
            Relation::AtMost => Relation::AtLeast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    Empty,
    NotIncreasing { index: usize, frequency: u64, previous: u64 },
    UnknownFrequency(u64),
    LastEnabledPoint(u64),
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::Empty => write!(f, "frequency table has no enabled operating point"),
            TableError::NotIncreasing {
                index,
                frequency,
                previous,
            } => write!(
                f,
                "operating point {index} ({frequency} Hz) is not above the previous one ({previous} Hz)"
            ),
            TableError::UnknownFrequency(freq) => {
                write!(f, "{freq} Hz is not an operating point of this table")
            }
            TableError::LastEnabledPoint(freq) => {
                write!(f, "cannot disable {freq} Hz, it is the last enabled operating point")
            }
        }
    }
}

impl std::error::Error for TableError {}

#[derive(Debug)]
struct Entry {
    frequency: u64,
    voltage: u32,
    enabled: AtomicBool,
}

impl Entry {
    fn snapshot(&self) -> OperatingPoint {
        OperatingPoint {
            frequency: self.frequency,
            voltage: self.voltage,
            enabled: self.enabled.load(Ordering::Acquire),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Ordered operating points of one power domain.
///
/// Built once and shared read-only; only the `enabled` flag of a point can be
/// toggled afterwards, and never so that no point stays enabled. Lookups skip
/// disabled points, so every lookup has at least one candidate.
#[derive(Debug)]
pub struct FrequencyTable {
    entries: Vec<Entry>,
    enabled_count: AtomicUsize,
}

impl FrequencyTable {
    /// Points must be strictly increasing in frequency and at least one of them enabled.
    pub fn new(points: Vec<OperatingPoint>) -> Result<Self, TableError> {
        for (i, pair) in points.windows(2).enumerate() {
            if pair[1].frequency <= pair[0].frequency {
                return Err(TableError::NotIncreasing {
                    index: i + 1,
                    frequency: pair[1].frequency,
                    previous: pair[0].frequency,
                });
            }
        }
        let enabled = points.iter().filter(|p| p.enabled).count();
        if enabled == 0 {
            return Err(TableError::Empty);
        }

        Ok(Self {
            entries: points
                .into_iter()
                .map(|p| Entry {
                    frequency: p.frequency,
                    voltage: p.voltage,
                    enabled: AtomicBool::new(p.enabled),
                })
                .collect(),
            enabled_count: AtomicUsize::new(enabled),
        })
    }

    /// Sorts and deduplicates raw frequencies (Hz) first; voltages are unknown.
    pub fn from_frequencies(mut frequencies: Vec<u64>) -> Result<Self, TableError> {
        frequencies.sort_unstable();
        frequencies.dedup();
        Self::new(
            frequencies
                .into_iter()
                .map(|f| OperatingPoint::new(f, 0))
                .collect(),
        )
    }

    pub fn points(&self) -> Vec<OperatingPoint> {
        self.entries.iter().map(Entry::snapshot).collect()
    }

    fn enabled(&self) -> impl DoubleEndedIterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_enabled())
    }

    pub fn lowest(&self) -> OperatingPoint {
        // enabled_count never drops to zero, the fallback is unreachable
        self.enabled()
            .next()
            .or(self.entries.first())
            .map(Entry::snapshot)
            .unwrap_or(OperatingPoint::new(0, 0))
    }

    pub fn highest(&self) -> OperatingPoint {
        self.enabled()
            .next_back()
            .or(self.entries.last())
            .map(Entry::snapshot)
            .unwrap_or(OperatingPoint::new(0, 0))
    }

    pub fn contains(&self, frequency: u64) -> bool {
        self.enabled().any(|e| e.frequency == frequency)
    }

    /// Lowest enabled point at or above `target`, or the highest point when
    /// nothing is that high.
    pub fn nearest_at_or_above(&self, target: u64) -> OperatingPoint {
        self.enabled()
            .find(|e| e.frequency >= target)
            .map(Entry::snapshot)
            .unwrap_or_else(|| self.highest())
    }

    /// Highest enabled point at or below `target`, or the lowest point when
    /// nothing is that low.
    pub fn nearest_at_or_below(&self, target: u64) -> OperatingPoint {
        self.enabled()
            .rev()
            .find(|e| e.frequency <= target)
            .map(Entry::snapshot)
            .unwrap_or_else(|| self.lowest())
    }

    /// Resolves `target` to a point inside `[min, max]` using `relation`.
    ///
    /// When no point satisfies the relation inside the bounds, the closest
    /// point on the other side is used instead. Returns `None` only when no
    /// enabled point lies within the bounds at all.
    pub fn resolve(&self, target: u64, min: u64, max: u64, relation: Relation) -> Option<OperatingPoint> {
        let in_bounds = || {
            self.enabled()
                .filter(move |e| e.frequency >= min && e.frequency <= max)
        };
        let above = in_bounds().find(|e| e.frequency >= target);
        let below = in_bounds().rev().find(|e| e.frequency <= target);
        let found = match relation {
            Relation::AtLeast => above.or(below),
            Relation::AtMost => below.or(above),
        };
        found.map(Entry::snapshot)
    }

    /// Clamps `frequency` into `[min, max]` and snaps it onto the table,
    /// preferring the highest point not above the clamped value.
    ///
    /// If no point lies within the bounds the point nearest to them is
    /// returned, so the result is always a member of the table. Equidistant
    /// neighbours resolve to the lower one.
    pub fn clamp(&self, frequency: u64, min: u64, max: u64) -> u64 {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let bounded = frequency.clamp(min, max);
        if let Some(point) = self.resolve(bounded, min, max, Relation::AtMost) {
            return point.frequency;
        }
        let distance = |f: u64| {
            if f < min {
                min - f
            } else {
                f.saturating_sub(max)
            }
        };
        let below = self.nearest_at_or_below(min).frequency;
        let above = self.nearest_at_or_above(max).frequency;
        if distance(above) < distance(below) {
            above
        } else {
            below
        }
    }

    /// Toggles a point. Refuses to disable the last enabled point.
    pub fn set_enabled(&self, frequency: u64, enabled: bool) -> Result<(), TableError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.frequency == frequency)
            .ok_or(TableError::UnknownFrequency(frequency))?;

        if enabled {
            if !entry.enabled.swap(true, Ordering::AcqRel) {
                self.enabled_count.fetch_add(1, Ordering::AcqRel);
            }
            return Ok(());
        }

        if !entry.is_enabled() {
            return Ok(());
        }
        self.enabled_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 1).then(|| n - 1))
            .map_err(|_| TableError::LastEnabledPoint(frequency))?;
        if !entry.enabled.swap(false, Ordering::AcqRel) {
            // lost a race with another disable of the same point
            self.enabled_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MHZ: u64 = 1_000_000;

    fn table() -> FrequencyTable {
        FrequencyTable::new(vec![
            OperatingPoint::new(100 * MHZ, 975_000),
            OperatingPoint::new(200 * MHZ, 1_075_000),
            OperatingPoint::new(400 * MHZ, 1_200_000),
            OperatingPoint::new(800 * MHZ, 1_350_000),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_and_unordered() {
        assert_eq!(FrequencyTable::new(vec![]).unwrap_err(), TableError::Empty);
        let err = FrequencyTable::new(vec![
            OperatingPoint::new(200 * MHZ, 0),
            OperatingPoint::new(200 * MHZ, 0),
        ])
        .unwrap_err();
        assert!(matches!(err, TableError::NotIncreasing { index: 1, .. }));

        let mut disabled = OperatingPoint::new(100 * MHZ, 0);
        disabled.enabled = false;
        assert_eq!(FrequencyTable::new(vec![disabled]).unwrap_err(), TableError::Empty);
    }

    #[test]
    fn test_nearest_lookups() {
        let t = table();
        assert_eq!(t.nearest_at_or_above(150 * MHZ).frequency, 200 * MHZ);
        assert_eq!(t.nearest_at_or_above(200 * MHZ).frequency, 200 * MHZ);
        assert_eq!(t.nearest_at_or_above(900 * MHZ).frequency, 800 * MHZ);
        assert_eq!(t.nearest_at_or_below(399 * MHZ).frequency, 200 * MHZ);
        assert_eq!(t.nearest_at_or_below(50 * MHZ).frequency, 100 * MHZ);
    }

    #[test]
    fn test_resolve_falls_back_across_relation() {
        let t = table();
        // nothing at most 300 MHz inside [400, 800]
        let p = t.resolve(300 * MHZ, 400 * MHZ, 800 * MHZ, Relation::AtMost).unwrap();
        assert_eq!(p.frequency, 400 * MHZ);
        let p = t.resolve(900 * MHZ, 100 * MHZ, 400 * MHZ, Relation::AtLeast).unwrap();
        assert_eq!(p.frequency, 400 * MHZ);
        assert!(t.resolve(300 * MHZ, 250 * MHZ, 350 * MHZ, Relation::AtLeast).is_none());
    }

    #[test]
    fn test_clamp_always_returns_member_within_bounds() {
        let t = table();
        for f in (0..1_000).map(|i| i * 7 * MHZ / 5) {
            for (min, max) in [(100 * MHZ, 800 * MHZ), (200 * MHZ, 400 * MHZ), (150 * MHZ, 700 * MHZ)] {
                let c = t.clamp(f, min, max);
                assert!(t.contains(c), "{c} not in table");
                assert!(c >= min && c <= max, "{c} outside [{min}, {max}]");
            }
        }
        // no member in range: nearest member wins, the lower one on a tie
        assert_eq!(t.clamp(300 * MHZ, 250 * MHZ, 350 * MHZ), 200 * MHZ);
        assert_eq!(t.clamp(1_000 * MHZ, 900 * MHZ, 950 * MHZ), 800 * MHZ);
        assert_eq!(t.clamp(50 * MHZ, 10 * MHZ, 20 * MHZ), 100 * MHZ);
    }

    #[test]
    fn test_clamp_between_points_picks_closer_side() {
        let t = table();
        // 230-260 MHz: 200 is 30 MHz below, 400 is 140 MHz above
        assert_eq!(t.clamp(250 * MHZ, 230 * MHZ, 260 * MHZ), 200 * MHZ);
        // 350-390 MHz: 400 is 10 MHz above, 200 is 150 MHz below
        assert_eq!(t.clamp(300 * MHZ, 350 * MHZ, 390 * MHZ), 400 * MHZ);
        // disabling the closer point moves the answer to the next member
        t.set_enabled(400 * MHZ, false).unwrap();
        assert_eq!(t.clamp(300 * MHZ, 350 * MHZ, 390 * MHZ), 200 * MHZ);
    }

    #[test]
    fn test_disabled_points_are_skipped() {
        let t = table();
        t.set_enabled(200 * MHZ, false).unwrap();
        assert_eq!(t.nearest_at_or_above(150 * MHZ).frequency, 400 * MHZ);
        assert!(!t.contains(200 * MHZ));
        t.set_enabled(200 * MHZ, true).unwrap();
        assert!(t.contains(200 * MHZ));
    }

    #[test]
    fn test_last_enabled_point_cannot_be_disabled() {
        let t = FrequencyTable::from_frequencies(vec![300 * MHZ, 100 * MHZ, 300 * MHZ]).unwrap();
        assert_eq!(t.points().len(), 2);
        t.set_enabled(100 * MHZ, false).unwrap();
        assert_eq!(
            t.set_enabled(300 * MHZ, false),
            Err(TableError::LastEnabledPoint(300 * MHZ))
        );
        assert_eq!(
            t.set_enabled(123, false),
            Err(TableError::UnknownFrequency(123))
        );
    }
}
