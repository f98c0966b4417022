use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::config::Watermarks;

/// How many slots a create walks from the drawn key looking for a free one.
const MAX_PROBES: u64 = 64;

const ABSENT: usize = usize::MAX;

/// Runtime lifecycle state of every structure backing a keyspace.
///
/// Dense arena indexed by key index. Existence flags and populations are
/// atomics so any worker can read them without locking; create and delete
/// transitions go through a short per-keyspace lock, which keeps the
/// existing-count exactly within the watermarks under concurrent workers.
pub struct StructureState {
    watermarks: Watermarks,
    exists: Box<[AtomicBool]>,
    population: Box<[AtomicU32]>,
    existing: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

/// Indices of existing structures with their positions, for O(1) random
/// picks and removal.
struct Lifecycle {
    keys: Vec<u64>,
    positions: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The structure at this index changed state and the request may go out.
    Claimed(u64),
    /// The watermark forbids the transition right now.
    Suppressed,
    /// No structure in the required state was found.
    NoCandidate,
}

/// Engine bookkeeping is corrupt; the run must not continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation(pub String);

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "internal invariant violated: {}", self.0)
    }
}

impl std::error::Error for InvariantViolation {}

impl StructureState {
    pub fn new(count: u64, watermarks: Watermarks) -> Self {
        let len = count as usize;
        Self {
            watermarks,
            exists: (0..len).map(|_| AtomicBool::new(false)).collect(),
            population: (0..len).map(|_| AtomicU32::new(0)).collect(),
            existing: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle {
                keys: Vec::new(),
                positions: vec![ABSENT; len],
            }),
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    /// Number of structures currently in the exists state.
    pub fn existing(&self) -> u64 {
        self.existing.load(Ordering::Acquire)
    }

    pub fn exists(&self, index: u64) -> bool {
        self.exists[index as usize].load(Ordering::Acquire)
    }

    pub fn population(&self, index: u64) -> u32 {
        self.population[index as usize].load(Ordering::Relaxed)
    }

    /// Moves a structure near `index` from does-not-exist to exists.
    pub fn try_create(&self, index: u64) -> Result<Transition, InvariantViolation> {
        let mut lifecycle = self.lifecycle.lock();

        let existing = self.existing.load(Ordering::Acquire);
        if existing >= self.watermarks.high {
            return Ok(Transition::Suppressed);
        }

        let count = self.exists.len() as u64;
        for probe in 0..MAX_PROBES.min(count) {
            let candidate = (index + probe) % count;
            let slot = candidate as usize;
            if self.exists[slot].load(Ordering::Acquire) {
                continue;
            }
            if lifecycle.positions[slot] != ABSENT {
                return Err(InvariantViolation(format!(
                    "key #{candidate} listed as existing while flagged absent"
                )));
            }

            lifecycle.positions[slot] = lifecycle.keys.len();
            lifecycle.keys.push(candidate);
            self.population[slot].store(0, Ordering::Relaxed);
            self.exists[slot].store(true, Ordering::Release);
            self.existing.store(existing + 1, Ordering::Release);
            return Ok(Transition::Claimed(candidate));
        }

        Ok(Transition::NoCandidate)
    }

    /// Moves a random existing structure back to does-not-exist.
    pub fn try_delete<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Transition, InvariantViolation> {
        let mut lifecycle = self.lifecycle.lock();

        let existing = self.existing.load(Ordering::Acquire);
        if existing <= self.watermarks.low {
            return Ok(Transition::Suppressed);
        }
        if lifecycle.keys.len() as u64 != existing {
            return Err(InvariantViolation(format!(
                "existing-count {existing} disagrees with {} tracked structures",
                lifecycle.keys.len()
            )));
        }
        let Some(remaining) = existing.checked_sub(1) else {
            return Err(InvariantViolation(
                "existing-count would go negative".to_owned(),
            ));
        };

        let position = rng.random_range(0..lifecycle.keys.len());
        let victim = lifecycle.keys.swap_remove(position);
        if let Some(&moved) = lifecycle.keys.get(position) {
            lifecycle.positions[moved as usize] = position;
        }
        lifecycle.positions[victim as usize] = ABSENT;

        self.exists[victim as usize].store(false, Ordering::Release);
        self.population[victim as usize].store(0, Ordering::Relaxed);
        self.existing.store(remaining, Ordering::Release);
        Ok(Transition::Claimed(victim))
    }

    pub fn grow(&self, index: u64, items: u32) {
        if self.exists(index) {
            let _ = self.population[index as usize]
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pop| {
                    Some(pop.saturating_add(items))
                });
        }
    }

    pub fn shrink(&self, index: u64, items: u32) {
        if self.exists(index) {
            let _ = self.population[index as usize]
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pop| {
                    Some(pop.saturating_sub(items))
                });
        }
    }

    pub fn truncate(&self, index: u64, items: u32) {
        if self.exists(index) {
            self.population[index as usize].fetch_min(items, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for StructureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructureState")
            .field("watermarks", &self.watermarks)
            .field("count", &self.exists.len())
            .field("existing", &self.existing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{SeedableRng as _, rngs::SmallRng};

    use super::*;

    #[test]
    fn create_then_delete_round_trip() {
        let state = StructureState::new(10, Watermarks { low: 0, high: 10 });
        let mut rng = SmallRng::seed_from_u64(1);

        assert_eq!(state.try_create(4), Ok(Transition::Claimed(4)));
        assert!(state.exists(4));
        assert_eq!(state.existing(), 1);

        // already exists, probe moves on to the next free slot
        assert_eq!(state.try_create(4), Ok(Transition::Claimed(5)));
        assert_eq!(state.existing(), 2);

        let Ok(Transition::Claimed(victim)) = state.try_delete(&mut rng) else {
            panic!("expected a delete");
        };
        assert!(victim == 4 || victim == 5);
        assert!(!state.exists(victim));
        assert_eq!(state.existing(), 1);
    }

    #[test]
    fn create_is_suppressed_at_high_watermark() {
        let state = StructureState::new(10, Watermarks { low: 3, high: 5 });
        for index in 0..10 {
            let _ = state.try_create(index).unwrap();
        }
        assert_eq!(state.existing(), 5);
        assert_eq!(state.try_create(9), Ok(Transition::Suppressed));
    }

    #[test]
    fn delete_is_suppressed_at_low_watermark() {
        let state = StructureState::new(10, Watermarks { low: 3, high: 5 });
        let mut rng = SmallRng::seed_from_u64(2);

        assert_eq!(state.try_delete(&mut rng), Ok(Transition::Suppressed));
        for index in 0..5 {
            state.try_create(index).unwrap();
        }
        assert!(matches!(state.try_delete(&mut rng), Ok(Transition::Claimed(_))));
        assert!(matches!(state.try_delete(&mut rng), Ok(Transition::Claimed(_))));
        assert_eq!(state.existing(), 3);
        assert_eq!(state.try_delete(&mut rng), Ok(Transition::Suppressed));
    }

    #[test]
    fn create_gives_up_after_probing() {
        let state = StructureState::new(200, Watermarks { low: 0, high: 200 });
        for index in 0..100 {
            assert_eq!(state.try_create(index), Ok(Transition::Claimed(index)));
        }
        assert_eq!(state.try_create(0), Ok(Transition::NoCandidate));
        assert_eq!(state.try_create(60), Ok(Transition::Claimed(100)));
    }

    #[test]
    fn population_follows_items() {
        let state = StructureState::new(4, Watermarks { low: 0, high: 4 });
        state.grow(1, 10);
        assert_eq!(state.population(1), 0, "absent structures do not grow");

        state.try_create(1).unwrap();
        state.grow(1, 10);
        state.shrink(1, 3);
        assert_eq!(state.population(1), 7);
        state.truncate(1, 5);
        assert_eq!(state.population(1), 5);
        state.truncate(1, 64);
        assert_eq!(state.population(1), 5);
        state.shrink(1, 100);
        assert_eq!(state.population(1), 0);
    }

    #[test]
    fn concurrent_lifecycle_stays_within_watermarks() {
        let marks = Watermarks {
            low: 3000,
            high: 3200,
        };
        let state = Arc::new(StructureState::new(100_000, marks));

        let handles: Vec<_> = (0..8u64)
            .map(|seed| {
                let state = state.clone();
                std::thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(seed);
                    let mut risen = false;
                    for _ in 0..50_000 {
                        if rng.random_bool(0.6) {
                            let index = rng.random_range(0..100_000);
                            state.try_create(index).unwrap();
                        } else {
                            state.try_delete(&mut rng).unwrap();
                        }
                        let existing = state.existing();
                        assert!(existing <= marks.high, "overshoot: {existing}");
                        if existing > marks.low {
                            risen = true;
                        }
                        if risen {
                            assert!(existing >= marks.low, "undershoot: {existing}");
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let existing = state.existing();
        assert!((marks.low..=marks.high).contains(&existing));
        let flagged = (0..100_000).filter(|&index| state.exists(index)).count() as u64;
        assert_eq!(flagged, existing);
    }
}
