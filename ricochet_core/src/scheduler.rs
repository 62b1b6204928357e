use crate::config::SchedulerType;
use crate::corpus::CorpusEntry;
use rand_core::RngCore;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// There is nothing to schedule.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// A `Scheduler` decides which corpus entry is mutated next.
///
/// The corpus store calls it while holding its lock and then bumps the
/// chosen entry's `times_selected`, so implementations only read `entries`.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the index of the next entry to mutate.
    fn next(
        &self,
        entries: &[CorpusEntry],
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError>;
}

/// Picks every entry with the same probability.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl Scheduler for RandomScheduler {
    fn name(&self) -> &'static str {
        "RandomScheduler"
    }

    fn next(
        &self,
        entries: &[CorpusEntry],
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        if entries.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        Ok(rng.next_u64() as usize % entries.len())
    }
}

/// Weighted random selection, inversely proportional to how often an entry
/// has already been selected.
///
/// Entry `i` has weight `1 / (1 + times_selected_i)`. New discoveries start
/// with the full weight and fade as they get mutated, which spreads effort
/// across the corpus instead of refining one entry forever.
#[derive(Default, Debug)]
pub struct WeightedScheduler;

impl WeightedScheduler {
    pub fn new() -> Self {
        WeightedScheduler
    }

    fn weight(entry: &CorpusEntry) -> f64 {
        1.0 / (1.0 + entry.times_selected as f64)
    }
}

/// Uniform float in `[0, 1)` from the top 53 bits of a `u64`.
fn unit_f64(rng: &mut dyn RngCore) -> f64 {
    (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

impl Scheduler for WeightedScheduler {
    fn name(&self) -> &'static str {
        "WeightedScheduler"
    }

    fn next(
        &self,
        entries: &[CorpusEntry],
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        if entries.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        let total: f64 = entries.iter().map(Self::weight).sum();
        let mut target = unit_f64(rng) * total;
        for (id, entry) in entries.iter().enumerate() {
            let w = Self::weight(entry);
            if target < w {
                return Ok(id);
            }
            target -= w;
        }
        // Rounding can leave a sliver past the last weight.
        Ok(entries.len() - 1)
    }
}

pub fn scheduler_for(kind: &SchedulerType) -> Box<dyn Scheduler> {
    match kind {
        SchedulerType::Weighted => Box::new(WeightedScheduler::new()),
        SchedulerType::Uniform => Box::new(RandomScheduler::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Input;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn entry(times_selected: u64) -> CorpusEntry {
        CorpusEntry {
            input: Input::from("seed"),
            signature: None,
            discovered_at_iteration: 0,
            times_selected,
        }
    }

    #[test]
    fn schedulers_reject_empty_corpus() {
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert_eq!(
            RandomScheduler::new().next(&[], &mut rng),
            Err(SchedulerError::CorpusEmpty)
        );
        assert_eq!(
            WeightedScheduler::new().next(&[], &mut rng),
            Err(SchedulerError::CorpusEmpty)
        );
    }

    #[test]
    fn random_scheduler_reaches_every_entry() {
        let scheduler = RandomScheduler::new();
        let entries = vec![entry(0), entry(0), entry(0)];
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = scheduler.next(&entries, &mut rng).unwrap();
            assert!(id < entries.len());
            seen.insert(id);
        }
        assert_eq!(seen.len(), entries.len());
    }

    #[test]
    fn weighted_scheduler_prefers_rarely_selected_entries() {
        let scheduler = WeightedScheduler::new();
        let entries = vec![entry(99), entry(0)];
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let mut counts = [0usize; 2];
        for _ in 0..2000 {
            counts[scheduler.next(&entries, &mut rng).unwrap()] += 1;
        }
        // Weights are 0.01 and 1.0.
        assert!(counts[1] > counts[0] * 20, "counts: {counts:?}");
        assert!(counts[0] < 100, "counts: {counts:?}");
    }

    #[test]
    fn scheduler_for_maps_config_types() {
        assert_eq!(scheduler_for(&SchedulerType::Weighted).name(), "WeightedScheduler");
        assert_eq!(scheduler_for(&SchedulerType::Uniform).name(), "RandomScheduler");
    }
}
