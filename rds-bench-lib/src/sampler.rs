use rand::Rng;

/// Cumulative weight table over an ordered list of items.
///
/// The table is built once (at config load time) so the hot path only has to
/// draw one uniform `f64` and do a binary search over the cumulative bounds.
/// Items keep their configured order: for a given draw the first item whose
/// cumulative bound exceeds the draw wins, which also means zero-weight items
/// (whose bound equals their predecessor's) can never be picked.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTable<T> {
    items: Vec<T>,
    bounds: Vec<f64>,
    total: f64,
    last_positive: usize,
}

/// Reasons a weighted list cannot be turned into a [`WeightedTable`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionError {
    Empty,
    InvalidWeight { index: usize, weight: f64 },
    AllZero,
}

impl std::fmt::Display for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "weighted list is empty"),
            Self::InvalidWeight { index, weight } => {
                write!(f, "weight #{index} is invalid ({weight}): must be finite and >= 0")
            }
            Self::AllZero => write!(f, "all weights are zero"),
        }
    }
}

impl std::error::Error for SelectionError {}

impl<T> WeightedTable<T> {
    pub fn try_new(weighted: impl IntoIterator<Item = (T, f64)>) -> Result<Self, SelectionError> {
        let weighted = weighted.into_iter();
        let (lower, _) = weighted.size_hint();
        let mut items = Vec::with_capacity(lower);
        let mut bounds = Vec::with_capacity(lower);

        let mut total = 0.0;
        let mut last_positive = None;
        for (index, (item, weight)) in weighted.enumerate() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(SelectionError::InvalidWeight { index, weight });
            }
            if weight > 0.0 {
                last_positive = Some(index);
            }
            total += weight;
            items.push(item);
            bounds.push(total);
        }

        if items.is_empty() {
            return Err(SelectionError::Empty);
        }
        let Some(last_positive) = last_positive else {
            return Err(SelectionError::AllZero);
        };

        Ok(Self {
            items,
            bounds,
            total,
            last_positive,
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        &self.items[self.sample_index(rng)]
    }

    pub fn sample_index<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        self.index_for(rng.random::<f64>() * self.total)
    }

    /// Maps a draw in `[0, total)` onto an item index.
    fn index_for(&self, draw: f64) -> usize {
        // float rounding can land exactly on `total`
        self.bounds
            .partition_point(|&bound| bound <= draw)
            .min(self.last_positive)
    }

    /// Share of draws item `index` receives.
    pub fn probability(&self, index: usize) -> f64 {
        let lower = if index == 0 {
            0.0
        } else {
            self.bounds[index - 1]
        };
        (self.bounds[index] - lower) / self.total
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng as _, rngs::SmallRng};

    #[test]
    fn rejects_invalid_lists() {
        assert_eq!(
            WeightedTable::try_new(Vec::<(u8, f64)>::new()).unwrap_err(),
            SelectionError::Empty
        );
        assert_eq!(
            WeightedTable::try_new([('a', 0.0), ('b', 0.0)]).unwrap_err(),
            SelectionError::AllZero
        );
        assert_eq!(
            WeightedTable::try_new([('a', 1.0), ('b', -1.0)]).unwrap_err(),
            SelectionError::InvalidWeight {
                index: 1,
                weight: -1.0
            }
        );
        assert!(matches!(
            WeightedTable::try_new([('a', f64::NAN)]).unwrap_err(),
            SelectionError::InvalidWeight { index: 0, .. }
        ));
    }

    #[test]
    fn draw_maps_to_first_bound_exceeding_it() {
        let table = WeightedTable::try_new([('a', 1.0), ('b', 0.0), ('c', 3.0)]).unwrap();
        assert_eq!(table.bounds(), &[1.0, 1.0, 4.0]);
        assert_eq!(table.index_for(0.0), 0);
        assert_eq!(table.index_for(0.999), 0);
        assert_eq!(table.index_for(1.0), 2);
        assert_eq!(table.index_for(3.999), 2);
        // rounding guard
        assert_eq!(table.index_for(4.0), 2);
    }

    #[test]
    fn trailing_zero_weight_is_never_selected() {
        let table = WeightedTable::try_new([('a', 2.0), ('b', 0.0)]).unwrap();
        assert_eq!(table.index_for(2.0), 0);

        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..10_000 {
            assert_eq!(*table.sample(&mut rng), 'a');
        }
    }

    #[test]
    fn sampling_converges_to_configured_fractions() {
        let weights = [0.05, 0.15, 0.3, 0.5, 0.0];
        let table = WeightedTable::try_new(weights.iter().copied().enumerate()).unwrap();

        const N: usize = 200_000;
        let mut rng = SmallRng::seed_from_u64(42);
        let mut hits = [0usize; 5];
        for _ in 0..N {
            hits[*table.sample(&mut rng)] += 1;
        }

        for (index, weight) in weights.iter().enumerate() {
            let observed = hits[index] as f64 / N as f64;
            assert!(
                (observed - weight).abs() < 0.01,
                "item {index}: observed {observed}, expected {weight}"
            );
            assert!((table.probability(index) - weight).abs() < 1e-12);
        }
        assert_eq!(hits[4], 0);
    }

    #[test]
    fn identical_input_yields_identical_tables() {
        let a = WeightedTable::try_new([("x", 0.2), ("y", 0.8)]).unwrap();
        let b = WeightedTable::try_new([("x", 0.2), ("y", 0.8)]).unwrap();
        assert_eq!(a, b);

        let mut rng_a = SmallRng::seed_from_u64(1);
        let mut rng_b = SmallRng::seed_from_u64(1);
        for _ in 0..1_000 {
            assert_eq!(a.sample(&mut rng_a), b.sample(&mut rng_b));
        }
    }
}
