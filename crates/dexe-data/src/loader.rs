// Indices — visiting order over a dataset, optionally shuffled

use rand::seq::SliceRandom;

use dexe_core::{Context, Result};

use crate::dataset::{Dataset, Sample};

/// A permutation of `0..n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indices {
    order: Vec<usize>,
}

impl Indices {
    /// The identity order `0, 1, ..., n-1`.
    pub fn new(n: usize) -> Self {
        Indices {
            order: (0..n).collect(),
        }
    }

    /// Shuffle in place with the context's generator.
    pub fn shuffle(&mut self, ctx: &mut Context) {
        self.order.shuffle(ctx.rng());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.order
    }

    pub fn iter(&self) -> std::slice::Iter<'_, usize> {
        self.order.iter()
    }
}

impl<'a> IntoIterator for &'a Indices {
    type Item = &'a usize;
    type IntoIter = std::slice::Iter<'a, usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}

/// Iterate a dataset's samples in the given order.
pub fn samples<'a>(
    dataset: &'a dyn Dataset,
    order: &'a Indices,
) -> impl Iterator<Item = Result<Sample>> + 'a {
    order.iter().map(move |&i| dataset.get_sample(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SyntheticDataset;
    use dexe_core::Shape;

    #[test]
    fn test_shuffle_is_permutation() {
        let mut ctx = Context::seeded(3);
        let mut idx = Indices::new(50);
        idx.shuffle(&mut ctx);
        let mut sorted = idx.as_slice().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(idx, Indices::new(50));
    }

    #[test]
    fn test_shuffle_reproducible() {
        let (mut a, mut b) = (Indices::new(20), Indices::new(20));
        a.shuffle(&mut Context::seeded(9));
        b.shuffle(&mut Context::seeded(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_samples_follow_order() {
        let ds = SyntheticDataset::new(Shape::new(1, 1, 1, 1), 4, 4, 0.0, 0).unwrap();
        let mut idx = Indices::new(4);
        idx.shuffle(&mut Context::seeded(1));
        let labels: Vec<usize> = samples(&ds, &idx).map(|s| s.unwrap().label).collect();
        let expected: Vec<usize> = idx.iter().map(|&i| i % 4).collect();
        assert_eq!(labels, expected);
    }
}
