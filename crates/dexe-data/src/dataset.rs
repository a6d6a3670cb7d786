// Dataset trait — Indexed source of (raw buffer, label) samples

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use dexe_core::{Error, Result, Shape};

/// One training example: a flattened `[C, H, W]` buffer and its class.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub data: Vec<f32>,
    pub label: usize,
}

/// An indexed collection of samples.
///
/// Every sample's `data.len()` equals `sample_shape().size()`, which is what
/// the network's input slot expects for a batch of one.
pub trait Dataset: Send + Sync {
    /// Number of samples.
    fn count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Sample at `index`. Fails with `Error::Dataset` when out of range.
    fn get_sample(&self, index: usize) -> Result<Sample>;

    /// Shape of one sample, batch size 1.
    fn sample_shape(&self) -> Shape;

    /// Number of distinct labels.
    fn classes(&self) -> usize;

    fn name(&self) -> &str {
        "dataset"
    }
}

/// In-memory dataset.
#[derive(Debug, Clone)]
pub struct VecDataset {
    shape: Shape,
    classes: usize,
    samples: Vec<Sample>,
}

impl VecDataset {
    /// Build from samples shaped `shape` (its batch size is forced to 1).
    /// Fails if any buffer has the wrong length or any label is `>= classes`.
    pub fn new(shape: Shape, classes: usize, samples: Vec<Sample>) -> Result<Self> {
        let shape = Shape::new(1, shape.c(), shape.h(), shape.w());
        for (i, s) in samples.iter().enumerate() {
            if s.data.len() != shape.size() {
                return Err(Error::Dataset(format!(
                    "sample {i} has {} values, expected {} for {shape}",
                    s.data.len(),
                    shape.size()
                )));
            }
            if s.label >= classes {
                return Err(Error::LabelOutOfRange {
                    label: s.label,
                    classes,
                });
            }
        }
        Ok(VecDataset {
            shape,
            classes,
            samples,
        })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Append a sample, with the same checks as `new`.
    pub fn push(&mut self, sample: Sample) -> Result<()> {
        if sample.data.len() != self.shape.size() {
            return Err(Error::Dataset(format!(
                "sample has {} values, expected {}",
                sample.data.len(),
                self.shape.size()
            )));
        }
        if sample.label >= self.classes {
            return Err(Error::LabelOutOfRange {
                label: sample.label,
                classes: self.classes,
            });
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Copy any dataset into memory.
    pub fn collect(source: &dyn Dataset) -> Result<Self> {
        let samples = (0..source.count())
            .map(|i| source.get_sample(i))
            .collect::<Result<Vec<_>>>()?;
        VecDataset::new(source.sample_shape(), source.classes(), samples)
    }
}

impl Dataset for VecDataset {
    fn count(&self) -> usize {
        self.samples.len()
    }

    fn get_sample(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            Error::Dataset(format!(
                "index {index} out of range for {} samples",
                self.samples.len()
            ))
        })
    }

    fn sample_shape(&self) -> Shape {
        self.shape
    }

    fn classes(&self) -> usize {
        self.classes
    }

    fn name(&self) -> &str {
        "vec"
    }
}

// SyntheticDataset — Class-conditional Gaussian blobs
//
// Each class gets a random prototype image drawn once from N(0, 1). A sample
// of class k is prototype_k plus N(0, noise) per pixel, with labels assigned
// round-robin. Everything is derived from the seed, so the same arguments
// always produce the same dataset, and samples are generated on demand
// rather than stored.

/// Reproducible, separable toy data for demos and tests.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    shape: Shape,
    classes: usize,
    count: usize,
    noise: f32,
    seed: u64,
    prototypes: Vec<Vec<f32>>,
}

impl SyntheticDataset {
    pub fn new(shape: Shape, classes: usize, count: usize, noise: f32, seed: u64) -> Result<Self> {
        if classes == 0 {
            return Err(Error::Dataset("synthetic dataset needs at least one class".into()));
        }
        let shape = Shape::new(1, shape.c(), shape.h(), shape.w());
        let unit = Normal::new(0.0f32, 1.0).map_err(|e| Error::Dataset(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let prototypes = (0..classes)
            .map(|_| (0..shape.size()).map(|_| unit.sample(&mut rng)).collect())
            .collect();
        // Validate the noise level once so get_sample cannot fail on it.
        Normal::new(0.0f32, noise).map_err(|e| Error::Dataset(e.to_string()))?;
        Ok(SyntheticDataset {
            shape,
            classes,
            count,
            noise,
            seed,
            prototypes,
        })
    }

    /// A dataset of `count` fresh samples around the same class prototypes,
    /// with noise drawn from `seed`. Used for held-out evaluation sets.
    pub fn resample(&self, count: usize, seed: u64) -> Self {
        SyntheticDataset {
            count,
            seed,
            ..self.clone()
        }
    }
}

impl Dataset for SyntheticDataset {
    fn count(&self) -> usize {
        self.count
    }

    fn get_sample(&self, index: usize) -> Result<Sample> {
        if index >= self.count {
            return Err(Error::Dataset(format!(
                "index {index} out of range for {} samples",
                self.count
            )));
        }
        let label = index % self.classes;
        let noise = Normal::new(0.0f32, self.noise).map_err(|e| Error::Dataset(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(self.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let data = self.prototypes[label]
            .iter()
            .map(|&p| p + noise.sample(&mut rng))
            .collect();
        Ok(Sample { data, label })
    }

    fn sample_shape(&self) -> Shape {
        self.shape
    }

    fn classes(&self) -> usize {
        self.classes
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
