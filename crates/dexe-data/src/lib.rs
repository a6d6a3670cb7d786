//! # dexe-data
//!
//! Training-data sources for dexe.
//!
//! - [`Dataset`] — `count()` / `get_sample(i)` over flattened samples with labels
//! - [`VecDataset`] — in-memory samples, length-checked on construction
//! - [`SyntheticDataset`] — seeded class-conditional Gaussian blobs
//! - [`Indices`] — visiting order, shuffled with the [`Context`](dexe_core::Context) generator

pub mod dataset;
pub mod loader;

pub use dataset::{Dataset, Sample, SyntheticDataset, VecDataset};
pub use loader::{samples, Indices};
