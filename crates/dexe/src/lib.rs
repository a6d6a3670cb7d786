//! # Dexe
//!
//! A minimal convolutional network training engine.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use dexe::prelude::*;
//!
//! # fn main() -> dexe::Result<()> {
//! let mut net = Network::<f32>::new(Shape::new(1, 1, 8, 8));
//! net.add_conv(4, 3, 3)?.add_tanh()?.add_pool(2, 2)?;
//! net.add_squash(2)?.add_softmax()?;
//! net.finish()?;
//! net.init_normal(&mut Context::seeded(0), 0.0, 0.1)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `dexe-core` | Buffer, Shape, Tensor, ActivationSlot, ParamStore, Context, Error |
//! | `dexe-nn` | Operations (Convolution, MaxPool, Squash, activations, reshapes), Loss |
//! | `dexe-data` | Dataset trait, VecDataset, SyntheticDataset, shuffled Indices |
//!
//! ## Modules
//!
//! - [`network`] — graph driver: build, finish, forward, loss, backward, update
//! - [`checkpoint`] — save/load the flat parameter buffer
//! - [`train`] — epoch loop over a dataset
//! - [`adversarial`] — fast-gradient-sign examples

/// Re-export core types.
pub use dexe_core::{
    ActivationSlot, Buffer, Context, DType, Error, ParamRange, ParamStore, Result, Scalar, Shape,
    Tensor, TensorDescriptor,
};

/// Re-export graph operations and losses.
pub mod nn {
    pub use dexe_nn::*;
}

/// Re-export data sources.
pub mod data {
    pub use dexe_data::*;
}

/// Network — the operation chain, its slots and its parameter arena.
pub mod network;

/// Checkpoint — save and load model parameters.
pub mod checkpoint;

/// Training loop — epochs, batching, per-epoch statistics.
pub mod train;

/// Adversarial examples — fast gradient sign.
pub mod adversarial;

pub use network::Network;
pub use train::{EpochStats, TrainConfig, Trainer};

/// Install a `tracing` subscriber that writes to stderr.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling this
/// more than once is harmless; only the first subscriber is installed.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::adversarial::{add_n_adversarial, make_adversarial_dataset, perturb};
    pub use crate::data::{Dataset, Indices, Sample, SyntheticDataset, VecDataset};
    pub use crate::network::Network;
    pub use crate::nn::{
        Convolution, Loss, MaxPool, Merge, Operation, Parametrised, Relu, Softmax, Split, Squash,
        Tanh, Unsquash,
    };
    pub use crate::train::{EpochStats, TrainConfig, Trainer};
    pub use crate::{Context, DType, Error, Result, Scalar, Shape, Tensor};
}
