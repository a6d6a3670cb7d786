//! # dexe-nn
//!
//! Graph operations and loss functions for dexe.
//!
//! Every node implements the [`Operation`] trait; nodes with weights also
//! implement [`Parametrised`] and read them from the flat arena
//! ([`ParamStore`](dexe_core::ParamStore)) passed into each call.
//!
//! 1. **Convolution** — stride-1 filter bank with bias, optional zero padding
//! 2. **MaxPool** — non-overlapping max pooling with cached argmax
//! 3. **Squash** — fully connected over a whole sample
//! 4. **Tanh / Relu / Softmax** — activations
//! 5. **Unsquash / Merge / Split** — structural reshapes
//! 6. **Loss** — softmax cross-entropy and squared error

pub mod activation;
pub mod conv;
pub mod linear;
pub mod loss;
pub mod operation;
pub mod reshape;

pub use activation::{Relu, Softmax, Tanh};
pub use conv::{Convolution, MaxPool};
pub use linear::Squash;
pub use loss::{argmax, Loss, LossState};
pub use operation::{FilterBank, Operation, Parametrised};
pub use reshape::{Merge, Split, Unsquash};
