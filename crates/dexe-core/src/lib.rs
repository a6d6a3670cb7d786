//! # dexe-core
//!
//! Memory model and numeric primitives for dexe.
//!
//! This crate provides:
//! - [`Buffer`] — owning numeric vector with the elementwise/reduction/random-init set
//! - [`Shape`] — immutable NCHW shape with row-major offset arithmetic
//! - [`Tensor`] / [`TensorDescriptor`] — a shaped buffer plus its kernel descriptor
//! - [`ActivationSlot`] — the (value, gradient) pair on each graph edge
//! - [`ParamStore`] / [`ParamRange`] — the flat parameter and gradient arena
//! - [`Context`] — explicit backend handle (random generator, device)
//! - [`Scalar`] / [`DType`] — f32 and f64 element types

pub mod buffer;
pub mod context;
pub mod dtype;
pub mod error;
pub mod param;
pub mod shape;
pub mod tensor;

pub use buffer::Buffer;
pub use context::Context;
pub use dtype::{DType, Scalar};
pub use error::{Error, Result};
pub use param::{ParamRange, ParamStore};
pub use shape::Shape;
pub use tensor::{ActivationSlot, Tensor, TensorDescriptor};
