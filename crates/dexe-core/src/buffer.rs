// Buffer — Owning fixed-size numeric vector
//
// The leaf primitive everything else is built on. A Buffer is a contiguous
// run of scalars with the fixed operation set the engine relies on:
//
//   elementwise:  sqrt, abs, pow(e), exp, clip(limit)
//   point update: add_at(idx, val)
//   vector-vector: add, sub, mul, div (lengths must match)
//   vector-scalar: scale, add_scalar, div_scalar
//   reductions:   asum (sum of |x|), norm, norm2
//   random init:  init_normal, add_normal, init_uniform
//   host copies:  to_vec, copy_from_slice
//
// Methods return `&mut Self` so calls chain the way the elementwise kernels
// did (`g.scale(-lr); p.add(&g)?;`). Large buffers are processed with rayon;
// each element is independent, so the parallel and sequential paths produce
// identical results.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::context::Context;
use crate::dtype::Scalar;
use crate::error::{Error, Result};

/// Below this many elements, elementwise passes stay on the calling thread.
const PAR_THRESHOLD: usize = 1 << 15;

/// Owning, fixed-size vector of scalars.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer<F: Scalar> {
    data: Vec<F>,
}

impl<F: Scalar> Buffer<F> {
    /// Allocate `n` zeroed elements.
    ///
    /// Allocation failure is reported as a backend error rather than aborting
    /// the process.
    pub fn new(n: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(n).map_err(|e| {
            Error::backend("ALLOC_FAILED", format!("allocating {n} elements: {e}"))
        })?;
        data.resize(n, F::zero());
        Ok(Buffer { data })
    }

    /// Take ownership of host data.
    pub fn from_vec(data: Vec<F>) -> Self {
        Buffer { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[F] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [F] {
        &mut self.data
    }

    /// Change the element count. Contents are zeroed either way.
    pub fn resize(&mut self, n: usize) -> Result<()> {
        if n != self.data.len() {
            *self = Buffer::new(n)?;
        } else {
            self.zero();
        }
        Ok(())
    }

    pub fn zero(&mut self) -> &mut Self {
        self.fill(F::zero())
    }

    /// Zero every element from `offset` to the end.
    pub fn zero_from(&mut self, offset: usize) -> &mut Self {
        let start = offset.min(self.data.len());
        self.data[start..].iter_mut().for_each(|v| *v = F::zero());
        self
    }

    pub fn fill(&mut self, val: F) -> &mut Self {
        self.data.iter_mut().for_each(|v| *v = val);
        self
    }

    //  Host transfers

    /// Copy the contents out to a host vector.
    pub fn to_vec(&self) -> Vec<F> {
        self.data.clone()
    }

    /// Overwrite the contents from host memory. Lengths must match.
    pub fn copy_from_slice(&mut self, src: &[F]) -> Result<&mut Self> {
        check_len(self.data.len(), src.len())?;
        self.data.copy_from_slice(src);
        Ok(self)
    }

    //  Elementwise unary

    pub fn sqrt(&mut self) -> &mut Self {
        self.map_inplace(|v| v.sqrt())
    }

    pub fn abs(&mut self) -> &mut Self {
        self.map_inplace(|v| v.abs())
    }

    pub fn pow(&mut self, e: F) -> &mut Self {
        self.map_inplace(move |v| v.powf(e))
    }

    pub fn exp(&mut self) -> &mut Self {
        self.map_inplace(|v| v.exp())
    }

    /// Clamp every element into `[-limit, limit]`.
    pub fn clip(&mut self, limit: F) -> &mut Self {
        let limit = limit.abs();
        self.map_inplace(move |v| v.max(-limit).min(limit))
    }

    /// Add `val` to the single element at `idx`.
    pub fn add_at(&mut self, idx: usize, val: F) -> Result<&mut Self> {
        let len = self.data.len();
        let slot = self.data.get_mut(idx).ok_or_else(|| {
            Error::backend("INVALID_VALUE", format!("index {idx} out of range for {len}"))
        })?;
        *slot = *slot + val;
        Ok(self)
    }

    //  Vector-vector

    pub fn add(&mut self, other: &Buffer<F>) -> Result<&mut Self> {
        self.zip_inplace(&other.data, |a, b| a + b)
    }

    pub fn sub(&mut self, other: &Buffer<F>) -> Result<&mut Self> {
        self.zip_inplace(&other.data, |a, b| a - b)
    }

    pub fn mul(&mut self, other: &Buffer<F>) -> Result<&mut Self> {
        self.zip_inplace(&other.data, |a, b| a * b)
    }

    pub fn div(&mut self, other: &Buffer<F>) -> Result<&mut Self> {
        self.zip_inplace(&other.data, |a, b| a / b)
    }

    /// `self += alpha * other` (BLAS axpy).
    pub fn axpy(&mut self, alpha: F, other: &[F]) -> Result<&mut Self> {
        self.zip_inplace(other, move |a, b| a + alpha * b)
    }

    //  Vector-scalar

    pub fn scale(&mut self, v: F) -> &mut Self {
        self.map_inplace(move |x| x * v)
    }

    pub fn add_scalar(&mut self, v: F) -> &mut Self {
        self.map_inplace(move |x| x + v)
    }

    pub fn div_scalar(&mut self, v: F) -> &mut Self {
        self.map_inplace(move |x| x / v)
    }

    //  Reductions

    /// Sum of absolute values (the BLAS `asum` convention).
    pub fn asum(&self) -> F {
        self.data.iter().fold(F::zero(), |acc, &v| acc + v.abs())
    }

    /// Sum of squares.
    pub fn norm2(&self) -> F {
        self.data.iter().fold(F::zero(), |acc, &v| acc + v * v)
    }

    /// Euclidean norm.
    pub fn norm(&self) -> F {
        self.norm2().sqrt()
    }

    //  Random initialisation

    /// Overwrite with samples from N(mean, std).
    pub fn init_normal(&mut self, ctx: &mut Context, mean: F, std: F) -> Result<&mut Self> {
        let dist = normal(mean, std)?;
        let rng = ctx.rng();
        for v in self.data.iter_mut() {
            *v = F::from_f64(dist.sample(rng));
        }
        Ok(self)
    }

    /// Add samples from N(mean, std) to the current contents.
    pub fn add_normal(&mut self, ctx: &mut Context, mean: F, std: F) -> Result<&mut Self> {
        let dist = normal(mean, std)?;
        let rng = ctx.rng();
        for v in self.data.iter_mut() {
            *v = *v + F::from_f64(dist.sample(rng));
        }
        Ok(self)
    }

    /// Overwrite with samples from U(-var, var).
    pub fn init_uniform(&mut self, ctx: &mut Context, var: F) -> Result<&mut Self> {
        let var = var.to_f64();
        if !var.is_finite() || var < 0.0 {
            return Err(Error::backend(
                "INVALID_VALUE",
                format!("uniform range must be finite and non-negative, got {var}"),
            ));
        }
        let rng = ctx.rng();
        for v in self.data.iter_mut() {
            *v = F::from_f64(rng.gen_range(-var..=var));
        }
        Ok(self)
    }

    //  Internals

    fn map_inplace(&mut self, f: impl Fn(F) -> F + Send + Sync) -> &mut Self {
        if self.data.len() >= PAR_THRESHOLD {
            self.data.par_iter_mut().for_each(|v| *v = f(*v));
        } else {
            self.data.iter_mut().for_each(|v| *v = f(*v));
        }
        self
    }

    fn zip_inplace(&mut self, other: &[F], f: impl Fn(F, F) -> F + Send + Sync) -> Result<&mut Self> {
        check_len(self.data.len(), other.len())?;
        if self.data.len() >= PAR_THRESHOLD {
            self.data
                .par_iter_mut()
                .zip(other.par_iter())
                .for_each(|(a, &b)| *a = f(*a, b));
        } else {
            self.data
                .iter_mut()
                .zip(other.iter())
                .for_each(|(a, &b)| *a = f(*a, b));
        }
        Ok(self)
    }
}

fn check_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::LengthMismatch { expected, got });
    }
    Ok(())
}

fn normal<F: Scalar>(mean: F, std: F) -> Result<Normal<f64>> {
    Normal::new(mean.to_f64(), std.to_f64()).map_err(|e| {
        Error::backend(
            "INVALID_VALUE",
            format!("normal(mean={mean}, std={std}): {e}"),
        )
    })
}
