// Operation — The interface every graph node implements
//
// A network is a chain of operations joined by activation slots:
//
//   slot 0 ──op 0──▶ slot 1 ──op 1──▶ ... ──op N-1──▶ slot N
//
// Each operation is a plain struct holding only its configuration (kernel
// size, channel counts) plus whatever state its backward pass needs from
// forward (pooling remembers where each maximum was). It never owns the
// activations around it; the network hands them in on every call.
//
// LEARNABLE OPERATIONS:
//
// Operations with weights also implement `Parametrised`. They do not own
// their weights either. At `finish()` the network lays out a single flat
// arena (ParamStore) and binds each learnable operation to its ParamRange.
// From then on forward/backward borrow the operation's slice from the store
// passed into the call:
//
//   forward(store, x, y)             reads store.weights(range)
//   backward(store, x, y, gy, gx)    reads store.weights(range), writes gx
//   backward_weights(store, x, gy)   accumulates into store.grads_mut(range)
//
// The data-gradient and weight-gradient passes are separate calls: gx needs
// the weights and gy, the weight gradient needs x and gy.

use dexe_core::{Buffer, Context, Error, ParamRange, ParamStore, Result, Scalar, Shape, Tensor};

/// A node in the computation chain.
pub trait Operation<F: Scalar>: Send {
    /// Short, stable name used in logs, errors and `describe()`.
    fn name(&self) -> &'static str;

    /// Shape this operation produces from `input`.
    ///
    /// Pure and deterministic. Called once at graph-construction time, where
    /// an incompatible input is rejected.
    fn output_shape(&self, input: &Shape) -> Result<Shape>;

    /// Compute `y` from `x`. `y` is written in full.
    fn forward(&mut self, store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()>;

    /// Compute `grad_x` from `grad_y` (overwriting it).
    fn backward(
        &mut self,
        store: &ParamStore<F>,
        x: &Tensor<F>,
        y: &Tensor<F>,
        grad_y: &Tensor<F>,
        grad_x: &mut Tensor<F>,
    ) -> Result<()>;

    /// The learnable side of this operation, if any.
    fn parametrised(&self) -> Option<&dyn Parametrised<F>> {
        None
    }

    fn parametrised_mut(&mut self) -> Option<&mut dyn Parametrised<F>> {
        None
    }

    /// Human-readable configuration, e.g. `"5x5, 3 -> 8"`.
    fn describe(&self) -> String {
        String::new()
    }

    /// True for a channel softmax. A network ending in one defaults to the
    /// cross-entropy loss.
    fn is_softmax(&self) -> bool {
        false
    }
}

/// Capability of operations that own a window of the flat parameter arena.
pub trait Parametrised<F: Scalar> {
    /// Number of scalars this operation needs in the arena.
    fn n_params(&self) -> usize;

    /// Attach the operation to its window. `range.len` must equal `n_params()`.
    fn bind(&mut self, range: ParamRange) -> Result<()>;

    /// The bound window, or `None` before `finish()`.
    fn range(&self) -> Option<ParamRange>;

    /// Accumulate the weight gradient for input `x` and output gradient
    /// `grad_y` into this operation's gradient slice. Never overwrites.
    fn backward_weights(
        &self,
        store: &mut ParamStore<F>,
        x: &Tensor<F>,
        grad_y: &Tensor<F>,
    ) -> Result<()>;

    /// Fill this operation's weights with N(mean, std).
    fn init_normal(
        &self,
        store: &mut ParamStore<F>,
        ctx: &mut Context,
        mean: F,
        std: F,
    ) -> Result<()> {
        let range = self.range().ok_or(Error::Unbound { op: "parametrised" })?;
        let mut fresh = Buffer::new(range.len)?;
        fresh.init_normal(ctx, mean, std)?;
        store.weights_mut(range)?.copy_from_slice(fresh.as_slice());
        Ok(())
    }

    /// Fill this operation's weights with U(-var, var).
    fn init_uniform(&self, store: &mut ParamStore<F>, ctx: &mut Context, var: F) -> Result<()> {
        let range = self.range().ok_or(Error::Unbound { op: "parametrised" })?;
        let mut fresh = Buffer::new(range.len)?;
        fresh.init_uniform(ctx, var)?;
        store.weights_mut(range)?.copy_from_slice(fresh.as_slice());
        Ok(())
    }

    /// Hook run on this operation's weights after every flat-buffer update.
    /// Used for per-operation rules layered on the bulk step (e.g. clipping).
    fn post_update(&self, _weights: &mut [F]) {}
}

// FilterBank — Weight layout shared by convolution and squash
//
// A filter bank is `out_c` filters of `[in_c, kh, kw]`, followed by one bias
// per output channel, laid out back to back in the operation's window:
//
//   [ W[0,0,0,0] ... W[out_c-1, in_c-1, kh-1, kw-1] | b[0] ... b[out_c-1] ]
//
// The bank itself holds only dimensions and the bound range.

/// Weight geometry `[out_c, in_c, kh, kw]` plus biases, and its arena window.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterBank {
    pub out_c: usize,
    pub in_c: usize,
    pub kh: usize,
    pub kw: usize,
    range: Option<ParamRange>,
    clip: Option<f64>,
}

impl FilterBank {
    pub fn new(out_c: usize, in_c: usize, kh: usize, kw: usize) -> Self {
        FilterBank {
            out_c,
            in_c,
            kh,
            kw,
            range: None,
            clip: None,
        }
    }

    /// Elements in one filter (`in_c * kh * kw`).
    pub fn filter_size(&self) -> usize {
        self.in_c * self.kh * self.kw
    }

    /// Number of filter weights, excluding biases.
    pub fn n_weights(&self) -> usize {
        self.out_c * self.filter_size()
    }

    /// Weights plus biases.
    pub fn n_params(&self) -> usize {
        self.n_weights() + self.out_c
    }

    /// Linear index of `W[o, i, ky, kx]` within the window.
    pub fn index(&self, o: usize, i: usize, ky: usize, kx: usize) -> usize {
        ((o * self.in_c + i) * self.kh + ky) * self.kw + kx
    }

    pub fn range(&self) -> Option<ParamRange> {
        self.range
    }

    /// Limit every weight to `[-limit, limit]` after each update.
    pub fn set_clip(&mut self, limit: Option<f64>) {
        self.clip = limit;
    }

    pub fn clip(&self) -> Option<f64> {
        self.clip
    }

    pub fn bind(&mut self, op: &'static str, range: ParamRange) -> Result<()> {
        if range.len != self.n_params() {
            return Err(Error::InvalidConfig(format!(
                "{op}: range of {} scalars bound to a bank of {}",
                range.len,
                self.n_params()
            )));
        }
        self.range = Some(range);
        Ok(())
    }

    fn bound(&self, op: &'static str) -> Result<ParamRange> {
        self.range.ok_or(Error::Unbound { op })
    }

    /// Borrow `(weights, biases)` from the arena.
    pub fn params<'a, F: Scalar>(
        &self,
        op: &'static str,
        store: &'a ParamStore<F>,
    ) -> Result<(&'a [F], &'a [F])> {
        let all = store.weights(self.bound(op)?)?;
        Ok(all.split_at(self.n_weights()))
    }

    /// Borrow `(weight grads, bias grads)` from the arena.
    pub fn grads_mut<'a, F: Scalar>(
        &self,
        op: &'static str,
        store: &'a mut ParamStore<F>,
    ) -> Result<(&'a mut [F], &'a mut [F])> {
        let n_weights = self.n_weights();
        let all = store.grads_mut(self.bound(op)?)?;
        Ok(all.split_at_mut(n_weights))
    }

    /// Clip the filter weights in place if a limit is set. Biases are left alone.
    pub fn apply_clip<F: Scalar>(&self, weights: &mut [F]) {
        if let Some(limit) = self.clip {
            let limit = F::from_f64(limit.abs());
            let n = self.n_weights().min(weights.len());
            for w in &mut weights[..n] {
                *w = (*w).max(-limit).min(limit);
            }
        }
    }
}

/// Input shape check shared by operations that fix their input channels.
pub(crate) fn expect_channels(input: &Shape, c: usize) -> Result<()> {
    if input.c() != c {
        return Err(Error::ShapeMismatch {
            expected: input.with_c(c),
            got: *input,
        });
    }
    Ok(())
}

/// Shape check for tensors handed to forward/backward.
pub(crate) fn expect_shape<F: Scalar>(t: &Tensor<F>, shape: Shape) -> Result<()> {
    if t.shape() != shape {
        return Err(Error::ShapeMismatch {
            expected: shape,
            got: t.shape(),
        });
    }
    Ok(())
}
