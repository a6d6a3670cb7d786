use crate::buffer::Buffer;
use crate::dtype::Scalar;
use crate::error::{Error, Result};

// ParamStore — The flat parameter arena and its gradient mirror
//
// Every learnable weight in a network lives in ONE contiguous buffer, and
// every gradient in a second buffer of the same length:
//
//   params: [ conv.w conv.b | squash.w squash.b | ... ]
//   grads:  [ conv.w conv.b | squash.w squash.b | ... ]
//            ^ range 0       ^ range 1
//
// Bulk work (the optimiser step, L2, save/load, gradient checking) runs over
// the whole buffer in one pass. Per-operation work sees only the operation's
// own slice, addressed by a ParamRange. An operation stores the range, not a
// reference, and borrows the slice from the store for the duration of one
// call. The store is laid out once and never resized afterwards, so a range
// handed out at layout time stays valid for the store's whole life.

/// An operation's `(offset, len)` window into the flat arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamRange {
    pub offset: usize,
    pub len: usize,
}

impl ParamRange {
    pub fn new(offset: usize, len: usize) -> Self {
        ParamRange { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn as_range(&self) -> std::ops::Range<usize> {
        self.offset..self.end()
    }
}

/// Owns the flat parameter buffer and the parallel gradient buffer.
#[derive(Debug, Clone)]
pub struct ParamStore<F: Scalar> {
    params: Buffer<F>,
    grads: Buffer<F>,
    ranges: Vec<ParamRange>,
}

impl<F: Scalar> ParamStore<F> {
    /// An empty arena (a network with no learnable operations).
    pub fn empty() -> Self {
        ParamStore {
            params: Buffer::from_vec(Vec::new()),
            grads: Buffer::from_vec(Vec::new()),
            ranges: Vec::new(),
        }
    }

    /// Lay out one contiguous range per count, in order, and allocate both
    /// buffers (zeroed) to the total.
    pub fn layout(counts: &[usize]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(counts.len());
        let mut offset = 0usize;
        for &len in counts {
            ranges.push(ParamRange::new(offset, len));
            offset += len;
        }
        Ok(ParamStore {
            params: Buffer::new(offset)?,
            grads: Buffer::new(offset)?,
            ranges,
        })
    }

    /// Total number of scalars in the arena.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// The ranges assigned by `layout`, in registration order.
    pub fn ranges(&self) -> &[ParamRange] {
        &self.ranges
    }

    fn check(&self, range: ParamRange) -> Result<std::ops::Range<usize>> {
        if range.end() > self.params.len() {
            return Err(Error::RangeOutOfBounds {
                offset: range.offset,
                end: range.end(),
                len: self.params.len(),
            });
        }
        Ok(range.as_range())
    }

    pub fn weights(&self, range: ParamRange) -> Result<&[F]> {
        let r = self.check(range)?;
        Ok(&self.params.as_slice()[r])
    }

    pub fn weights_mut(&mut self, range: ParamRange) -> Result<&mut [F]> {
        let r = self.check(range)?;
        Ok(&mut self.params.as_mut_slice()[r])
    }

    pub fn grads(&self, range: ParamRange) -> Result<&[F]> {
        let r = self.check(range)?;
        Ok(&self.grads.as_slice()[r])
    }

    pub fn grads_mut(&mut self, range: ParamRange) -> Result<&mut [F]> {
        let r = self.check(range)?;
        Ok(&mut self.grads.as_mut_slice()[r])
    }

    /// Borrow an operation's weights and gradients at the same time.
    pub fn split(&mut self, range: ParamRange) -> Result<(&[F], &mut [F])> {
        let r = self.check(range)?;
        Ok((&self.params.as_slice()[r.clone()], &mut self.grads.as_mut_slice()[r]))
    }

    pub fn params(&self) -> &Buffer<F> {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Buffer<F> {
        &mut self.params
    }

    pub fn grad_buffer(&self) -> &Buffer<F> {
        &self.grads
    }

    pub fn grad_buffer_mut(&mut self) -> &mut Buffer<F> {
        &mut self.grads
    }

    /// `params -= lr * grads`, then zero the gradients.
    pub fn step(&mut self, lr: F) -> Result<()> {
        self.params.axpy(-lr, self.grads.as_slice())?;
        self.grads.zero();
        Ok(())
    }

    /// `grads += lambda * params`.
    pub fn add_l2(&mut self, lambda: F) -> Result<()> {
        self.grads.axpy(lambda, self.params.as_slice())?;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grads.zero();
    }
}
