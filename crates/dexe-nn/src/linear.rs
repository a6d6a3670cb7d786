// Squash — Fully connected layer over a whole sample
//
// Squash collapses each sample `[C, H, W]` into `out_c` numbers:
//
//   y[n, o, 0, 0] = b[o] + Σ_k W[o, k] · x[n, k]     (k runs over C·H·W)
//
// The filter bank is `[out_c, C, H, W]`, i.e. one filter exactly the size of
// the input sample, so this is a convolution whose kernel covers the input.
// Written as a matrix product over flattened samples:
//
//   Y  = X · Wᵀ + b        X: [N, K]   W: [out_c, K]   Y: [N, out_c]
//   dX = dY · W
//   dW += dYᵀ · X
//   db += Σ_n dY

use rayon::prelude::*;

use dexe_core::{Error, ParamRange, ParamStore, Result, Scalar, Shape, Tensor};

use crate::operation::{expect_shape, FilterBank, Operation, Parametrised};

/// Fully connected layer producing `[N, out_c, 1, 1]`.
#[derive(Debug, Clone)]
pub struct Squash {
    bank: FilterBank,
}

impl Squash {
    /// Build for samples shaped like `input` (its batch size is ignored).
    pub fn new(input: &Shape, out_c: usize) -> Result<Self> {
        if out_c == 0 || input.sample_size() == 0 {
            return Err(Error::InvalidConfig(format!(
                "squash of {input} into {out_c} outputs"
            )));
        }
        Ok(Squash {
            bank: FilterBank::new(out_c, input.c(), input.h(), input.w()),
        })
    }

    /// Clip filter weights into `[-limit, limit]` after every update.
    pub fn with_weight_clip(mut self, limit: f64) -> Self {
        self.bank.set_clip(Some(limit));
        self
    }

    pub fn bank(&self) -> &FilterBank {
        &self.bank
    }

    fn sample_shape(&self, n: usize) -> Shape {
        Shape::new(n, self.bank.in_c, self.bank.kh, self.bank.kw)
    }
}

impl<F: Scalar> Operation<F> for Squash {
    fn name(&self) -> &'static str {
        "squash"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let expected = self.sample_shape(input.n());
        if *input != expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: *input,
            });
        }
        Ok(Shape::new(input.n(), self.bank.out_c, 1, 1))
    }

    fn forward(&mut self, store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(y, ys)?;
        let (weights, bias) = self.bank.params("squash", store)?;
        let k = self.bank.filter_size();
        let out_c = self.bank.out_c;
        let xd = x.data()?;

        y.data_mut()?
            .par_chunks_mut(out_c)
            .zip(xd.par_chunks(k))
            .for_each(|(row, sample)| {
                for (o, out) in row.iter_mut().enumerate() {
                    let filter = &weights[o * k..(o + 1) * k];
                    *out = filter
                        .iter()
                        .zip(sample)
                        .fold(bias[o], |acc, (&w, &v)| acc + w * v);
                }
            });
        Ok(())
    }

    fn backward(
        &mut self,
        store: &ParamStore<F>,
        x: &Tensor<F>,
        _y: &Tensor<F>,
        grad_y: &Tensor<F>,
        grad_x: &mut Tensor<F>,
    ) -> Result<()> {
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(grad_y, ys)?;
        expect_shape(grad_x, x.shape())?;
        let (weights, _) = self.bank.params("squash", store)?;
        let k = self.bank.filter_size();
        let out_c = self.bank.out_c;
        let gy = grad_y.data()?;

        grad_x
            .data_mut()?
            .par_chunks_mut(k)
            .zip(gy.par_chunks(out_c))
            .for_each(|(gx, g)| {
                gx.iter_mut().for_each(|v| *v = F::zero());
                for (o, &go) in g.iter().enumerate() {
                    let filter = &weights[o * k..(o + 1) * k];
                    for (v, &w) in gx.iter_mut().zip(filter) {
                        *v = *v + w * go;
                    }
                }
            });
        Ok(())
    }

    fn parametrised(&self) -> Option<&dyn Parametrised<F>> {
        Some(self)
    }

    fn parametrised_mut(&mut self) -> Option<&mut dyn Parametrised<F>> {
        Some(self)
    }

    fn describe(&self) -> String {
        format!(
            "[{}, {}, {}] -> {}",
            self.bank.in_c, self.bank.kh, self.bank.kw, self.bank.out_c
        )
    }
}

impl<F: Scalar> Parametrised<F> for Squash {
    fn n_params(&self) -> usize {
        self.bank.n_params()
    }

    fn bind(&mut self, range: ParamRange) -> Result<()> {
        self.bank.bind("squash", range)
    }

    fn range(&self) -> Option<ParamRange> {
        self.bank.range()
    }

    fn backward_weights(
        &self,
        store: &mut ParamStore<F>,
        x: &Tensor<F>,
        grad_y: &Tensor<F>,
    ) -> Result<()> {
        let xs = x.shape();
        let ys = Operation::<F>::output_shape(self, &xs)?;
        expect_shape(grad_y, ys)?;
        let k = self.bank.filter_size();
        let out_c = self.bank.out_c;
        let xd = x.data()?;
        let gy = grad_y.data()?;
        let (gw, gb) = self.bank.grads_mut("squash", store)?;

        gw.par_chunks_mut(k).enumerate().for_each(|(o, filter)| {
            for n in 0..xs.n() {
                let go = gy[n * out_c + o];
                let sample = &xd[n * k..(n + 1) * k];
                for (g, &v) in filter.iter_mut().zip(sample) {
                    *g = *g + go * v;
                }
            }
        });
        for (o, b) in gb.iter_mut().enumerate() {
            for n in 0..xs.n() {
                *b = *b + gy[n * out_c + o];
            }
        }
        Ok(())
    }

    fn post_update(&self, weights: &mut [F]) {
        self.bank.apply_clip(weights);
    }
}
