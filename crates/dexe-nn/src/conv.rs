// Convolution & MaxPool — Spatial operations
//
// Convolution slides `out_c` learnable filters of `[in_c, kh, kw]` over an
// input `[N, in_c, H, W]`, one output plane per filter plus a per-channel bias.
//
// MaxPool keeps the largest value of each non-overlapping `kh x kw` window
// and remembers where it was, so backward can route the gradient there.
//
// OUTPUT SIZE (stride 1 convolution, symmetric zero padding p):
//
//   H_out = H + 2p - kh + 1
//   W_out = W + 2p - kw + 1
//
// OUTPUT SIZE (pooling, stride = kernel, floor):
//
//   H_out = H / kh
//   W_out = W / kw
//
// GRADIENTS (convolution, with iy = oy + ky - p, ix = ox + kx - p):
//
//   gx[n,i,iy,ix]  = Σ_{o,ky,kx}   W[o,i,ky,kx] · gy[n,o,oy,ox]
//   gW[o,i,ky,kx] += Σ_{n,oy,ox}   x[n,i,iy,ix] · gy[n,o,oy,ox]
//   gb[o]         += Σ_{n,oy,ox}   gy[n,o,oy,ox]
//
// Every loop is written as a gather over the element being produced, so
// output planes are independent and are computed in parallel with rayon.

use rayon::prelude::*;

use dexe_core::{Error, ParamRange, ParamStore, Result, Scalar, Shape, Tensor};

use crate::operation::{expect_channels, expect_shape, FilterBank, Operation, Parametrised};

/// 2D convolution, stride 1, with a learnable filter bank and bias.
#[derive(Debug, Clone)]
pub struct Convolution {
    bank: FilterBank,
    padding: usize,
}

impl Convolution {
    /// `out_c` filters of `[in_c, kh, kw]` with no padding.
    pub fn new(in_c: usize, out_c: usize, kw: usize, kh: usize) -> Result<Self> {
        if out_c == 0 || in_c == 0 || kw == 0 || kh == 0 {
            return Err(Error::InvalidConfig(format!(
                "convolution needs non-zero sizes, got in_c={in_c} out_c={out_c} kernel={kw}x{kh}"
            )));
        }
        Ok(Convolution {
            bank: FilterBank::new(out_c, in_c, kh, kw),
            padding: 0,
        })
    }

    /// Zero-pad the input by `padding` on every side.
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Clip filter weights into `[-limit, limit]` after every update.
    pub fn with_weight_clip(mut self, limit: f64) -> Self {
        self.bank.set_clip(Some(limit));
        self
    }

    pub fn bank(&self) -> &FilterBank {
        &self.bank
    }

    pub fn padding(&self) -> usize {
        self.padding
    }
}

/// Signed input coordinate for output `o` and kernel tap `k`, or `None` when
/// it falls in the zero padding.
#[inline]
fn tap(o: usize, k: usize, pad: usize, extent: usize) -> Option<usize> {
    let pos = (o + k).checked_sub(pad)?;
    (pos < extent).then_some(pos)
}

impl<F: Scalar> Operation<F> for Convolution {
    fn name(&self) -> &'static str {
        "convolution"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        expect_channels(input, self.bank.in_c)?;
        if input.h() == 0 || input.w() == 0 {
            return Err(Error::InvalidConfig(format!(
                "convolution input {input} has an empty plane"
            )));
        }
        let (ph, pw) = (input.h() + 2 * self.padding, input.w() + 2 * self.padding);
        if self.bank.kh > ph || self.bank.kw > pw {
            return Err(Error::InvalidConfig(format!(
                "convolution kernel {}x{} larger than padded input {}x{}",
                self.bank.kw, self.bank.kh, pw, ph
            )));
        }
        Ok(Shape::new(
            input.n(),
            self.bank.out_c,
            ph - self.bank.kh + 1,
            pw - self.bank.kw + 1,
        ))
    }

    fn forward(&mut self, store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        let xs = x.shape();
        let ys = Operation::<F>::output_shape(self, &xs)?;
        expect_shape(y, ys)?;
        let (weights, bias) = self.bank.params("convolution", store)?;
        let xd = x.data()?;
        let bank = &self.bank;
        let pad = self.padding;
        let plane = ys.plane_size();

        y.data_mut()?
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(idx, out)| {
                let (n, o) = (idx / ys.c(), idx % ys.c());
                for oy in 0..ys.h() {
                    for ox in 0..ys.w() {
                        let mut acc = bias[o];
                        for i in 0..bank.in_c {
                            for ky in 0..bank.kh {
                                let Some(iy) = tap(oy, ky, pad, xs.h()) else { continue };
                                for kx in 0..bank.kw {
                                    let Some(ix) = tap(ox, kx, pad, xs.w()) else { continue };
                                    acc = acc
                                        + weights[bank.index(o, i, ky, kx)]
                                            * xd[xs.offset(n, i, iy, ix)];
                                }
                            }
                        }
                        out[oy * ys.w() + ox] = acc;
                    }
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
        let xs = x.shape();
        let ys = Operation::<F>::output_shape(self, &xs)?;
        expect_shape(grad_y, ys)?;
        expect_shape(grad_x, xs)?;
        let (weights, _) = self.bank.params("convolution", store)?;
        let gy = grad_y.data()?;
        let bank = &self.bank;
        let pad = self.padding;

        grad_x
            .data_mut()?
            .par_chunks_mut(xs.plane_size())
            .enumerate()
            .for_each(|(idx, gx)| {
                let (n, i) = (idx / xs.c(), idx % xs.c());
                for iy in 0..xs.h() {
                    for ix in 0..xs.w() {
                        let mut acc = F::zero();
                        for ky in 0..bank.kh {
                            // oy = iy + pad - ky
                            let Some(oy) = (iy + pad).checked_sub(ky) else { continue };
                            if oy >= ys.h() {
                                continue;
                            }
                            for kx in 0..bank.kw {
                                let Some(ox) = (ix + pad).checked_sub(kx) else { continue };
                                if ox >= ys.w() {
                                    continue;
                                }
                                for o in 0..bank.out_c {
                                    acc = acc
                                        + weights[bank.index(o, i, ky, kx)]
                                            * gy[ys.offset(n, o, oy, ox)];
                                }
                            }
                        }
                        gx[iy * xs.w() + ix] = acc;
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
        let mut s = format!(
            "{}x{}, {} -> {}",
            self.bank.kw, self.bank.kh, self.bank.in_c, self.bank.out_c
        );
        if self.padding > 0 {
            s.push_str(&format!(", pad {}", self.padding));
        }
        s
    }
}

impl<F: Scalar> Parametrised<F> for Convolution {
    fn n_params(&self) -> usize {
        self.bank.n_params()
    }

    fn bind(&mut self, range: ParamRange) -> Result<()> {
        self.bank.bind("convolution", range)
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
        let xd = x.data()?;
        let gy = grad_y.data()?;
        let bank = &self.bank;
        let pad = self.padding;
        let (gw, gb) = bank.grads_mut("convolution", store)?;

        gw.par_chunks_mut(bank.filter_size())
            .enumerate()
            .for_each(|(o, filter)| {
                for i in 0..bank.in_c {
                    for ky in 0..bank.kh {
                        for kx in 0..bank.kw {
                            let mut acc = F::zero();
                            for n in 0..xs.n() {
                                for oy in 0..ys.h() {
                                    let Some(iy) = tap(oy, ky, pad, xs.h()) else { continue };
                                    for ox in 0..ys.w() {
                                        let Some(ix) = tap(ox, kx, pad, xs.w()) else { continue };
                                        acc = acc
                                            + xd[xs.offset(n, i, iy, ix)]
                                                * gy[ys.offset(n, o, oy, ox)];
                                    }
                                }
                            }
                            let k = (i * bank.kh + ky) * bank.kw + kx;
                            filter[k] = filter[k] + acc;
                        }
                    }
                }
            });

        for (o, b) in gb.iter_mut().enumerate() {
            let mut acc = F::zero();
            for n in 0..ys.n() {
                let start = ys.offset(n, o, 0, 0);
                for &g in &gy[start..start + ys.plane_size()] {
                    acc = acc + g;
                }
            }
            *b = *b + acc;
        }
        Ok(())
    }

    fn post_update(&self, weights: &mut [F]) {
        self.bank.apply_clip(weights);
    }
}

/// Max-pooling over non-overlapping windows (stride = kernel).
#[derive(Debug, Clone)]
pub struct MaxPool {
    kw: usize,
    kh: usize,
    /// Flat input index of each output's maximum, from the latest forward.
    argmax: Vec<usize>,
    /// (input, output) shapes of the latest forward.
    cached: Option<(Shape, Shape)>,
}

impl MaxPool {
    pub fn new(kw: usize, kh: usize) -> Result<Self> {
        if kw == 0 || kh == 0 {
            return Err(Error::InvalidConfig(format!(
                "pooling window must be non-empty, got {kw}x{kh}"
            )));
        }
        Ok(MaxPool {
            kw,
            kh,
            argmax: Vec::new(),
            cached: None,
        })
    }

    pub fn kernel(&self) -> (usize, usize) {
        (self.kw, self.kh)
    }

    /// Input indices chosen by the most recent forward, one per output.
    pub fn cached_indices(&self) -> Option<&[usize]> {
        self.cached.map(|_| self.argmax.as_slice())
    }
}

impl<F: Scalar> Operation<F> for MaxPool {
    fn name(&self) -> &'static str {
        "max_pool"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let (h, w) = (input.h() / self.kh, input.w() / self.kw);
        if h == 0 || w == 0 {
            return Err(Error::InvalidConfig(format!(
                "pooling window {}x{} larger than input {}x{}",
                self.kw,
                self.kh,
                input.w(),
                input.h()
            )));
        }
        Ok(input.with_hw(h, w))
    }

    fn forward(&mut self, _store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        let xs = x.shape();
        let ys = Operation::<F>::output_shape(self, &xs)?;
        expect_shape(y, ys)?;
        let xd = x.data()?;
        let yd = y.data_mut()?;

        self.argmax.clear();
        self.argmax.resize(ys.size(), 0);
        for n in 0..ys.n() {
            for c in 0..ys.c() {
                for oy in 0..ys.h() {
                    for ox in 0..ys.w() {
                        let mut best = xs.offset(n, c, oy * self.kh, ox * self.kw);
                        for ky in 0..self.kh {
                            for kx in 0..self.kw {
                                let idx = xs.offset(n, c, oy * self.kh + ky, ox * self.kw + kx);
                                if xd[idx] > xd[best] {
                                    best = idx;
                                }
                            }
                        }
                        let out = ys.offset(n, c, oy, ox);
                        self.argmax[out] = best;
                        yd[out] = xd[best];
                    }
                }
            }
        }
        self.cached = Some((xs, ys));
        Ok(())
    }

    fn backward(
        &mut self,
        _store: &ParamStore<F>,
        x: &Tensor<F>,
        _y: &Tensor<F>,
        grad_y: &Tensor<F>,
        grad_x: &mut Tensor<F>,
    ) -> Result<()> {
        let (xs, ys) = self
            .cached
            .ok_or(Error::MissingForwardCache { op: "max_pool" })?;
        expect_shape(x, xs)?;
        expect_shape(grad_y, ys)?;
        expect_shape(grad_x, xs)?;
        let gy = grad_y.data()?;
        let gx = grad_x.data_mut()?;
        gx.iter_mut().for_each(|v| *v = F::zero());
        for (&idx, &g) in self.argmax.iter().zip(gy.iter()) {
            gx[idx] = gx[idx] + g;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}x{}", self.kw, self.kh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_conv(in_c: usize, out_c: usize, k: usize, params: &[f64]) -> (Convolution, ParamStore<f64>) {
        let mut conv = Convolution::new(in_c, out_c, k, k).unwrap();
        let n = Parametrised::<f64>::n_params(&conv);
        let mut store = ParamStore::<f64>::layout(&[n]).unwrap();
        store.params_mut().copy_from_slice(params).unwrap();
        Parametrised::<f64>::bind(&mut conv, store.ranges()[0]).unwrap();
        (conv, store)
    }

    #[test]
    fn test_conv_output_shape() {
        let conv = Convolution::new(3, 8, 5, 5).unwrap();
        let s = Operation::<f32>::output_shape(&conv, &Shape::new(2, 3, 32, 32)).unwrap();
        assert_eq!(s, Shape::new(2, 8, 28, 28));

        let padded = Convolution::new(3, 8, 3, 3).unwrap().with_padding(1);
        let s = Operation::<f32>::output_shape(&padded, &Shape::new(1, 3, 8, 8)).unwrap();
        assert_eq!(s, Shape::new(1, 8, 8, 8));
    }

    #[test]
    fn test_conv_rejects_wrong_channels_and_big_kernel() {
        let conv = Convolution::new(3, 8, 5, 5).unwrap();
        let err = Operation::<f32>::output_shape(&conv, &Shape::new(1, 1, 32, 32)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        let err = Operation::<f32>::output_shape(&conv, &Shape::new(1, 3, 4, 4)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_conv_forward_known_values() {
        // One 2x2 filter of ones, bias 0.5, over a 3x3 ramp.
        let (mut conv, store) = bound_conv(1, 1, 2, &[1.0, 1.0, 1.0, 1.0, 0.5]);
        let x = Tensor::from_vec(Shape::new(1, 1, 3, 3), (1..=9).map(|v| v as f64).collect()).unwrap();
        let mut y = Tensor::new(Shape::new(1, 1, 2, 2)).unwrap();
        conv.forward(&store, &x, &mut y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![12.5, 16.5, 24.5, 28.5]);
    }

    #[test]
    fn test_conv_backward_data_and_weights() {
        let (mut conv, mut store) = bound_conv(1, 1, 2, &[1.0, 2.0, 3.0, 4.0, 0.0]);
        let x = Tensor::from_vec(Shape::new(1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = Tensor::new(Shape::new(1, 1, 1, 1)).unwrap();
        let gy = Tensor::from_vec(Shape::new(1, 1, 1, 1), vec![2.0]).unwrap();
        let mut gx = Tensor::new(Shape::new(1, 1, 2, 2)).unwrap();

        conv.backward(&store, &x, &y, &gy, &mut gx).unwrap();
        assert_eq!(gx.to_vec().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);

        conv.backward_weights(&mut store, &x, &gy).unwrap();
        conv.backward_weights(&mut store, &x, &gy).unwrap();
        // Accumulated twice.
        assert_eq!(store.grad_buffer().as_slice(), &[4.0, 8.0, 12.0, 16.0, 4.0]);
    }

    #[test]
    fn test_conv_unbound_fails() {
        let mut conv = Convolution::new(1, 1, 1, 1).unwrap();
        let store = ParamStore::<f32>::empty();
        let x = Tensor::new(Shape::new(1, 1, 1, 1)).unwrap();
        let mut y = Tensor::new(Shape::new(1, 1, 1, 1)).unwrap();
        let err = conv.forward(&store, &x, &mut y).unwrap_err();
        assert!(matches!(err, Error::Unbound { op: "convolution" }));
    }

    #[test]
    fn test_pool_forward_and_ties() {
        let mut pool = MaxPool::new(2, 2).unwrap();
        let store = ParamStore::<f32>::empty();
        #[rustfmt::skip]
        let x = Tensor::from_vec(Shape::new(1, 1, 2, 4), vec![
            1.0, 3.0,  5.0, 5.0,
            2.0, 0.0,  5.0, 1.0,
        ]).unwrap();
        let mut y = Tensor::new(Shape::new(1, 1, 1, 2)).unwrap();
        pool.forward(&store, &x, &mut y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![3.0, 5.0]);
        // First-seen maximum wins the tie.
        assert_eq!(pool.cached_indices().unwrap(), &[1, 2]);
    }

    #[test]
    fn test_pool_floor_shape() {
        let pool = MaxPool::new(2, 2).unwrap();
        let s = Operation::<f32>::output_shape(&pool, &Shape::new(1, 4, 7, 5)).unwrap();
        assert_eq!(s, Shape::new(1, 4, 3, 2));
    }

    #[test]
    fn test_pool_backward_before_forward() {
        let mut pool = MaxPool::new(2, 2).unwrap();
        let store = ParamStore::<f32>::empty();
        let x = Tensor::new(Shape::new(1, 1, 2, 2)).unwrap();
        let y = Tensor::new(Shape::new(1, 1, 1, 1)).unwrap();
        let gy = Tensor::new(Shape::new(1, 1, 1, 1)).unwrap();
        let mut gx = Tensor::new(Shape::new(1, 1, 2, 2)).unwrap();
        let err = pool.backward(&store, &x, &y, &gy, &mut gx).unwrap_err();
        assert!(matches!(err, Error::MissingForwardCache { op: "max_pool" }));
    }

    #[test]
    fn test_pool_backward_routes_to_latest_max() {
        let mut pool = MaxPool::new(2, 1).unwrap();
        let store = ParamStore::<f64>::empty();
        let s = Shape::new(1, 1, 1, 2);
        let mut y = Tensor::new(Shape::new(1, 1, 1, 1)).unwrap();
        let gy = Tensor::from_vec(Shape::new(1, 1, 1, 1), vec![1.0]).unwrap();
        let mut gx = Tensor::new(s).unwrap();

        let first = Tensor::from_vec(s, vec![9.0, 1.0]).unwrap();
        let second = Tensor::from_vec(s, vec![1.0, 9.0]).unwrap();
        pool.forward(&store, &first, &mut y).unwrap();
        pool.forward(&store, &second, &mut y).unwrap();
        pool.backward(&store, &second, &y, &gy, &mut gx).unwrap();
        assert_eq!(gx.to_vec().unwrap(), vec![0.0, 1.0]);
    }
}
