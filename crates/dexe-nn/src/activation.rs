// Activations — Elementwise and per-position nonlinearities
//
//   Tanh     y = tanh(x)               dx = dy · (1 - y²)
//   Relu     y = max(0, x)             dx = dy · [x > 0]
//   Softmax  over channels at every (n, y, x):
//            y_c = exp(x_c - m) / Σ_j exp(x_j - m),  m = max_j x_j
//            dx_c = y_c · (dy_c - Σ_j dy_j · y_j)
//
// Tanh backward only needs the output, Relu only the input. Softmax is
// shifted by the per-position maximum so large logits do not overflow.

use rayon::prelude::*;

use dexe_core::{ParamStore, Result, Scalar, Shape, Tensor};

use crate::operation::{expect_shape, Operation};

/// Below this many elements, activations run on the calling thread.
const PAR_THRESHOLD: usize = 1 << 14;

fn map_into<F: Scalar>(src: &[F], dst: &mut [F], f: impl Fn(F) -> F + Send + Sync) {
    if dst.len() >= PAR_THRESHOLD {
        dst.par_iter_mut().zip(src.par_iter()).for_each(|(d, &s)| *d = f(s));
    } else {
        dst.iter_mut().zip(src).for_each(|(d, &s)| *d = f(s));
    }
}

fn zip_into<F: Scalar>(a: &[F], b: &[F], dst: &mut [F], f: impl Fn(F, F) -> F + Send + Sync) {
    if dst.len() >= PAR_THRESHOLD {
        dst.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(d, (&p, &q))| *d = f(p, q));
    } else {
        dst.iter_mut()
            .zip(a.iter().zip(b))
            .for_each(|(d, (&p, &q))| *d = f(p, q));
    }
}

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl<F: Scalar> Operation<F> for Tanh {
    fn name(&self) -> &'static str {
        "tanh"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        Ok(*input)
    }

    fn forward(&mut self, _store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        expect_shape(y, x.shape())?;
        map_into(x.data()?, y.data_mut()?, |v| v.tanh());
        Ok(())
    }

    fn backward(
        &mut self,
        _store: &ParamStore<F>,
        x: &Tensor<F>,
        y: &Tensor<F>,
        grad_y: &Tensor<F>,
        grad_x: &mut Tensor<F>,
    ) -> Result<()> {
        expect_shape(y, x.shape())?;
        expect_shape(grad_y, x.shape())?;
        expect_shape(grad_x, x.shape())?;
        zip_into(y.data()?, grad_y.data()?, grad_x.data_mut()?, |y, g| {
            g * (F::one() - y * y)
        });
        Ok(())
    }
}

/// Rectified linear unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl<F: Scalar> Operation<F> for Relu {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        Ok(*input)
    }

    fn forward(&mut self, _store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        expect_shape(y, x.shape())?;
        map_into(x.data()?, y.data_mut()?, |v| if v > F::zero() { v } else { F::zero() });
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
        expect_shape(grad_y, x.shape())?;
        expect_shape(grad_x, x.shape())?;
        zip_into(x.data()?, grad_y.data()?, grad_x.data_mut()?, |x, g| {
            if x > F::zero() {
                g
            } else {
                F::zero()
            }
        });
        Ok(())
    }
}

/// Softmax across channels, independently at every spatial position.
#[derive(Debug, Clone, Copy, Default)]
pub struct Softmax;

impl<F: Scalar> Operation<F> for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn is_softmax(&self) -> bool {
        true
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        Ok(*input)
    }

    fn forward(&mut self, _store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        let s = x.shape();
        expect_shape(y, s)?;
        let (c, plane) = (s.c(), s.plane_size());
        if s.size() == 0 {
            return Ok(());
        }
        let xd = x.data()?;
        y.data_mut()?
            .par_chunks_mut(s.sample_size())
            .zip(xd.par_chunks(s.sample_size()))
            .for_each(|(ys, xs)| {
                for p in 0..plane {
                    let mut m = F::neg_infinity();
                    for ch in 0..c {
                        m = m.max(xs[ch * plane + p]);
                    }
                    let mut total = F::zero();
                    for ch in 0..c {
                        let e = (xs[ch * plane + p] - m).exp();
                        ys[ch * plane + p] = e;
                        total = total + e;
                    }
                    for ch in 0..c {
                        ys[ch * plane + p] = ys[ch * plane + p] / total;
                    }
                }
            });
        Ok(())
    }

    fn backward(
        &mut self,
        _store: &ParamStore<F>,
        x: &Tensor<F>,
        y: &Tensor<F>,
        grad_y: &Tensor<F>,
        grad_x: &mut Tensor<F>,
    ) -> Result<()> {
        let s = x.shape();
        expect_shape(y, s)?;
        expect_shape(grad_y, s)?;
        expect_shape(grad_x, s)?;
        if s.size() == 0 {
            return Ok(());
        }
        let (c, plane, k) = (s.c(), s.plane_size(), s.sample_size());
        let yd = y.data()?;
        let gy = grad_y.data()?;
        grad_x
            .data_mut()?
            .par_chunks_mut(k)
            .zip(yd.par_chunks(k).zip(gy.par_chunks(k)))
            .for_each(|(gx, (ys, gs))| {
                for p in 0..plane {
                    let mut dot = F::zero();
                    for ch in 0..c {
                        dot = dot + gs[ch * plane + p] * ys[ch * plane + p];
                    }
                    for ch in 0..c {
                        let i = ch * plane + p;
                        gx[i] = ys[i] * (gs[i] - dot);
                    }
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_tanh_forward_backward() {
        let store = ParamStore::<f64>::empty();
        let s = Shape::new(1, 1, 1, 2);
        let x = Tensor::from_vec(s, vec![0.0, 1.0]).unwrap();
        let mut y = Tensor::new(s).unwrap();
        Tanh.forward(&store, &x, &mut y).unwrap();
        let yv = y.to_vec().unwrap();
        assert!(approx_eq(yv[1], 1.0f64.tanh(), 1e-12));

        let gy = Tensor::from_vec(s, vec![1.0, 1.0]).unwrap();
        let mut gx = Tensor::new(s).unwrap();
        Tanh.backward(&store, &x, &y, &gy, &mut gx).unwrap();
        let g = gx.to_vec().unwrap();
        assert!(approx_eq(g[0], 1.0, 1e-12));
        assert!(approx_eq(g[1], 1.0 - yv[1] * yv[1], 1e-12));
    }

    #[test]
    fn test_relu_masks_on_input() {
        let store = ParamStore::<f32>::empty();
        let s = Shape::new(1, 1, 1, 3);
        let x = Tensor::from_vec(s, vec![-1.0, 0.0, 2.0]).unwrap();
        let mut y = Tensor::new(s).unwrap();
        Relu.forward(&store, &x, &mut y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![0.0, 0.0, 2.0]);

        let gy = Tensor::from_vec(s, vec![5.0, 5.0, 5.0]).unwrap();
        let mut gx = Tensor::new(s).unwrap();
        Relu.backward(&store, &x, &y, &gy, &mut gx).unwrap();
        assert_eq!(gx.to_vec().unwrap(), vec![0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_softmax_over_channels() {
        let store = ParamStore::<f64>::empty();
        // 3 channels at 2 positions.
        let s = Shape::new(1, 3, 1, 2);
        let x = Tensor::from_vec(s, vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0]).unwrap();
        let mut y = Tensor::new(s).unwrap();
        Softmax.forward(&store, &x, &mut y).unwrap();
        let yv = y.to_vec().unwrap();
        // Position 0 sees logits [1, 2, 3].
        let z: f64 = [1.0f64, 2.0, 3.0].iter().map(|v| v.exp()).sum();
        assert!(approx_eq(yv[0], 1.0f64.exp() / z, 1e-12));
        assert!(approx_eq(yv[4], 3.0f64.exp() / z, 1e-12));
        // Position 1 sees equal logits.
        for ch in 0..3 {
            assert!(approx_eq(yv[ch * 2 + 1], 1.0 / 3.0, 1e-12));
        }
    }

    #[test]
    fn test_softmax_large_logits_stay_finite() {
        let store = ParamStore::<f32>::empty();
        let s = Shape::new(1, 2, 1, 1);
        let x = Tensor::from_vec(s, vec![1000.0, 1000.0]).unwrap();
        let mut y = Tensor::new(s).unwrap();
        Softmax.forward(&store, &x, &mut y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_softmax_backward_of_cross_entropy() {
        // With gy = -onehot / p the softmax backward yields p - onehot.
        let store = ParamStore::<f64>::empty();
        let s = Shape::new(1, 3, 1, 1);
        let x = Tensor::from_vec(s, vec![0.5, -0.2, 0.1]).unwrap();
        let mut y = Tensor::new(s).unwrap();
        Softmax.forward(&store, &x, &mut y).unwrap();
        let p = y.to_vec().unwrap();

        let gy = Tensor::from_vec(s, vec![0.0, -1.0 / p[1], 0.0]).unwrap();
        let mut gx = Tensor::new(s).unwrap();
        Softmax.backward(&store, &x, &y, &gy, &mut gx).unwrap();
        let g = gx.to_vec().unwrap();
        assert!(approx_eq(g[0], p[0], 1e-12));
        assert!(approx_eq(g[1], p[1] - 1.0, 1e-12));
        assert!(approx_eq(g[2], p[2], 1e-12));
    }
}
