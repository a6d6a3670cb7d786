// Structural operations — Reshape and rearrange without arithmetic
//
// None of these have weights, and backward is always the inverse data
// movement applied to the gradient.
//
// Unsquash: reinterpret each sample as a new [C, H, W] (same element count).
//
// Merge (space-to-depth): every 2x2 spatial block becomes 4 channels.
//
//   out[n, 4c + 2dy + dx, y, x] = in[n, c, 2y + dy, 2x + dx]
//   [N, C, H, W] → [N, 4C, H/2, W/2]
//
// Split (depth-to-space): the exact inverse of Merge.
//
//   [N, C, H, W] → [N, C/4, 2H, 2W]

use dexe_core::{Error, ParamStore, Result, Scalar, Shape, Tensor};

use crate::operation::{expect_shape, Operation};

/// Reshape each sample to `[c, h, w]`, keeping the batch size.
#[derive(Debug, Clone, Copy)]
pub struct Unsquash {
    c: usize,
    h: usize,
    w: usize,
}

impl Unsquash {
    /// Target per-sample dimensions are taken from `shape`; its batch size
    /// is ignored.
    pub fn new(shape: Shape) -> Self {
        Unsquash {
            c: shape.c(),
            h: shape.h(),
            w: shape.w(),
        }
    }
}

impl<F: Scalar> Operation<F> for Unsquash {
    fn name(&self) -> &'static str {
        "unsquash"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let out = Shape::new(input.n(), self.c, self.h, self.w);
        if out.size() != input.size() {
            return Err(Error::ShapeMismatch {
                expected: out,
                got: *input,
            });
        }
        Ok(out)
    }

    fn forward(&mut self, _store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(y, ys)?;
        y.data_mut()?.copy_from_slice(x.data()?);
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
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(grad_y, ys)?;
        expect_shape(grad_x, x.shape())?;
        grad_x.data_mut()?.copy_from_slice(grad_y.data()?);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("-> [{}, {}, {}]", self.c, self.h, self.w)
    }
}

/// Copy `src` (shaped `[n, c, h, w]`) into `dst` shaped `[n, 4c, h/2, w/2]`.
fn space_to_depth<F: Scalar>(src: &[F], s: Shape, dst: &mut [F]) {
    let d = Shape::new(s.n(), s.c() * 4, s.h() / 2, s.w() / 2);
    for n in 0..s.n() {
        for c in 0..s.c() {
            for y in 0..d.h() {
                for x in 0..d.w() {
                    for dy in 0..2 {
                        for dx in 0..2 {
                            dst[d.offset(n, 4 * c + 2 * dy + dx, y, x)] =
                                src[s.offset(n, c, 2 * y + dy, 2 * x + dx)];
                        }
                    }
                }
            }
        }
    }
}

/// Copy `src` (shaped `[n, c, h, w]`) into `dst` shaped `[n, c/4, 2h, 2w]`.
fn depth_to_space<F: Scalar>(src: &[F], s: Shape, dst: &mut [F]) {
    let d = Shape::new(s.n(), s.c() / 4, s.h() * 2, s.w() * 2);
    for n in 0..d.n() {
        for c in 0..d.c() {
            for y in 0..s.h() {
                for x in 0..s.w() {
                    for dy in 0..2 {
                        for dx in 0..2 {
                            dst[d.offset(n, c, 2 * y + dy, 2 * x + dx)] =
                                src[s.offset(n, 4 * c + 2 * dy + dx, y, x)];
                        }
                    }
                }
            }
        }
    }
}

/// Space-to-depth: `[n, c, h, w] -> [n, 4c, h/2, w/2]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Merge;

impl<F: Scalar> Operation<F> for Merge {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if input.h() % 2 != 0 || input.w() % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "merge needs even height and width, got {input}"
            )));
        }
        Ok(Shape::new(input.n(), input.c() * 4, input.h() / 2, input.w() / 2))
    }

    fn forward(&mut self, _store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(y, ys)?;
        space_to_depth(x.data()?, x.shape(), y.data_mut()?);
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
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(grad_y, ys)?;
        expect_shape(grad_x, x.shape())?;
        depth_to_space(grad_y.data()?, ys, grad_x.data_mut()?);
        Ok(())
    }
}

/// Depth-to-space: `[n, c, h, w] -> [n, c/4, 2h, 2w]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Split;

impl<F: Scalar> Operation<F> for Split {
    fn name(&self) -> &'static str {
        "split"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if input.c() % 4 != 0 {
            return Err(Error::InvalidConfig(format!(
                "split needs a channel count divisible by 4, got {input}"
            )));
        }
        Ok(Shape::new(input.n(), input.c() / 4, input.h() * 2, input.w() * 2))
    }

    fn forward(&mut self, _store: &ParamStore<F>, x: &Tensor<F>, y: &mut Tensor<F>) -> Result<()> {
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(y, ys)?;
        depth_to_space(x.data()?, x.shape(), y.data_mut()?);
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
        let ys = Operation::<F>::output_shape(self, &x.shape())?;
        expect_shape(grad_y, ys)?;
        expect_shape(grad_x, x.shape())?;
        space_to_depth(grad_y.data()?, ys, grad_x.data_mut()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(s: Shape) -> Tensor<f32> {
        Tensor::from_vec(s, (0..s.size()).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_unsquash() {
        let op = Unsquash::new(Shape::new(1, 2, 2, 2));
        let s = Operation::<f32>::output_shape(&op, &Shape::new(3, 8, 1, 1)).unwrap();
        assert_eq!(s, Shape::new(3, 2, 2, 2));
        let err = Operation::<f32>::output_shape(&op, &Shape::new(3, 9, 1, 1)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_unsquash_copies_both_ways() {
        let store = ParamStore::<f32>::empty();
        let mut op = Unsquash::new(Shape::new(1, 2, 2, 2));
        let xs = Shape::new(2, 8, 1, 1);
        let ys = Shape::new(2, 2, 2, 2);
        let x = ramp(xs);
        let mut y = Tensor::new(ys).unwrap();
        op.forward(&store, &x, &mut y).unwrap();
        assert_eq!(y.shape(), ys);
        assert_eq!(y.to_vec().unwrap(), x.to_vec().unwrap());

        let gy = Tensor::from_vec(ys, (0..16).map(|v| -(v as f32)).collect()).unwrap();
        let mut gx = Tensor::new(xs).unwrap();
        op.backward(&store, &x, &y, &gy, &mut gx).unwrap();
        assert_eq!(gx.shape(), xs);
        assert_eq!(gx.to_vec().unwrap(), gy.to_vec().unwrap());
    }

    #[test]
    fn test_merge_layout() {
        let store = ParamStore::<f32>::empty();
        let xs = Shape::new(1, 1, 2, 4);
        let x = ramp(xs);
        let mut y = Tensor::new(Shape::new(1, 4, 1, 2)).unwrap();
        Merge.forward(&store, &x, &mut y).unwrap();
        // Input rows: [0 1 2 3] / [4 5 6 7]. Channel 2dy+dx holds (dy, dx) of each block.
        assert_eq!(y.to_vec().unwrap(), vec![0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
    }

    #[test]
    fn test_merge_split_are_inverse() {
        let store = ParamStore::<f32>::empty();
        let xs = Shape::new(2, 3, 4, 6);
        let x = ramp(xs);
        let ms = Operation::<f32>::output_shape(&Merge, &xs).unwrap();
        assert_eq!(ms, Shape::new(2, 12, 2, 3));
        let mut m = Tensor::new(ms).unwrap();
        Merge.forward(&store, &x, &mut m).unwrap();
        let mut back = Tensor::new(xs).unwrap();
        Split.forward(&store, &m, &mut back).unwrap();
        assert_eq!(back.to_vec().unwrap(), x.to_vec().unwrap());

        // Backward of merge is split applied to the gradient.
        let mut gx = Tensor::new(xs).unwrap();
        Merge.backward(&store, &x, &m, &m, &mut gx).unwrap();
        assert_eq!(gx.to_vec().unwrap(), x.to_vec().unwrap());
    }

    #[test]
    fn test_split_backward_is_merge_of_gradient() {
        let store = ParamStore::<f32>::empty();
        let xs = Shape::new(1, 8, 2, 3);
        let ys = Operation::<f32>::output_shape(&Split, &xs).unwrap();
        assert_eq!(ys, Shape::new(1, 2, 4, 6));
        let x = ramp(xs);
        let mut y = Tensor::new(ys).unwrap();
        Split.forward(&store, &x, &mut y).unwrap();

        let gy = Tensor::from_vec(ys, (0..48).map(|v| (v * 3 % 11) as f32).collect()).unwrap();
        let mut gx = Tensor::new(xs).unwrap();
        Split.backward(&store, &x, &y, &gy, &mut gx).unwrap();

        let mut merged = Tensor::new(xs).unwrap();
        Merge.forward(&store, &gy, &mut merged).unwrap();
        assert_eq!(gx.to_vec().unwrap(), merged.to_vec().unwrap());
    }

    #[test]
    fn test_shape_preconditions() {
        assert!(Operation::<f32>::output_shape(&Merge, &Shape::new(1, 1, 3, 4)).is_err());
        assert!(Operation::<f32>::output_shape(&Split, &Shape::new(1, 6, 2, 2)).is_err());
    }
}
