use std::fmt;

// Shape — 4D tensor shape (batch, channels, height, width)
//
// Every activation in the graph is an NCHW block:
//   - n: samples in the batch
//   - c: feature maps (channels)
//   - h, w: spatial extent
//
// Flat layouts are row-major, so the width index moves fastest:
//   offset(n, c, y, x) = ((n * C + c) * H + y) * W + x
//
// Shapes are plain values. Operations never mutate one; they derive a new
// shape from the incoming one (pooling halves h and w, squash collapses the
// plane to 1x1, and so on).

/// Immutable NCHW shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
}

impl Shape {
    pub const fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        Shape { n, c, h, w }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn c(&self) -> usize {
        self.c
    }

    pub fn h(&self) -> usize {
        self.h
    }

    pub fn w(&self) -> usize {
        self.w
    }

    /// The dimensions as `[n, c, h, w]`.
    pub fn dims(&self) -> [usize; 4] {
        [self.n, self.c, self.h, self.w]
    }

    /// Total number of elements (product of all dimensions).
    pub fn size(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    /// Elements in one sample (`c * h * w`).
    pub fn sample_size(&self) -> usize {
        self.c * self.h * self.w
    }

    /// Elements in one feature map (`h * w`).
    pub fn plane_size(&self) -> usize {
        self.h * self.w
    }

    /// Row-major linear index of element `(n, c, y, x)`.
    pub fn offset(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.c + c) * self.h + y) * self.w + x
    }

    /// Contiguous strides for `[n, c, h, w]`.
    pub fn strides(&self) -> [usize; 4] {
        [self.c * self.h * self.w, self.h * self.w, self.w, 1]
    }

    /// Same shape with a different channel count.
    pub fn with_c(&self, c: usize) -> Shape {
        Shape { c, ..*self }
    }

    /// Same shape with a different spatial extent.
    pub fn with_hw(&self, h: usize, w: usize) -> Shape {
        Shape { h, w, ..*self }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.n, self.c, self.h, self.w)
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((n, c, h, w): (usize, usize, usize, usize)) -> Self {
        Shape::new(n, c, h, w)
    }
}

impl From<[usize; 4]> for Shape {
    fn from([n, c, h, w]: [usize; 4]) -> Self {
        Shape::new(n, c, h, w)
    }
}
