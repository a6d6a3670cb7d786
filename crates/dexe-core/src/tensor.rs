use crate::buffer::Buffer;
use crate::context::Context;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::shape::Shape;

// Tensor — A Shape-typed buffer plus its backend descriptor
//
// A Tensor is the unit of data the graph moves around: one NCHW block of
// scalars. It pairs three things:
//
//   shape       the logical NCHW extent
//   descriptor  what the kernel layer needs to address the memory (strides)
//   data        an owning Buffer of exactly shape.size() elements
//
// Allocation can be deferred. The network creates every activation slot at
// graph-construction time but only allocates memory when a pass first
// touches it, so a tensor may exist with a shape and no data. Reading an
// unallocated tensor is a configuration error, never a silent empty slice.
//
// The descriptor is derived state. It is rebuilt whenever the shape changes
// and never edited on its own, so it cannot drift out of sync.

/// Kernel-facing description of a contiguous NCHW block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDescriptor {
    shape: Shape,
    strides: [usize; 4],
}

impl TensorDescriptor {
    pub fn new(shape: Shape) -> Self {
        TensorDescriptor {
            shape,
            strides: shape.strides(),
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn strides(&self) -> [usize; 4] {
        self.strides
    }
}

/// An NCHW tensor that owns its (possibly not yet allocated) buffer.
#[derive(Debug, Clone)]
pub struct Tensor<F: Scalar> {
    shape: Shape,
    desc: TensorDescriptor,
    data: Option<Buffer<F>>,
}

impl<F: Scalar> Tensor<F> {
    /// Allocate a zero-filled tensor.
    pub fn new(shape: Shape) -> Result<Self> {
        Ok(Tensor {
            shape,
            desc: TensorDescriptor::new(shape),
            data: Some(Buffer::new(shape.size())?),
        })
    }

    /// A tensor with a shape but no memory yet.
    pub fn unallocated(shape: Shape) -> Self {
        Tensor {
            shape,
            desc: TensorDescriptor::new(shape),
            data: None,
        }
    }

    /// Wrap host data. `data.len()` must equal `shape.size()`.
    pub fn from_vec(shape: Shape, data: Vec<F>) -> Result<Self> {
        if data.len() != shape.size() {
            return Err(Error::LengthMismatch {
                expected: shape.size(),
                got: data.len(),
            });
        }
        Ok(Tensor {
            shape,
            desc: TensorDescriptor::new(shape),
            data: Some(Buffer::from_vec(data)),
        })
    }

    /// Allocate zeroed memory if none is held yet. Existing data is kept.
    pub fn allocate(&mut self) -> Result<()> {
        if self.data.is_none() {
            self.data = Some(Buffer::new(self.shape.size())?);
        }
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Change the shape. The descriptor is regenerated. If the element count
    /// changes an allocated tensor gets a fresh zeroed buffer; otherwise the
    /// data is kept as-is.
    pub fn reshape(&mut self, shape: Shape) -> Result<()> {
        if shape.size() != self.shape.size() {
            if let Some(buf) = self.data.as_mut() {
                buf.resize(shape.size())?;
            }
        }
        self.shape = shape;
        self.desc = TensorDescriptor::new(shape);
        Ok(())
    }

    pub fn buffer(&self) -> Result<&Buffer<F>> {
        self.data.as_ref().ok_or(Error::Unallocated { shape: self.shape })
    }

    pub fn buffer_mut(&mut self) -> Result<&mut Buffer<F>> {
        let shape = self.shape;
        self.data.as_mut().ok_or(Error::Unallocated { shape })
    }

    pub fn data(&self) -> Result<&[F]> {
        Ok(self.buffer()?.as_slice())
    }

    pub fn data_mut(&mut self) -> Result<&mut [F]> {
        Ok(self.buffer_mut()?.as_mut_slice())
    }

    /// Copy the contents out to host memory.
    pub fn to_vec(&self) -> Result<Vec<F>> {
        Ok(self.buffer()?.to_vec())
    }

    /// Overwrite from host memory, allocating first if needed.
    pub fn copy_from_slice(&mut self, src: &[F]) -> Result<()> {
        self.allocate()?;
        self.buffer_mut()?.copy_from_slice(src)?;
        Ok(())
    }

    pub fn zero(&mut self) -> Result<()> {
        self.buffer_mut()?.zero();
        Ok(())
    }

    pub fn fill(&mut self, val: F) -> Result<()> {
        self.buffer_mut()?.fill(val);
        Ok(())
    }

    pub fn init_normal(&mut self, ctx: &mut Context, mean: F, std: F) -> Result<()> {
        self.allocate()?;
        self.buffer_mut()?.init_normal(ctx, mean, std)?;
        Ok(())
    }

    pub fn init_uniform(&mut self, ctx: &mut Context, var: F) -> Result<()> {
        self.allocate()?;
        self.buffer_mut()?.init_uniform(ctx, var)?;
        Ok(())
    }

    /// Sum of absolute values.
    pub fn sum(&self) -> Result<F> {
        Ok(self.buffer()?.asum())
    }

    pub fn norm(&self) -> Result<F> {
        Ok(self.buffer()?.norm())
    }

    pub fn norm2(&self) -> Result<F> {
        Ok(self.buffer()?.norm2())
    }

    /// `self -= other`. Shapes must match.
    pub fn sub_assign(&mut self, other: &Tensor<F>) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape,
                got: other.shape,
            });
        }
        let rhs = other.buffer()?;
        self.buffer_mut()?.sub(rhs)?;
        Ok(())
    }

    /// `self *= v`.
    pub fn scale(&mut self, v: F) -> Result<()> {
        self.buffer_mut()?.scale(v);
        Ok(())
    }
}

// ActivationSlot — One edge of the graph: a value and its gradient
//
// Slot i sits between operation i-1 and operation i. Forward writes the
// value, backward writes the gradient. Both tensors always carry the same
// shape; they are allocated independently so a forward-only pass never pays
// for gradient memory.

/// Paired (value, gradient) storage at one point in the graph.
///
/// The two tensors always share a shape. The fields are private so the only
/// way to change that shape is [`ActivationSlot::reshape`], which moves both.
#[derive(Debug, Clone)]
pub struct ActivationSlot<F: Scalar> {
    value: Tensor<F>,
    grad: Tensor<F>,
}

impl<F: Scalar> ActivationSlot<F> {
    pub fn new(shape: Shape) -> Self {
        ActivationSlot {
            value: Tensor::unallocated(shape),
            grad: Tensor::unallocated(shape),
        }
    }

    pub fn shape(&self) -> Shape {
        self.value.shape()
    }

    pub fn value(&self) -> &Tensor<F> {
        &self.value
    }

    pub fn grad(&self) -> &Tensor<F> {
        &self.grad
    }

    /// Mutable value, for writing data. Reshaping through it breaks the
    /// pairing with the gradient; use [`ActivationSlot::reshape`].
    pub fn value_mut(&mut self) -> &mut Tensor<F> {
        &mut self.value
    }

    /// Mutable gradient, for writing data. Same caveat as `value_mut`.
    pub fn grad_mut(&mut self) -> &mut Tensor<F> {
        &mut self.grad
    }

    /// The value for reading alongside the gradient for writing, as a
    /// backward or loss pass needs them.
    pub fn parts_mut(&mut self) -> (&Tensor<F>, &mut Tensor<F>) {
        (&self.value, &mut self.grad)
    }

    pub fn alloc_value(&mut self) -> Result<()> {
        self.value.allocate()
    }

    pub fn alloc_grad(&mut self) -> Result<()> {
        self.grad.allocate()
    }

    /// Allocate both tensors.
    pub fn alloc(&mut self) -> Result<()> {
        self.alloc_value()?;
        self.alloc_grad()
    }

    /// Reshape value and gradient together.
    pub fn reshape(&mut self, shape: Shape) -> Result<()> {
        self.value.reshape(shape)?;
        self.grad.reshape(shape)
    }
}
