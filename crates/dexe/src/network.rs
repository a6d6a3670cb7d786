// Network — Graph driver over a chain of operations
//
// A Network owns everything a training step touches:
//
//   ops:    [op 0, op 1, ..., op N-1]               (exclusive ownership)
//   slots:  [slot 0, slot 1, ..., slot N]           (value + grad per edge)
//   store:  flat parameter arena + gradient mirror  (laid out at finish)
//   loss:   terminal node reading slot N
//
// LIFECYCLE:
//
//   1. Building: add_* appends an operation, derives its output shape from
//      the current last shape and creates the next slot. Incompatible
//      shapes fail here, never at forward time.
//   2. finish(): freezes the chain, lays out the flat arena in insertion
//      order, binds every learnable operation to its range and allocates
//      all slots. After this only weight VALUES change.
//   3. Training: forward → calculate_loss → backward → (l2) → update.
//
// GRADIENT ACCUMULATION:
//
// backward adds into the flat gradient buffer and never clears it, so
// several backward calls before one update sum their gradients (mini-batch
// by accumulation). update applies `params -= lr · grads` and then zeroes
// the gradients, so every update starts the next cycle from zero.
// zero_grad() clears them explicitly when a step is abandoned.

use std::path::Path;

use dexe_core::{
    bail, ActivationSlot, Context, Error, ParamRange, ParamStore, Result, Scalar, Shape, Tensor,
};
use dexe_nn::{
    Convolution, Loss, MaxPool, Merge, Operation, Relu, Softmax, Split, Squash, Tanh, Unsquash,
};

use crate::checkpoint;

/// A chain of operations with a flat parameter arena and a loss.
pub struct Network<F: Scalar> {
    ops: Vec<Box<dyn Operation<F>>>,
    slots: Vec<ActivationSlot<F>>,
    store: ParamStore<F>,
    loss: Option<Loss<F>>,
    finished: bool,
}

impl<F: Scalar> Network<F> {
    /// An empty network fed with tensors of `input` shape.
    pub fn new(input: Shape) -> Self {
        Network {
            ops: Vec::new(),
            slots: vec![ActivationSlot::new(input)],
            store: ParamStore::empty(),
            loss: None,
            finished: false,
        }
    }

    // Graph construction

    /// Append an operation to the chain.
    pub fn add_operation(&mut self, op: Box<dyn Operation<F>>) -> Result<&mut Self> {
        if self.finished {
            return Err(Error::AlreadyFinished);
        }
        let input = self.output_shape();
        let output = op.output_shape(&input)?;
        tracing::debug!(
            op = op.name(),
            %input,
            %output,
            params = op.parametrised().map_or(0, |p| p.n_params()),
            "add operation"
        );
        self.ops.push(op);
        self.slots.push(ActivationSlot::new(output));
        Ok(self)
    }

    /// Convolution with `out_c` filters of `kw x kh`, stride 1, no padding.
    pub fn add_conv(&mut self, out_c: usize, kw: usize, kh: usize) -> Result<&mut Self> {
        let in_c = self.output_shape().c();
        self.add_operation(Box::new(Convolution::new(in_c, out_c, kw, kh)?))
    }

    /// Convolution with symmetric zero padding.
    pub fn add_conv_padded(
        &mut self,
        out_c: usize,
        kw: usize,
        kh: usize,
        padding: usize,
    ) -> Result<&mut Self> {
        let in_c = self.output_shape().c();
        let conv = Convolution::new(in_c, out_c, kw, kh)?.with_padding(padding);
        self.add_operation(Box::new(conv))
    }

    pub fn add_pool(&mut self, kw: usize, kh: usize) -> Result<&mut Self> {
        self.add_operation(Box::new(MaxPool::new(kw, kh)?))
    }

    /// Fully connected layer producing `[n, out_c, 1, 1]`.
    pub fn add_squash(&mut self, out_c: usize) -> Result<&mut Self> {
        let input = self.output_shape();
        self.add_operation(Box::new(Squash::new(&input, out_c)?))
    }

    pub fn add_tanh(&mut self) -> Result<&mut Self> {
        self.add_operation(Box::new(Tanh))
    }

    pub fn add_relu(&mut self) -> Result<&mut Self> {
        self.add_operation(Box::new(Relu))
    }

    pub fn add_softmax(&mut self) -> Result<&mut Self> {
        self.add_operation(Box::new(Softmax))
    }

    /// Reshape each sample to the `[c, h, w]` of `shape`.
    pub fn add_unsquash(&mut self, shape: Shape) -> Result<&mut Self> {
        self.add_operation(Box::new(Unsquash::new(shape)))
    }

    pub fn add_merge(&mut self) -> Result<&mut Self> {
        self.add_operation(Box::new(Merge))
    }

    pub fn add_split(&mut self) -> Result<&mut Self> {
        self.add_operation(Box::new(Split))
    }

    /// Freeze the chain, lay out the flat arena and allocate every slot.
    ///
    /// Installs a default loss unless one was set: softmax cross-entropy over
    /// the channels when the last operation is a softmax, squared error
    /// over the whole sample otherwise.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::AlreadyFinished);
        }
        if self.ops.is_empty() {
            return Err(Error::InvalidConfig(
                "cannot finish a network with no operations".into(),
            ));
        }

        let counts: Vec<usize> = self
            .ops
            .iter()
            .filter_map(|op| op.parametrised().map(|p| p.n_params()))
            .collect();
        let store = ParamStore::layout(&counts)?;
        let mut ranges = store.ranges().iter();
        for op in self.ops.iter_mut() {
            if let Some(p) = op.parametrised_mut() {
                let Some(&range) = ranges.next() else {
                    bail!("parameter layout has fewer ranges than learnable operations");
                };
                p.bind(range)?;
            }
        }
        self.store = store;

        for slot in self.slots.iter_mut() {
            slot.alloc()?;
        }

        if self.loss.is_none() {
            self.loss = Some(self.default_loss());
        }
        self.finished = true;
        tracing::debug!(
            ops = self.ops.len(),
            learnable = counts.len(),
            params = self.store.len(),
            output = %self.output_shape(),
            "network finished"
        );
        Ok(())
    }

    fn default_loss(&self) -> Loss<F> {
        let out = self.output_shape();
        let ends_in_softmax = self.ops.last().is_some_and(|op| op.is_softmax());
        if ends_in_softmax && out.plane_size() == 1 {
            Loss::softmax_cross_entropy(out.n(), out.c())
        } else {
            Loss::squared(out.n(), out.sample_size())
        }
    }

    /// Replace the loss. Its `n * c` must equal the output size.
    pub fn set_loss(&mut self, loss: Loss<F>) -> Result<()> {
        let out = self.output_shape();
        if loss.n() * loss.c() != out.size() {
            return Err(Error::InvalidConfig(format!(
                "{} loss over {}x{} does not fit output {out}",
                loss.name(),
                loss.n(),
                loss.c()
            )));
        }
        self.loss = Some(loss);
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn ensure_finished(&self) -> Result<()> {
        if !self.finished {
            return Err(Error::NotFinished);
        }
        Ok(())
    }

    // Passes

    /// Copy `input` into slot 0 and run every operation in order.
    pub fn forward(&mut self, input: &[F]) -> Result<()> {
        self.ensure_finished()?;
        let expected = self.input_shape().size();
        if input.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                got: input.len(),
            });
        }
        self.slots[0].value_mut().copy_from_slice(input)?;
        self.forward_tensor()
    }

    /// Re-run the chain on whatever slot 0 currently holds.
    pub fn forward_tensor(&mut self) -> Result<()> {
        self.ensure_finished()?;
        for (i, op) in self.ops.iter_mut().enumerate() {
            let (head, tail) = self.slots.split_at_mut(i + 1);
            op.forward(&self.store, head[i].value(), tail[0].value_mut())?;
        }
        tracing::trace!(ops = self.ops.len(), "forward");
        Ok(())
    }

    /// Loss of the current output against a single label.
    pub fn calculate_loss(&mut self, label: usize) -> Result<F> {
        self.calculate_loss_batch(&[label])
    }

    /// Loss of the current output against one label per batch entry. The
    /// error signal is written into the output gradient.
    pub fn calculate_loss_batch(&mut self, labels: &[usize]) -> Result<F> {
        self.ensure_finished()?;
        let loss = self.loss.as_mut().ok_or(Error::NotFinished)?;
        let last = self.slots.len() - 1;
        let (value, grad) = self.slots[last].parts_mut();
        let l = loss.calculate(value, labels, grad)?;
        if !l.is_finite() {
            tracing::warn!(loss = %l, "non-finite loss");
        }
        tracing::trace!(loss = %l, correct = loss.n_correct(), "loss");
        Ok(l)
    }

    /// Squared error of the current output against an arbitrary target of
    /// the output shape. Correctness is not counted (recorded as 0).
    pub fn calculate_loss_target(&mut self, target: &Tensor<F>) -> Result<F> {
        self.ensure_finished()?;
        let out = self.output_shape();
        if target.shape() != out {
            return Err(Error::ShapeMismatch {
                expected: out,
                got: target.shape(),
            });
        }
        let t = target.data()?;
        let last = self.slots.len() - 1;
        let (value, grad) = self.slots[last].parts_mut();
        let p = value.data()?;
        let g = grad.data_mut()?;
        let half = F::from_f64(0.5);
        let mut l = F::zero();
        for ((gv, &pv), &tv) in g.iter_mut().zip(p).zip(t) {
            let d = pv - tv;
            l = l + half * d * d;
            *gv = d;
        }
        if !l.is_finite() {
            tracing::warn!(loss = %l, "non-finite loss");
        }
        if let Some(loss) = self.loss.as_mut() {
            loss.restore(l, 0);
        }
        Ok(l)
    }

    /// Propagate the output gradient back to the input, accumulating weight
    /// gradients into the flat gradient buffer.
    pub fn backward(&mut self) -> Result<()> {
        self.propagate(true)
    }

    /// Forward `input`, compute the loss against `label`, then backward.
    /// Returns the loss.
    pub fn backward_from(&mut self, input: &[F], label: usize) -> Result<F> {
        self.forward(input)?;
        let l = self.calculate_loss(label)?;
        self.backward()?;
        Ok(l)
    }

    /// Propagate data gradients only. The flat gradient buffer is untouched,
    /// which is what input-gradient methods (adversarial examples) need.
    pub fn backward_data(&mut self) -> Result<()> {
        self.propagate(false)
    }

    fn propagate(&mut self, weights: bool) -> Result<()> {
        self.ensure_finished()?;
        for i in (0..self.ops.len()).rev() {
            let (head, tail) = self.slots.split_at_mut(i + 1);
            let (x, grad_x) = head[i].parts_mut();
            let next = &tail[0];
            let op = &mut self.ops[i];
            op.backward(&self.store, x, next.value(), next.grad(), grad_x)?;
            if weights {
                if let Some(p) = op.parametrised() {
                    p.backward_weights(&mut self.store, x, next.grad())?;
                }
            }
        }
        tracing::trace!(weights, "backward");
        Ok(())
    }

    /// `params -= lr · grads` over the whole arena, then zero the gradients
    /// and run each operation's post-update hook.
    pub fn update(&mut self, lr: F) -> Result<()> {
        self.ensure_finished()?;
        self.store.step(lr)?;
        for op in &self.ops {
            if let Some(p) = op.parametrised() {
                if let Some(range) = p.range() {
                    p.post_update(self.store.weights_mut(range)?);
                }
            }
        }
        tracing::trace!(%lr, "update");
        Ok(())
    }

    /// `grads += lambda · params`. Call between backward and update.
    pub fn l2(&mut self, lambda: F) -> Result<()> {
        self.ensure_finished()?;
        self.store.add_l2(lambda)
    }

    pub fn zero_grad(&mut self) {
        self.store.zero_grad();
    }

    // Parameters

    /// Fill every learnable operation's weights with N(mean, std).
    pub fn init_normal(&mut self, ctx: &mut Context, mean: F, std: F) -> Result<()> {
        self.ensure_finished()?;
        for op in &self.ops {
            if let Some(p) = op.parametrised() {
                p.init_normal(&mut self.store, ctx, mean, std)?;
            }
        }
        tracing::debug!(%mean, %std, seed = ?ctx.seed(), "init normal");
        Ok(())
    }

    /// Fill every learnable operation's weights with U(-var, var).
    pub fn init_uniform(&mut self, ctx: &mut Context, var: F) -> Result<()> {
        self.ensure_finished()?;
        for op in &self.ops {
            if let Some(p) = op.parametrised() {
                p.init_uniform(&mut self.store, ctx, var)?;
            }
        }
        tracing::debug!(%var, seed = ?ctx.seed(), "init uniform");
        Ok(())
    }

    /// Copy of the flat parameter buffer.
    pub fn param_vec(&self) -> Vec<F> {
        self.store.params().to_vec()
    }

    /// Overwrite the flat parameter buffer.
    pub fn set_param_vec(&mut self, params: &[F]) -> Result<()> {
        self.ensure_finished()?;
        self.store.params_mut().copy_from_slice(params)?;
        Ok(())
    }

    /// Copy of the flat gradient buffer.
    pub fn gradient(&self) -> Vec<F> {
        self.store.grad_buffer().to_vec()
    }

    /// The flat arena itself.
    pub fn params(&self) -> &ParamStore<F> {
        &self.store
    }

    /// Central-difference estimate of ∂L/∂θ for every parameter.
    ///
    /// Each parameter is moved by ±`eps`, the network re-run forward with
    /// the loss against `label`, and `(L+ - L-) / 2eps` recorded. Only
    /// forward and loss are used; the flat gradient buffer is neither read
    /// nor written. Parameters, loss results and the output gradient are
    /// restored afterwards, even on error.
    pub fn fd_gradient(&mut self, input: &[F], label: usize, eps: F) -> Result<Vec<F>> {
        self.ensure_finished()?;
        let saved = self.param_vec();
        let saved_loss = self.loss.as_ref().map(|l| (l.loss(), l.n_correct()));
        let saved_out_grad = self.output_grad()?.to_vec()?;

        let result = self.fd_sweep(input, label, eps, &saved);

        self.store.params_mut().copy_from_slice(&saved)?;
        let refreshed = self.forward(input);
        let last = self.slots.len() - 1;
        self.slots[last].grad_mut().copy_from_slice(&saved_out_grad)?;
        if let (Some(loss), Some((l, c))) = (self.loss.as_mut(), saved_loss) {
            loss.restore(l, c);
        }
        let grad = result?;
        refreshed?;
        Ok(grad)
    }

    fn fd_sweep(&mut self, input: &[F], label: usize, eps: F, saved: &[F]) -> Result<Vec<F>> {
        let two_eps = eps + eps;
        let mut grad = Vec::with_capacity(saved.len());
        for (i, &orig) in saved.iter().enumerate() {
            self.store.params_mut().as_mut_slice()[i] = orig + eps;
            self.forward(input)?;
            let plus = self.calculate_loss(label)?;

            self.store.params_mut().as_mut_slice()[i] = orig - eps;
            self.forward(input)?;
            let minus = self.calculate_loss(label)?;

            self.store.params_mut().as_mut_slice()[i] = orig;
            grad.push((plus - minus) / two_eps);
        }
        Ok(grad)
    }

    // Persistence

    /// Write the flat parameter buffer to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::save(path, self)
    }

    /// Read the flat parameter buffer from `path`. The live parameters are
    /// untouched if the file is malformed or its count does not match.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::load(path, self)
    }

    // Accessors

    pub fn input_shape(&self) -> Shape {
        self.slots[0].shape()
    }

    /// Shape of the last slot (the input shape while no operation is added).
    pub fn output_shape(&self) -> Shape {
        self.slots[self.slots.len() - 1].shape()
    }

    /// Shapes of every slot, input first.
    pub fn shapes(&self) -> Vec<Shape> {
        self.slots.iter().map(|s| s.shape()).collect()
    }

    pub fn input(&self) -> &Tensor<F> {
        self.slots[0].value()
    }

    /// Gradient of the loss with respect to the input, after a backward.
    pub fn input_grad(&self) -> Result<&Tensor<F>> {
        self.ensure_finished()?;
        Ok(self.slots[0].grad())
    }

    pub fn output(&self) -> Result<&Tensor<F>> {
        self.ensure_finished()?;
        Ok(self.slots[self.slots.len() - 1].value())
    }

    pub fn output_grad(&self) -> Result<&Tensor<F>> {
        self.ensure_finished()?;
        Ok(self.slots[self.slots.len() - 1].grad())
    }

    /// Slot `i` (0 = input, `n_ops()` = output).
    pub fn slot(&self, i: usize) -> Option<&ActivationSlot<F>> {
        self.slots.get(i)
    }

    pub fn n_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn operations(&self) -> impl Iterator<Item = &dyn Operation<F>> {
        self.ops.iter().map(|op| op.as_ref())
    }

    /// Total learnable scalars (0 before `finish`).
    pub fn n_params(&self) -> usize {
        self.store.len()
    }

    /// Each learnable operation's window into the flat arena, in graph order.
    pub fn param_ranges(&self) -> &[ParamRange] {
        self.store.ranges()
    }

    pub fn loss_fn(&self) -> Option<&Loss<F>> {
        self.loss.as_ref()
    }

    /// Loss from the last `calculate_loss*` call.
    pub fn loss(&self) -> F {
        self.loss.as_ref().map_or(F::zero(), |l| l.loss())
    }

    /// Correct predictions from the last `calculate_loss*` call.
    pub fn n_correct(&self) -> usize {
        self.loss.as_ref().map_or(0, |l| l.n_correct())
    }

    /// Multi-line summary: one line per operation with its configuration,
    /// output shape and parameter count.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "network {} -> {} ({} ops, {} params, {})\n",
            self.input_shape(),
            self.output_shape(),
            self.ops.len(),
            self.n_params(),
            F::DTYPE
        );
        for (i, op) in self.ops.iter().enumerate() {
            let params = op.parametrised().map_or(0, |p| p.n_params());
            out.push_str(&format!(
                "  {i:>2} {:<12} {:<20} {:<18} {params}\n",
                op.name(),
                op.describe(),
                self.slots[i + 1].shape().to_string(),
            ));
        }
        if let Some(loss) = &self.loss {
            out.push_str(&format!("  loss {} over {}x{}\n", loss.name(), loss.n(), loss.c()));
        }
        out
    }
}

impl<F: Scalar> std::fmt::Debug for Network<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("ops", &self.ops.iter().map(|op| op.name()).collect::<Vec<_>>())
            .field("shapes", &self.shapes())
            .field("n_params", &self.n_params())
            .field("finished", &self.finished)
            .finish()
    }
}
