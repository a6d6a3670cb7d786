// Loss — Terminal node of the network
//
// A loss turns the final activation `p` (n samples x c classes) and the
// ground-truth labels into a scalar and an error signal for backward.
//
// VARIANTS:
//
// 1. Softmax cross-entropy (p is a probability row per sample):
//      L   = -Σ_n log(p[n, label_n] + ε)
//      err = ∂L/∂p = -onehot / (p + ε)
//    Propagated through the Softmax operation this becomes p - onehot at
//    the logits.
//
// 2. Squared error:
//      L   = ½ Σ_n Σ_c (p[n, c] - onehot[n, c])²
//      err = ∂L/∂p = p - onehot
//
// The error tensor always holds ∂L/∂p, so `params -= lr · grad` descends
// and a finite-difference check of L agrees with the analytic gradient.
//
// A sample counts as correct when argmax(p row) == label. Ties resolve to
// the first maximum seen (strict `>`), and a row of NaNs resolves to 0.
//
// Both variants sum over the batch, they do not average.

use dexe_core::{Error, Result, Scalar, Tensor};

/// Guards log(0) and division by zero.
pub const EPSILON: f64 = 1e-8;

/// Index of the first maximum in `row` (strict `>` scan). Returns 0 for an
/// empty row or when no element compares greater than the first.
pub fn argmax<F: Scalar>(row: &[F]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Batch geometry plus the results of the last `calculate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct LossState<F: Scalar> {
    pub n: usize,
    pub c: usize,
    pub last_loss: F,
    pub last_correct: usize,
}

impl<F: Scalar> LossState<F> {
    fn new(n: usize, c: usize) -> Self {
        LossState {
            n,
            c,
            last_loss: F::zero(),
            last_correct: 0,
        }
    }
}

/// The closed set of loss functions.
#[derive(Debug, Clone, PartialEq)]
pub enum Loss<F: Scalar> {
    SoftmaxCrossEntropy(LossState<F>),
    Squared(LossState<F>),
}

impl<F: Scalar> Loss<F> {
    pub fn softmax_cross_entropy(n: usize, c: usize) -> Self {
        Loss::SoftmaxCrossEntropy(LossState::new(n, c))
    }

    pub fn squared(n: usize, c: usize) -> Self {
        Loss::Squared(LossState::new(n, c))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Loss::SoftmaxCrossEntropy(_) => "softmax_cross_entropy",
            Loss::Squared(_) => "squared_error",
        }
    }

    pub fn state(&self) -> &LossState<F> {
        match self {
            Loss::SoftmaxCrossEntropy(s) | Loss::Squared(s) => s,
        }
    }

    fn state_mut(&mut self) -> &mut LossState<F> {
        match self {
            Loss::SoftmaxCrossEntropy(s) | Loss::Squared(s) => s,
        }
    }

    /// Batch size.
    pub fn n(&self) -> usize {
        self.state().n
    }

    /// Class count.
    pub fn c(&self) -> usize {
        self.state().c
    }

    /// Loss from the last `calculate`.
    pub fn loss(&self) -> F {
        self.state().last_loss
    }

    /// Correct predictions from the last `calculate`.
    pub fn n_correct(&self) -> usize {
        self.state().last_correct
    }

    /// Restore the recorded results (used after a finite-difference sweep).
    pub fn restore(&mut self, loss: F, correct: usize) {
        let s = self.state_mut();
        s.last_loss = loss;
        s.last_correct = correct;
    }

    /// Compute the loss of `input` against `labels`, write ∂L/∂input into
    /// `err` and record loss and correct count.
    pub fn calculate(&mut self, input: &Tensor<F>, labels: &[usize], err: &mut Tensor<F>) -> Result<F> {
        let (n, c) = (self.n(), self.c());
        if labels.len() != n {
            return Err(Error::LengthMismatch {
                expected: n,
                got: labels.len(),
            });
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= c) {
            return Err(Error::LabelOutOfRange { label, classes: c });
        }
        if input.size() != n * c {
            return Err(Error::LengthMismatch {
                expected: n * c,
                got: input.size(),
            });
        }
        if err.size() != n * c {
            return Err(Error::LengthMismatch {
                expected: n * c,
                got: err.size(),
            });
        }
        err.allocate()?;

        let p = input.data()?;
        let e = err.data_mut()?;
        let eps = F::from_f64(EPSILON);
        let half = F::from_f64(0.5);
        let mut loss = F::zero();
        let mut correct = 0;

        for (i, &label) in labels.iter().enumerate() {
            let row = &p[i * c..(i + 1) * c];
            let erow = &mut e[i * c..(i + 1) * c];
            if argmax(row) == label {
                correct += 1;
            }
            match self {
                Loss::SoftmaxCrossEntropy(_) => {
                    loss = loss - (row[label] + eps).ln();
                    erow.iter_mut().for_each(|v| *v = F::zero());
                    erow[label] = -F::one() / (row[label] + eps);
                }
                Loss::Squared(_) => {
                    for (j, (ev, &pv)) in erow.iter_mut().zip(row).enumerate() {
                        let target = if j == label { F::one() } else { F::zero() };
                        let d = pv - target;
                        loss = loss + half * d * d;
                        *ev = d;
                    }
                }
            }
        }

        let s = self.state_mut();
        s.last_loss = loss;
        s.last_correct = correct;
        Ok(loss)
    }

    /// Single-sample convenience for `calculate`.
    pub fn calculate_label(&mut self, input: &Tensor<F>, label: usize, err: &mut Tensor<F>) -> Result<F> {
        self.calculate(input, &[label], err)
    }
}
