// Trainer — Epoch loop over a dataset
//
// One training step per batch:
//
//   forward(batch) → calculate_loss_batch(labels) → backward
//     → l2(λ) if enabled → update(lr)
//
// The batch size is the network's input batch dimension: an input shape of
// [4, 3, 32, 32] trains on four samples per step, [1, ...] on one. A trailing
// partial batch is skipped. Samples are visited in a shuffled order when
// `shuffle` is set, using the Context generator so a seeded context
// reproduces the whole run.

use std::fmt;
use std::time::{Duration, Instant};

use dexe_core::{Context, Error, Result, Scalar};
use dexe_data::{Dataset, Indices};

use crate::network::Network;

/// Configuration for the training loop.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Number of passes over the dataset.
    pub epochs: usize,
    /// Step size for `update`.
    pub learning_rate: f64,
    /// L2 coefficient (0 disables the term).
    pub l2: f64,
    /// Visit samples in a shuffled order each epoch.
    pub shuffle: bool,
    /// Seed for the training Context (None = entropy).
    pub seed: Option<u64>,
    /// Log the network output every `log_every` steps (0 = never).
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 0.005,
            l2: 0.0,
            shuffle: true,
            seed: None,
            log_every: 0,
        }
    }
}

impl TrainConfig {
    pub fn epochs(mut self, n: usize) -> Self {
        self.epochs = n;
        self
    }

    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn l2(mut self, lambda: f64) -> Self {
        self.l2 = lambda;
        self
    }

    pub fn shuffle(mut self, s: bool) -> Self {
        self.shuffle = s;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = Some(s);
        self
    }

    pub fn log_every(mut self, n: usize) -> Self {
        self.log_every = n;
        self
    }

    /// A Context seeded from `seed`, or from entropy when unset.
    pub fn context(&self) -> Context {
        match self.seed {
            Some(s) => Context::seeded(s),
            None => Context::new(),
        }
    }
}

/// Summary of one pass over a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    /// Mean loss per sample.
    pub loss: f64,
    pub n_correct: usize,
    pub n_samples: usize,
    pub elapsed: Duration,
}

impl EpochStats {
    pub fn accuracy(&self) -> f64 {
        if self.n_samples == 0 {
            0.0
        } else {
            self.n_correct as f64 / self.n_samples as f64
        }
    }
}

impl fmt::Display for EpochStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {}: elapsed {:.3}s loss {:.6} correct {}/{}",
            self.epoch,
            self.elapsed.as_secs_f64(),
            self.loss,
            self.n_correct,
            self.n_samples
        )
    }
}

/// Runs the per-batch training step over whole epochs.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainConfig,
    epoch: usize,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Trainer { config, epoch: 0 }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Epochs completed so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// One pass over `data` with parameter updates.
    pub fn train_epoch<F: Scalar>(
        &mut self,
        network: &mut Network<F>,
        data: &dyn Dataset,
        ctx: &mut Context,
    ) -> Result<EpochStats> {
        let stats = self.run(network, data, ctx, true)?;
        self.epoch += 1;
        tracing::info!(
            epoch = stats.epoch,
            elapsed = stats.elapsed.as_secs_f64(),
            loss = stats.loss,
            correct = stats.n_correct,
            total = stats.n_samples,
            "epoch finished"
        );
        Ok(stats)
    }

    /// Loss and accuracy over `data` without touching the parameters.
    pub fn evaluate<F: Scalar>(
        &self,
        network: &mut Network<F>,
        data: &dyn Dataset,
        ctx: &mut Context,
    ) -> Result<EpochStats> {
        self.run(network, data, ctx, false)
    }

    /// Train for `config.epochs` epochs.
    pub fn fit<F: Scalar>(
        &mut self,
        network: &mut Network<F>,
        data: &dyn Dataset,
        ctx: &mut Context,
    ) -> Result<Vec<EpochStats>> {
        (0..self.config.epochs)
            .map(|_| self.train_epoch(network, data, ctx))
            .collect()
    }

    fn run<F: Scalar>(
        &self,
        network: &mut Network<F>,
        data: &dyn Dataset,
        ctx: &mut Context,
        train: bool,
    ) -> Result<EpochStats> {
        let input = network.input_shape();
        if data.sample_shape().sample_size() != input.sample_size() {
            return Err(Error::ShapeMismatch {
                expected: input,
                got: data.sample_shape(),
            });
        }
        let batch = input.n().max(1);
        let lr = F::from_f64(self.config.learning_rate);
        let lambda = F::from_f64(self.config.l2);

        let mut order = Indices::new(data.count());
        if train && self.config.shuffle {
            order.shuffle(ctx);
        }
        let skipped = order.len() % batch;
        if skipped > 0 {
            tracing::debug!(skipped, batch, "dropping partial batch");
        }

        let start = Instant::now();
        let mut buf: Vec<F> = Vec::with_capacity(input.size());
        let mut labels = Vec::with_capacity(batch);
        let mut total_loss = 0.0f64;
        let mut n_correct = 0usize;
        let mut n_samples = 0usize;

        for (step, chunk) in order.as_slice().chunks_exact(batch).enumerate() {
            buf.clear();
            labels.clear();
            for &i in chunk {
                let sample = data.get_sample(i)?;
                buf.extend(sample.data.iter().map(|&v| F::from_f64(v as f64)));
                labels.push(sample.label);
            }

            network.forward(&buf)?;
            let loss = network.calculate_loss_batch(&labels)?;
            if train {
                network.backward()?;
                if self.config.l2 > 0.0 {
                    network.l2(lambda)?;
                }
                network.update(lr)?;
            }

            total_loss += loss.to_f64();
            n_correct += network.n_correct();
            n_samples += batch;

            if self.config.log_every > 0 && step % self.config.log_every == 0 {
                let out = network.output()?.to_vec()?;
                tracing::info!(step, labels = ?labels, output = ?out, "progress");
            }
        }

        let loss = if n_samples == 0 {
            0.0
        } else {
            total_loss / n_samples as f64
        };
        Ok(EpochStats {
            epoch: self.epoch,
            loss,
            n_correct,
            n_samples,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let c = TrainConfig::default()
            .epochs(3)
            .learning_rate(0.1)
            .l2(1e-4)
            .shuffle(false)
            .seed(7)
            .log_every(100);
        assert_eq!(c.epochs, 3);
        assert_eq!(c.learning_rate, 0.1);
        assert_eq!(c.l2, 1e-4);
        assert!(!c.shuffle);
        assert_eq!(c.context().seed(), Some(7));
        assert_eq!(c.log_every, 100);
    }

    #[test]
    fn test_stats_display() {
        let s = EpochStats {
            epoch: 2,
            loss: 0.5,
            n_correct: 3,
            n_samples: 4,
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(s.to_string(), "epoch 2: elapsed 1.500s loss 0.500000 correct 3/4");
        assert_eq!(s.accuracy(), 0.75);
    }
}
