// Adversarial — Fast-gradient-sign examples
//
// For a sample x with label y:
//
//   x' = x + step · sign(∂L/∂x)
//
// with sign(0) = 0. The input gradient comes from backward_data, so the
// network's weight gradients are never touched and generating examples can
// be interleaved with training without disturbing an accumulation in
// progress. Works on networks whose input batch size is 1.

use dexe_core::{Error, Result, Scalar};
use dexe_data::{Dataset, Sample, VecDataset};

use crate::network::Network;

/// Fast-gradient-sign perturbation of a single input.
pub fn perturb<F: Scalar>(
    network: &mut Network<F>,
    input: &[F],
    label: usize,
    step: F,
) -> Result<Vec<F>> {
    network.forward(input)?;
    network.calculate_loss(label)?;
    network.backward_data()?;
    let grad = network.input_grad()?.data()?;
    Ok(input
        .iter()
        .zip(grad)
        .map(|(&x, &g)| x + step * sign(g))
        .collect())
}

fn sign<F: Scalar>(v: F) -> F {
    if v > F::zero() {
        F::one()
    } else if v < F::zero() {
        -F::one()
    } else {
        F::zero()
    }
}

fn check_geometry<F: Scalar>(network: &Network<F>, data: &dyn Dataset) -> Result<()> {
    let input = network.input_shape();
    if input.n() != 1 {
        return Err(Error::InvalidConfig(format!(
            "adversarial examples need a batch size of 1, network input is {input}"
        )));
    }
    if data.sample_shape().size() != input.size() {
        return Err(Error::ShapeMismatch {
            expected: input,
            got: data.sample_shape(),
        });
    }
    Ok(())
}

fn perturb_sample<F: Scalar>(network: &mut Network<F>, sample: &Sample, step: F) -> Result<Sample> {
    let x: Vec<F> = sample.data.iter().map(|&v| F::from_f64(v as f64)).collect();
    let adv = perturb(network, &x, sample.label, step)?;
    Ok(Sample {
        data: adv.iter().map(|&v| v.to_f64() as f32).collect(),
        label: sample.label,
    })
}

/// Replace every sample of `data` with its adversarial counterpart.
pub fn make_adversarial_dataset<F: Scalar>(
    network: &mut Network<F>,
    data: &dyn Dataset,
    step: f32,
) -> Result<VecDataset> {
    check_geometry(network, data)?;
    let step = F::from_f64(step as f64);
    let samples = (0..data.count())
        .map(|i| perturb_sample(network, &data.get_sample(i)?, step))
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(samples = samples.len(), "built adversarial dataset");
    VecDataset::new(data.sample_shape(), data.classes(), samples)
}

/// Append adversarial copies of the first `n` samples of `data` to itself.
/// `n` is capped at the number of samples present on entry.
pub fn add_n_adversarial<F: Scalar>(
    network: &mut Network<F>,
    data: &mut VecDataset,
    n: usize,
    step: f32,
) -> Result<usize> {
    check_geometry(network, &*data)?;
    let step = F::from_f64(step as f64);
    let n = n.min(data.count());
    let added = data.samples()[..n]
        .iter()
        .map(|s| perturb_sample(network, s, step))
        .collect::<Result<Vec<_>>>()?;
    for s in added {
        data.push(s)?;
    }
    tracing::debug!(added = n, total = data.count(), "appended adversarial samples");
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexe_core::{Context, Shape};

    fn net() -> Network<f64> {
        let mut net = Network::new(Shape::new(1, 1, 3, 3));
        net.add_conv(2, 2, 2).unwrap().add_tanh().unwrap();
        net.add_squash(2).unwrap().add_softmax().unwrap();
        net.finish().unwrap();
        net.init_normal(&mut Context::seeded(4), 0.0, 0.5).unwrap();
        net
    }

    #[test]
    fn test_perturb_moves_by_step_along_sign() {
        let mut net = net();
        let x: Vec<f64> = (0..9).map(|i| i as f64 * 0.1).collect();
        let adv = perturb(&mut net, &x, 1, 0.05).unwrap();
        let grad = net.input_grad().unwrap().to_vec().unwrap();
        for ((a, b), g) in adv.iter().zip(&x).zip(&grad) {
            assert!((a - (b + 0.05 * sign(*g))).abs() < 1e-12);
        }
    }

    #[test]
    fn test_perturb_leaves_weight_grads() {
        let mut net = net();
        let x = vec![0.3; 9];
        perturb(&mut net, &x, 0, 0.1).unwrap();
        assert!(net.gradient().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_perturb_increases_loss() {
        let mut net = net();
        let x: Vec<f64> = (0..9).map(|i| (i as f64 - 4.0) * 0.2).collect();
        net.forward(&x).unwrap();
        let before = net.calculate_loss(0).unwrap();
        let adv = perturb(&mut net, &x, 0, 0.01).unwrap();
        net.forward(&adv).unwrap();
        let after = net.calculate_loss(0).unwrap();
        assert!(after >= before);
    }

    #[test]
    fn test_sign_of_zero() {
        assert_eq!(sign(0.0f32), 0.0);
        assert_eq!(sign(-3.0f32), -1.0);
        assert_eq!(sign(2.0f64), 1.0);
    }
}
