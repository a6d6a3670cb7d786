// Integration tests for the network driver
//
// These tests build small networks through the public API and verify shape
// propagation, parameter accounting, the loss, gradient accumulation and
// persistence end-to-end.

use dexe::prelude::*;
use dexe::ParamRange;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn ramp(n: usize, scale: f64) -> Vec<f64> {
    (0..n).map(|i| ((i * 37 % 17) as f64 - 8.0) * scale).collect()
}

fn classifier(input: Shape) -> Network<f64> {
    let mut net = Network::new(input);
    net.add_conv(4, 3, 3).unwrap().add_tanh().unwrap();
    net.add_pool(2, 2).unwrap();
    net.add_squash(2).unwrap().add_softmax().unwrap();
    net.finish().unwrap();
    net
}

// Every operation variant in one chain:
//   conv(pad 1) → relu → pool → merge → split → conv → tanh → squash
//   → unsquash → squash → softmax
fn every_op_chain() -> Network<f64> {
    let mut net = Network::new(Shape::new(1, 2, 8, 8));
    net.add_conv_padded(4, 3, 3, 1).unwrap().add_relu().unwrap();
    net.add_pool(2, 2).unwrap();
    net.add_merge().unwrap().add_split().unwrap();
    net.add_conv(3, 3, 3).unwrap().add_tanh().unwrap();
    net.add_squash(8).unwrap();
    net.add_unsquash(Shape::new(1, 2, 2, 2)).unwrap();
    net.add_squash(3).unwrap().add_softmax().unwrap();
    net.finish().unwrap();
    net
}

fn wave(n: usize, scale: f64) -> Vec<f64> {
    (0..n).map(|i| (i as f64 * 0.37 + 0.1).sin() * scale).collect()
}

// Analytic gradient from backward against the central difference, per label.
fn assert_gradient_matches(net: &mut Network<f64>, input: &[f64], labels: &[usize]) {
    for &label in labels {
        net.zero_grad();
        net.backward_from(input, label).unwrap();
        let analytic = net.gradient();
        let numeric = net.fd_gradient(input, label, 1e-5).unwrap();
        assert_eq!(analytic.len(), net.n_params());
        assert_eq!(numeric.len(), net.n_params());

        for (i, (a, n)) in analytic.iter().zip(&numeric).enumerate() {
            let tol = 1e-2 * a.abs().max(n.abs()) + 1e-6;
            assert!(
                (a - n).abs() <= tol,
                "label {label}, param {i}: analytic {a} numeric {n}"
            );
        }
    }
}

// Construction

#[test]
fn test_shape_propagation() {
    let net = classifier(Shape::new(1, 3, 8, 8));
    assert_eq!(
        net.shapes(),
        vec![
            Shape::new(1, 3, 8, 8),
            Shape::new(1, 4, 6, 6),
            Shape::new(1, 4, 6, 6),
            Shape::new(1, 4, 3, 3),
            Shape::new(1, 2, 1, 1),
            Shape::new(1, 2, 1, 1),
        ]
    );
    assert_eq!(net.output_shape(), Shape::new(1, 2, 1, 1));
    assert_eq!(net.n_ops(), 5);
}

#[test]
fn test_shape_propagation_every_variant() {
    let net = every_op_chain();
    assert_eq!(
        net.shapes(),
        vec![
            Shape::new(1, 2, 8, 8),
            Shape::new(1, 4, 8, 8),  // conv 3x3, padding 1
            Shape::new(1, 4, 8, 8),  // relu
            Shape::new(1, 4, 4, 4),  // pool 2x2
            Shape::new(1, 16, 2, 2), // merge
            Shape::new(1, 4, 4, 4),  // split
            Shape::new(1, 3, 2, 2),  // conv 3x3
            Shape::new(1, 3, 2, 2),  // tanh
            Shape::new(1, 8, 1, 1),  // squash
            Shape::new(1, 2, 2, 2),  // unsquash
            Shape::new(1, 3, 1, 1),  // squash
            Shape::new(1, 3, 1, 1),  // softmax
        ]
    );
    assert_eq!(net.n_ops(), 11);
    assert_eq!(
        net.n_params(),
        (4 * 2 * 9 + 4) + (3 * 4 * 9 + 3) + (8 * 12 + 8) + (3 * 8 + 3)
    );
    assert_eq!(net.loss_fn().unwrap().name(), "softmax_cross_entropy");

    // Padding 2 around a 3x3 kernel grows the plane.
    let mut wide = Network::<f32>::new(Shape::new(2, 1, 4, 5));
    wide.add_conv_padded(2, 3, 3, 2).unwrap();
    assert_eq!(wide.output_shape(), Shape::new(2, 2, 6, 7));
}

#[test]
fn test_parameter_ranges_are_contiguous() {
    let net = classifier(Shape::new(1, 3, 8, 8));
    let conv = 4 * 3 * 3 * 3 + 4;
    let squash = 2 * 4 * 3 * 3 + 2;
    assert_eq!(
        net.param_ranges(),
        &[ParamRange::new(0, conv), ParamRange::new(conv, squash)]
    );
    assert_eq!(net.n_params(), conv + squash);
    assert_eq!(net.param_vec().len(), net.n_params());
    assert_eq!(net.gradient().len(), net.n_params());
}

#[test]
fn test_incompatible_shapes_fail_at_add_time() {
    let mut net = Network::<f32>::new(Shape::new(1, 1, 2, 2));
    assert!(net.add_conv(1, 3, 3).unwrap_err().is_configuration());
    assert!(net.add_merge().is_ok());
    assert!(net.add_merge().is_err());
    assert!(net.add_unsquash(Shape::new(1, 2, 2, 2)).is_err());
    assert_eq!(net.n_ops(), 1);
}

#[test]
fn test_lifecycle_errors() {
    let mut net = Network::<f32>::new(Shape::new(1, 1, 2, 2));
    net.add_relu().unwrap();
    assert!(matches!(net.forward(&[0.0; 4]).unwrap_err(), Error::NotFinished));
    net.finish().unwrap();
    assert!(matches!(net.add_relu().unwrap_err(), Error::AlreadyFinished));
    assert!(matches!(
        net.forward(&[0.0; 3]).unwrap_err(),
        Error::LengthMismatch { expected: 4, got: 3 }
    ));
}

// Loss

#[test]
fn test_cross_entropy_through_softmax() {
    let mut net = Network::<f64>::new(Shape::new(1, 2, 1, 1));
    net.add_softmax().unwrap();
    net.finish().unwrap();
    net.forward(&[0.7f64.ln(), 0.3f64.ln()]).unwrap();

    let out = net.output().unwrap().to_vec().unwrap();
    assert_vec_approx(&out, &[0.7, 0.3], 1e-12);

    let l = net.calculate_loss(0).unwrap();
    assert!(approx_eq(l, 0.356_674_9, 1e-6));
    assert_eq!(net.n_correct(), 1);

    let l = net.calculate_loss(1).unwrap();
    assert!(approx_eq(l, 1.203_972_8, 1e-6));
    assert_eq!(net.n_correct(), 0);

    assert!(matches!(
        net.calculate_loss(2).unwrap_err(),
        Error::LabelOutOfRange { label: 2, classes: 2 }
    ));
}

#[test]
fn test_tie_goes_to_first_class() {
    let mut net = Network::<f64>::new(Shape::new(1, 3, 1, 1));
    net.add_softmax().unwrap();
    net.finish().unwrap();
    net.forward(&[0.0, 0.0, -1000.0]).unwrap();
    assert_vec_approx(&net.output().unwrap().to_vec().unwrap(), &[0.5, 0.5, 0.0], 1e-12);

    net.calculate_loss(0).unwrap();
    assert_eq!(net.n_correct(), 1);
    net.calculate_loss(1).unwrap();
    assert_eq!(net.n_correct(), 0);
}

#[test]
fn test_batched_loss_sums_rows() {
    let mut net = Network::<f64>::new(Shape::new(2, 2, 1, 1));
    net.add_softmax().unwrap();
    net.finish().unwrap();
    net.forward(&[0.7f64.ln(), 0.3f64.ln(), 0.3f64.ln(), 0.7f64.ln()]).unwrap();
    let l = net.calculate_loss_batch(&[0, 1]).unwrap();
    assert!(approx_eq(l, 2.0 * 0.356_674_9, 1e-6));
    assert_eq!(net.n_correct(), 2);
}

// Gradients

#[test]
fn test_gradient_matches_finite_difference() {
    let mut net = Network::<f64>::new(Shape::new(1, 3, 8, 8));
    net.add_conv(2, 3, 3).unwrap().add_tanh().unwrap();
    net.add_squash(2).unwrap().add_softmax().unwrap();
    net.finish().unwrap();
    net.init_normal(&mut Context::seeded(11), 0.0, 0.1).unwrap();

    let input = ramp(3 * 8 * 8, 0.1);
    assert_gradient_matches(&mut net, &input, &[0, 1]);
}

#[test]
fn test_gradient_matches_finite_difference_every_op() {
    let mut net = every_op_chain();
    net.init_normal(&mut Context::seeded(21), 0.0, 0.3).unwrap();
    let input = wave(2 * 8 * 8, 1.0);
    assert_gradient_matches(&mut net, &input, &[0, 1, 2]);
}

#[test]
fn test_gradient_matches_finite_difference_squared_loss() {
    // No softmax, so the default loss is squared error over the output.
    // The 5x5 plane does not divide by the 2x2 pool; the last row and
    // column are dropped and must get zero gradient.
    let mut net = Network::<f64>::new(Shape::new(1, 1, 7, 7));
    net.add_conv(2, 3, 3).unwrap().add_tanh().unwrap();
    net.add_pool(2, 2).unwrap();
    net.add_squash(3).unwrap();
    net.finish().unwrap();
    assert_eq!(net.loss_fn().unwrap().name(), "squared_error");
    assert_eq!(net.shapes()[3], Shape::new(1, 2, 2, 2));

    net.init_normal(&mut Context::seeded(17), 0.0, 0.4).unwrap();
    let input = wave(49, 0.8);
    assert_gradient_matches(&mut net, &input, &[0, 2]);

    let gx = net.slot(2).unwrap().grad().to_vec().unwrap();
    let plane = Shape::new(1, 2, 5, 5);
    for c in 0..2 {
        for i in 0..5 {
            assert_eq!(gx[plane.offset(0, c, 4, i)], 0.0);
            assert_eq!(gx[plane.offset(0, c, i, 4)], 0.0);
        }
    }
}

#[test]
fn test_fd_gradient_restores_state() {
    let mut net = classifier(Shape::new(1, 1, 8, 8));
    net.init_normal(&mut Context::seeded(2), 0.0, 0.2).unwrap();
    let input = ramp(64, 0.05);

    net.backward_from(&input, 1).unwrap();
    let params = net.param_vec();
    let grads = net.gradient();
    let loss = net.loss();
    let out_grad = net.output_grad().unwrap().to_vec().unwrap();

    net.fd_gradient(&input, 0, 1e-3).unwrap();
    assert_eq!(net.param_vec(), params);
    assert_eq!(net.gradient(), grads);
    assert_eq!(net.loss(), loss);
    assert_eq!(net.output_grad().unwrap().to_vec().unwrap(), out_grad);
}

#[test]
fn test_backward_accumulates_until_update() {
    let mut net = classifier(Shape::new(1, 1, 8, 8));
    net.init_normal(&mut Context::seeded(5), 0.0, 0.2).unwrap();
    let input = ramp(64, 0.05);

    net.backward_from(&input, 0).unwrap();
    let once = net.gradient();
    net.backward_from(&input, 0).unwrap();
    let twice = net.gradient();
    let doubled: Vec<f64> = once.iter().map(|g| 2.0 * g).collect();
    assert_vec_approx(&twice, &doubled, 1e-12);

    let before = net.param_vec();
    net.update(0.1).unwrap();
    let expected: Vec<f64> = before.iter().zip(&twice).map(|(p, g)| p - 0.1 * g).collect();
    assert_vec_approx(&net.param_vec(), &expected, 1e-12);
    assert!(net.gradient().iter().all(|&g| g == 0.0));
}

#[test]
fn test_update_with_zero_grad_is_identity() {
    let mut net = classifier(Shape::new(1, 1, 8, 8));
    net.init_normal(&mut Context::seeded(6), 0.0, 0.2).unwrap();
    let before = net.param_vec();
    net.update(0.5).unwrap();
    assert_eq!(net.param_vec(), before);

    net.backward_from(&ramp(64, 0.05), 1).unwrap();
    net.zero_grad();
    net.update(0.5).unwrap();
    assert_eq!(net.param_vec(), before);
}

#[test]
fn test_backward_data_leaves_weight_grads() {
    let mut net = classifier(Shape::new(1, 1, 8, 8));
    net.init_normal(&mut Context::seeded(8), 0.0, 0.2).unwrap();
    net.forward(&ramp(64, 0.05)).unwrap();
    net.calculate_loss(1).unwrap();
    net.backward_data().unwrap();
    assert!(net.gradient().iter().all(|&g| g == 0.0));
    assert!(net.input_grad().unwrap().to_vec().unwrap().iter().any(|&g| g != 0.0));
}

#[test]
fn test_pool_routes_to_latest_forward() {
    let mut net = Network::<f64>::new(Shape::new(1, 1, 2, 4));
    net.add_pool(2, 2).unwrap();
    net.finish().unwrap();

    net.forward(&[9.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 9.0]).unwrap();
    net.forward(&[0.0, 0.0, 0.0, 5.0, 6.0, 0.0, 0.0, 0.0]).unwrap();

    let target = Tensor::from_vec(Shape::new(1, 1, 1, 2), vec![0.0, 0.0]).unwrap();
    let l = net.calculate_loss_target(&target).unwrap();
    assert!(approx_eq(l, 0.5 * (36.0 + 25.0), 1e-12));
    net.backward().unwrap();

    let gx = net.input_grad().unwrap().to_vec().unwrap();
    assert_vec_approx(&gx, &[0.0, 0.0, 0.0, 5.0, 6.0, 0.0, 0.0, 0.0], 1e-12);
}

// Initialisation and persistence

#[test]
fn test_seeded_init_is_reproducible() {
    let mut a = classifier(Shape::new(1, 1, 8, 8));
    let mut b = classifier(Shape::new(1, 1, 8, 8));
    a.init_uniform(&mut Context::seeded(42), 0.3).unwrap();
    b.init_uniform(&mut Context::seeded(42), 0.3).unwrap();
    assert_eq!(a.param_vec(), b.param_vec());
    assert!(a.param_vec().iter().all(|p| p.abs() <= 0.3));
}

#[test]
fn test_save_load_roundtrip() {
    let path = std::env::temp_dir().join(format!("dexe_roundtrip_{}.dexe", std::process::id()));
    let input = ramp(64, 0.05);

    let mut a = classifier(Shape::new(1, 1, 8, 8));
    a.init_normal(&mut Context::seeded(1), 0.0, 0.3).unwrap();
    a.save(&path).unwrap();
    a.forward(&input).unwrap();
    let expected = a.output().unwrap().to_vec().unwrap();

    let mut b = classifier(Shape::new(1, 1, 8, 8));
    b.init_normal(&mut Context::seeded(2), 0.0, 0.3).unwrap();
    b.load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(a.param_vec(), b.param_vec());
    b.forward(&input).unwrap();
    assert_eq!(b.output().unwrap().to_vec().unwrap(), expected);
}

#[test]
fn test_load_count_mismatch_leaves_network() {
    let a = classifier(Shape::new(1, 1, 8, 8));
    let bytes = dexe::checkpoint::to_bytes(&a).unwrap();

    let mut b = Network::<f64>::new(Shape::new(1, 1, 8, 8));
    b.add_conv(4, 3, 3).unwrap().add_squash(3).unwrap();
    b.finish().unwrap();
    b.init_normal(&mut Context::seeded(3), 0.0, 0.3).unwrap();
    let before = b.param_vec();

    let err = dexe::checkpoint::from_bytes(&bytes, &mut b).unwrap_err();
    assert!(matches!(
        err,
        Error::ParamCountMismatch { expected, got } if expected == b.n_params() && got == a.n_params()
    ));
    assert_eq!(b.param_vec(), before);
}

#[test]
fn test_weight_clip_after_update() {
    let mut net = Network::<f64>::new(Shape::new(1, 1, 3, 3));
    let conv = Convolution::new(1, 1, 2, 2).unwrap().with_weight_clip(0.05);
    net.add_operation(Box::new(conv)).unwrap();
    net.finish().unwrap();
    net.init_uniform(&mut Context::seeded(9), 0.04).unwrap();

    net.forward(&[1.0; 9]).unwrap();
    let target = Tensor::from_vec(Shape::new(1, 1, 2, 2), vec![10.0; 4]).unwrap();
    net.calculate_loss_target(&target).unwrap();
    net.backward().unwrap();
    net.update(1.0).unwrap();

    let params = net.param_vec();
    assert!(params[..4].iter().all(|w| w.abs() <= 0.05 + 1e-12));
    assert!(params[4] > 0.05);
}
