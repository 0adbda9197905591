//! Checks the gradient graphs built by autograd against central finite
//! differences, one operation at a time.

use mnist_wgan::asg::Value;
use mnist_wgan::runtime::session::Session;
use mnist_wgan::tensor::{GraphContext, Tensor};

use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;

const EPSILON: f32 = 1e-2;
const ABS_TOLERANCE: f32 = 1e-2;
const REL_TOLERANCE: f32 = 2e-2;

/// Deterministic values in roughly `[-1.3, 1.1]`, never closer than 0.1 to zero.
fn values(shape: &[usize], salt: usize) -> ArrayD<f32> {
    let n: usize = shape.iter().product();
    let data = (0..n).map(|i| (((i + salt) * 7 % 13) as f32 - 6.5) / 5.0).collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
}

fn literal(like: &Tensor, shape: &[usize], salt: usize, name: &str) -> Tensor {
    Tensor::new_literal(&like.context, values(shape, salt), name)
}

/// Weighted sum of `y`, so that every output element gets a distinct
/// upstream gradient.
fn weighted_sum(y: &Tensor, shape: &[usize]) -> Tensor {
    (y * &literal(y, shape, 3, "r")).sum()
}

fn assert_grads_are_close(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
    assert_eq!(analytic.shape(), numeric.shape(), "gradient shapes differ");
    for (i, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
        let diff = (a - n).abs();
        let bound = ABS_TOLERANCE + REL_TOLERANCE * a.abs().max(n.abs());
        assert!(diff <= bound, "element {}: analytic {:.6}, numeric {:.6}", i, a, n);
    }
}

/// Differentiates `build(p)` with respect to the parameter `p` both ways.
fn check_gradient(param_shape: &[usize], build: impl Fn(&Tensor) -> Tensor) {
    let ctx = GraphContext::shared();
    let p = Tensor::new_parameter(&ctx, "p");
    let loss = build(&p);

    let initial = values(param_shape, 0);
    let mut session = Session::cpu();
    session.parameters_mut().insert("p".to_string(), Value::Tensor(initial.clone()));
    let feed = HashMap::new();
    let shapes = HashMap::new();

    let grad_program = session.compile_gradients(&ctx, &loss, &[p.clone()], &shapes).unwrap();
    let (_, grads) = session.run_with_gradients(&grad_program, &feed).unwrap();
    let analytic = grads["p"].clone().into_array();

    let forward = session.compile(&ctx, &[&loss], &shapes).unwrap();
    let mut eval = |x: ArrayD<f32>| {
        session.parameters_mut().insert("p".to_string(), Value::Tensor(x));
        session.run(&forward, &feed).unwrap()[0].scalar().unwrap()
    };

    let mut numeric = ArrayD::zeros(initial.raw_dim());
    for i in 0..initial.len() {
        let mut plus = initial.clone();
        plus.as_slice_mut().unwrap()[i] += EPSILON;
        let mut minus = initial.clone();
        minus.as_slice_mut().unwrap()[i] -= EPSILON;
        numeric.as_slice_mut().unwrap()[i] = (eval(plus) - eval(minus)) / (2.0 * EPSILON);
    }

    assert_grads_are_close(&analytic, &numeric);
}

#[test]
fn matmul_right_operand() {
    check_gradient(&[3, 4], |p| weighted_sum(&literal(p, &[2, 3], 1, "x").dot(p), &[2, 4]));
}

#[test]
fn matmul_left_operand() {
    check_gradient(&[2, 3], |p| weighted_sum(&p.dot(&literal(p, &[3, 4], 1, "w")), &[2, 4]));
}

#[test]
fn relu() {
    check_gradient(&[2, 5], |p| weighted_sum(&p.relu(), &[2, 5]));
}

#[test]
fn sigmoid() {
    check_gradient(&[2, 5], |p| weighted_sum(&p.sigmoid(), &[2, 5]));
}

#[test]
fn broadcast_add_of_bias() {
    check_gradient(&[1, 4], |p| weighted_sum(&(&literal(p, &[3, 4], 1, "x") + p), &[3, 4]));
}

#[test]
fn broadcast_multiply_and_subtract() {
    check_gradient(&[1, 4], |p| {
        let x = literal(p, &[3, 4], 1, "x");
        weighted_sum(&(&(&x * p) - p), &[3, 4])
    });
}

#[test]
fn mean_and_negate() {
    check_gradient(&[3, 3], |p| -&(p * &literal(p, &[3, 3], 2, "x")).mean());
}

#[test]
fn reshape_keeps_batch_axis() {
    check_gradient(&[2, 6], |p| weighted_sum(&p.reshape(&[3, 2]), &[2, 3, 2]));
}

#[test]
fn strided_conv_wrt_input() {
    check_gradient(&[1, 5, 5, 2], |p| {
        let filter = literal(p, &[3, 3, 2, 3], 1, "filter");
        weighted_sum(&p.conv2d(&filter, (2, 2)), &[1, 3, 3, 3])
    });
}

#[test]
fn conv_wrt_filter() {
    check_gradient(&[3, 3, 2, 3], |p| {
        let input = literal(p, &[2, 4, 4, 2], 1, "input");
        weighted_sum(&input.conv2d(p, (1, 1)), &[2, 4, 4, 3])
    });
}

#[test]
fn strided_conv_wrt_filter() {
    check_gradient(&[3, 3, 1, 2], |p| {
        let input = literal(p, &[1, 6, 6, 1], 1, "input");
        weighted_sum(&input.conv2d(p, (2, 2)), &[1, 3, 3, 2])
    });
}

#[test]
fn bilinear_upsample() {
    check_gradient(&[1, 3, 3, 2], |p| weighted_sum(&p.resize_bilinear((6, 6)), &[1, 6, 6, 2]));
}

#[test]
fn bilinear_resize_to_uneven_size() {
    check_gradient(&[2, 4, 3, 1], |p| weighted_sum(&p.resize_bilinear((5, 7)), &[2, 5, 7, 1]));
}

#[test]
fn generator_like_chain() {
    check_gradient(&[4, 8], |p| {
        let noise = literal(p, &[2, 4], 1, "noise");
        let bias = literal(p, &[1, 8], 2, "bias");
        let hidden = (&noise.dot(p) + &bias).sigmoid();
        let image = hidden.reshape(&[2, 4, 1]).resize_bilinear((4, 8));
        let filter = literal(p, &[3, 3, 1, 1], 4, "filter");
        image.conv2d(&filter, (1, 1)).sigmoid().mean()
    });
}
