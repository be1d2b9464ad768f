mod common;

use approx::assert_relative_eq;
use common::{SequenceCheck, random_mat, random_vec, rng};
use layerwise::{
    Context, DifferentiableFunction, Gru, Initialization, Layer, Linear, Loss, Lstm, Module, Rnn,
    faer::Mat,
};

const STEPS: usize = 5;

fn regression_rnn(rho: Option<usize>, cell_rho: Option<usize>) -> Rnn {
    let mut rnn = Rnn::new(Loss::MeanSquaredError, Initialization::Glorot, 3).with_rho(rho);
    rnn.add(Linear::new(2, 3));
    rnn.add(Lstm::new(3, 3).with_rho(cell_rho));
    rnn.add(Linear::new(3, 1));
    let mut rng = rng(12);
    let predictors = (0..STEPS).map(|_| random_mat(2, 4, &mut rng)).collect();
    let responses = (0..STEPS).map(|_| random_mat(1, 4, &mut rng)).collect();
    rnn.set_data(predictors, responses).unwrap();
    rnn.reset().unwrap();
    rnn
}

/// Plain gradient descent over the whole batch; returns the final loss.
fn train(rnn: &mut Rnn, iterations: usize) -> f64 {
    let batch = rnn.num_functions();
    let mut grad = vec![0.0; rnn.parameters().len()];
    for _ in 0..iterations {
        let params = rnn.parameters().to_vec();
        rnn.gradient(&params, 0, &mut grad, batch).unwrap();
        for (p, g) in rnn.parameters_mut().iter_mut().zip(&grad) {
            *p -= 0.05 * g;
        }
    }
    let params = rnn.parameters().to_vec();
    rnn.evaluate(&params, 0, batch).unwrap()
}

fn assert_same_parameters(a: &Rnn, b: &Rnn) {
    for (x, y) in a.parameters().iter().zip(b.parameters()) {
        assert_relative_eq!(x, y, max_relative = 1e-12);
    }
}

#[test]
fn full_window_matches_unbounded_training() {
    let mut unbounded = regression_rnn(None, None);
    let mut windowed = regression_rnn(Some(STEPS), None);
    let loss_a = train(&mut unbounded, 6);
    let loss_b = train(&mut windowed, 6);
    assert_relative_eq!(loss_a, loss_b, max_relative = 1e-12);
    assert_same_parameters(&unbounded, &windowed);
}

#[test]
fn full_cell_window_matches_unbounded_training() {
    let mut unbounded = regression_rnn(None, None);
    let mut windowed = regression_rnn(None, Some(STEPS));
    train(&mut unbounded, 6);
    train(&mut windowed, 6);
    assert_same_parameters(&unbounded, &windowed);
}

#[test]
fn training_lowers_the_loss() {
    let mut rnn = regression_rnn(None, None);
    let params = rnn.parameters().to_vec();
    let before = rnn.evaluate(&params, 0, rnn.num_functions()).unwrap();
    let after = train(&mut rnn, 20);
    assert!(after < before, "{after} >= {before}");
}

#[test]
fn shorter_window_changes_the_gradient() {
    let mut full = regression_rnn(None, None);
    let mut truncated = regression_rnn(Some(2), None);
    let params = full.parameters().to_vec();
    let mut grad_full = vec![0.0; params.len()];
    let mut grad_truncated = vec![0.0; params.len()];
    let loss_full = full.gradient(&params, 0, &mut grad_full, 4).unwrap();
    let loss_truncated = truncated.gradient(&params, 0, &mut grad_truncated, 4).unwrap();
    // The loss still covers every step.
    assert_relative_eq!(loss_full, loss_truncated, max_relative = 1e-12);
    assert_ne!(grad_full, grad_truncated);
}

#[test]
fn exhausted_cell_window_stops_input_gradients() {
    for mut layer in [
        Layer::from(Lstm::new(3, 2).with_rho(Some(1))),
        Layer::from(Gru::new(3, 2).with_rho(Some(1))),
    ] {
        let params = random_vec(layer.n_params(), 0.5, &mut rng(2));
        let check = SequenceCheck::new(&mut layer, &params, (3, 2), 3, 5);
        let (_, deltas) = check.analytic(&mut layer, &params);
        assert!(deltas[2].norm_l2() > 0.0);
        for delta in &deltas[..2] {
            assert_eq!(delta.norm_l2(), 0.0);
        }
    }
}

#[test]
fn single_step_window_matches_a_one_step_numeric_gradient() {
    // With rho 1 only the last step's direct dependence on the parameters
    // is kept, so the gradient equals that of the final step alone with the
    // carried state held fixed.
    let mut lstm = Lstm::new(2, 2).with_rho(Some(1));
    let params = random_vec(lstm.n_params(), 0.5, &mut rng(4));
    let mut rng = rng(9);
    let inputs: Vec<Mat<f64>> = (0..3).map(|_| random_mat(2, 1, &mut rng)).collect();
    let weights = random_mat(2, 1, &mut rng);

    let mut ctx = Context::training(0);
    for x in &inputs {
        lstm.forward(&mut ctx, &params, x.as_ref()).unwrap();
    }
    let last = inputs[2].as_ref();
    lstm.backward(&params, last, weights.as_ref()).unwrap();
    let mut grad = vec![0.0; params.len()];
    lstm.gradient(&params, last, weights.as_ref(), &mut grad)
        .unwrap();

    // Replay the first two steps with the original parameters, then perturb
    // only the last one.
    let last_step = |shifted: &[f64]| {
        let mut replay = Lstm::new(2, 2);
        let mut ctx = Context::training(0);
        for x in &inputs[..2] {
            replay.forward(&mut ctx, &params, x.as_ref()).unwrap();
        }
        let y = replay.forward(&mut ctx, shifted, last).unwrap();
        (0..2).map(|i| y[(i, 0)] * weights[(i, 0)]).sum::<f64>()
    };
    let mut shifted = params.clone();
    for (i, g) in grad.iter().enumerate() {
        shifted[i] = params[i] + common::STEP;
        let up = last_step(&shifted);
        shifted[i] = params[i] - common::STEP;
        let down = last_step(&shifted);
        shifted[i] = params[i];
        assert_relative_eq!(*g, (up - down) / (2.0 * common::STEP), epsilon = 1e-6);
    }
}

#[test]
fn stateful_cells_carry_state_across_sequences() {
    let x = Mat::from_fn(2, 1, |i, _| 0.5 + i as f64);
    let run_twice = |mut layer: Layer| {
        let params = vec![0.4; layer.n_params()];
        let mut ctx = Context::training(0);
        let mut outputs = Vec::new();
        for _ in 0..2 {
            layer.begin_sequence();
            outputs.push(layer.forward(&mut ctx, &params, x.as_ref()).unwrap());
        }
        (outputs[0][(0, 0)], outputs[1][(0, 0)])
    };

    let (first, second) = run_twice(Lstm::new(2, 2).into());
    assert_eq!(first, second);
    let (first, second) = run_twice(Lstm::new(2, 2).with_stateful(true).into());
    assert_ne!(first, second);
    let (first, second) = run_twice(Gru::new(2, 2).into());
    assert_eq!(first, second);
    let (first, second) = run_twice(Gru::new(2, 2).with_stateful(true).into());
    assert_ne!(first, second);
}

#[test]
fn single_response_network_scores_the_last_step() {
    let mut rnn = Rnn::new(Loss::MeanSquaredError, Initialization::Glorot, 1).with_single(true);
    rnn.add(Gru::new(1, 1));
    let mut rng = rng(3);
    let predictors: Vec<Mat<f64>> = (0..4).map(|_| random_mat(1, 2, &mut rng)).collect();
    let target = random_mat(1, 2, &mut rng);
    rnn.set_data(predictors.clone(), vec![target.clone()]).unwrap();
    rnn.reset().unwrap();

    let params = rnn.parameters().to_vec();
    let loss = rnn.evaluate(&params, 0, 2).unwrap();
    let outputs: Vec<_> = (0..2)
        .map(|j| {
            let sequence: Vec<Mat<f64>> = predictors
                .iter()
                .map(|m| Mat::from_fn(1, 1, |_, _| m[(0, j)]))
                .collect();
            rnn.predict(&sequence).unwrap().last().unwrap()[(0, 0)]
        })
        .collect();
    let expected = Loss::MeanSquaredError
        .forward(
            Mat::from_fn(1, 2, |_, j| outputs[j]).as_ref(),
            target.as_ref(),
        )
        .unwrap();
    assert_relative_eq!(loss, expected, max_relative = 1e-10);
}
