use dynbatch::node::dropout_zero_count;
use dynbatch::operators::*;
use dynbatch::{ExecutionMode, Graph, GraphConfig};

fn seeded(seed: u64) -> Graph {
    Graph::new(GraphConfig::default().with_seed(seed))
}

#[test]
fn test_training_zeroes_exact_count() {
    for (dim, rate) in [(10, 0.3), (7, 0.5), (16, 0.25), (3, 0.1), (100, 0.9)] {
        let mut g = seeded(5);
        let values: Vec<f32> = (1..=dim).map(|i| i as f32).collect();
        let x = g.input(&values);
        let d = dropout_with_mode(&mut g, x, rate, true);
        g.forward();

        let out = g.value(d);
        let zeros = out.iter().filter(|&&v| v == 0.0).count();
        assert_eq!(zeros, dropout_zero_count(dim, rate), "dim {dim}, rate {rate}");
        // survivors pass through unscaled
        for (o, v) in out.iter().zip(&values) {
            assert!(*o == 0.0 || o == v);
        }
    }
}

#[test]
fn test_rate_zero_is_identity() {
    let mut g = seeded(1);
    let x = g.input(&[1.0, -2.0, 3.0]);
    let d = dropout_with_mode(&mut g, x, 0.0, true);
    g.forward();
    assert_eq!(g.value(d), &[1.0, -2.0, 3.0]);
}

#[test]
fn test_inference_scales_by_keep_probability() {
    let mut g = seeded(1);
    let x = g.input(&[2.0, -4.0, 8.0]);
    let d = dropout_with_mode(&mut g, x, 0.25, false);
    g.forward();
    assert_eq!(g.value(d), &[1.5, -3.0, 6.0]);

    g.backward(&[(d, &[1.0, 1.0, 1.0])]);
    assert_eq!(g.grad(x), Some(&[0.75, 0.75, 0.75][..]));
}

#[test]
fn test_graph_training_flag_picks_the_mode() {
    let mut g = Graph::new(GraphConfig::default().with_training(false));
    let x = g.input(&[4.0, 4.0]);
    let d = dropout(&mut g, x, 0.5);
    g.forward();
    assert_eq!(g.value(d), &[2.0, 2.0]);
}

#[test]
fn test_backward_routes_through_mask() {
    let mut g = seeded(17);
    let x = g.input(&[1.0; 8]);
    let d = dropout_with_mode(&mut g, x, 0.5, true);
    g.forward();
    let mask = g.node(d).dropout_mask().unwrap().to_vec();

    g.backward(&[(d, &[3.0; 8])]);
    let expected: Vec<f32> = mask.iter().map(|m| 3.0 * m).collect();
    assert_eq!(g.grad(x), Some(expected.as_slice()));
}

#[test]
fn test_positions_are_dropped_uniformly() {
    let (dim, rate, trials) = (10, 0.3, 3000);
    let mut g = seeded(2024);
    let x = g.input(&[1.0; 10]);
    let d = dropout_with_mode(&mut g, x, rate, true);

    let mut hits = [0usize; 10];
    for _ in 0..trials {
        g.forward_batch(&[d]);
        for (h, &v) in hits.iter_mut().zip(g.value(d)) {
            if v == 0.0 {
                *h += 1;
            }
        }
    }

    let expected = trials * dropout_zero_count(dim, rate) / dim;
    for (i, &h) in hits.iter().enumerate() {
        assert!(h.abs_diff(expected) < expected / 5, "position {i} dropped {h} times, expected about {expected}");
    }
}

#[test]
fn test_same_seed_gives_same_masks_in_every_mode() {
    let masks: Vec<Vec<f32>> = [
        ExecutionMode::Cpu,
        ExecutionMode::Accelerated,
        ExecutionMode::AcceleratedWithVerification,
    ]
    .into_iter()
    .map(|mode| {
        let mut g = Graph::new(GraphConfig::new(mode).with_seed(77));
        let x = g.input(&[1.0; 12]);
        let y = g.input(&[2.0; 12]);
        let dx = dropout_with_mode(&mut g, x, 0.5, true);
        let dy = dropout_with_mode(&mut g, y, 0.5, true);
        g.forward();
        let mut mask = g.value(dx).to_vec();
        mask.extend_from_slice(g.value(dy));
        mask
    })
    .collect();

    assert_eq!(masks[0], masks[1]);
    assert_eq!(masks[0], masks[2]);
}
