use dynbatch::approx::first_mismatch;
use dynbatch::operators::*;
use dynbatch::ops::cpu::CpuKernels;
use dynbatch::ops::{BackwardBatch, ForwardBatch};
use dynbatch::{ExecutionMode, Graph, GraphConfig, GraphError, KernelError, Kernels, NodeId, Op};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Builds a graph of eight independent chains over shared weights and returns
/// the leaves and the loss.
fn build(g: &mut Graph) -> (Vec<NodeId>, NodeId) {
    let w = g.input(&[0.5, -0.25, 1.5, 0.75]);
    let mut leaves = vec![w];
    let mut scores = Vec::new();
    for i in 0..8 {
        let base = i as f32 * 0.1;
        let x = g.input(&[base, 0.3 - base, base * base, -0.2]);
        leaves.push(x);
        let h = tanh(g, x);
        let d = dropout(g, h, 0.25);
        let p = point_mul(g, d, w);
        let s = vector_sum(g, p);
        let v = scalar_to_vector(g, 4, s);
        let r = relu(g, v);
        let m = max_scalar(g, r);
        scores.push(add(g, &[m, s]));
    }
    let total = add(g, &scores);
    (leaves, total)
}

fn run(mode: ExecutionMode) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let mut g = Graph::new(GraphConfig::new(mode).with_seed(99));
    let (leaves, total) = build(&mut g);
    g.forward();
    g.backward(&[(total, &[1.0])]);
    let values = g.nodes().iter().map(|n| n.value().data.clone()).collect();
    let grads = leaves.iter().map(|&l| g.grad(l).unwrap().to_vec()).collect();
    (values, grads)
}

#[test]
fn test_every_mode_matches_scalar_path() {
    let (values, grads) = run(ExecutionMode::Cpu);
    for mode in [ExecutionMode::Accelerated, ExecutionMode::AcceleratedWithVerification] {
        let (v, gr) = run(mode);
        for (a, b) in v.iter().zip(&values) {
            assert_eq!(first_mismatch(a, b, 1e-5), None, "{mode}: values differ");
        }
        for (a, b) in gr.iter().zip(&grads) {
            assert_eq!(first_mismatch(a, b, 1e-5), None, "{mode}: gradients differ");
        }
    }
}

#[derive(Default)]
struct Counting {
    forward: Arc<AtomicUsize>,
    backward: Arc<AtomicUsize>,
}

impl Kernels for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn forward(&self, op: Op, batch: &mut ForwardBatch) -> Result<(), KernelError> {
        self.forward.fetch_add(1, Ordering::Relaxed);
        CpuKernels.forward(op, batch)
    }

    fn backward(&self, op: Op, batch: &mut BackwardBatch) -> Result<(), KernelError> {
        self.backward.fetch_add(1, Ordering::Relaxed);
        CpuKernels.backward(op, batch)
    }
}

#[test]
fn test_one_kernel_call_per_depth_and_signature() {
    let kernels = Counting::default();
    let (fwd, bwd) = (kernels.forward.clone(), kernels.backward.clone());
    let mut g = Graph::with_kernels(GraphConfig::new(ExecutionMode::Accelerated).with_seed(1), Box::new(kernels));
    let (_, total) = build(&mut g);
    let plan = g.plan();

    g.forward();
    assert_eq!(fwd.load(Ordering::Relaxed), plan.batch_count());
    // tanh, dropout, point-multiply, sum, broadcast, relu, max, add, add
    assert_eq!(plan.batch_count(), 9);

    g.backward(&[(total, &[1.0])]);
    assert_eq!(bwd.load(Ordering::Relaxed), 9);
}

#[test]
fn test_batch_with_dependent_members_is_rejected() {
    let mut g = Graph::default();
    let x = g.input(&[0.1, 0.2]);
    let t1 = tanh(&mut g, x);
    let t2 = tanh(&mut g, t1);
    assert!(matches!(
        g.try_forward_batch(&[t1, t2]),
        Err(GraphError::BatchMismatch { .. })
    ));
}

#[test]
fn test_batch_with_mixed_signatures_is_rejected() {
    let mut g = Graph::default();
    let x = g.input(&[0.1, 0.2]);
    let t = tanh(&mut g, x);
    let s = sigmoid(&mut g, x);
    assert!(matches!(g.try_forward_batch(&[t, s]), Err(GraphError::BatchMismatch { .. })));
    assert!(matches!(g.try_forward_batch(&[t, t]), Err(GraphError::BatchMismatch { .. })));
    assert!(matches!(g.try_forward_batch(&[x]), Err(GraphError::BatchMismatch { .. })));
}

#[test]
fn test_manual_batches_run_like_the_scheduler() {
    let mut g = Graph::default();
    let a = g.input(&[1.0, 2.0]);
    let b = g.input(&[3.0, 4.0]);
    let sa = vector_sum(&mut g, a);
    let sb = vector_sum(&mut g, b);
    g.forward_batch(&[sa, sb]);
    assert_eq!(g.value(sa), &[3.0]);
    assert_eq!(g.value(sb), &[7.0]);

    g.zero_grads();
    g.seed_grad(sa, &[2.0]).unwrap();
    g.backward_batch(&[sb, sa]);
    assert_eq!(g.grad(a), Some(&[2.0, 2.0][..]));
    assert_eq!(g.grad(b), Some(&[0.0, 0.0][..]));
}

#[test]
fn test_training_mode_mismatch_is_fatal() {
    let mut g = Graph::default();
    let x = g.input(&[1.0, 2.0, 3.0, 4.0]);
    let y = g.input(&[1.0, 2.0, 3.0, 4.0]);
    dropout_with_mode(&mut g, x, 0.5, true);
    dropout_with_mode(&mut g, y, 0.5, false);
    assert!(matches!(g.try_forward(), Err(GraphError::TrainingModeMismatch { .. })));
}

#[test]
#[should_panic(expected = "mixes training and inference dropout")]
fn test_training_mode_mismatch_panics_in_forward() {
    let mut g = Graph::default();
    let x = g.input(&[1.0, 2.0]);
    let y = g.input(&[1.0, 2.0]);
    dropout_with_mode(&mut g, x, 0.5, true);
    dropout_with_mode(&mut g, y, 0.5, false);
    g.forward();
}

/// Correct on the CPU, then nudges every result.
struct Skewed {
    forward: f32,
    backward: f32,
}

impl Kernels for Skewed {
    fn name(&self) -> &'static str {
        "skewed"
    }

    fn forward(&self, op: Op, batch: &mut ForwardBatch) -> Result<(), KernelError> {
        CpuKernels.forward(op, batch)?;
        batch.output.iter_mut().for_each(|y| *y += self.forward);
        Ok(())
    }

    fn backward(&self, op: Op, batch: &mut BackwardBatch) -> Result<(), KernelError> {
        CpuKernels.backward(op, batch)?;
        for slot in &mut batch.input_grads {
            slot.iter_mut().for_each(|g| *g += self.backward);
        }
        Ok(())
    }
}

fn skewed_graph(mode: ExecutionMode, forward: f32, backward: f32) -> (Graph, NodeId, NodeId) {
    let mut g = Graph::with_kernels(GraphConfig::new(mode), Box::new(Skewed { forward, backward }));
    let x = g.input(&[0.5, 1.0]);
    let t = tanh(&mut g, x);
    (g, x, t)
}

#[test]
fn test_verification_detects_forward_mismatch() {
    let (mut g, _, t) = skewed_graph(ExecutionMode::AcceleratedWithVerification, 1.0, 0.0);
    match g.try_forward() {
        Err(GraphError::VerificationMismatch { stage, node, index, .. }) => {
            assert_eq!(stage, "forward");
            assert_eq!(node, t);
            assert_eq!(index, 0);
        }
        other => panic!("expected a verification mismatch, got {other:?}"),
    }
}

#[test]
fn test_verification_detects_backward_mismatch() {
    let (mut g, _, t) = skewed_graph(ExecutionMode::AcceleratedWithVerification, 0.0, 0.5);
    g.forward();
    assert!(matches!(
        g.try_backward(&[(t, &[1.0, 1.0])]),
        Err(GraphError::VerificationMismatch { stage: "backward", .. })
    ));
}

#[test]
fn test_small_differences_pass_verification() {
    let (mut g, x, t) = skewed_graph(ExecutionMode::AcceleratedWithVerification, 1e-6, 1e-6);
    g.forward();
    g.backward(&[(t, &[1.0, 1.0])]);
    assert!(g.grad(x).is_some());
}

#[test]
fn test_accelerated_mode_trusts_the_kernels() {
    let (mut g, _, t) = skewed_graph(ExecutionMode::Accelerated, 1.0, 0.0);
    g.forward();
    assert!((g.value(t)[0] - (0.5f32.tanh() + 1.0)).abs() < 1e-6);
}

#[test]
fn test_cpu_mode_never_calls_the_kernels() {
    let (mut g, _, t) = skewed_graph(ExecutionMode::Cpu, 1.0, 1.0);
    g.forward();
    assert_eq!(g.value(t)[0], 0.5f32.tanh());
}

struct Failing;

impl Kernels for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn forward(&self, _: Op, _: &mut ForwardBatch) -> Result<(), KernelError> {
        Err(KernelError::Unavailable("unplugged".into()))
    }

    fn backward(&self, _: Op, _: &mut BackwardBatch) -> Result<(), KernelError> {
        Err(KernelError::Dispatch("lost".into()))
    }
}

#[test]
fn test_failing_kernels_fall_back_to_cpu() {
    let mut g = Graph::with_kernels(
        GraphConfig::new(ExecutionMode::AcceleratedWithVerification),
        Box::new(Failing),
    );
    let a = g.input(&[1.0, 2.0, 3.0]);
    let b = g.input(&[4.0, 5.0, 6.0]);
    let d = point_dot(&mut g, a, b);
    g.forward();
    assert_eq!(g.value(d), &[32.0]);
    g.backward(&[(d, &[2.0])]);
    assert_eq!(g.grad(a), Some(&[8.0, 10.0, 12.0][..]));
}

#[test]
fn test_random_graphs_match_across_modes() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0xBA7C4);
    for _ in 0..10 {
        let dim = rng.random_range(1..6);
        let width = rng.random_range(1..10);
        let leaves: Vec<Vec<f32>> = (0..width)
            .map(|_| (0..dim).map(|_| rng.random_range(-2.0..2.0)).collect())
            .collect();

        let outputs: Vec<(Vec<f32>, Vec<Vec<f32>>)> = [
            ExecutionMode::Cpu,
            ExecutionMode::Accelerated,
            ExecutionMode::AcceleratedWithVerification,
        ]
        .into_iter()
        .map(|mode| {
            let mut g = Graph::new(GraphConfig::new(mode).with_seed(4));
            let ids: Vec<NodeId> = leaves.iter().map(|v| g.input(v)).collect();
            let heads: Vec<NodeId> = ids
                .iter()
                .map(|&x| {
                    let s = sigmoid(&mut g, x);
                    let d = dropout(&mut g, s, 0.5);
                    let e = exp(&mut g, d);
                    max_scalar(&mut g, e)
                })
                .collect();
            let total = add(&mut g, &heads);
            g.forward();
            g.backward(&[(total, &[1.0])]);
            let grads = ids.iter().map(|&x| g.grad(x).unwrap().to_vec()).collect();
            (g.value(total).to_vec(), grads)
        })
        .collect();

        for (value, grads) in &outputs[1..] {
            assert_eq!(first_mismatch(value, &outputs[0].0, 1e-5), None);
            for (a, b) in grads.iter().zip(&outputs[0].1) {
                assert_eq!(first_mismatch(a, b, 1e-5), None);
            }
        }
    }
}

#[test]
fn test_matching_nan_passes_verification() {
    let grads: Vec<Vec<f32>> = [ExecutionMode::Cpu, ExecutionMode::AcceleratedWithVerification]
        .into_iter()
        .map(|mode| {
            let mut g = Graph::new(GraphConfig::new(mode));
            let x = g.input(&[100.0, 0.5]);
            let e = exp(&mut g, x);
            g.forward();
            assert_eq!(g.value(e)[0], f32::INFINITY);
            // 0 * inf on both paths
            g.backward(&[(e, &[0.0, 1.0])]);
            g.grad(x).unwrap().to_vec()
        })
        .collect();

    for grad in &grads {
        assert!(grad[0].is_nan());
        assert!((grad[1] - 0.5f32.exp()).abs() < 1e-6);
    }
}

#[test]
fn test_wide_same_depth_batch_runs() {
    let mut g = Graph::default();
    let heads: Vec<NodeId> = (0..256)
        .map(|i| {
            let x = g.input(&[i as f32 * 0.01, -0.5]);
            tanh(&mut g, x)
        })
        .collect();
    g.forward_batch(&heads);
    let out = g.value(heads[100]);
    assert!((out[0] - 1.0f32.tanh()).abs() < 1e-6);
    assert_eq!(out[1], (-0.5f32).tanh());
}

#[test]
fn test_independent_members_at_different_depths_batch() {
    let mut g = Graph::default();
    let x = g.input(&[0.1, 0.2]);
    let y = g.input(&[0.3, 0.4]);
    let tx = tanh(&mut g, x);
    let ty = tanh(&mut g, y);
    let tty = tanh(&mut g, ty);
    g.forward_batch(&[tx, ty]);
    g.forward_batch(&[tty]);

    g.try_forward_batch(&[tx, tty]).unwrap();
    assert_eq!(g.value(tty), &[0.3f32.tanh().tanh(), 0.4f32.tanh().tanh()]);
}
