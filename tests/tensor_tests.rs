use dynbatch::operators::{point_mul, relu, vector_sum};
use dynbatch::{Graph, tensor, tensors::{Tensor, WithGrad}};

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tensor_macro() {
    let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]);
    });
    assert!(result.is_err());
}

#[test]
fn test_node_value_and_grad_pair() {
    let mut g = Graph::default();
    let x = g.input(&[-1.0, 0.0, 1.0]);
    let r = relu(&mut g, x);
    g.forward();
    assert!(g.with_grad(x).is_none());

    g.backward(&[(r, &[1.0, 1.0, 1.0])]);
    let pair = g.with_grad(x).unwrap();
    assert_eq!(pair.value.data, vec![-1.0, 0.0, 1.0]);
    assert_eq!(pair.grad.data, vec![0.0, 0.0, 1.0]);
    assert_eq!(pair.value.shape, pair.grad.shape);
}

#[test]
fn test_rows_of_a_matrix_as_inputs() {
    let m = tensor!([[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]]);
    let mut g = Graph::default();
    let rows: Vec<_> = (0..m.rows()).map(|i| g.input(m.row(i))).collect();
    let sums: Vec<_> = rows
        .iter()
        .map(|&r| {
            let sq = point_mul(&mut g, r, r);
            vector_sum(&mut g, sq)
        })
        .collect();
    g.forward();
    let totals: Vec<f32> = sums.iter().map(|&s| g.value(s)[0]).collect();
    assert_eq!(totals, vec![5.0, 25.0, 61.0]);

    let mut acc = WithGrad::new(Tensor::zeros(vec![3]));
    acc.grad.add_assign(&totals);
    acc.zero_grad();
    assert_eq!(acc.grad.sum(), 0.0);
}
