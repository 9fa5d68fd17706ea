//! Core tensor buffers.
//!
//! # Tensor Buffers
//!
//! Every node owns one value buffer and, once it takes part in a backward
//! pass, one gradient buffer of the same shape. The engine only ever builds
//! rank-1 vectors and rank-2 row-major matrices; the element type is `f32`
//! throughout.
//!
//! ## Design Highlights
//! - `Tensor<T>` is a shape plus flat row-major storage, checked at construction
//! - `WithGrad<T>` pairs a value with its gradient
//! - Accumulation helpers (`add_assign`) only ever add, never overwrite
//! - The `tensor!` macro builds literals for tests and callers
//!
//! ## Example
//!
//! ```rust
//! use dynbatch::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.rows(), 2);
//! assert_eq!(t.dim(), 3);
//! ```

/// The float used in node buffers.
pub type TensorFloat = f32;

/// An N-dimensional tensor with a shape and flat row-major data.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the innermost axis (the vector length for rank 1).
    pub fn dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Row count: 1 for vectors, the outer axis for matrices.
    pub fn rows(&self) -> usize {
        match self.shape.as_slice() {
            [rows, _] => *rows,
            _ => 1,
        }
    }

    /// Borrows row `i` of a row-major matrix.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    pub fn row(&self, i: usize) -> &[T] {
        let dim = self.dim();
        &self.data[i * dim..(i + 1) * dim]
    }
}

impl Tensor<TensorFloat> {
    /// A zero-filled tensor.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// A rank-1 tensor owning `data`.
    pub fn vector(data: Vec<TensorFloat>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Overwrites every element with `x`.
    pub fn fill(&mut self, x: TensorFloat) {
        self.data.iter_mut().for_each(|v| *v = x);
    }

    /// Elementwise `self += other`.
    ///
    /// # Panics
    /// Panics if lengths differ.
    pub fn add_assign(&mut self, other: &[TensorFloat]) {
        assert_eq!(self.data.len(), other.len(), "accumulation length mismatch");
        self.data.iter_mut().zip(other).for_each(|(a, b)| *a += b);
    }

    /// Sum of all elements.
    pub fn sum(&self) -> TensorFloat {
        self.data.iter().sum()
    }
}

/// A value paired with its gradient.
///
/// The node buffers are `WithGrad<Tensor<f32>>` once a backward pass has
/// allocated the gradient; both halves always share one shape.
#[derive(Debug, Clone, PartialEq)]
pub struct WithGrad<T> {
    pub value: T,
    pub grad: T,
}

impl WithGrad<Tensor<TensorFloat>> {
    /// Wraps `value` with a zero gradient of the same shape.
    pub fn new(value: Tensor<TensorFloat>) -> Self {
        let grad = Tensor::zeros(value.shape.clone());
        Self { value, grad }
    }

    /// Resets the gradient to zero, keeping the value.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use dynbatch::tensor;
/// let t = tensor!([[1.0f32, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
