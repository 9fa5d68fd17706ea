//! Utilities to approximate equality of floating point buffers.
//!
//! Verification mode and the test suite both compare an accelerated result
//! with the scalar reference. Comparisons are relative for large magnitudes and
//! absolute near zero: `|a - b| <= tol * max(1, |a|, |b|)`.

/// Scaled distance between two values.
#[inline]
pub fn distance(a: f32, b: f32) -> f32 {
    if a == b {
        // covers matching infinities
        return 0.0;
    }
    (a - b).abs() / 1.0f32.max(a.abs()).max(b.abs())
}

/// Whether `a` and `b` agree within `tol`.
///
/// Identical bit patterns and NaN on both sides agree regardless of `tol`.
#[inline]
pub fn within(a: f32, b: f32, tol: f32) -> bool {
    if a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()) {
        return true;
    }
    distance(a, b) <= tol
}

/// First index at which `got` and `expected` disagree beyond `tol`.
///
/// A NaN on only one side is always reported.
pub fn first_mismatch(got: &[f32], expected: &[f32], tol: f32) -> Option<usize> {
    if got.len() != expected.len() {
        return Some(got.len().min(expected.len()));
    }
    got.iter()
        .zip(expected)
        .position(|(&g, &e)| !within(g, e, tol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_relative_for_large_values() {
        assert_eq!(distance(1.0, 1.0), 0.0);
        assert_eq!(distance(f32::INFINITY, f32::INFINITY), 0.0);
        assert!(within(1000.0, 1000.05, 1e-4));
        assert!(!within(1.0, 1.05, 1e-4));
        assert!(within(0.0, 5e-5, 1e-4));
    }

    #[test]
    fn nan_agrees_only_with_nan() {
        assert!(within(f32::NAN, f32::NAN, 0.0));
        assert!(within(-f32::NAN, f32::NAN, 1e-4));
        assert!(!within(f32::NAN, 1.0, 1e-4));
        assert!(!within(1.0, f32::NAN, 1e-4));
        assert!(!within(f32::INFINITY, f32::NAN, 1e-4));
    }

    #[test]
    fn mismatch_reports_first_index() {
        let tol = 1e-4;
        assert_eq!(first_mismatch(&[1.0, 2.0], &[1.0, 2.0], tol), None);
        assert_eq!(first_mismatch(&[1.0, 2.0, 9.0], &[1.0, 2.5, 3.0], tol), Some(1));
        assert_eq!(first_mismatch(&[f32::NAN, 1.0], &[f32::NAN, 1.0], tol), None);
        assert_eq!(first_mismatch(&[1.0, f32::NAN], &[1.0, 2.0], tol), Some(1));
        assert_eq!(first_mismatch(&[1.0], &[1.0, 2.0], tol), Some(1));
    }
}
