use crate::error::SimMathError;

/// Dot product of two equal-length vectors.
///
/// On unit vectors this is the cosine similarity. Lengths are only checked in
/// debug builds; hot loops validate dimensions once up front and call this.
/// Accumulates in f64 so long vectors do not drift.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc: f64 = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc += (*x as f64) * (*y as f64);
    }
    acc as f32
}

/// Cosine similarity of two pre-normalized vectors.
///
/// Returns a value in `[-1, 1]`. Fails fast on a dimension mismatch, which
/// always means vectors from two different embedding spaces were compared.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32, SimMathError> {
    if a.len() != b.len() {
        return Err(SimMathError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    // Clamp to [-1, 1] to absorb floating point error on near-identical vectors.
    Ok(dot(a, b).clamp(-1.0, 1.0))
}

/// Cosine distance: `1 - cosine(a, b)`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, SimMathError> {
    Ok(1.0 - cosine(a, b)?)
}

/// Normalizes a vector to unit length in place and returns its original norm.
/// A zero vector is left untouched and reports norm 0.
pub fn l2_normalize(v: &mut [f32]) -> f64 {
    let mut sum: f64 = 0.0;
    for &x in v.iter() {
        sum += (x as f64) * (x as f64);
    }
    let norm = sum.sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
    norm
}

/// Mean of the given vectors, re-normalized to unit length.
///
/// Returns an empty vector for empty input.
pub fn centroid(vectors: &[&[f32]]) -> Result<Vec<f32>, SimMathError> {
    let Some(first) = vectors.first() else {
        return Ok(Vec::new());
    };
    let dim = first.len();
    let mut acc = vec![0.0f64; dim];
    for v in vectors {
        if v.len() != dim {
            return Err(SimMathError::DimensionMismatch {
                expected: dim,
                got: v.len(),
            });
        }
        for (a, &x) in acc.iter_mut().zip(v.iter()) {
            *a += x as f64;
        }
    }
    let n = vectors.len() as f64;
    let mut out: Vec<f32> = acc.into_iter().map(|a| (a / n) as f32).collect();
    l2_normalize(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: &[f32]) -> Vec<f32> {
        let mut c = v.to_vec();
        l2_normalize(&mut c);
        c
    }

    #[test]
    fn cosine_identical() {
        let sim = cosine(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6, "identical vectors should have sim=1, got {sim}");
    }

    #[test]
    fn cosine_orthogonal() {
        let sim = cosine(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).unwrap();
        assert!(sim.abs() < 1e-6, "orthogonal vectors should have sim=0, got {sim}");
    }

    #[test]
    fn cosine_opposite() {
        let d = cosine_distance(&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]).unwrap();
        assert!((d - 2.0).abs() < 1e-6, "opposite: got {d}");
    }

    #[test]
    fn cosine_dimension_mismatch() {
        let err = cosine(&[1.0, 0.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert_eq!(
            err,
            SimMathError::DimensionMismatch {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn l2_normalize_unit() {
        let mut v = [3.0, 4.0];
        let norm = l2_normalize(&mut v);
        assert!((norm - 5.0).abs() < 1e-9);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero() {
        let mut v = [0.0, 0.0, 0.0];
        assert_eq!(l2_normalize(&mut v), 0.0);
        assert_eq!(v, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn centroid_is_unit_mean() {
        let a = unit(&[1.0, 0.0]);
        let b = unit(&[0.0, 1.0]);
        let c = centroid(&[&a, &b]).unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((c[0] - expected).abs() < 1e-6);
        assert!((c[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn centroid_empty() {
        assert!(centroid(&[]).unwrap().is_empty());
    }

    #[test]
    fn centroid_dimension_mismatch() {
        let a = [1.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        assert!(matches!(
            centroid(&[&a, &b]),
            Err(SimMathError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
    }
}
