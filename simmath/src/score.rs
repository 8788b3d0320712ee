/// Quality score of an item, used to pick the representative of a group.
///
/// Each embedding kind implements this once (faces score on centroid
/// closeness, detector confidence and box size; photos on sharpness and
/// resolution) instead of scattering ad hoc heuristics.
pub trait QualityScorer<T: ?Sized> {
    fn score(&self, item: &T) -> f32;
}

impl<T: ?Sized, F: Fn(&T) -> f32> QualityScorer<T> for F {
    fn score(&self, item: &T) -> f32 {
        self(item)
    }
}

/// Returns the index of the highest-scoring item.
///
/// Ties go to the smallest `id_of` value so repeated runs pick the same
/// item regardless of input order. NaN scores lose to everything.
pub fn best_by_score<T, K: Ord>(
    items: &[T],
    scorer: &dyn QualityScorer<T>,
    id_of: impl Fn(&T) -> K,
) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, item) in items.iter().enumerate() {
        let mut s = scorer.score(item);
        if s.is_nan() {
            s = f32::NEG_INFINITY;
        }
        best = match best {
            None => Some((i, s)),
            Some((bi, bs)) => {
                if s > bs || (s == bs && id_of(item) < id_of(&items[bi])) {
                    Some((i, s))
                } else {
                    Some((bi, bs))
                }
            }
        };
    }
    best.map(|(i, _)| i)
}
