use std::collections::VecDeque;

use snapsort_simmath::dot;
use snapsort_task::{CancelProbe, Cancelled};

pub(crate) const NOISE: i32 = -1;
const UNDEFINED: i32 = 0;

/// Runs DBSCAN using cosine distance.
///
/// # Parameters
/// - `vectors`: the data points, L2-normalized and all of one dimension
/// - `eps`: maximum cosine distance (1 - cosine_similarity) for neighbors
/// - `min_pts`: minimum neighborhood size (the point itself included)
/// - `probe`: polled once per pairwise comparison
///
/// # Returns
/// Cluster labels for each vector. Label -1 means noise (unassigned).
/// Positive labels (1, 2, ...) identify clusters in order of discovery, so
/// the same input order always yields the same labels.
pub(crate) fn dbscan(
    vectors: &[&[f32]],
    eps: f32,
    min_pts: usize,
    probe: &mut CancelProbe,
) -> Result<Vec<i32>, Cancelled> {
    let n = vectors.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut labels = vec![UNDEFINED; n];
    let mut cluster_id: i32 = 0;

    for i in 0..n {
        if labels[i] != UNDEFINED {
            continue;
        }

        let neighbors = range_query(vectors, i, eps, probe)?;
        if neighbors.len() < min_pts {
            labels[i] = NOISE;
            continue;
        }

        cluster_id += 1;
        labels[i] = cluster_id;

        let mut seed: VecDeque<usize> = neighbors.into_iter().filter(|&j| j != i).collect();

        while let Some(q) = seed.pop_front() {
            // Border point previously marked noise: claim it, don't expand.
            if labels[q] == NOISE {
                labels[q] = cluster_id;
            }
            if labels[q] != UNDEFINED {
                continue;
            }
            labels[q] = cluster_id;

            let q_neighbors = range_query(vectors, q, eps, probe)?;
            if q_neighbors.len() >= min_pts {
                enqueue_unclaimed(&mut seed, q_neighbors, &labels);
            }
        }
    }

    Ok(labels)
}

/// Queues only points not yet claimed by a cluster.
fn enqueue_unclaimed(seed: &mut VecDeque<usize>, neighbors: Vec<usize>, labels: &[i32]) {
    seed.extend(
        neighbors
            .into_iter()
            .filter(|&j| labels[j] == UNDEFINED || labels[j] == NOISE),
    );
}

/// Returns indices of all vectors within eps cosine distance of vectors[idx].
fn range_query(
    vectors: &[&[f32]],
    idx: usize,
    eps: f32,
    probe: &mut CancelProbe,
) -> Result<Vec<usize>, Cancelled> {
    let q = vectors[idx];
    let mut out = Vec::new();
    for (i, v) in vectors.iter().enumerate() {
        probe.tick()?;
        if 1.0 - dot(q, v) <= eps {
            out.push(i);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use snapsort_simmath::l2_normalize;
    use snapsort_task::CancellationToken;

    use super::*;

    fn normed(vs: &[[f32; 3]]) -> Vec<Vec<f32>> {
        vs.iter()
            .map(|v| {
                let mut c = v.to_vec();
                l2_normalize(&mut c);
                c
            })
            .collect()
    }

    #[test]
    fn two_clusters() {
        let all = normed(&[
            [1.0, 0.0, 0.0],
            [0.99, 0.1, 0.0],
            [0.98, 0.15, 0.0],
            [0.0, 1.0, 0.0],
            [0.1, 0.99, 0.0],
            [0.15, 0.98, 0.0],
        ]);
        let refs: Vec<&[f32]> = all.iter().map(|v| v.as_slice()).collect();
        let labels = dbscan(&refs, 0.3, 2, &mut CancelProbe::never()).unwrap();

        assert_eq!(labels, vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn expansion_skips_claimed_points() {
        let labels = [1, UNDEFINED, NOISE, 2, 1];
        let mut seed = VecDeque::new();
        enqueue_unclaimed(&mut seed, vec![0, 1, 2, 3, 4], &labels);
        assert_eq!(seed, VecDeque::from([1, 2]));
    }

    #[test]
    fn dense_clique_is_one_cluster() {
        let all: Vec<Vec<f32>> = (0..200)
            .map(|i| {
                let mut v = vec![1.0, 0.01 * (i % 7) as f32, 0.01 * (i % 5) as f32];
                l2_normalize(&mut v);
                v
            })
            .collect();
        let refs: Vec<&[f32]> = all.iter().map(|v| v.as_slice()).collect();
        let labels = dbscan(&refs, 0.05, 3, &mut CancelProbe::never()).unwrap();
        assert!(labels.iter().all(|&l| l == 1));
    }

    #[test]
    fn single_point_is_noise() {
        let all = normed(&[[1.0, 0.0, 0.0]]);
        let refs: Vec<&[f32]> = all.iter().map(|v| v.as_slice()).collect();
        let labels = dbscan(&refs, 0.1, 2, &mut CancelProbe::never()).unwrap();
        assert_eq!(labels, vec![NOISE]);
    }

    #[test]
    fn empty() {
        let labels = dbscan(&[], 0.1, 2, &mut CancelProbe::never()).unwrap();
        assert!(labels.is_empty());
    }

    #[test]
    fn border_point_joins_but_does_not_expand() {
        // a-b-c chain where only b is core with min_pts=3.
        let all = normed(&[[1.0, 0.0, 0.0], [0.9, 0.44, 0.0], [0.6, 0.8, 0.0]]);
        let refs: Vec<&[f32]> = all.iter().map(|v| v.as_slice()).collect();
        let labels = dbscan(&refs, 0.12, 3, &mut CancelProbe::never()).unwrap();
        assert_eq!(labels, vec![1, 1, 1]);
    }

    #[test]
    fn cancelled_run_stops() {
        let all = normed(&[[1.0, 0.0, 0.0], [0.99, 0.1, 0.0], [0.98, 0.15, 0.0]]);
        let refs: Vec<&[f32]> = all.iter().map(|v| v.as_slice()).collect();
        let token = CancellationToken::new();
        token.cancel();
        let mut probe = CancelProbe::new(token, 2);
        assert_eq!(dbscan(&refs, 0.3, 2, &mut probe), Err(Cancelled));
    }
}
