//! Cosine distances and average-linkage agglomeration over a dense matrix.

use nalgebra::DMatrix;

/// Scale `v` to unit length. A zero vector stays zero (its norm is treated
/// as 1), which puts it at distance 1 from everything.
pub fn l2_normalize(v: &[f32]) -> Vec<f64> {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm = if norm > 0.0 { norm } else { 1.0 };
    v.iter().map(|x| *x as f64 / norm).collect()
}

/// Pairwise `1 - cos(a, b)`, with the similarity clipped to [-1, 1].
pub fn cosine_distance_matrix(vectors: &[Vec<f32>]) -> DMatrix<f64> {
    let n = vectors.len();
    let normalized: Vec<Vec<f64>> = vectors.iter().map(|v| l2_normalize(v)).collect();
    let mut dist = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for j in (i + 1)..n {
            let sim: f64 = normalized[i]
                .iter()
                .zip(&normalized[j])
                .map(|(a, b)| a * b)
                .sum();
            let d = 1.0 - sim.clamp(-1.0, 1.0);
            dist[(i, j)] = d;
            dist[(j, i)] = d;
        }
    }
    dist
}

/// Nearest active neighbour of `i` (lowest index wins ties).
fn nearest(dist: &DMatrix<f64>, active: &[bool], i: usize) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (j, alive) in active.iter().enumerate() {
        if j == i || !alive {
            continue;
        }
        let d = dist[(i, j)];
        match best {
            Some((_, bd)) if d >= bd => {}
            _ => best = Some((j, d)),
        }
    }
    best
}

/// Agglomerative clustering with average linkage: repeatedly merge the two
/// closest clusters while their mean pairwise distance is below `threshold`.
///
/// Returns flat clusters as sorted index lists, ordered by smallest member.
/// Deterministic: ties resolve to the lowest indices.
pub fn average_linkage(dist: &DMatrix<f64>, threshold: f64) -> Vec<Vec<usize>> {
    let n = dist.nrows();
    if n == 0 {
        return Vec::new();
    }

    // Cluster-to-cluster distances; row/column `i` is the cluster whose
    // smallest original index is `i`.
    let mut d = dist.clone();
    let mut active = vec![true; n];
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut nn: Vec<Option<(usize, f64)>> = (0..n).map(|i| nearest(&d, &active, i)).collect();

    loop {
        let mut pick: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            if let Some((j, dij)) = nn[i] {
                let better = match pick {
                    None => true,
                    Some((pi, pj, pd)) => {
                        let (a, b) = (i.min(j), i.max(j));
                        dij < pd || (dij == pd && (a, b) < (pi, pj))
                    }
                };
                if better {
                    pick = Some((i.min(j), i.max(j), dij));
                }
            }
        }
        let Some((keep, gone, dmin)) = pick else {
            break;
        };
        if dmin >= threshold {
            break;
        }

        let (nk, ng) = (members[keep].len() as f64, members[gone].len() as f64);
        for k in 0..n {
            if !active[k] || k == keep || k == gone {
                continue;
            }
            let merged = (nk * d[(keep, k)] + ng * d[(gone, k)]) / (nk + ng);
            d[(keep, k)] = merged;
            d[(k, keep)] = merged;
        }
        active[gone] = false;
        let moved = std::mem::take(&mut members[gone]);
        members[keep].extend(moved);
        nn[gone] = None;

        for k in 0..n {
            if !active[k] {
                continue;
            }
            let stale = match nn[k] {
                None => true,
                Some((j, _)) => k == keep || j == keep || j == gone,
            };
            if stale {
                nn[k] = nearest(&d, &active, k);
            } else if let Some((j, dj)) = nn[k] {
                let dk = d[(k, keep)];
                if dk < dj || (dk == dj && keep < j) {
                    nn[k] = Some((keep, dk));
                }
            }
        }
    }

    let mut out: Vec<Vec<usize>> = members
        .into_iter()
        .zip(active)
        .filter(|(_, alive)| *alive)
        .map(|(mut m, _)| {
            m.sort_unstable();
            m
        })
        .collect();
    out.sort_by_key(|m| m[0]);
    out
}
