//! Brute-force descriptor matching and the exhaustive matching controller.

use std::path::PathBuf;

use rayon::prelude::*;

use crate::db::{Database, Keypoint, TwoViewGeometry};
use crate::error::FeatureError;
use crate::two_view::{estimate_fundamental_ransac, RansacOptions};

#[inline]
fn hamming_distance(a: &[u8; 32], b: &[u8; 32]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x ^ y).count_ones())
        .sum()
}

/// Matches binary descriptors by brute-force Hamming distance.
///
/// Each descriptor in `descriptors1` is matched to its nearest neighbor in
/// `descriptors2`, filtered by a maximum distance, Lowe's ratio test against
/// the second-best distance, and mutual-nearest-neighbor cross checking.
pub fn match_descriptors(
    descriptors1: &[[u8; 32]],
    descriptors2: &[[u8; 32]],
    max_distance: Option<u32>,
    max_ratio: Option<f32>,
    cross_check: bool,
) -> Vec<(u32, u32)> {
    if descriptors1.is_empty() || descriptors2.is_empty() {
        return vec![];
    }

    struct Nearest {
        index: usize,
        distance: u32,
        second_distance: u32,
    }

    let forward: Vec<Nearest> = descriptors1
        .iter()
        .map(|d1| {
            let mut nearest = Nearest {
                index: 0,
                distance: u32::MAX,
                second_distance: u32::MAX,
            };
            for (j, d2) in descriptors2.iter().enumerate() {
                let distance = hamming_distance(d1, d2);
                if distance < nearest.distance {
                    nearest.second_distance = nearest.distance;
                    nearest.distance = distance;
                    nearest.index = j;
                } else if distance < nearest.second_distance {
                    nearest.second_distance = distance;
                }
            }
            nearest
        })
        .collect();

    let reverse_best: Option<Vec<usize>> = cross_check.then(|| {
        let mut best = vec![0usize; descriptors2.len()];
        let mut best_distance = vec![u32::MAX; descriptors2.len()];
        for (i, d1) in descriptors1.iter().enumerate() {
            for (j, d2) in descriptors2.iter().enumerate() {
                let distance = hamming_distance(d1, d2);
                if distance < best_distance[j] {
                    best_distance[j] = distance;
                    best[j] = i;
                }
            }
        }
        best
    });

    let mut matches = Vec::new();
    for (i, nearest) in forward.iter().enumerate() {
        if let Some(max_distance) = max_distance {
            if nearest.distance > max_distance {
                continue;
            }
        }
        if let Some(ratio) = max_ratio {
            let second = nearest.second_distance.max(1) as f32;
            if nearest.distance as f32 / second >= ratio {
                continue;
            }
        }
        if let Some(reverse) = &reverse_best {
            if reverse[nearest.index] != i {
                continue;
            }
        }
        matches.push((i as u32, nearest.index as u32));
    }
    matches
}

/// Options for exhaustive pairwise matching.
#[derive(Debug, Clone)]
pub struct MatchingOptions {
    /// Number of images per matching block.
    pub block_size: usize,
    /// Maximum Hamming distance for a tentative match.
    pub max_distance: u32,
    /// Lowe's ratio threshold; set to 1.0 to disable.
    pub max_ratio: f32,
    /// Keep only mutual nearest neighbors.
    pub cross_check: bool,
    /// Minimum inlier count to store a verified geometry.
    pub min_num_inliers: usize,
    /// Epipolar verification parameters.
    pub ransac: RansacOptions,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            block_size: 50,
            max_distance: 80,
            max_ratio: 0.8,
            cross_check: true,
            min_num_inliers: 15,
            ransac: RansacOptions::default(),
        }
    }
}

/// Totals reported by a matching run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchingSummary {
    /// Number of image pairs that produced tentative matches.
    pub num_matched_pairs: usize,
    /// Number of pairs that passed geometric verification.
    pub num_verified_pairs: usize,
}

/// Matches every image pair in the database, block by block.
pub struct ExhaustiveMatcher {
    database_path: PathBuf,
    options: MatchingOptions,
}

impl ExhaustiveMatcher {
    /// Creates a matcher over the given database.
    pub fn new(database_path: impl Into<PathBuf>, options: MatchingOptions) -> Self {
        Self {
            database_path: database_path.into(),
            options,
        }
    }

    /// Runs matching and verification over all pairs, then saves the
    /// database in place.
    pub fn run(self) -> Result<MatchingSummary, FeatureError> {
        let mut db = Database::open(&self.database_path)?;
        let image_ids = db.image_ids();
        let n = image_ids.len();
        let block_size = self.options.block_size.max(2);
        let num_blocks = n.div_ceil(block_size);

        let mut summary = MatchingSummary::default();

        for block1 in 0..num_blocks {
            for block2 in block1..num_blocks {
                log::info!(
                    "Matching block [{}/{}, {}/{}]",
                    block1 + 1,
                    num_blocks,
                    block2 + 1,
                    num_blocks
                );

                let start1 = block1 * block_size;
                let start2 = block2 * block_size;
                let end1 = (start1 + block_size).min(n);
                let end2 = (start2 + block_size).min(n);

                let mut pairs = Vec::new();
                for i in start1..end1 {
                    for j in start2.max(i + 1)..end2 {
                        pairs.push((image_ids[i], image_ids[j]));
                    }
                }

                let results: Vec<_> = pairs
                    .par_iter()
                    .map(|&(id1, id2)| {
                        let matches = match_descriptors(
                            db.descriptors(id1),
                            db.descriptors(id2),
                            Some(self.options.max_distance),
                            (self.options.max_ratio < 1.0).then_some(self.options.max_ratio),
                            self.options.cross_check,
                        );
                        let geometry = self.verify(
                            db.keypoints(id1),
                            db.keypoints(id2),
                            &matches,
                        );
                        (id1, id2, matches, geometry)
                    })
                    .collect();

                for (id1, id2, matches, geometry) in results {
                    if matches.is_empty() {
                        continue;
                    }
                    summary.num_matched_pairs += 1;
                    db.set_matches(id1, id2, matches);
                    if let Some(geometry) = geometry {
                        summary.num_verified_pairs += 1;
                        db.set_two_view_geometry(id1, id2, geometry);
                    }
                }
            }
        }

        db.save(&self.database_path)?;
        log::info!(
            "Matched {} pairs, verified {}",
            summary.num_matched_pairs,
            summary.num_verified_pairs
        );
        Ok(summary)
    }

    fn verify(
        &self,
        keypoints1: &[Keypoint],
        keypoints2: &[Keypoint],
        matches: &[(u32, u32)],
    ) -> Option<TwoViewGeometry> {
        if matches.len() < self.options.min_num_inliers {
            return None;
        }
        let points1: Vec<[f64; 2]> = matches
            .iter()
            .map(|&(i, _)| {
                let kp = &keypoints1[i as usize];
                [kp.x as f64, kp.y as f64]
            })
            .collect();
        let points2: Vec<[f64; 2]> = matches
            .iter()
            .map(|&(_, j)| {
                let kp = &keypoints2[j as usize];
                [kp.x as f64, kp.y as f64]
            })
            .collect();

        let (f, inliers) = estimate_fundamental_ransac(&points1, &points2, &self.options.ransac)?;
        if inliers.len() < self.options.min_num_inliers {
            return None;
        }

        let mut fundamental = [[0.0; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                fundamental[r][c] = f[(r, c)];
            }
        }
        Some(TwoViewGeometry {
            inlier_matches: inliers.iter().map(|&k| matches[k]).collect(),
            fundamental,
        })
    }
}
