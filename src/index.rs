//! Flat nearest-neighbour index over unit-norm embeddings.
//!
//! Squared L2 distance between unit vectors equals `2 - 2 * cos`, so ranking
//! by ascending distance is ranking by descending cosine similarity. The index
//! stores vectors as given: callers normalize both corpus and query vectors.

use crate::errors::{FusionError, FusionResult};
use crate::semantic::{is_zero_vector, squared_l2_distance};

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub id: String,
    pub distance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingIndex {
    ids: Vec<String>,
    dimension: usize,
    // Row-major, `ids.len() * dimension` values.
    data: Vec<f32>,
}

impl EmbeddingIndex {
    pub fn build<I>(entries: I) -> FusionResult<Self>
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        let mut index = Self::default();

        for (id, vector) in entries {
            if index.ids.is_empty() {
                if vector.is_empty() {
                    return Err(FusionError::MalformedInput(format!(
                        "embedding for '{id}' is empty"
                    )));
                }
                index.dimension = vector.len();
            } else if vector.len() != index.dimension {
                return Err(FusionError::DimensionMismatch {
                    expected: index.dimension,
                    found: vector.len(),
                });
            }
            if is_zero_vector(&vector) {
                return Err(FusionError::MalformedInput(format!(
                    "embedding for '{id}' has zero norm"
                )));
            }

            index.data.extend_from_slice(&vector);
            index.ids.push(id);
        }

        Ok(index)
    }

    /// Up to `k` nearest entries, ascending by squared L2 distance. Ties keep
    /// insertion order.
    pub fn query(&self, vector: &[f32], k: usize) -> FusionResult<Vec<Neighbor>> {
        if self.ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.dimension {
            return Err(FusionError::DimensionMismatch {
                expected: self.dimension,
                found: vector.len(),
            });
        }

        let mut scored = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, row)| (position, squared_l2_distance(row, vector)))
            .collect::<Vec<(usize, f64)>>();

        scored.sort_by(|left, right| left.1.total_cmp(&right.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, distance)| Neighbor {
                position,
                id: self.ids[position].clone(),
                distance,
            })
            .collect())
    }

    pub fn size(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::EmbeddingIndex;
    use crate::semantic::{dot, normalized};

    fn entry(id: &str, values: &[f32]) -> (String, Vec<f32>) {
        (id.to_string(), values.to_vec())
    }

    #[test]
    fn build_rejects_inconsistent_dimensions() {
        let err = EmbeddingIndex::build(vec![entry("a", &[1.0, 0.0]), entry("b", &[1.0])])
            .expect_err("mixed dimensions");
        assert_eq!(err.kind(), "malformed_input");
    }

    #[test]
    fn build_rejects_zero_norm_vectors() {
        let err = EmbeddingIndex::build(vec![entry("a", &[1.0, 0.0]), entry("blank", &[0.0, 0.0])])
            .expect_err("zero vector");
        assert_eq!(err.kind(), "malformed_input");
        assert!(err.to_string().contains("blank"));
    }

    #[test]
    fn query_rejects_wrong_dimension() {
        let index = EmbeddingIndex::build(vec![entry("a", &[1.0, 0.0])]).expect("build");
        assert!(index.query(&[1.0, 0.0, 0.0], 1).is_err());
    }

    #[test]
    fn distance_matches_cosine_identity_for_unit_vectors() {
        let pairs = [
            ([0.6_f32, 0.8], [1.0_f32, 0.0]),
            ([0.0, 1.0], [0.0, -1.0]),
            ([0.3, -0.7], [-0.2, 0.9]),
        ];

        for (a, b) in pairs {
            let a = normalized(&a);
            let b = normalized(&b);
            let index = EmbeddingIndex::build(vec![("b".to_string(), b.clone())]).expect("build");
            let hits = index.query(&a, 1).expect("query");
            assert_eq!(hits.len(), 1);
            let expected = 2.0 - 2.0 * dot(&a, &b);
            assert!((hits[0].distance - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn query_returns_ascending_neighbours_capped_at_k() {
        let index = EmbeddingIndex::build(vec![
            entry("far", &[-1.0, 0.0]),
            entry("near", &[1.0, 0.0]),
            entry("mid", &[0.0, 1.0]),
        ])
        .expect("build");

        let hits = index.query(&[1.0, 0.0], 2).expect("query");
        let ids = hits.iter().map(|hit| hit.id.as_str()).collect::<Vec<&str>>();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(hits[0].distance <= hits[1].distance);
        assert_eq!(index.size(), 3);
        assert_eq!(index.dimension(), 2);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let index = EmbeddingIndex::build(vec![entry("first", &[0.0, 1.0]), entry("second", &[0.0, -1.0])])
            .expect("build");
        let hits = index.query(&[1.0, 0.0], 1).expect("query");
        assert_eq!(hits[0].id, "first");
    }

    #[test]
    fn empty_index_returns_no_neighbours() {
        let index = EmbeddingIndex::build(Vec::<(String, Vec<f32>)>::new()).expect("build");
        assert!(index.is_empty());
        assert!(index.query(&[1.0], 1).expect("query").is_empty());
    }

    #[test]
    fn caption_scenario_picks_blue_button() {
        let index = EmbeddingIndex::build(vec![
            entry("blue button", &[1.0, 0.0]),
            entry("red icon", &[0.0, 1.0]),
        ])
        .expect("build");
        let query = normalized(&[0.9, 0.1]);
        let hits = index.query(&query, 1).expect("query");
        assert_eq!(hits[0].id, "blue button");
    }
}
