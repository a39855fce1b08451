//! Embedding retrieval: whole-screenshot description selection and
//! per-widget caption lookup.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::warn;

use crate::errors::{FusionError, FusionResult};
use crate::index::EmbeddingIndex;
use crate::model::{CaptionEntry, DescriptionValue};
use crate::semantic::{TextEmbedder, cosine_from_squared_l2, dot, is_zero_vector, normalized};

pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Keeps the leading `max_tokens` whitespace-delimited tokens.
pub fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    text.split_whitespace()
        .take(max_tokens)
        .collect::<Vec<&str>>()
        .join(" ")
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Lookup keys for an image filename, in the order they are tried: the
/// normalized name itself, then the name with `.png` swapped for `.jpg`.
pub fn candidate_keys(filename: &str) -> Vec<String> {
    let base = Path::new(filename.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(filename);
    let direct = normalize_key(base);

    let mut keys = vec![direct.clone()];
    if let Some(stem) = direct.strip_suffix(".png") {
        keys.push(format!("{stem}.jpg"));
    }
    keys
}

#[derive(Debug, Clone)]
pub struct DescriptionEntry {
    pub key: String,
    pub description: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptionMatch<'a> {
    pub key: &'a str,
    pub description: &'a str,
    pub score: f64,
}

/// Normalized-key description table with one unit-norm embedding per entry.
#[derive(Debug, Clone, Default)]
pub struct DescriptionTable {
    entries: Vec<DescriptionEntry>,
    positions: HashMap<String, usize>,
    dimension: usize,
    rejected: Vec<String>,
    locally_embedded: usize,
}

impl DescriptionTable {
    /// Keys are lowercased and trimmed; when two raw keys collide the later
    /// value replaces the earlier one in place. Text descriptions are truncated
    /// to `max_tokens` before embedding. Entries whose embedding has zero norm
    /// are left out and listed in `rejected()`.
    pub fn build(
        raw: BTreeMap<String, DescriptionValue>,
        embedder: &dyn TextEmbedder,
        max_tokens: usize,
    ) -> FusionResult<Self> {
        let mut table = Self::default();

        for (raw_key, value) in raw {
            let key = normalize_key(&raw_key);
            let (description, embedding) = match value {
                DescriptionValue::Text(text) => {
                    let description = truncate_tokens(&text, max_tokens);
                    let embedding = embedder.embed(&description);
                    table.locally_embedded += 1;
                    (description, embedding)
                }
                DescriptionValue::Embedded {
                    description,
                    embedding,
                } => (truncate_tokens(&description, max_tokens), normalized(&embedding)),
            };

            if embedding.is_empty() {
                return Err(FusionError::MalformedInput(format!(
                    "description '{key}' has an empty embedding"
                )));
            }
            if is_zero_vector(&embedding) {
                warn!(key = %key, "skipping description with zero-norm embedding");
                table.rejected.push(key);
                continue;
            }
            if table.entries.is_empty() {
                table.dimension = embedding.len();
            } else if embedding.len() != table.dimension {
                return Err(FusionError::DimensionMismatch {
                    expected: table.dimension,
                    found: embedding.len(),
                });
            }

            let entry = DescriptionEntry {
                key: key.clone(),
                description,
                embedding,
            };
            match table.positions.get(&key) {
                Some(&position) => table.entries[position] = entry,
                None => {
                    table.positions.insert(key, table.entries.len());
                    table.entries.push(entry);
                }
            }
        }

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Keys dropped at build time because their embedding had no direction.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    /// Number of text descriptions embedded by the local text encoder.
    pub fn locally_embedded(&self) -> usize {
        self.locally_embedded
    }

    pub fn get(&self, key: &str) -> Option<&DescriptionEntry> {
        self.positions
            .get(key)
            .map(|position| &self.entries[*position])
    }

    pub fn resolve_key(&self, filename: &str) -> Option<&str> {
        candidate_keys(filename)
            .into_iter()
            .find_map(|key| self.get(&key).map(|entry| entry.key.as_str()))
    }

    /// Description with the highest dot product against the normalized image
    /// embedding. The score is the raw dot product; the first entry wins ties.
    pub fn best_match(&self, image_embedding: &[f32]) -> FusionResult<Option<DescriptionMatch<'_>>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        if image_embedding.len() != self.dimension {
            return Err(FusionError::DimensionMismatch {
                expected: self.dimension,
                found: image_embedding.len(),
            });
        }
        if is_zero_vector(image_embedding) {
            return Err(FusionError::MalformedInput(
                "image embedding has zero norm".to_string(),
            ));
        }

        let query = normalized(image_embedding);
        let mut best: Option<DescriptionMatch<'_>> = None;
        for entry in &self.entries {
            let score = dot(&query, &entry.embedding);
            if best.as_ref().is_none_or(|current| score > current.score) {
                best = Some(DescriptionMatch {
                    key: &entry.key,
                    description: &entry.description,
                    score,
                });
            }
        }

        Ok(best)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionMatch<'a> {
    pub caption_id: &'a str,
    pub caption: &'a str,
    pub distance: f64,
    pub similarity: f64,
}

/// Caption corpus plus its index. Built once; shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct CaptionCorpus {
    entries: Vec<CaptionEntry>,
    index: EmbeddingIndex,
}

impl CaptionCorpus {
    pub fn build(entries: Vec<CaptionEntry>) -> FusionResult<Self> {
        let index = EmbeddingIndex::build(
            entries
                .iter()
                .map(|entry| (entry.caption_id.clone(), entry.embedding.clone())),
        )?;
        Ok(Self { entries, index })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    /// Nearest caption for a widget crop embedding. No distance threshold is
    /// applied: any non-empty corpus yields a caption, even for outlier crops.
    pub fn nearest(&self, crop_embedding: &[f32]) -> FusionResult<Option<CaptionMatch<'_>>> {
        if self.is_empty() {
            return Ok(None);
        }
        if is_zero_vector(crop_embedding) {
            return Err(FusionError::MalformedInput(
                "crop embedding has zero norm".to_string(),
            ));
        }

        let query = normalized(crop_embedding);
        let hits = self.index.query(&query, 1)?;

        Ok(hits.into_iter().next().map(|hit| {
            let entry = &self.entries[hit.position];
            CaptionMatch {
                caption_id: &entry.caption_id,
                caption: &entry.caption,
                distance: hit.distance,
                similarity: cosine_from_squared_l2(hit.distance),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        CaptionCorpus, DescriptionTable, candidate_keys, normalize_key, truncate_tokens,
    };
    use crate::model::{CaptionEntry, DescriptionValue};
    use crate::semantic::{LocalHashEmbedder, resolve_model_config};

    fn caption(id: &str, text: &str, embedding: &[f32]) -> CaptionEntry {
        CaptionEntry {
            caption_id: id.to_string(),
            image_name: "corpus.jpg".to_string(),
            caption: text.to_string(),
            embedding: embedding.to_vec(),
        }
    }

    fn embedded(description: &str, embedding: &[f32]) -> DescriptionValue {
        DescriptionValue::Embedded {
            description: description.to_string(),
            embedding: embedding.to_vec(),
        }
    }

    fn embedder() -> LocalHashEmbedder {
        LocalHashEmbedder::new(resolve_model_config("", Some(2)))
    }

    #[test]
    fn truncation_keeps_leading_tokens_and_is_idempotent() {
        let text = (0..600).map(|i| format!("t{i}")).collect::<Vec<String>>().join(" ");
        let once = truncate_tokens(&text, 512);
        assert_eq!(once.split(' ').count(), 512);
        assert!(once.starts_with("t0 t1 t2"));
        assert!(once.ends_with("t511"));
        assert_eq!(truncate_tokens(&once, 512), once);
    }

    #[test]
    fn short_descriptions_only_collapse_whitespace() {
        assert_eq!(truncate_tokens("  login \n screen ", 512), "login screen");
    }

    #[test]
    fn keys_are_trimmed_and_lowercased() {
        assert_eq!(normalize_key("  Screen1.JPG "), "screen1.jpg");
    }

    #[test]
    fn candidate_keys_try_direct_then_png_to_jpg() {
        assert_eq!(
            candidate_keys("Screen1.PNG"),
            vec!["screen1.png".to_string(), "screen1.jpg".to_string()]
        );
        assert_eq!(candidate_keys("dir/Home.jpg"), vec!["home.jpg".to_string()]);
    }

    #[test]
    fn extension_swapped_lookup_resolves_upper_case_png() {
        let mut raw = BTreeMap::new();
        raw.insert("Screen1.jpg ".to_string(), embedded("login form", &[1.0, 0.0]));
        let table = DescriptionTable::build(raw, &embedder(), 512).expect("table");
        assert_eq!(table.resolve_key("Screen1.PNG"), Some("screen1.jpg"));
        assert_eq!(table.resolve_key("Screen2.PNG"), None);
    }

    #[test]
    fn direct_match_is_preferred_over_swapped_key() {
        let mut raw = BTreeMap::new();
        raw.insert("a.png".to_string(), embedded("png entry", &[1.0, 0.0]));
        raw.insert("a.jpg".to_string(), embedded("jpg entry", &[0.0, 1.0]));
        let table = DescriptionTable::build(raw, &embedder(), 512).expect("table");
        assert_eq!(table.resolve_key("A.png"), Some("a.png"));
    }

    #[test]
    fn best_match_returns_argmax_dot_product() {
        let mut raw = BTreeMap::new();
        raw.insert("feed.jpg".to_string(), embedded("news feed", &[0.0, 1.0]));
        raw.insert("login.jpg".to_string(), embedded("login form", &[1.0, 0.0]));
        let table = DescriptionTable::build(raw, &embedder(), 512).expect("table");

        let best = table
            .best_match(&[0.9, 0.1])
            .expect("query")
            .expect("non-empty table");
        assert_eq!(best.key, "login.jpg");
        assert_eq!(best.description, "login form");
        assert!((best.score - 0.99388).abs() < 1e-4);
    }

    #[test]
    fn best_match_rejects_wrong_dimension() {
        let mut raw = BTreeMap::new();
        raw.insert("a.jpg".to_string(), embedded("a", &[1.0, 0.0]));
        let table = DescriptionTable::build(raw, &embedder(), 512).expect("table");
        assert!(table.best_match(&[1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn text_descriptions_are_truncated_then_embedded() {
        let mut raw = BTreeMap::new();
        raw.insert("a.jpg".to_string(), DescriptionValue::Text("one two three".to_string()));
        let table = DescriptionTable::build(raw, &embedder(), 2).expect("table");
        let entry = table.get("a.jpg").expect("entry");
        assert_eq!(entry.description, "one two");
        assert_eq!(entry.embedding.len(), 2);
    }

    #[test]
    fn colliding_keys_keep_the_later_value() {
        let mut raw = BTreeMap::new();
        raw.insert("A.jpg".to_string(), embedded("upper", &[1.0, 0.0]));
        raw.insert("a.jpg".to_string(), embedded("lower", &[0.0, 1.0]));
        let table = DescriptionTable::build(raw, &embedder(), 512).expect("table");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a.jpg").expect("entry").description, "lower");
    }

    #[test]
    fn nearest_caption_matches_blue_button_scenario() {
        let corpus = CaptionCorpus::build(vec![
            caption("c0", "blue button", &[1.0, 0.0]),
            caption("c1", "red icon", &[0.0, 1.0]),
        ])
        .expect("corpus");

        let hit = corpus.nearest(&[0.9, 0.1]).expect("query").expect("hit");
        assert_eq!(hit.caption, "blue button");
        assert_eq!(hit.caption_id, "c0");
        assert!((hit.similarity - 0.99388).abs() < 1e-4);
    }

    #[test]
    fn outlier_crops_still_receive_a_caption() {
        let corpus = CaptionCorpus::build(vec![caption("c0", "blue button", &[1.0, 0.0])])
            .expect("corpus");
        let hit = corpus.nearest(&[-1.0, 0.0]).expect("query").expect("hit");
        assert_eq!(hit.caption, "blue button");
        assert!((hit.distance - 4.0).abs() < 1e-6);
    }

    #[test]
    fn zero_norm_descriptions_are_left_out_and_reported() {
        let mut raw = BTreeMap::new();
        raw.insert("blank.jpg".to_string(), embedded("blank", &[0.0, 0.0]));
        raw.insert("empty.jpg".to_string(), DescriptionValue::Text(" -- ".to_string()));
        raw.insert("login.jpg".to_string(), embedded("login form", &[1.0, 0.0]));
        let table = DescriptionTable::build(raw, &embedder(), 512).expect("table");

        assert_eq!(table.len(), 1);
        assert_eq!(table.rejected(), ["blank.jpg".to_string(), "empty.jpg".to_string()]);
        assert_eq!(table.locally_embedded(), 1);
        let best = table.best_match(&[-0.6, -0.8]).expect("query").expect("entry");
        assert_eq!(best.key, "login.jpg");
    }

    #[test]
    fn zero_norm_queries_are_malformed() {
        let mut raw = BTreeMap::new();
        raw.insert("a.jpg".to_string(), embedded("a", &[1.0, 0.0]));
        let table = DescriptionTable::build(raw, &embedder(), 512).expect("table");
        let err = table.best_match(&[0.0, 0.0]).expect_err("zero image vector");
        assert_eq!(err.kind(), "malformed_input");

        let corpus = CaptionCorpus::build(vec![caption("c0", "blue button", &[1.0, 0.0])])
            .expect("corpus");
        let err = corpus.nearest(&[0.0, 0.0]).expect_err("zero crop vector");
        assert_eq!(err.kind(), "malformed_input");
    }

    #[test]
    fn caption_corpus_rejects_zero_norm_entries() {
        let err = CaptionCorpus::build(vec![
            caption("c0", "blue button", &[1.0, 0.0]),
            caption("c1", "", &[0.0, 0.0]),
        ])
        .expect_err("zero entry");
        assert_eq!(err.kind(), "malformed_input");
    }

    #[test]
    fn empty_corpus_yields_no_caption() {
        let corpus = CaptionCorpus::build(Vec::new()).expect("corpus");
        assert!(corpus.nearest(&[1.0, 0.0]).expect("query").is_none());
    }
}
