use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_MODEL_ID: &str = "ui-caption-local-v1";
pub const DEFAULT_MODEL_NAME: &str = "local hashed bag-of-words caption encoder";
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
pub const DEFAULT_NORMALIZATION: &str = "l2";
pub const DEFAULT_BACKEND: &str = "local-hash-v2";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticModelConfig {
    pub model_id: String,
    pub model_name: String,
    pub dimensions: usize,
    pub normalization: String,
    pub backend: String,
}

pub fn resolve_model_config(model_id: &str, dimensions: Option<usize>) -> SemanticModelConfig {
    let trimmed = model_id.trim();
    let resolved_id = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };
    let model_name = if resolved_id == DEFAULT_MODEL_ID {
        DEFAULT_MODEL_NAME
    } else {
        resolved_id
    };

    SemanticModelConfig {
        model_id: resolved_id.to_string(),
        model_name: model_name.to_string(),
        dimensions: dimensions.unwrap_or(DEFAULT_EMBEDDING_DIM).max(1),
        normalization: DEFAULT_NORMALIZATION.to_string(),
        backend: DEFAULT_BACKEND.to_string(),
    }
}

/// Produces text embeddings for captions and descriptions that arrive
/// without a pre-computed vector. Whether those vectors share a space with
/// the supplied image or crop embeddings depends on the backend; the local
/// hash backend does not.
pub trait TextEmbedder: Send + Sync {
    fn config(&self) -> &SemanticModelConfig;

    /// Returns a unit-norm vector of `config().dimensions` values.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic hashed bag-of-words encoder; stands in for a neural text
/// tower when no pre-computed caption vectors are available. Its vectors are
/// only comparable with other vectors it produced, never with image
/// embeddings from a vision encoder.
#[derive(Debug, Clone)]
pub struct LocalHashEmbedder {
    config: SemanticModelConfig,
}

impl LocalHashEmbedder {
    pub fn new(config: SemanticModelConfig) -> Self {
        Self { config }
    }
}

impl TextEmbedder for LocalHashEmbedder {
    fn config(&self) -> &SemanticModelConfig {
        &self.config
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        embed_text_local(text, self.config.dimensions)
    }
}

/// Warning for `count` texts embedded locally and then compared against
/// externally supplied image vectors. `None` when nothing was embedded
/// locally or the backend is not the local hash encoder.
pub fn cross_modal_warning(config: &SemanticModelConfig, count: usize, what: &str) -> Option<String> {
    (config.backend == DEFAULT_BACKEND && count > 0).then(|| {
        format!(
            "{count} {what} embedded with the {} text encoder are compared against image embeddings from another model; scores are not meaningful without pre-computed vectors",
            config.backend
        )
    })
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

pub fn embedding_text_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// False when `text` yields no word or trigram features, in which case the
/// local encoder would return a zero vector.
pub fn has_embeddable_text(text: &str) -> bool {
    !tokenize_payload(text).is_empty()
}

pub fn embed_text_local(payload: &str, dimensions: usize) -> Vec<f32> {
    let dims = dimensions.max(1);
    let mut vector = vec![0_f32; dims];
    let mut tokens = tokenize_payload(payload);

    if tokens.is_empty() {
        return vector;
    }

    for token in tokens.drain(..) {
        let hash = stable_hash(&token);
        let index = (hash as usize) % dims;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
        vector[index] += sign * weight;
    }

    normalize_vector(&mut vector);
    vector
}

/// Dot product. Equal to cosine similarity when both sides are unit-norm.
pub fn dot(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum::<f64>()
}

pub fn squared_l2_distance(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| {
            let delta = f64::from(*left_value) - f64::from(*right_value);
            delta * delta
        })
        .sum::<f64>()
}

/// Cosine similarity implied by a squared L2 distance between unit vectors.
pub fn cosine_from_squared_l2(distance: f64) -> f64 {
    1.0 - distance / 2.0
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }

    let out = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<f32>>();

    (out.len() == expected_dim).then_some(out)
}

/// Scales `values` to unit L2 norm in place. Zero vectors are left untouched.
pub fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    if norm == 0.0 {
        return;
    }

    for value in values {
        *value /= norm;
    }
}

/// True when `values` has no direction to compare against: all zero, or
/// carrying a non-finite component.
pub fn is_zero_vector(values: &[f32]) -> bool {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();
    !(squared_norm.is_finite() && squared_norm > 0.0)
}

pub fn normalized(values: &[f32]) -> Vec<f32> {
    let mut out = values.to_vec();
    normalize_vector(&mut out);
    out
}

/// Leading 8 bytes of the SHA-256 digest, so bucket assignments stay fixed
/// across toolchains and platforms.
fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Splits on non-alphanumerics and on lower→upper case steps, so widget
/// names like `ImageButton` and captions like "image button" share words.
fn caption_words(text: &str) -> Vec<String> {
    let mut words = Vec::<String>::new();
    let mut current = String::new();
    let mut previous_lower = false;

    for character in text.chars() {
        if !character.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if character.is_uppercase() && previous_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = character.is_lowercase() || character.is_numeric();
        current.extend(character.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Word unigrams, word bigrams and character trigrams over the joined words.
fn tokenize_payload(payload: &str) -> Vec<String> {
    let words = caption_words(payload);

    let mut features = Vec::<String>::with_capacity(words.len() * 4);
    for (index, word) in words.iter().enumerate() {
        features.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            features.push(format!("b:{word}_{next}"));
        }
    }

    let joined = words.concat().chars().collect::<Vec<char>>();
    for window in joined.windows(3) {
        features.push(format!("c:{}", window.iter().collect::<String>()));
    }
    features
}
