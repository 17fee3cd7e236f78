//! Embedding providers for semantic memory.
//!
//! The engine requires only the vector contract: a deterministic map from
//! text to a fixed-dimension unit vector, safe to call from any thread. The
//! default [`HashEmbedder`] hashes stemmed tokens into a fixed-size feature
//! space — no model download, fully deterministic, good enough for recall of
//! related wordings. A provider selection of `"disabled"` turns semantic mode
//! off entirely; the memory engine then reports `index = unavailable` and
//! serves keyword-only results.

use std::sync::Arc;

/// Dimension of the default hashed embedding space.
pub const DEFAULT_DIM: usize = 384;

/// A deterministic text → unit-vector map.
///
/// Implementations must be pure per input text and `Send + Sync`; the
/// orchestrator calls them from rayon workers.
pub trait EmbeddingProvider: Send + Sync {
    /// Short provider identifier, used in health reporting.
    fn id(&self) -> &'static str;

    /// Dimension of produced vectors.
    fn dimension(&self) -> usize;

    /// Embed one text. The result has `len() == dimension()` and unit L2
    /// norm, except for texts with no extractable tokens, which embed to the
    /// zero vector.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Build the provider selected by config, or `None` for `"disabled"`.
///
/// Unknown selections fall back to the hash provider with a warning, so a
/// typo degrades gracefully instead of silently disabling semantic search.
#[must_use]
pub fn build_provider(selection: &str) -> Option<Arc<dyn EmbeddingProvider>> {
    match selection {
        "disabled" => None,
        "hash" => Some(Arc::new(HashEmbedder::new(DEFAULT_DIM))),
        other => {
            log::warn!("Unknown embedder '{other}', using 'hash'.");
            Some(Arc::new(HashEmbedder::new(DEFAULT_DIM)))
        }
    }
}

/// Feature-hashing embedder over stemmed, stopword-filtered tokens.
///
/// Each token occurrence contributes weight 1 to the bucket selected by an
/// FNV-1a hash of its stem; the vector is then L2-normalized. Cosine
/// between two texts is token-overlap driven: "off-by-one in loop bound"
/// and "loop iterates one too few times" share stems and land well above
/// unrelated text.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    /// Create an embedder producing `dim`-dimensional vectors.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn id(&self) -> &'static str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        let mut any = false;

        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes()) as usize) % self.dim;
            v[bucket] += 1.0;
            any = true;
        }

        if !any {
            return v;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

/// Lowercased alphanumeric tokens, stopword-filtered and lightly stemmed.
/// Shared with the keyword search path so both modes agree on token identity.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            push_token(&mut tokens, std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        push_token(&mut tokens, current);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, token: String) {
    if token.len() < 2 || is_stopword(&token) {
        return;
    }
    tokens.push(stem(&token));
}

/// Minimal English stopword set; just enough to keep function words from
/// dominating short descriptions.
fn is_stopword(token: &str) -> bool {
    matches!(
        token,
        "a" | "an" | "the" | "in" | "on" | "at" | "of" | "to" | "by" | "is" | "are" | "was"
            | "be" | "it" | "its" | "as" | "and" | "or" | "not" | "no" | "too" | "for" | "with"
            | "this" | "that" | "from" | "has" | "have"
    )
}

/// Strip the most common English suffixes. Deliberately crude: "iterates"
/// and "iterate" must agree, exotic morphology does not matter here.
fn stem(token: &str) -> String {
    for suffix in ["ing", "ed", "s"] {
        if let Some(stripped) = token.strip_suffix(suffix) {
            if stripped.len() >= 3 {
                return stripped.to_owned();
            }
        }
    }
    token.to_owned()
}

/// FNV-1a over bytes. Stable across platforms and releases, unlike the
/// standard library's `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Cosine similarity between two equal-length vectors.
///
/// Inputs from [`EmbeddingProvider::embed`] are unit-norm, so this reduces to
/// a dot product, but the general form is kept for index rebuild paths where
/// vectors come off disk.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
