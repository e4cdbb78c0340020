//! Pure retrieval helpers: document front matter, chunking, cosine
//! similarity and maximal-marginal-relevance selection.

use serde::{Deserialize, Serialize};

pub const MMR_LAMBDA: f32 = 0.7;
pub const DEFAULT_DOC_VERSION: &str = "1.0";
const FRONT_MATTER_FENCE: &str = "+++";
const SIMILARITY_EPSILON: f32 = 1e-9;

/// A retrieved chunk of a reference document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub doc_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub snippet_id: String,
    pub text: String,
    #[serde(default)]
    pub score: f32,
}

fn default_version() -> String {
    DEFAULT_DOC_VERSION.to_string()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchParams {
    pub top_k: usize,
    pub min_score: f32,
    pub mmr: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self { top_k: 5, min_score: 0.3, mmr: true }
    }
}

impl SearchParams {
    /// How many scored candidates to gather before the final selection.
    pub fn candidate_pool(&self) -> usize {
        if self.mmr {
            self.top_k.saturating_mul(3)
        } else {
            self.top_k
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct DocumentMeta {
    pub doc_id: Option<String>,
    pub title: Option<String>,
    pub version: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedDocument {
    pub meta: DocumentMeta,
    pub body: String,
}

/// Splits optional `+++` TOML front matter from a markdown document.
/// Front matter that does not parse is treated as absent.
pub fn parse_document(raw: &str) -> ParsedDocument {
    let trimmed = raw.trim_start_matches('\u{feff}');
    let Some(rest) = trimmed.strip_prefix(FRONT_MATTER_FENCE) else {
        return ParsedDocument { meta: DocumentMeta::default(), body: trimmed.to_string() };
    };
    let Some(end) = rest.find(&format!("\n{FRONT_MATTER_FENCE}")) else {
        return ParsedDocument { meta: DocumentMeta::default(), body: trimmed.to_string() };
    };

    let header = &rest[..end];
    let body = rest[end + 1 + FRONT_MATTER_FENCE.len()..].trim_start_matches(['\r', '\n']);
    match toml::from_str::<DocumentMeta>(header) {
        Ok(meta) => ParsedDocument { meta, body: body.to_string() },
        Err(error) => {
            tracing::warn!(
                event_name = "retrieval.document.front_matter_invalid",
                error = %error,
                "ignoring unparseable document front matter"
            );
            ParsedDocument { meta: DocumentMeta::default(), body: body.to_string() }
        }
    }
}

/// Splits markdown into chunks: first at heading lines (whose `#` markers are
/// dropped), then each section by character windows of `target_chars`
/// overlapping by `overlap_chars`.
pub fn chunk_markdown(text: &str, target_chars: usize, overlap_chars: usize) -> Vec<String> {
    split_sections(text)
        .into_iter()
        .flat_map(|section| split_len(&section, target_chars, overlap_chars))
        .map(|piece| piece.trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn split_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let heading = line.trim_start().starts_with('#');
        if heading && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        let content =
            if heading { line.trim_start().trim_start_matches('#').trim_start() } else { line };
        current.push_str(content);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

/// Character windows over `text`. Stops once a window reaches the end.
pub fn split_len(text: &str, target_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let target = target_chars.max(1);

    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + target).min(chars.len());
        pieces.push(chars[start..end].iter().collect());
        if end >= chars.len() {
            break;
        }
        let next = end.saturating_sub(overlap_chars);
        start = if next > start { next } else { end };
    }
    pieces
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    dot / (left_norm * right_norm + SIMILARITY_EPSILON)
}

/// Maximal marginal relevance over candidate embeddings. Returns indices
/// into `candidates` in selection order, at most `k` of them.
pub fn mmr_select(query: &[f32], candidates: &[Vec<f32>], k: usize, lambda: f32) -> Vec<usize> {
    let relevance: Vec<f32> =
        candidates.iter().map(|candidate| cosine_similarity(candidate, query)).collect();
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    let mut selected: Vec<usize> = Vec::new();
    let limit = k.min(candidates.len());

    while selected.len() < limit && !remaining.is_empty() {
        let mut best_position = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (position, &index) in remaining.iter().enumerate() {
            let score = if selected.is_empty() {
                relevance[index]
            } else {
                let redundancy = selected
                    .iter()
                    .map(|&chosen| cosine_similarity(&candidates[index], &candidates[chosen]))
                    .fold(f32::NEG_INFINITY, f32::max);
                lambda * relevance[index] - (1.0 - lambda) * redundancy
            };
            if score > best_score {
                best_score = score;
                best_position = position;
            }
        }

        selected.push(remaining.remove(best_position));
    }

    selected
}

/// Keeps snippets at or above `min_score` and orders them by descending score.
pub fn rank_by_score(mut snippets: Vec<Snippet>, params: &SearchParams) -> Vec<Snippet> {
    snippets.retain(|snippet| snippet.score >= params.min_score);
    snippets.sort_by(|left, right| right.score.total_cmp(&left.score));
    snippets
}

#[cfg(test)]
mod tests {
    use super::{
        chunk_markdown, cosine_similarity, mmr_select, parse_document, rank_by_score, split_len,
        SearchParams, Snippet, MMR_LAMBDA,
    };

    fn snippet(id: &str, score: f32) -> Snippet {
        Snippet {
            doc_id: "doc".to_string(),
            title: String::new(),
            version: "1.0".to_string(),
            snippet_id: id.to_string(),
            text: id.to_string(),
            score,
        }
    }

    #[test]
    fn front_matter_supplies_metadata() {
        let parsed = parse_document(
            "+++\ndoc_id = \"fever-care\"\ntitle = \"ดูแลไข้\"\nversion = \"2.1\"\ntags = [\"fever\"]\n+++\n# ไข้\nเช็ดตัว",
        );

        assert_eq!(parsed.meta.doc_id.as_deref(), Some("fever-care"));
        assert_eq!(parsed.meta.version.as_deref(), Some("2.1"));
        assert_eq!(parsed.meta.tags, vec!["fever".to_string()]);
        assert_eq!(parsed.body, "# ไข้\nเช็ดตัว");
    }

    #[test]
    fn documents_without_front_matter_keep_their_body() {
        let parsed = parse_document("# title\ntext");
        assert_eq!(parsed.meta.doc_id, None);
        assert_eq!(parsed.body, "# title\ntext");
    }

    #[test]
    fn split_len_overlaps_and_stops_at_end() {
        let pieces = split_len("abcdefghij", 4, 1);
        assert_eq!(pieces, vec!["abcd", "defg", "ghij"]);

        let no_progress = split_len("abcdef", 2, 5);
        assert_eq!(no_progress, vec!["ab", "cd", "ef"]);
    }

    #[test]
    fn chunking_splits_at_headings_first() {
        let chunks = chunk_markdown("# A\nalpha\n\n# B\nbeta\n", 900, 120);
        assert_eq!(chunks, vec!["A\nalpha", "B\nbeta"]);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn mmr_prefers_diverse_second_pick() {
        let query = vec![1.0, 0.8];
        let candidates = vec![vec![1.0, 0.0], vec![1.0, 0.05], vec![0.0, 1.0]];

        let picked = mmr_select(&query, &candidates, 2, MMR_LAMBDA);
        assert_eq!(picked, vec![1, 2]);
        assert_eq!(mmr_select(&query, &candidates, 10, MMR_LAMBDA).len(), 3);
    }

    #[test]
    fn rank_by_score_filters_and_sorts() {
        let params = SearchParams { top_k: 2, min_score: 0.3, mmr: false };
        let ranked = rank_by_score(vec![snippet("s1", 0.4), snippet("s2", 0.1), snippet("s3", 0.9)], &params);

        let ids: Vec<&str> = ranked.iter().map(|snippet| snippet.snippet_id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s1"]);
        assert_eq!(params.candidate_pool(), 2);
    }
}
