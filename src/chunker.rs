//! Bounded-length overlapping text splitter.
//!
//! Splits raw documents into chunks of at most `chunk_size` characters with
//! `overlap` characters carried between consecutive chunks. Splitting works
//! down a separator hierarchy (blank line, newline, space, hard character
//! split) so chunk boundaries land on the most semantic break available.
//!
//! Each raw document splits independently — content is never merged across
//! two raw documents. Chunk indices are zero-based and contiguous per
//! source file across the whole output sequence.

use std::collections::HashMap;

use serde_json::json;

use crate::config::ChunkingConfig;
use crate::models::{sanitize_metadata, RawDocument, SplitChunk};

const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

/// Split a batch of raw documents into indexed chunks with metadata.
pub fn split_documents(docs: &[RawDocument], config: &ChunkingConfig) -> Vec<SplitChunk> {
    let mut counters: HashMap<String, i64> = HashMap::new();
    let mut chunks = Vec::new();

    for doc in docs {
        let source = doc
            .metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        for text in split_text(&doc.text, config.chunk_size, config.overlap) {
            let index = counters.entry(source.clone()).or_insert(0);
            let mut metadata = sanitize_metadata(&doc.metadata);
            metadata.insert("source".to_string(), json!(source));
            metadata.insert("chunk_index".to_string(), json!(*index));
            chunks.push(SplitChunk {
                text,
                source: source.clone(),
                chunk_index: *index,
                metadata,
            });
            *index += 1;
        }
    }

    chunks
}

/// Split one text into pieces of at most `chunk_size` characters.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    split_recursive(text, chunk_size, overlap, SEPARATORS)
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn joined_len(window: &[String], sep: &str) -> usize {
    if window.is_empty() {
        return 0;
    }
    let sep_total = char_len(sep) * (window.len() - 1);
    window.iter().map(|s| char_len(s)).sum::<usize>() + sep_total
}

fn split_recursive(text: &str, size: usize, overlap: usize, seps: &[&str]) -> Vec<String> {
    if char_len(text) <= size {
        return vec![text.to_string()];
    }

    let Some((sep, rest)) = seps.split_first() else {
        return hard_split(text, size, overlap);
    };

    let parts: Vec<&str> = text.split(sep).collect();
    if parts.len() == 1 {
        return split_recursive(text, size, overlap, rest);
    }

    let mut pieces: Vec<String> = Vec::new();
    for part in parts {
        if char_len(part) > size {
            pieces.extend(split_recursive(part, size, overlap, rest));
        } else {
            pieces.push(part.to_string());
        }
    }

    merge_pieces(pieces, sep, size, overlap)
}

/// Greedily pack pieces into windows of at most `size` characters; when a
/// window flushes, trailing pieces totalling at most `overlap` characters
/// seed the next window.
fn merge_pieces(pieces: Vec<String>, sep: &str, size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut chunks: Vec<String> = Vec::new();
    let mut window: Vec<String> = Vec::new();

    for piece in pieces {
        if piece.trim().is_empty() {
            continue;
        }
        let piece_len = char_len(&piece);
        if !window.is_empty() && joined_len(&window, sep) + sep_len + piece_len > size {
            chunks.push(window.join(sep));
            while !window.is_empty()
                && (joined_len(&window, sep) > overlap
                    || joined_len(&window, sep) + sep_len + piece_len > size)
            {
                window.remove(0);
            }
        }
        window.push(piece);
    }

    if !window.is_empty() {
        chunks.push(window.join(sep));
    }

    chunks
}

/// Last resort: fixed character windows stepping by `size - overlap`.
fn hard_split(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            overlap,
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("Hello, world!", 1000, 200);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_every_chunk_within_bound() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} with a bit of padding.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        for chunk in split_text(&text, 120, 30) {
            assert!(
                chunk.chars().count() <= 120,
                "chunk exceeds bound: {} chars",
                chunk.chars().count()
            );
        }
    }

    #[test]
    fn test_overlap_carries_trailing_content() {
        let text = "alpha beta\n\ngamma delta\n\nepsilon zeta\n\neta theta";
        let chunks = split_text(text, 26, 12);
        assert_eq!(
            chunks,
            vec![
                "alpha beta\n\ngamma delta".to_string(),
                "gamma delta\n\nepsilon zeta".to_string(),
                "epsilon zeta\n\neta theta".to_string(),
            ]
        );
    }

    #[test]
    fn test_hard_split_is_char_boundary_safe() {
        let text = "日本語のテキスト".repeat(50);
        let chunks = split_text(&text, 37, 9);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 37);
        }
    }

    #[test]
    fn test_indices_contiguous_per_source() {
        let docs = vec![
            RawDocument::new("short one", "a.txt"),
            RawDocument::new(
                (0..30)
                    .map(|i| format!("Paragraph {}.", i))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
                "a.txt",
            ),
        ];
        let chunks = split_documents(&docs, &config(60, 10));
        assert!(chunks.len() > 2);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i64);
            assert_eq!(chunk.source, "a.txt");
            assert_eq!(
                chunk.metadata.get("chunk_index"),
                Some(&serde_json::json!(i as i64))
            );
        }
    }

    #[test]
    fn test_documents_never_merge() {
        let docs = vec![
            RawDocument::new("row one content", "rows.csv"),
            RawDocument::new("row two content", "rows.csv"),
        ];
        let chunks = split_documents(&docs, &config(1000, 200));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "row one content");
        assert_eq!(chunks[1].text, "row two content");
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[test]
    fn test_separate_sources_restart_indices() {
        let docs = vec![
            RawDocument::new("from file a", "a.txt"),
            RawDocument::new("from file b", "b.txt"),
        ];
        let chunks = split_documents(&docs, &config(1000, 200));
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 0);
        assert_eq!(chunks[1].source, "b.txt");
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(split_text(text, 12, 4), split_text(text, 12, 4));
    }
}
