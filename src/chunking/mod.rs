//! Token-bounded semantic chunking with overlap.
//!
//! The chunker splits a document on blank lines into paragraphs and greedily
//! packs them up to a token target. When a chunk overflows it is emitted and
//! the next chunk is seeded with a token-proportional suffix of the previous
//! one, so neighboring chunks share context. Paragraphs that alone exceed
//! the target recurse into sentence packing, and pathological sentences fall
//! back to whitespace splitting.
//!
//! Offsets are byte offsets into the original text; the overlap makes
//! neighboring `[start_char, end_char)` ranges intersect by design.
//!
//! Token counts are estimated (≈4 characters per token, floored at the word
//! count); the estimator only has to be monotone and consistent, not exact.

use crate::config::ChunkingConfig;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Sentence terminators followed by whitespace.
static SENTENCE_BREAK: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    Regex::new(r"[.!?]+\s+").unwrap()
});

/// A chunk of text with byte offsets into its source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk text (a verbatim slice of the source).
    pub text: String,
    /// Byte offset of the chunk start.
    pub start_char: usize,
    /// Byte offset one past the chunk end.
    pub end_char: usize,
}

/// Estimates the token count of a text span.
///
/// Uses the larger of word count and `chars / 4`, mirroring the usual
/// BPE-free approximation.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let by_chars = text.chars().count() / 4;
    words.max(by_chars)
}

/// Splits text into overlapping, token-bounded chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Creates a chunker, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for out-of-range options.
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Creates a chunker with default options.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            config: ChunkingConfig::default(),
        }
    }

    /// Chunks raw bytes, rejecting non-UTF-8 input.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the bytes are not valid UTF-8.
    pub fn chunk_bytes(&self, bytes: &[u8]) -> Result<Vec<Chunk>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::InvalidInput(format!("document is not valid UTF-8: {e}")))?;
        Ok(self.chunk(text))
    }

    /// Chunks a document into a finite sequence of overlapping chunks.
    ///
    /// Empty or whitespace-only input yields an empty sequence.
    #[must_use]
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let paragraphs = paragraph_spans(text);
        if paragraphs.is_empty() {
            return Vec::new();
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        // Current chunk as a byte span over `text`.
        let mut cur: Option<(usize, usize)> = None;
        let mut idx = 0;

        while idx < paragraphs.len() {
            let (p_start, p_end) = paragraphs[idx];
            let candidate = cur.map_or((p_start, p_end), |(s, _)| (s, p_end));

            if estimate_tokens(&text[candidate.0..candidate.1]) <= self.config.target_tokens {
                cur = Some(candidate);
                idx += 1;
                continue;
            }

            // Overflow. Emit the current chunk when it carries enough tokens,
            // seeding the successor with an overlap suffix.
            if let Some((s, e)) = cur {
                if estimate_tokens(&text[s..e]) >= self.config.min_tokens {
                    self.emit(text, s, e, &mut chunks);
                    let overlap_start = self.overlap_start(text, s, e);
                    cur = Some((overlap_start, e));
                } else {
                    cur = None;
                }
            }

            let para_tokens = estimate_tokens(&text[p_start..p_end]);
            if para_tokens <= self.config.target_tokens {
                // The paragraph fits on its own; append it to the overlap
                // seed (or start fresh) even if the combination exceeds the
                // target. The next overflow emits it.
                cur = Some(cur.map_or((p_start, p_end), |(s, _)| (s, p_end)));
                idx += 1;
            } else {
                // Paragraph alone exceeds the target: recurse into sentences.
                let pieces = self.split_to_fit(text, p_start, p_end);
                let last = pieces.len().saturating_sub(1);
                for (i, (s, e)) in pieces.into_iter().enumerate() {
                    if i == last {
                        cur = Some((s, e));
                    } else {
                        self.emit(text, s, e, &mut chunks);
                    }
                }
                idx += 1;
            }
        }

        // Tail: honor min_tokens only when earlier chunks already cover the
        // document, otherwise a short document would vanish entirely.
        if let Some((s, e)) = cur {
            let tail_tokens = estimate_tokens(&text[s..e]);
            let tail_is_new = chunks.last().is_none_or(|c| e > c.end_char);
            if tail_is_new && (tail_tokens >= self.config.min_tokens || chunks.is_empty()) {
                self.emit(text, s, e, &mut chunks);
            }
        }

        chunks
    }

    /// Pushes a chunk for the given span.
    #[allow(clippy::unused_self)]
    fn emit(&self, text: &str, start: usize, end: usize, out: &mut Vec<Chunk>) {
        out.push(Chunk {
            text: text[start..end].to_string(),
            start_char: start,
            end_char: end,
        });
    }

    /// Computes the byte offset where the overlap suffix of `[start, end)`
    /// begins, sized proportionally to `overlap_tokens`.
    fn overlap_start(&self, text: &str, start: usize, end: usize) -> usize {
        let span = &text[start..end];
        let tokens = estimate_tokens(span).max(1);
        if tokens <= self.config.overlap_tokens {
            return start;
        }
        let keep_ratio = self.config.overlap_tokens as f64 / tokens as f64;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let keep_bytes = (span.len() as f64 * keep_ratio) as usize;
        let mut cut = end.saturating_sub(keep_bytes).max(start);
        // Snap to a character boundary, then forward to the next word start.
        while cut < end && !text.is_char_boundary(cut) {
            cut += 1;
        }
        if let Some(offset) = text[cut..end].find(char::is_whitespace) {
            let candidate = cut + offset + 1;
            if candidate < end {
                cut = candidate;
                while cut < end && !text.is_char_boundary(cut) {
                    cut += 1;
                }
            }
        }
        cut
    }

    /// Splits an oversized span into sequential subspans each within the
    /// token target, preferring sentence boundaries and falling back to
    /// whitespace.
    fn split_to_fit(&self, text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
        let sentences = sentence_spans(text, start, end);
        let mut out: Vec<(usize, usize)> = Vec::new();
        let mut cur: Option<(usize, usize)> = None;

        for (s_start, s_end) in sentences {
            if estimate_tokens(&text[s_start..s_end]) > self.config.target_tokens {
                // Flush whatever is packed, then word-split the monster.
                if let Some(span) = cur.take() {
                    out.push(span);
                }
                out.extend(self.split_words_to_fit(text, s_start, s_end));
                continue;
            }
            let candidate = cur.map_or((s_start, s_end), |(s, _)| (s, s_end));
            if estimate_tokens(&text[candidate.0..candidate.1]) <= self.config.target_tokens {
                cur = Some(candidate);
            } else {
                if let Some(span) = cur.take() {
                    out.push(span);
                }
                cur = Some((s_start, s_end));
            }
        }
        if let Some(span) = cur {
            out.push(span);
        }
        if out.is_empty() {
            out.push((start, end));
        }
        out
    }

    /// Last-resort whitespace packing for a single oversized sentence.
    fn split_words_to_fit(&self, text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
        let span = &text[start..end];
        let mut out = Vec::new();
        let mut cur_start: Option<usize> = None;
        let mut cur_end = start;

        for (offset, word) in span.split_word_indices() {
            let w_start = start + offset;
            let w_end = w_start + word.len();
            let candidate_start = cur_start.unwrap_or(w_start);
            if estimate_tokens(&text[candidate_start..w_end]) > self.config.target_tokens
                && cur_start.is_some()
            {
                out.push((candidate_start, cur_end));
                cur_start = Some(w_start);
            } else if cur_start.is_none() {
                cur_start = Some(w_start);
            }
            cur_end = w_end;
        }
        if let Some(s) = cur_start {
            out.push((s, cur_end));
        }
        if out.is_empty() {
            out.push((start, end));
        }
        out
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Word iteration with byte offsets, used by the whitespace fallback.
trait SplitWordIndices {
    fn split_word_indices(&self) -> impl Iterator<Item = (usize, &str)>;
}

impl SplitWordIndices for str {
    fn split_word_indices(&self) -> impl Iterator<Item = (usize, &str)> {
        self.split_whitespace().map(|word| {
            // Safety of the offset math: split_whitespace yields subslices
            // of self, so the pointer difference is a valid byte offset.
            let offset = word.as_ptr() as usize - self.as_ptr() as usize;
            (offset, word)
        })
    }
}

/// Returns trimmed paragraph byte spans, splitting on blank lines.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    for part in text.split("\n\n") {
        let offset = cursor;
        cursor += part.len() + 2;
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lead = part.len() - part.trim_start().len();
        let start = offset + lead;
        spans.push((start, start + trimmed.len()));
    }
    spans
}

/// Returns sentence byte spans within `[start, end)`.
fn sentence_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let span = &text[start..end];
    let mut spans = Vec::new();
    let mut cursor = 0;

    for m in SENTENCE_BREAK.find_iter(span) {
        let s_end = m.start() + m.as_str().trim_end().len();
        if s_end > cursor {
            spans.push((start + cursor, start + s_end));
        }
        cursor = m.end();
    }
    if cursor < span.len() {
        let tail = span[cursor..].trim_end();
        if !tail.is_empty() {
            spans.push((start + cursor, start + cursor + tail.len()));
        }
    }
    if spans.is_empty() {
        spans.push((start, end));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunker(target: usize, overlap: usize, min: usize) -> Chunker {
        Chunker {
            config: ChunkingConfig {
                target_tokens: target,
                overlap_tokens: overlap,
                min_tokens: min,
            },
        }
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let chunker = Chunker::with_defaults();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\n   ").is_empty());
    }

    #[test]
    fn test_small_document_is_one_chunk() {
        let chunker = Chunker::with_defaults();
        let text = "Alice works at Acme Corp.\n\nAcme Corp is based in Paris.";
        let chunks = chunker.chunk(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks[0].end_char, text.len());
    }

    #[test]
    fn test_offsets_slice_back_into_source() {
        let chunker = small_chunker(20, 5, 2);
        let text = (0..12)
            .map(|i| format!("Paragraph number {i} has a handful of words in it."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_char..chunk.end_char], chunk.text);
        }
    }

    #[test]
    fn test_overlap_ranges_intersect() {
        let chunker = small_chunker(20, 8, 2);
        let text = (0..12)
            .map(|i| format!("Paragraph number {i} has a handful of words in it."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].start_char < pair[0].end_char,
                "expected overlap between {:?} and {:?}",
                (pair[0].start_char, pair[0].end_char),
                (pair[1].start_char, pair[1].end_char),
            );
        }
    }

    #[test]
    fn test_coverage_spans_all_content() {
        let chunker = small_chunker(15, 4, 2);
        let text = (0..9)
            .map(|i| format!("Sentence {i} carries several words for packing."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunker.chunk(&text);
        let mut covered = vec![false; text.len()];
        for chunk in &chunks {
            for flag in &mut covered[chunk.start_char..chunk.end_char] {
                *flag = true;
            }
        }
        for (i, byte) in text.bytes().enumerate() {
            if !byte.is_ascii_whitespace() {
                assert!(covered[i], "byte {i} ({}) not covered", byte as char);
            }
        }
    }

    #[test]
    fn test_oversized_paragraph_splits_on_sentences() {
        let chunker = small_chunker(12, 3, 1);
        let text = (0..8)
            .map(|i| format!("This is sentence number {i} with filler words."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_char..chunk.end_char], chunk.text);
        }
    }

    #[test]
    fn test_oversized_sentence_splits_on_whitespace() {
        let chunker = small_chunker(6, 2, 1);
        let text = "word ".repeat(60);
        let chunks = chunker.chunk(text.trim_end());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(estimate_tokens(&chunk.text) <= 7, "chunk too large");
        }
    }

    #[test]
    fn test_chunk_bytes_rejects_invalid_utf8() {
        let chunker = Chunker::with_defaults();
        let result = chunker.chunk_bytes(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(crate::Error::InvalidInput(_))));
    }

    #[test]
    fn test_estimate_tokens_scales_with_words() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("one two three") >= 3);
        assert!(estimate_tokens(&"abcd".repeat(100)) >= 100);
    }
}
