//! Line chunking with sentence-boundary preference and original line tracking

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ChunkingConfig;
use crate::types::SourceLine;

/// Sentence-ending mark, optionally followed by closing quotes or brackets
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[.!?…。！？;；][\"'”’»)\]）」』]*\s*$"#).expect("valid sentence-end pattern")
});

/// An ordered span of non-blank lines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    pub index: u32,
    pub lines: Vec<SourceLine>,
}

impl TextChunk {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Splits documents into line chunks
#[derive(Debug, Clone)]
pub struct LineChunker {
    /// Preferred lines per chunk
    target_lines: usize,
    /// Soft minimum
    min_lines: usize,
    /// Hard maximum
    max_lines: usize,
}

impl LineChunker {
    /// Create a new chunker; bounds are normalised so min <= target <= max
    pub fn new(target_lines: usize, min_lines: usize, max_lines: usize) -> Self {
        let target_lines = target_lines.max(1);
        let max_lines = max_lines.max(target_lines);
        let min_lines = min_lines.clamp(1, target_lines);
        Self {
            target_lines,
            min_lines,
            max_lines,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.target_lines, config.min_lines, config.max_lines)
    }

    /// Chunk raw text. Blank lines are skipped; line indices refer to the input.
    pub fn chunk_text(&self, text: &str) -> Vec<TextChunk> {
        let mut spans: Vec<Vec<SourceLine>> = Vec::new();
        let mut current: Vec<SourceLine> = Vec::new();

        for line in non_blank_lines(text) {
            current.push(line);
            let len = current.len();

            if len >= self.target_lines && ends_sentence(&current[len - 1].text) {
                spans.push(std::mem::take(&mut current));
                continue;
            }

            if len >= self.max_lines {
                // Back up to the latest sentence end that keeps the minimum
                let cut = (self.min_lines..len)
                    .rev()
                    .find(|&n| ends_sentence(&current[n - 1].text))
                    .unwrap_or(len);
                let rest = current.split_off(cut);
                spans.push(std::mem::replace(&mut current, rest));
            }
        }

        if !current.is_empty() {
            match spans.last_mut() {
                Some(last)
                    if current.len() < self.min_lines
                        && last.len() + current.len() <= self.max_lines =>
                {
                    last.extend(current);
                }
                _ => spans.push(current),
            }
        }

        spans
            .into_iter()
            .enumerate()
            .map(|(i, lines)| TextChunk {
                index: i as u32,
                lines,
            })
            .collect()
    }
}

impl Default for LineChunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

/// Non-blank lines with their original indices
pub fn non_blank_lines(text: &str) -> impl Iterator<Item = SourceLine> + '_ {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_index, line)| SourceLine {
            line_index,
            text: line.to_string(),
        })
}

/// Whether a line closes a sentence
pub fn ends_sentence(line: &str) -> bool {
    SENTENCE_END.is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn flatten(chunks: &[TextChunk]) -> Vec<SourceLine> {
        chunks.iter().flat_map(|c| c.lines.iter().cloned()).collect()
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunker = LineChunker::default();
        assert!(chunker.chunk_text("").is_empty());
        assert!(chunker.chunk_text("\n   \n\t\n").is_empty());
    }

    #[test]
    fn test_thirteen_lines_target_four() {
        let text = (1..=13)
            .map(|i| format!("Sentence number {}.", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunker = LineChunker::new(4, 2, 6);
        let chunks = chunker.chunk_text(&text);

        assert!((3..=4).contains(&chunks.len()), "got {} chunks", chunks.len());
        let texts: Vec<String> = flatten(&chunks).into_iter().map(|l| l.text).collect();
        let expected: Vec<String> = text.lines().map(String::from).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn test_prefers_sentence_boundary_over_target() {
        // Line 4 has no terminal mark; the chunk runs on to line 5
        let text = "One.\nTwo.\nThree.\nfour, and\nfive.\nSix.\nSeven.\nEight.";
        let chunks = LineChunker::new(4, 2, 6).chunk_text(text);
        assert_eq!(chunks[0].len(), 5);
        assert_eq!(chunks[0].lines[4].text, "five.");
    }

    #[test]
    fn test_backs_up_to_sentence_end_at_max() {
        let text = "a\nb\nc.\nd\ne\nf\ng\nh";
        let chunks = LineChunker::new(4, 2, 6).chunk_text(text);
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[0].lines[2].text, "c.");
        assert_eq!(flatten(&chunks).len(), 8);
    }

    #[test]
    fn test_blank_lines_keep_original_indices() {
        let text = "First.\n\nSecond.\n   \nThird.";
        let chunks = LineChunker::new(4, 2, 6).chunk_text(text);
        let indices: Vec<usize> = flatten(&chunks).iter().map(|l| l.line_index).collect();
        assert_eq!(indices, vec![0, 2, 4]);
    }

    #[test]
    fn test_short_tail_is_merged() {
        let text = "A.\nB.\nC.\nD.\nE.";
        let chunks = LineChunker::new(4, 2, 6).chunk_text(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 5);
    }

    #[test]
    fn test_closing_quotes_count_as_sentence_end() {
        assert!(ends_sentence("He said \"stop.\""));
        assert!(ends_sentence("终わり。"));
        assert!(ends_sentence("Really?)  "));
        assert!(!ends_sentence("and then"));
    }

    #[test]
    fn test_idempotent() {
        let text = "x.\ny\nz.\n\nw\nv.\nu";
        let chunker = LineChunker::default();
        assert_eq!(chunker.chunk_text(text), chunker.chunk_text(text));
    }

    proptest! {
        #[test]
        fn prop_chunks_reconstruct_non_blank_lines(
            lines in proptest::collection::vec("[a-z ]{0,12}[.!?,]?", 0..60),
            target in 1usize..8,
        ) {
            let text = lines.join("\n");
            let chunker = LineChunker::new(target, 2, target + 2);
            let chunks = chunker.chunk_text(&text);

            let expected: Vec<SourceLine> = non_blank_lines(&text).collect();
            prop_assert_eq!(flatten(&chunks), expected);

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index as usize, i);
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.len() <= chunker.max_lines);
            }
        }
    }
}
