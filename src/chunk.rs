//! Line-window code chunker.
//!
//! Splits source code into ordered pieces that respect a configurable
//! `max_tokens` limit. Pieces end on blank-line boundaries where possible,
//! then on line boundaries, and only as a last resort inside a line (always
//! on a UTF-8 character boundary).
//!
//! Every piece is a contiguous slice of the input, so concatenating the
//! pieces in order reproduces the source byte-for-byte. Nothing is trimmed.

use std::ops::Range;

/// Approximate bytes-per-token ratio. Budgets are compared against byte
/// lengths, which equal char counts for ASCII source.
const BYTES_PER_TOKEN: usize = 4;

/// How code is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Token-budgeted windows on blank-line and line boundaries.
    Lines { max_tokens: usize },
    /// The whole snippet as a single chunk.
    Whole,
}

impl ChunkStrategy {
    pub fn from_config(config: &crate::config::ChunkingConfig) -> anyhow::Result<Self> {
        match config.strategy.as_str() {
            "lines" => Ok(Self::Lines {
                max_tokens: config.max_tokens,
            }),
            "whole" => Ok(Self::Whole),
            other => anyhow::bail!("Unknown chunking strategy: {}", other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lines { .. } => "lines",
            Self::Whole => "whole",
        }
    }
}

/// Split code into chunks. Always returns at least one chunk.
pub fn chunk_code(code: &str, strategy: ChunkStrategy) -> Vec<String> {
    match strategy {
        ChunkStrategy::Whole => vec![code.to_string()],
        ChunkStrategy::Lines { max_tokens } => {
            let max_bytes = max_tokens.max(1) * BYTES_PER_TOKEN;
            chunk_ranges(code, max_bytes)
                .into_iter()
                .map(|r| code[r].to_string())
                .collect()
        }
    }
}

fn chunk_ranges(code: &str, max_bytes: usize) -> Vec<Range<usize>> {
    if code.is_empty() {
        return vec![0..0];
    }

    let mut chunks = Vec::new();
    let mut current: Option<Range<usize>> = None;

    for unit in units(code, max_bytes) {
        current = match current {
            Some(cur) if unit.end - cur.start > max_bytes => {
                chunks.push(cur);
                Some(unit)
            }
            Some(cur) => Some(cur.start..unit.end),
            None => Some(unit),
        };
    }
    if let Some(cur) = current {
        chunks.push(cur);
    }

    chunks
}

/// Contiguous, ordered units no larger than `max_bytes`.
///
/// Blocks (runs of lines ending in a blank line) are kept whole when they fit;
/// otherwise they fall back to single lines, and oversized lines are cut.
fn units(code: &str, max_bytes: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut block: Vec<Range<usize>> = Vec::new();
    let mut pos = 0;

    for line in code.split_inclusive('\n') {
        let range = pos..pos + line.len();
        pos = range.end;
        block.push(range);
        if line.trim().is_empty() {
            flush_block(code, &mut block, max_bytes, &mut out);
        }
    }
    flush_block(code, &mut block, max_bytes, &mut out);

    out
}

fn flush_block(
    code: &str,
    block: &mut Vec<Range<usize>>,
    max_bytes: usize,
    out: &mut Vec<Range<usize>>,
) {
    let (Some(first), Some(last)) = (block.first(), block.last()) else {
        return;
    };
    let whole = first.start..last.end;

    if whole.len() <= max_bytes {
        out.push(whole);
    } else {
        for line in block.iter() {
            if line.len() <= max_bytes {
                out.push(line.clone());
            } else {
                split_line(code, line.clone(), max_bytes, out);
            }
        }
    }
    block.clear();
}

fn split_line(code: &str, line: Range<usize>, max_bytes: usize, out: &mut Vec<Range<usize>>) {
    let mut start = line.start;
    while start < line.end {
        let mut end = (start + max_bytes).min(line.end);
        while end > start && !code.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // Budget smaller than one character: take the whole character.
            end = start + 1;
            while !code.is_char_boundary(end) {
                end += 1;
            }
        }
        out.push(start..end);
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(code: &str, chunks: &[String]) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks.concat(), code, "chunks must reproduce the input");
    }

    #[test]
    fn test_small_code_single_chunk() {
        let code = "function add(a,b){return a+b}";
        let chunks = chunk_code(code, ChunkStrategy::Lines { max_tokens: 512 });
        assert_eq!(chunks, vec![code.to_string()]);
    }

    #[test]
    fn test_empty_code() {
        let chunks = chunk_code("", ChunkStrategy::Lines { max_tokens: 512 });
        assert_eq!(chunks, vec![String::new()]);
    }

    #[test]
    fn test_whole_strategy() {
        let code = "a\n\nb\n\nc\n".repeat(500);
        let chunks = chunk_code(&code, ChunkStrategy::Whole);
        assert_eq!(chunks.len(), 1);
        assert_covers(&code, &chunks);
    }

    #[test]
    fn test_coverage_law_over_varied_inputs() {
        let long_line = "x".repeat(1000);
        let unicode = "fn größe() -> &'static str { \"日本語のコメント\" }\n".repeat(40);
        let crlf = "line one\r\nline two\r\n\r\nline three\r\n".repeat(30);
        let no_trailing_newline = "def f():\n    return 1\n\n\ndef g():\n    return 2";
        let blank_runs = "\n\n\n\nfn a() {}\n\n\n\n";
        let emoji_line = "🦀".repeat(300);
        let samples: Vec<&str> = vec![
            "function add(a,b){return a+b}",
            &long_line,
            &unicode,
            &crlf,
            no_trailing_newline,
            blank_runs,
            &emoji_line,
            "\n",
            "   ",
        ];

        for max_tokens in [1, 2, 5, 16, 64, 512] {
            for code in &samples {
                let chunks = chunk_code(code, ChunkStrategy::Lines { max_tokens });
                assert_covers(code, &chunks);
            }
        }
    }

    #[test]
    fn test_chunks_respect_budget() {
        // max_tokens=5 => max_bytes=20
        let code = "let a = 1;\nlet b = 2;\n\nlet c = 3;\nlet d = 4;\n\nlet e = 5;\n";
        let chunks = chunk_code(code, ChunkStrategy::Lines { max_tokens: 5 });
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.len() <= 20, "chunk too large: {:?}", c);
        }
        assert_covers(code, &chunks);
    }

    #[test]
    fn test_prefers_blank_line_boundaries() {
        let block = "fn one() {\n    1\n}\n\n";
        let code = block.repeat(4);
        // Each block is 20 bytes; a 40-byte budget fits exactly two blocks.
        let chunks = chunk_code(&code, ChunkStrategy::Lines { max_tokens: 10 });
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.starts_with("fn one()")));
    }

    #[test]
    fn test_long_line_split_on_char_boundary() {
        let code = "é".repeat(100); // 200 bytes
        let chunks = chunk_code(&code, ChunkStrategy::Lines { max_tokens: 5 });
        assert!(chunks.len() >= 10);
        for c in &chunks {
            assert!(c.len() <= 20);
        }
        assert_covers(&code, &chunks);
    }

    #[test]
    fn test_budget_counts_bytes() {
        // 20 chars but 40 bytes: a 20-byte budget takes ten chars per chunk.
        let code = "é".repeat(20);
        let chunks = chunk_code(&code, ChunkStrategy::Lines { max_tokens: 5 });
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 20 && c.chars().count() == 10));
        assert_covers(&code, &chunks);
    }

    #[test]
    fn test_deterministic() {
        let code = "alpha\n\nbeta\n\ngamma\n\ndelta\n";
        let c1 = chunk_code(code, ChunkStrategy::Lines { max_tokens: 2 });
        let c2 = chunk_code(code, ChunkStrategy::Lines { max_tokens: 2 });
        assert_eq!(c1, c2);
    }
}
