//! Splits loaded document pages into overlapping, page-tagged chunks.

use serde::{Deserialize, Serialize};

use crate::config::ChunkingConfig;
use crate::error::{AppError, Result};

/// Split points tried in order: paragraph, line, sentence, word.
const BOUNDARIES: &[&[&str]] = &[
    &["\n\n"],
    &["\n"],
    &[". ", "! ", "? ", "; "],
    &[" ", "\t"],
];

/// Separator assumed between pages when computing document-wide offsets.
const PAGE_JOINER: &str = "\n\n";

/// Text of one loaded page; `number` is 1-based and absent for plain text files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub text: String,
    pub number: Option<u32>,
}

impl Page {
    pub fn new(text: impl Into<String>, number: Option<u32>) -> Self {
        Self {
            text: text.into(),
            number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_id: String,
    pub sequence_index: usize,
    pub text: String,
    /// Character offset of the chunk within the concatenated document.
    pub start_offset: usize,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    window: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.chunk_overlap >= config.chunk_size {
            return Err(AppError::Config(format!(
                "invalid chunking window {} / overlap {}",
                config.chunk_size, config.chunk_overlap
            )));
        }
        Ok(Self {
            window: config.chunk_size,
            overlap: config.chunk_overlap,
        })
    }

    /// Split pages into chunks of at most `window` characters.
    ///
    /// Pages are split independently, so a chunk never spans two pages.
    /// Within a page each chunk after the first starts exactly `overlap`
    /// characters before the previous chunk ended. Chunk ends prefer
    /// paragraph, line, sentence and word boundaries in that order and fall
    /// back to a hard cut. `sequence_index` runs across the whole document
    /// and `start_offset` counts from the start of the pages joined by a
    /// blank line.
    pub fn split(&self, source_id: &str, pages: &[Page]) -> Vec<Chunk> {
        let joiner_len = PAGE_JOINER.chars().count();
        let mut chunks = Vec::new();
        let mut page_start = 0;

        for (i, page) in pages.iter().enumerate() {
            if i > 0 {
                page_start += joiner_len;
            }
            let chars: Vec<char> = page.text.chars().collect();
            for (start, end) in self.ranges(&chars) {
                chunks.push(Chunk {
                    source_id: source_id.to_string(),
                    sequence_index: chunks.len(),
                    text: chars[start..end].iter().collect(),
                    start_offset: page_start + start,
                    metadata: ChunkMetadata {
                        source: source_id.to_string(),
                        page: page.number,
                    },
                });
            }
            page_start += chars.len();
        }
        chunks
    }

    /// Character ranges of the chunks of one page, leading and trailing whitespace excluded.
    fn ranges(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let Some(first) = chars.iter().position(|c| !c.is_whitespace()) else {
            return Vec::new();
        };
        let last = chars
            .iter()
            .rposition(|c| !c.is_whitespace())
            .map(|p| p + 1)
            .unwrap_or(chars.len());

        let mut ranges = Vec::new();
        let mut start = first;
        loop {
            let end = if last - start <= self.window {
                last
            } else {
                self.find_end(chars, start)
            };
            ranges.push((start, end));
            if end >= last {
                break;
            }
            start = end - self.overlap;
        }
        ranges
    }

    /// Pick the end of a chunk beginning at `start`, which has more than `window` characters left.
    fn find_end(&self, chars: &[char], start: usize) -> usize {
        let limit = start + self.window;
        // Never end before the overlap (no progress) or in the first half of the window.
        let min_end = (start + self.overlap + 1).max(start + self.window / 2);

        for level in BOUNDARIES {
            let mut end = limit;
            while end >= min_end {
                if level.iter().any(|sep| ends_with_at(chars, end, sep)) {
                    return end;
                }
                end -= 1;
            }
        }
        limit
    }
}

fn ends_with_at(chars: &[char], end: usize, sep: &str) -> bool {
    let len = sep.chars().count();
    end >= len && chars[end - len..end].iter().copied().eq(sep.chars())
}
