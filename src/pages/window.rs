use serde::Serialize;

use super::assemble::PageRecord;

pub const DEFAULT_CHUNK_SIZE: usize = 4;

/// A run of consecutive canonical pages handed to a downstream extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub chunk_number: usize,
    pub page_numbers: Vec<u32>,
    pub sources: Vec<String>,
    pub char_count: usize,
    pub text: String,
}

/// Groups pages into consecutive windows of `chunk_size` (0 is read as 1).
/// The last window may be short.
pub fn window(pages: &[PageRecord], chunk_size: usize) -> Vec<Chunk> {
    pages
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, group)| {
            let mut text = String::new();
            for record in group {
                text.push_str(&format!("=== PAGE {} ({}) ===\n", record.page, record.source));
                text.push_str(&record.text);
                text.push_str("\n\n");
            }
            let text = text.trim().to_string();

            Chunk {
                chunk_number: index + 1,
                page_numbers: group.iter().map(|record| record.page).collect(),
                sources: group.iter().map(|record| record.source.clone()).collect(),
                char_count: text.chars().count(),
                text,
            }
        })
        .collect()
}
