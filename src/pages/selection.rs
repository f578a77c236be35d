use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::boundary::PageBoundaryIndex;

pub const DEFAULT_MIN_AMOUNT: u64 = 1;
pub const DEFAULT_BUFFER_PAGES: u32 = 1;
pub const DEFAULT_FALLBACK_PAGES: usize = 3;

/// Pages that mention any of these (upper-cased) are worked examples, not schedules.
pub const DEFAULT_SKIP_WORDS: &[&str] = &["EXAMPLE", "CALCULATION", "HOW TO", "SAMPLE", "ILLUSTRATION"];

/// Additional-interest vocabulary, matched against lower-cased page text.
pub const ADDITIONAL_INTEREST_KEYWORDS: &[&str] = &[
    "additional interest",
    "additional interests",
    "additional insured",
    "additional insureds",
    "mortgagee",
    "mortgagees",
    "mortgage holder",
    "mortgage holders",
    "loss payee",
    "loss payable",
    "lienholder",
    "lien holder",
    "secured party",
    "secured parties",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionRules {
    pub min_amount: u64,
    pub buffer_pages: u32,
    pub fallback_pages: usize,
    pub skip_words: Vec<String>,
    pub keywords: Vec<String>,
}

impl Default for SelectionRules {
    fn default() -> Self {
        Self {
            min_amount: DEFAULT_MIN_AMOUNT,
            buffer_pages: DEFAULT_BUFFER_PAGES,
            fallback_pages: DEFAULT_FALLBACK_PAGES,
            skip_words: DEFAULT_SKIP_WORDS.iter().map(|word| word.to_string()).collect(),
            keywords: ADDITIONAL_INTEREST_KEYWORDS
                .iter()
                .map(|keyword| keyword.to_string())
                .collect(),
        }
    }
}

impl SelectionRules {
    /// Loads rules from a JSON file; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let rules: SelectionRules = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse selection rules {}", path.display()))?;
        Ok(rules)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Inclusive `(first, last)` page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageInterval {
    pub first: u32,
    pub last: u32,
}

impl PageInterval {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, page: u32) -> bool {
        self.first <= page && page <= self.last
    }

    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.first..=self.last
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionOutcome {
    pub total_pages: usize,
    pub magnitude_pages: Vec<u32>,
    pub keyword_pages: Vec<u32>,
    pub retained_pages: Vec<u32>,
    pub intervals: Vec<PageInterval>,
    pub fallback_used: bool,
}

impl SelectionOutcome {
    pub fn covered_pages(&self) -> BTreeSet<u32> {
        pages_in(&self.intervals)
    }
}

#[derive(Debug, Clone)]
pub struct RangeSelector {
    dollar_token: Regex,
    rules: SelectionRules,
    skip_words: Vec<String>,
    keywords: Vec<String>,
}

impl RangeSelector {
    pub fn new(rules: SelectionRules) -> Result<Self> {
        let skip_words = rules
            .skip_words
            .iter()
            .map(|word| word.trim().to_uppercase())
            .filter(|word| !word.is_empty())
            .collect();
        let keywords = rules
            .keywords
            .iter()
            .map(|keyword| keyword.trim().to_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .collect();

        Ok(Self {
            dollar_token: Regex::new(r"\$\s*([0-9,]+)")
                .context("failed to compile dollar amount regex")?,
            rules,
            skip_words,
            keywords,
        })
    }

    pub fn select(&self, index: &PageBoundaryIndex, raw_text: &str) -> SelectionOutcome {
        let mut magnitude_pages = BTreeSet::new();
        let mut keyword_pages = BTreeSet::new();

        for boundary in index.boundaries() {
            let Some(page_text) = boundary.text(raw_text) else {
                continue;
            };
            if self.has_qualifying_amount(page_text) {
                magnitude_pages.insert(boundary.page);
            }
            if self.has_keyword(page_text) {
                keyword_pages.insert(boundary.page);
            }
        }

        let mut retained = magnitude_pages
            .union(&keyword_pages)
            .copied()
            .collect::<Vec<u32>>();

        let all_pages = index.page_numbers();
        let mut fallback_used = false;
        let intervals = if retained.is_empty() {
            if all_pages.is_empty() {
                Vec::new()
            } else {
                fallback_used = true;
                retained = all_pages
                    .iter()
                    .copied()
                    .take(self.rules.fallback_pages.clamp(1, all_pages.len()))
                    .collect();
                warn!(
                    total_pages = all_pages.len(),
                    fallback_pages = retained.len(),
                    "no page matched amount or keyword rules; keeping leading pages"
                );
                leading_interval(&retained)
            }
        } else {
            let (min_page, max_page) = match (index.min_page(), index.max_page()) {
                (Some(min_page), Some(max_page)) => (min_page, max_page),
                _ => (1, 1),
            };
            merge_buffered(&retained, self.rules.buffer_pages, min_page, max_page)
        };

        debug!(
            magnitude = ?magnitude_pages,
            keyword = ?keyword_pages,
            intervals = intervals.len(),
            "page selection computed"
        );

        SelectionOutcome {
            total_pages: all_pages.len(),
            magnitude_pages: magnitude_pages.into_iter().collect(),
            keyword_pages: keyword_pages.into_iter().collect(),
            retained_pages: retained,
            intervals,
            fallback_used,
        }
    }

    fn has_qualifying_amount(&self, page_text: &str) -> bool {
        let upper = page_text.to_uppercase();
        if self.skip_words.iter().any(|word| upper.contains(word.as_str())) {
            return false;
        }

        self.dollar_token.captures_iter(page_text).any(|captures| {
            let Some(amount) = captures.get(1) else {
                return false;
            };
            let digits = amount.as_str().replace(',', "");
            if digits.is_empty() {
                return false;
            }
            // Only overflow can fail here; anything that large clears the floor.
            digits
                .parse::<u64>()
                .map(|value| value >= self.rules.min_amount)
                .unwrap_or(true)
        })
    }

    fn has_keyword(&self, page_text: &str) -> bool {
        let lower = page_text.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| lower.contains(keyword.as_str()))
    }
}

fn leading_interval(pages: &[u32]) -> Vec<PageInterval> {
    match (pages.first(), pages.last()) {
        (Some(first), Some(last)) => vec![PageInterval::new(*first, *last)],
        _ => Vec::new(),
    }
}

/// Expands each page by `buffer` on both sides, clipped to `[min_page, max_page]`,
/// then coalesces overlapping or adjacent ranges.
pub fn merge_buffered(pages: &[u32], buffer: u32, min_page: u32, max_page: u32) -> Vec<PageInterval> {
    let mut ranges = pages
        .iter()
        .map(|page| {
            PageInterval::new(
                page.saturating_sub(buffer).max(min_page),
                page.saturating_add(buffer).min(max_page),
            )
        })
        .filter(|range| range.first <= range.last)
        .collect::<Vec<PageInterval>>();
    ranges.sort();

    let mut merged = Vec::<PageInterval>::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(previous) if range.first <= previous.last.saturating_add(1) => {
                previous.last = previous.last.max(range.last);
            }
            _ => merged.push(range),
        }
    }
    merged
}

pub fn pages_in(intervals: &[PageInterval]) -> BTreeSet<u32> {
    intervals.iter().flat_map(PageInterval::pages).collect()
}

/// Reduced text: each interval under a `FILTERED PAGES a-b` banner, copied
/// verbatim from the first page's start to the last page's end.
pub fn render_filtered(raw_text: &str, index: &PageBoundaryIndex, intervals: &[PageInterval]) -> String {
    let banner = "=".repeat(80);
    let mut filtered = String::new();

    for interval in intervals {
        // Endpoints may name pages the source lacks; span the pages that exist.
        let present = index
            .boundaries()
            .iter()
            .filter(|boundary| interval.contains(boundary.page))
            .collect::<Vec<_>>();
        let (Some(start), Some(end)) = (
            present.iter().map(|boundary| boundary.start).min(),
            present.iter().map(|boundary| boundary.end).max(),
        ) else {
            continue;
        };
        let Some(body) = raw_text.get(start..end) else {
            continue;
        };

        filtered.push('\n');
        filtered.push_str(&banner);
        filtered.push('\n');
        filtered.push_str(&format!("FILTERED PAGES {}-{}\n", interval.first, interval.last));
        filtered.push_str(&banner);
        filtered.push_str("\n\n");
        filtered.push_str(body);
        filtered.push('\n');
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::boundary::BoundaryParser;

    fn selector() -> RangeSelector {
        RangeSelector::new(SelectionRules::default()).expect("dollar regex compiles")
    }

    fn marked_document(bodies: &[(u32, &str)]) -> String {
        let separator = "=".repeat(60);
        bodies
            .iter()
            .map(|(page, body)| format!("{separator}\nPAGE {page}\n{separator}\n{body}\n"))
            .collect()
    }

    fn run(text: &str) -> SelectionOutcome {
        let index = BoundaryParser::new().expect("parser").parse(text);
        selector().select(&index, text)
    }

    #[test]
    fn amount_and_keyword_pages_are_buffered_and_merged() {
        let pages = (1..=10)
            .map(|page| match page {
                3 => (page, "Limit of insurance $5,000 each occurrence"),
                8 => (page, "The Mortgagee named in the declarations"),
                _ => (page, "general conditions"),
            })
            .collect::<Vec<(u32, &str)>>();
        let outcome = run(&marked_document(&pages));

        assert_eq!(outcome.magnitude_pages, vec![3]);
        assert_eq!(outcome.keyword_pages, vec![8]);
        assert_eq!(outcome.retained_pages, vec![3, 8]);
        assert_eq!(
            outcome.covered_pages().into_iter().collect::<Vec<u32>>(),
            vec![2, 3, 4, 7, 8, 9]
        );
        assert_eq!(
            outcome.intervals,
            vec![PageInterval::new(2, 4), PageInterval::new(7, 9)]
        );
        assert!(!outcome.fallback_used);
    }

    #[test]
    fn unmarked_text_selects_its_only_page() {
        let outcome = run(&"plain words ".repeat(40));
        assert_eq!(outcome.intervals, vec![PageInterval::new(1, 1)]);
        assert!(outcome.fallback_used);

        let outcome = run("Premium $1,200 due");
        assert_eq!(outcome.intervals, vec![PageInterval::new(1, 1)]);
        assert!(!outcome.fallback_used);
    }

    #[test]
    fn disqualifying_words_suppress_amounts_but_not_keywords() {
        let outcome = run(&marked_document(&[
            (1, "Sample schedule $10,000"),
            (2, "nothing"),
            (3, "nothing"),
            (4, "nothing"),
            (5, "Example: loss payee receives $500"),
        ]));

        assert!(outcome.magnitude_pages.is_empty());
        assert_eq!(outcome.keyword_pages, vec![5]);
        assert_eq!(outcome.intervals, vec![PageInterval::new(4, 5)]);
    }

    #[test]
    fn zero_amounts_fall_below_default_floor() {
        let outcome = run(&marked_document(&[(1, "Deductible $0"), (2, "x"), (3, "y"), (4, "z")]));
        assert!(outcome.magnitude_pages.is_empty());
        assert!(outcome.fallback_used);
        assert_eq!(outcome.intervals, vec![PageInterval::new(1, 3)]);
    }

    #[test]
    fn overflowing_amount_still_counts() {
        let outcome = run(&marked_document(&[(1, "$99999999999999999999999"), (2, "x")]));
        assert_eq!(outcome.magnitude_pages, vec![1]);
    }

    #[test]
    fn merged_intervals_are_sorted_clipped_and_separated() {
        let merged = merge_buffered(&[1, 2, 6, 12, 20], 1, 1, 20);
        assert_eq!(
            merged,
            vec![
                PageInterval::new(1, 3),
                PageInterval::new(5, 7),
                PageInterval::new(11, 13),
                PageInterval::new(19, 20),
            ]
        );
        for pair in merged.windows(2) {
            assert!(pair[1].first >= pair[0].last + 2);
        }
    }

    #[test]
    fn adjacent_buffers_coalesce() {
        assert_eq!(merge_buffered(&[2, 5], 1, 1, 10), vec![PageInterval::new(1, 6)]);
    }

    #[test]
    fn selection_is_repeatable() {
        let text = marked_document(&[(1, "a"), (2, "$25 fee"), (3, "b"), (4, "lienholder")]);
        assert_eq!(run(&text), run(&text));
    }

    #[test]
    fn rules_file_overrides_only_given_fields() {
        let rules: SelectionRules =
            serde_json::from_str(r#"{ "min_amount": 500 }"#).expect("partial rules parse");
        assert_eq!(rules.min_amount, 500);
        assert_eq!(rules.keywords.len(), ADDITIONAL_INTEREST_KEYWORDS.len());
        assert_eq!(rules.buffer_pages, DEFAULT_BUFFER_PAGES);
    }

    #[test]
    fn filtered_render_copies_interval_text() {
        let text = marked_document(&[(1, "one"), (2, "two $5"), (3, "three"), (4, "four"), (5, "five")]);
        let index = BoundaryParser::new().expect("parser").parse(&text);
        let outcome = selector().select(&index, &text);
        let filtered = render_filtered(&text, &index, &outcome.intervals);

        assert!(filtered.contains("FILTERED PAGES 1-3"));
        assert!(filtered.contains("three"));
        assert!(!filtered.contains("four"));
    }

    #[test]
    fn filtered_render_spans_present_pages_when_an_endpoint_is_missing() {
        let text = marked_document(&[
            (1, "one"),
            (2, "two"),
            (3, "three"),
            (5, "Limit $5,000"),
            (6, "six"),
            (7, "seven"),
            (8, "eight"),
        ]);
        let index = BoundaryParser::new().expect("parser").parse(&text);
        let outcome = selector().select(&index, &text);
        assert_eq!(outcome.intervals, vec![PageInterval::new(4, 6)]);

        let filtered = render_filtered(&text, &index, &outcome.intervals);
        assert!(filtered.contains("FILTERED PAGES 4-6"));
        assert!(filtered.contains("Limit $5,000"));
        assert!(filtered.contains("six"));
        assert!(!filtered.contains("three"));
        assert!(!filtered.contains("seven"));
    }
}
