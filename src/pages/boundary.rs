use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// Which marker grammar produced the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStyle {
    Framed,
    Open,
    Bare,
    Implicit,
}

impl MarkerStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Framed => "framed",
            Self::Open => "open",
            Self::Bare => "bare",
            Self::Implicit => "implicit",
        }
    }
}

/// Half-open byte range `[start, end)` of one page inside a source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageBoundary {
    pub page: u32,
    pub start: usize,
    pub end: usize,
}

impl PageBoundary {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// This page's slice of the source it was parsed from.
    pub fn text<'a>(&self, raw_text: &'a str) -> Option<&'a str> {
        raw_text.get(self.start..self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBoundaryIndex {
    boundaries: Vec<PageBoundary>,
    style: MarkerStyle,
}

impl PageBoundaryIndex {
    /// Index with no pages, used for sources that carry no text at all.
    pub fn empty() -> Self {
        Self {
            boundaries: Vec::new(),
            style: MarkerStyle::Implicit,
        }
    }

    /// Boundaries in ascending start-offset order.
    pub fn boundaries(&self) -> &[PageBoundary] {
        &self.boundaries
    }

    pub fn style(&self) -> MarkerStyle {
        self.style
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn get(&self, page: u32) -> Option<&PageBoundary> {
        self.boundaries.iter().find(|boundary| boundary.page == page)
    }

    /// Page numbers in ascending numeric order.
    pub fn page_numbers(&self) -> Vec<u32> {
        let mut pages = self
            .boundaries
            .iter()
            .map(|boundary| boundary.page)
            .collect::<Vec<u32>>();
        pages.sort_unstable();
        pages
    }

    pub fn min_page(&self) -> Option<u32> {
        self.boundaries.iter().map(|boundary| boundary.page).min()
    }

    pub fn max_page(&self) -> Option<u32> {
        self.boundaries.iter().map(|boundary| boundary.page).max()
    }

    /// Page texts keyed by page number, trimmed.
    pub fn page_texts(&self, raw_text: &str) -> BTreeMap<u32, String> {
        self.boundaries
            .iter()
            .filter_map(|boundary| {
                boundary
                    .text(raw_text)
                    .map(|text| (boundary.page, text.trim().to_string()))
            })
            .collect()
    }
}

/// Recovers page boundaries from marker text. Parsing never fails: text
/// without any recognizable marker becomes a single implicit page 1.
#[derive(Debug, Clone)]
pub struct BoundaryParser {
    framed_marker: Regex,
    open_marker: Regex,
    bare_marker: Regex,
}

impl BoundaryParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            framed_marker: Regex::new(
                r"(?mi)^={50,}[ \t]*\r?\n[ \t]*PAGE[ \t]+(\d+)[ \t]*\r?\n={50,}[ \t]*\r?$",
            )
            .context("failed to compile framed page marker regex")?,
            open_marker: Regex::new(r"(?mi)^={50,}[ \t]*\r?\n[ \t]*PAGE[ \t]+(\d+)[ \t]*\r?$")
                .context("failed to compile open page marker regex")?,
            bare_marker: Regex::new(r"(?mi)^[ \t]*PAGE[ \t]+(\d+)[ \t]*:?[ \t]*\r?$")
                .context("failed to compile bare page marker regex")?,
        })
    }

    pub fn parse(&self, raw_text: &str) -> PageBoundaryIndex {
        let grammars = [
            (MarkerStyle::Framed, &self.framed_marker),
            (MarkerStyle::Open, &self.open_marker),
            (MarkerStyle::Bare, &self.bare_marker),
        ];

        for (style, pattern) in grammars {
            let markers = collect_markers(raw_text, pattern);
            if markers.is_empty() {
                continue;
            }

            let boundaries =
                resolve_overlaps(deduplicate(naive_ranges(&markers, raw_text.len())));
            debug!(
                style = style.as_str(),
                markers = markers.len(),
                pages = boundaries.len(),
                "parsed page markers"
            );
            return PageBoundaryIndex { boundaries, style };
        }

        PageBoundaryIndex {
            boundaries: vec![PageBoundary {
                page: 1,
                start: 0,
                end: raw_text.len(),
            }],
            style: MarkerStyle::Implicit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    page: u32,
    match_start: usize,
    match_end: usize,
}

fn collect_markers(raw_text: &str, pattern: &Regex) -> Vec<Marker> {
    pattern
        .captures_iter(raw_text)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let page = captures.get(1)?.as_str().parse::<u32>().ok()?;
            if page == 0 {
                return None;
            }
            Some(Marker {
                page,
                match_start: whole.start(),
                match_end: whole.end(),
            })
        })
        .collect()
}

fn naive_ranges(markers: &[Marker], text_len: usize) -> Vec<PageBoundary> {
    markers
        .iter()
        .enumerate()
        .map(|(index, marker)| PageBoundary {
            page: marker.page,
            start: marker.match_end,
            end: markers
                .get(index + 1)
                .map(|next| next.match_start)
                .unwrap_or(text_len),
        })
        .collect()
}

/// Keeps the first start for a repeated page number and stretches its end
/// over every later occurrence.
fn deduplicate(ranges: Vec<PageBoundary>) -> Vec<PageBoundary> {
    let mut merged = Vec::<PageBoundary>::with_capacity(ranges.len());
    for range in ranges {
        match merged.iter_mut().find(|existing| existing.page == range.page) {
            Some(existing) => {
                if range.end > existing.end {
                    existing.end = range.end;
                }
            }
            None => merged.push(range),
        }
    }
    merged
}

/// Sorts by start offset and clamps each end to the following start.
pub(crate) fn resolve_overlaps(mut boundaries: Vec<PageBoundary>) -> Vec<PageBoundary> {
    boundaries.sort_by(|left, right| left.start.cmp(&right.start).then(left.page.cmp(&right.page)));

    for index in 1..boundaries.len() {
        let next_start = boundaries[index].start;
        let current = &mut boundaries[index - 1];
        if current.end > next_start {
            current.end = next_start.max(current.start);
        }
    }

    boundaries
}
