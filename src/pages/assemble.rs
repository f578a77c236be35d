use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use super::reconcile::{
    Confidence, Decisions, PageCandidates, PageDecision, SelectionReason, UnavailableReason,
};

const PAGE_RULE_WIDTH: usize = 80;
const HEADER_RULE_WIDTH: usize = 50;
const TEXT_RULE_WIDTH: usize = 30;

/// One page of the canonical document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    pub page: u32,
    pub source: String,
    pub source_label: String,
    pub reason: SelectionReason,
    pub confidence: Confidence,
    pub char_count: usize,
    pub line_count: usize,
    pub recovered: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageDiagnostic {
    Unavailable {
        page: u32,
        reason: UnavailableReason,
    },
    SelectedSourceMissing {
        page: u32,
        expected: String,
        used: String,
    },
}

impl PageDiagnostic {
    pub fn page(&self) -> u32 {
        match self {
            Self::Unavailable { page, .. } | Self::SelectedSourceMissing { page, .. } => *page,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledDocument {
    pub name: String,
    pub primary_source: String,
    pub pages: Vec<PageRecord>,
    pub diagnostics: Vec<PageDiagnostic>,
}

impl AssembledDocument {
    pub fn unavailable_pages(&self) -> Vec<u32> {
        self.diagnostics
            .iter()
            .filter(|diagnostic| matches!(diagnostic, PageDiagnostic::Unavailable { .. }))
            .map(PageDiagnostic::page)
            .collect()
    }

    pub fn pages_by_source(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::<String, usize>::new();
        for record in &self.pages {
            *counts.entry(record.source.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn total_chars(&self) -> usize {
        self.pages.iter().map(|record| record.char_count).sum()
    }

    /// Canonical text report. Contains no timestamps, so identical inputs
    /// render identical bytes.
    pub fn render_report(&self) -> String {
        let page_rule = "=".repeat(PAGE_RULE_WIDTH);
        let mut report = String::new();

        let _ = writeln!(report, "COMBINED PAGE EXTRACTION - {}", self.name);
        let _ = writeln!(report, "{page_rule}");
        let _ = writeln!(report, "Primary Source: {}", self.primary_source);
        let _ = writeln!(report, "Total Pages: {}", self.pages.len());
        for (source, count) in self.pages_by_source() {
            let _ = writeln!(report, "{source} Selected: {count} pages");
        }
        let unavailable = self.unavailable_pages();
        if !unavailable.is_empty() {
            let listed = unavailable
                .iter()
                .map(u32::to_string)
                .collect::<Vec<String>>()
                .join(", ");
            let _ = writeln!(report, "Unavailable Pages: {listed}");
        }
        let _ = writeln!(report, "{page_rule}");
        report.push('\n');

        for record in &self.pages {
            let _ = writeln!(report, "{page_rule}");
            let _ = writeln!(report, "PAGE {} ({}):", record.page, record.source_label);
            let _ = writeln!(report, "{}", "-".repeat(HEADER_RULE_WIDTH));
            let _ = writeln!(report, "Selected Source: {}", record.source);
            let _ = writeln!(report, "Reason: {}", record.reason.describe());
            let _ = writeln!(report, "Confidence: {}", record.confidence);
            let _ = writeln!(report, "Characters: {}", record.char_count);
            let _ = writeln!(report, "Lines: {}", record.line_count);
            report.push('\n');
            let _ = writeln!(report, "TEXT CONTENT:");
            let _ = writeln!(report, "{}", "-".repeat(TEXT_RULE_WIDTH));
            let _ = writeln!(report, "{}", record.text);
            let _ = writeln!(report, "{page_rule}");
            report.push('\n');
        }

        report
    }
}

/// Walks decisions in ascending page order and pulls each page's text from
/// the selected source. A selected source without text is replaced by the
/// first other non-blank candidate and reported as a diagnostic.
pub fn assemble(name: &str, decisions: &Decisions, candidates: &PageCandidates) -> AssembledDocument {
    let primary = candidates.primary().unwrap_or_default().to_string();
    let mut pages = Vec::with_capacity(decisions.len());
    let mut diagnostics = Vec::new();

    for (page, decision) in decisions {
        let page = *page;
        let selection = match decision {
            PageDecision::Selected(selection) => selection,
            PageDecision::Unavailable { reason } => {
                diagnostics.push(PageDiagnostic::Unavailable {
                    page,
                    reason: reason.clone(),
                });
                continue;
            }
        };

        let selected_text = candidates
            .text_for(page, &selection.selected_source)
            .filter(|text| !text.trim().is_empty());

        let (source, text, recovered) = match selected_text {
            Some(text) => (selection.selected_source.clone(), text.to_string(), false),
            None => {
                let replacement = candidates.candidates(page).iter().find(|candidate| {
                    candidate.source != selection.selected_source && !candidate.is_blank()
                });
                let Some(replacement) = replacement else {
                    warn!(page, source = %selection.selected_source, "selected source has no text and no alternative exists");
                    diagnostics.push(PageDiagnostic::Unavailable {
                        page,
                        reason: UnavailableReason::NoContent,
                    });
                    continue;
                };
                warn!(
                    page,
                    expected = %selection.selected_source,
                    used = %replacement.source,
                    "selected source missing text; using alternative"
                );
                diagnostics.push(PageDiagnostic::SelectedSourceMissing {
                    page,
                    expected: selection.selected_source.clone(),
                    used: replacement.source.clone(),
                });
                (replacement.source.clone(), replacement.text.clone(), true)
            }
        };

        let role = if source == primary { "primary" } else { "secondary" };
        pages.push(PageRecord {
            page,
            source_label: format!("{source} ({role})"),
            char_count: text.chars().count(),
            line_count: text.lines().filter(|line| !line.trim().is_empty()).count(),
            source,
            reason: selection.reason.clone(),
            confidence: selection.confidence,
            recovered,
            text,
        });
    }

    AssembledDocument {
        name: name.to_string(),
        primary_source: primary,
        pages,
        diagnostics,
    }
}

/// Reads the canonical report layout back into page records. Each page's
/// text is taken by its `Characters:` count, so text containing rule lines
/// or header-like lines survives intact.
#[derive(Debug, Clone)]
pub struct ReportParser {
    page_header: Regex,
}

impl ReportParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            page_header: Regex::new(
                r"(?m)^PAGE (\d+) \((.*)\):\r?\n-{50}\r?\nSelected Source: (.*?)\r?\nReason: (.*?)\r?\nConfidence: (.*?)\r?\nCharacters: (\d+)\r?\nLines: \d+\r?\n\r?\nTEXT CONTENT:\r?\n-{30}\r?\n",
            )
            .context("failed to compile report page header regex")?,
        })
    }

    pub fn parse(&self, report: &str) -> Vec<PageRecord> {
        let page_rule = "=".repeat(PAGE_RULE_WIDTH);
        let mut pages = Vec::new();
        let mut cursor = 0;

        while let Some(captures) = self.page_header.captures_at(report, cursor) {
            let Some(header) = captures.get(0) else {
                break;
            };
            match read_page_block(&captures, &report[header.end()..], &page_rule) {
                Some((record, consumed)) => {
                    pages.push(record);
                    cursor = header.end() + consumed;
                }
                None => {
                    warn!(offset = header.start(), "skipping malformed report page block");
                    cursor = header.end();
                }
            }
        }

        pages.sort_by_key(|record| record.page);
        pages.dedup_by_key(|record| record.page);
        pages
    }
}

/// Builds one record from a matched header and the report text after it.
/// Returns the record and the number of bytes its text and closing rule use.
fn read_page_block(
    captures: &regex::Captures<'_>,
    rest: &str,
    page_rule: &str,
) -> Option<(PageRecord, usize)> {
    let page = captures.get(1)?.as_str().parse::<u32>().ok()?;
    let source_label = captures.get(2)?.as_str().to_string();
    let source = captures.get(3)?.as_str().trim().to_string();
    let reason = SelectionReason::from_description(captures.get(4)?.as_str());
    let confidence = Confidence::parse(captures.get(5)?.as_str())?;
    let char_count = captures.get(6)?.as_str().parse::<usize>().ok()?;

    let text_end = match rest.char_indices().nth(char_count) {
        Some((offset, _)) => offset,
        None if rest.chars().count() == char_count => rest.len(),
        None => return None,
    };
    let text = &rest[..text_end];
    let trailer = rest[text_end..]
        .strip_prefix("\r\n")
        .or_else(|| rest[text_end..].strip_prefix('\n'))?;
    if !trailer.starts_with(page_rule) {
        return None;
    }
    let consumed = rest.len() - trailer.len() + page_rule.len();

    Some((
        PageRecord {
            page,
            char_count,
            line_count: text.lines().filter(|line| !line.trim().is_empty()).count(),
            recovered: false,
            source_label,
            source,
            reason,
            confidence,
            text: text.to_string(),
        },
        consumed,
    ))
}
