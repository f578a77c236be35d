use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::boundary::PageBoundaryIndex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("no raw sources were supplied")]
    NoSources,

    #[error("every supplied source is empty")]
    AllSourcesEmpty,

    #[error("primary source '{0}' is not among the supplied sources")]
    UnknownPrimary(String),

    #[error("source name '{0}' was supplied more than once")]
    DuplicateSource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionReason {
    /// Exactly one source carried the page.
    OnlyAvailableSource,
    /// The primary source had text; the others were not compared.
    PrimaryPreferred,
    /// The primary source was blank or missing.
    Fallback,
    /// An external judge compared the candidates.
    Judged { explanation: String },
}

impl SelectionReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OnlyAvailableSource => "only-available-source",
            Self::PrimaryPreferred => "fallback-preferred",
            Self::Fallback => "fallback",
            Self::Judged { .. } => "judged",
        }
    }

    /// Text written to the `Reason:` line of the canonical report.
    pub fn describe(&self) -> String {
        match self {
            Self::Judged { explanation } if !explanation.trim().is_empty() => {
                explanation.trim().replace('\n', " ")
            }
            other => other.label().to_string(),
        }
    }

    /// Inverse of [`describe`](Self::describe); free text is read back as a judge explanation.
    pub fn from_description(text: &str) -> Self {
        match text.trim() {
            "only-available-source" => Self::OnlyAvailableSource,
            "fallback-preferred" => Self::PrimaryPreferred,
            "fallback" => Self::Fallback,
            other => Self::Judged {
                explanation: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionDecision {
    pub selected_source: String,
    pub reason: SelectionReason,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnavailableReason {
    NoContent,
    JudgeTimeout,
    JudgeMalformed(String),
    JudgeFailed(String),
    Cancelled,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoContent => f.write_str("no content available"),
            Self::JudgeTimeout => f.write_str("judge timed out"),
            Self::JudgeMalformed(detail) => write!(f, "judge response malformed: {detail}"),
            Self::JudgeFailed(detail) => write!(f, "judge call failed: {detail}"),
            Self::Cancelled => f.write_str("cancelled before judgement"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageDecision {
    Selected(SelectionDecision),
    Unavailable { reason: UnavailableReason },
}

impl PageDecision {
    pub fn unavailable(reason: UnavailableReason) -> Self {
        Self::Unavailable { reason }
    }

    pub fn selected(&self) -> Option<&SelectionDecision> {
        match self {
            Self::Selected(decision) => Some(decision),
            Self::Unavailable { .. } => None,
        }
    }
}

pub type Decisions = BTreeMap<u32, PageDecision>;

/// One source's text for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub source: String,
    pub text: String,
}

impl Candidate {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Per-page candidate texts for a single document, with the sources in
/// preference order (primary first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCandidates {
    sources: Vec<String>,
    pages: BTreeMap<u32, Vec<Candidate>>,
}

impl PageCandidates {
    /// Builds candidates from already-indexed sources. `sources` pairs each
    /// source name with its raw text and boundary index.
    pub fn from_sources(
        sources: &[(String, &str, &PageBoundaryIndex)],
        primary: &str,
    ) -> Result<Self, ReconcileError> {
        if sources.is_empty() {
            return Err(ReconcileError::NoSources);
        }

        let mut seen = BTreeSet::new();
        for (name, _, _) in sources {
            if !seen.insert(name.as_str()) {
                return Err(ReconcileError::DuplicateSource(name.clone()));
            }
        }

        let Some(primary_position) = sources.iter().position(|(name, _, _)| name == primary) else {
            return Err(ReconcileError::UnknownPrimary(primary.to_string()));
        };

        let mut ordered = Vec::with_capacity(sources.len());
        ordered.push(&sources[primary_position]);
        ordered.extend(
            sources
                .iter()
                .enumerate()
                .filter(|(position, _)| *position != primary_position)
                .map(|(_, source)| source),
        );

        let mut pages = BTreeMap::<u32, Vec<Candidate>>::new();
        for (name, raw_text, index) in &ordered {
            for (page, text) in index.page_texts(raw_text) {
                pages.entry(page).or_default().push(Candidate {
                    source: name.clone(),
                    text,
                });
            }
        }

        Ok(Self {
            sources: ordered.iter().map(|(name, _, _)| name.clone()).collect(),
            pages,
        })
    }

    pub fn from_pages(sources: Vec<String>, pages: BTreeMap<u32, Vec<Candidate>>) -> Self {
        Self { sources, pages }
    }

    pub fn primary(&self) -> Option<&str> {
        self.sources.first().map(String::as_str)
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn page_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.keys().copied()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn candidates(&self, page: u32) -> &[Candidate] {
        self.pages.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn text_for(&self, page: u32, source: &str) -> Option<&str> {
        self.candidates(page)
            .iter()
            .find(|candidate| candidate.source == source)
            .map(|candidate| candidate.text.as_str())
    }

    /// Drops every page outside `keep`.
    pub fn retain_pages(&mut self, keep: &BTreeSet<u32>) {
        self.pages.retain(|page, _| keep.contains(page));
    }
}

/// Deterministic primary-first selection for one page. The primary source
/// always wins when it has any text at all; quality is never compared.
pub fn decide_by_rule(primary: &str, candidates: &[Candidate]) -> PageDecision {
    if let [only] = candidates {
        if !only.is_blank() {
            return PageDecision::Selected(SelectionDecision {
                selected_source: only.source.clone(),
                reason: SelectionReason::OnlyAvailableSource,
                confidence: Confidence::High,
            });
        }
    }

    if candidates
        .iter()
        .any(|candidate| candidate.source == primary && !candidate.is_blank())
    {
        return PageDecision::Selected(SelectionDecision {
            selected_source: primary.to_string(),
            reason: SelectionReason::PrimaryPreferred,
            confidence: Confidence::High,
        });
    }

    match candidates
        .iter()
        .find(|candidate| candidate.source != primary && !candidate.is_blank())
    {
        Some(secondary) => PageDecision::Selected(SelectionDecision {
            selected_source: secondary.source.clone(),
            reason: SelectionReason::Fallback,
            confidence: Confidence::Medium,
        }),
        None => PageDecision::unavailable(UnavailableReason::NoContent),
    }
}

pub fn reconcile_by_rule(candidates: &PageCandidates) -> Decisions {
    let primary = candidates.primary().unwrap_or_default();
    let mut decisions = Decisions::new();

    for page in candidates.page_numbers() {
        let decision = decide_by_rule(primary, candidates.candidates(page));
        match &decision {
            PageDecision::Selected(selected) => debug!(
                page,
                source = %selected.selected_source,
                reason = selected.reason.label(),
                "page source selected"
            ),
            PageDecision::Unavailable { reason } => {
                warn!(page, reason = %reason, "no usable text for page")
            }
        }
        decisions.insert(page, decision);
    }

    decisions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(source: &str, text: &str) -> Candidate {
        Candidate {
            source: source.to_string(),
            text: text.to_string(),
        }
    }

    fn selected(decision: &PageDecision) -> &SelectionDecision {
        decision.selected().expect("page should have a selection")
    }

    #[test]
    fn primary_wins_even_when_secondary_is_blank() {
        let decision = decide_by_rule("ocr", &[candidate("ocr", "OCR-TEXT"), candidate("text", "")]);
        let decision = selected(&decision);

        assert_eq!(decision.selected_source, "ocr");
        assert_eq!(decision.reason.label(), "fallback-preferred");
        assert_eq!(decision.confidence, Confidence::High);
    }

    #[test]
    fn primary_wins_over_clean_secondary_without_comparison() {
        let decision = decide_by_rule(
            "ocr",
            &[
                candidate("ocr", "#@! garbled 0cr"),
                candidate("text", "Clean policy declarations"),
            ],
        );
        assert_eq!(selected(&decision).selected_source, "ocr");
    }

    #[test]
    fn blank_primary_falls_back_with_medium_confidence() {
        let decision = decide_by_rule("ocr", &[candidate("ocr", "  \n "), candidate("text", "layer")]);
        let decision = selected(&decision);

        assert_eq!(decision.selected_source, "text");
        assert_eq!(decision.reason, SelectionReason::Fallback);
        assert_eq!(decision.confidence, Confidence::Medium);
    }

    #[test]
    fn page_in_one_source_is_only_available() {
        let decision = decide_by_rule("ocr", &[candidate("text", "only here")]);
        let decision = selected(&decision);

        assert_eq!(decision.selected_source, "text");
        assert_eq!(decision.reason.label(), "only-available-source");
        assert_eq!(decision.confidence, Confidence::High);
    }

    #[test]
    fn all_blank_is_explicitly_unavailable() {
        let decision = decide_by_rule("ocr", &[candidate("ocr", ""), candidate("text", " ")]);
        assert_eq!(
            decision,
            PageDecision::unavailable(UnavailableReason::NoContent)
        );
        assert_eq!(
            decide_by_rule("ocr", &[candidate("ocr", "")]),
            PageDecision::unavailable(UnavailableReason::NoContent)
        );
    }

    #[test]
    fn reason_descriptions_round_trip_through_labels() {
        for reason in [
            SelectionReason::OnlyAvailableSource,
            SelectionReason::PrimaryPreferred,
            SelectionReason::Fallback,
        ] {
            assert_eq!(SelectionReason::from_description(&reason.describe()), reason);
        }
        assert_eq!(
            SelectionReason::from_description("OCR keeps the account number"),
            SelectionReason::Judged {
                explanation: "OCR keeps the account number".to_string()
            }
        );
    }

    #[test]
    fn candidates_require_known_primary_and_unique_names() {
        let index = crate::pages::boundary::BoundaryParser::new()
            .expect("parser")
            .parse("text");

        assert_eq!(
            PageCandidates::from_sources(&[], "ocr"),
            Err(ReconcileError::NoSources)
        );
        assert_eq!(
            PageCandidates::from_sources(&[("text".to_string(), "text", &index)], "ocr"),
            Err(ReconcileError::UnknownPrimary("ocr".to_string()))
        );
        assert_eq!(
            PageCandidates::from_sources(
                &[
                    ("ocr".to_string(), "a", &index),
                    ("ocr".to_string(), "b", &index)
                ],
                "ocr"
            ),
            Err(ReconcileError::DuplicateSource("ocr".to_string()))
        );
    }
}
