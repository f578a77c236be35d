use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::assemble::{AssembledDocument, assemble};
use super::boundary::{BoundaryParser, MarkerStyle, PageBoundaryIndex};
use super::judge::{PageJudge, ScoredOptions, reconcile_scored};
use super::reconcile::{Decisions, PageCandidates, ReconcileError, reconcile_by_rule};
use super::selection::{PageInterval, RangeSelector, SelectionOutcome};

/// Text produced by one extraction method for one physical document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSource {
    pub name: String,
    pub text: String,
}

impl RawSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub marker_style: MarkerStyle,
    pub page_count: usize,
    pub char_count: usize,
    pub selection: Option<SelectionOutcome>,
}

/// Parsed sources plus the per-page candidates ready for reconciliation.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub candidates: PageCandidates,
    pub summaries: Vec<SourceSummary>,
    pub kept_pages: Option<BTreeSet<u32>>,
}

#[derive(Debug, Clone)]
pub struct CombineOutcome {
    pub prepared: PreparedDocument,
    pub decisions: Decisions,
    pub document: AssembledDocument,
}

/// Parses every source, optionally restricts pages to those any source's
/// selection kept, and collects per-page candidates in preference order.
pub fn prepare(
    parser: &BoundaryParser,
    selector: Option<&RangeSelector>,
    sources: &[RawSource],
    primary: &str,
) -> Result<PreparedDocument, ReconcileError> {
    if sources.is_empty() {
        return Err(ReconcileError::NoSources);
    }
    if sources.iter().all(|source| source.text.trim().is_empty()) {
        return Err(ReconcileError::AllSourcesEmpty);
    }

    // Blank sources contribute no pages.
    let indexes = sources
        .iter()
        .map(|source| {
            if source.text.trim().is_empty() {
                PageBoundaryIndex::empty()
            } else {
                parser.parse(&source.text)
            }
        })
        .collect::<Vec<PageBoundaryIndex>>();

    let mut summaries = Vec::with_capacity(sources.len());
    let mut kept_pages = selector.map(|_| BTreeSet::<u32>::new());
    for (source, index) in sources.iter().zip(&indexes) {
        let selection = selector.map(|selector| selector.select(index, &source.text));
        if let (Some(kept), Some(selection)) = (kept_pages.as_mut(), selection.as_ref()) {
            kept.extend(selection.covered_pages());
        }

        info!(
            source = %source.name,
            style = index.style().as_str(),
            pages = index.len(),
            kept_intervals = ?selection.as_ref().map(|outcome| render_intervals(&outcome.intervals)),
            "indexed source"
        );
        summaries.push(SourceSummary {
            name: source.name.clone(),
            marker_style: index.style(),
            page_count: index.len(),
            char_count: source.text.chars().count(),
            selection,
        });
    }

    let indexed = sources
        .iter()
        .zip(&indexes)
        .map(|(source, index)| (source.name.clone(), source.text.as_str(), index))
        .collect::<Vec<(String, &str, &PageBoundaryIndex)>>();
    let mut candidates = PageCandidates::from_sources(&indexed, primary)?;
    if let Some(kept) = &kept_pages {
        candidates.retain_pages(kept);
    }

    Ok(PreparedDocument {
        candidates,
        summaries,
        kept_pages,
    })
}

pub fn combine_by_rule(
    name: &str,
    parser: &BoundaryParser,
    selector: Option<&RangeSelector>,
    sources: &[RawSource],
    primary: &str,
) -> Result<CombineOutcome, ReconcileError> {
    let prepared = prepare(parser, selector, sources, primary)?;
    let decisions = reconcile_by_rule(&prepared.candidates);
    Ok(finish(name, prepared, decisions))
}

#[allow(clippy::too_many_arguments)]
pub async fn combine_scored<F>(
    name: &str,
    parser: &BoundaryParser,
    selector: Option<&RangeSelector>,
    sources: &[RawSource],
    primary: &str,
    judge: Arc<dyn PageJudge>,
    options: ScoredOptions,
    cancel: F,
) -> Result<CombineOutcome, ReconcileError>
where
    F: Future<Output = ()>,
{
    let prepared = prepare(parser, selector, sources, primary)?;
    let decisions = reconcile_scored(judge, &prepared.candidates, options, cancel).await;
    Ok(finish(name, prepared, decisions))
}

fn finish(name: &str, prepared: PreparedDocument, decisions: Decisions) -> CombineOutcome {
    let document = assemble(name, &decisions, &prepared.candidates);
    let unavailable = document.unavailable_pages();
    if !unavailable.is_empty() {
        warn!(pages = ?unavailable, "document assembled with unavailable pages");
    }
    info!(
        document = %name,
        pages = document.pages.len(),
        chars = document.total_chars(),
        by_source = ?document.pages_by_source(),
        "document assembled"
    );

    CombineOutcome {
        prepared,
        decisions,
        document,
    }
}

pub fn render_intervals(intervals: &[PageInterval]) -> String {
    intervals
        .iter()
        .map(|interval| {
            if interval.first == interval.last {
                interval.first.to_string()
            } else {
                format!("{}-{}", interval.first, interval.last)
            }
        })
        .collect::<Vec<String>>()
        .join(",")
}
