use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::{CombineArgs, Strategy};
use crate::commands::ledger::{open_ledger, record_run};
use crate::model::{
    CombineCounts, CombinePaths, CombineRunManifest, SelectionSummary, SourceEntry,
};
use crate::pages::pipeline::render_intervals;
use crate::pages::{
    BoundaryParser, CombineOutcome, OpenAiJudge, PageDiagnostic, RangeSelector, RawSource,
    ScoredOptions, SelectionRules, combine_by_rule, combine_scored,
};
use crate::util::{
    ensure_directory, now_utc_string, read_text, sha256_file, utc_compact_string,
    write_json_pretty, write_text,
};

const MANIFEST_VERSION: u32 = 1;
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceArg {
    name: String,
    path: PathBuf,
}

#[derive(Debug, Clone)]
struct LoadedSource {
    path: PathBuf,
    sha256: String,
}

pub fn run(args: CombineArgs) -> Result<()> {
    validate_document_name(&args.name)?;

    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let stamp = utc_compact_string(started_ts);
    let run_id = format!("combine-{}-{stamp}", args.name);

    let source_args = args
        .sources
        .iter()
        .map(|value| parse_source_arg(value))
        .collect::<Result<Vec<SourceArg>>>()?;
    if source_args.is_empty() {
        bail!("at least one --source <name>=<path> is required");
    }

    let mut raw_sources = Vec::with_capacity(source_args.len());
    let mut loaded = Vec::with_capacity(source_args.len());
    for source in &source_args {
        let text = read_text(&source.path)?;
        if text.trim().is_empty() {
            warn!(source = %source.name, path = %source.path.display(), "source is empty");
        }
        loaded.push(LoadedSource {
            path: source.path.clone(),
            sha256: sha256_file(&source.path)?,
        });
        raw_sources.push(RawSource::new(source.name.clone(), text));
    }

    let parser = BoundaryParser::new()?;
    let selector = if args.select {
        let rules = SelectionRules::load_or_default(args.rules_path.as_deref())?;
        Some(RangeSelector::new(rules)?)
    } else {
        if args.rules_path.is_some() {
            warn!("--rules-path has no effect without --select");
        }
        None
    };

    info!(
        run_id = %run_id,
        document = %args.name,
        primary = %args.primary,
        sources = raw_sources.len(),
        strategy = args.strategy.as_str(),
        select = args.select,
        "starting combine"
    );

    let outcome = match args.strategy {
        Strategy::Rule => combine_by_rule(
            &args.name,
            &parser,
            selector.as_ref(),
            &raw_sources,
            &args.primary,
        )
        .context("failed to reconcile sources")?,
        Strategy::Scored => combine_with_judge(&args, &parser, selector.as_ref(), &raw_sources)?,
    };

    ensure_directory(&args.output_dir)?;
    let paths = CombinePaths {
        output_dir: args.output_dir.display().to_string(),
        report_path: path_string(&args.output_dir.join(format!("{}_combined.txt", args.name))),
        decisions_path: path_string(&args.output_dir.join(format!("{}_decisions.json", args.name))),
        manifest_path: path_string(
            &args
                .output_dir
                .join(format!("{}_combine_run_{stamp}.json", args.name)),
        ),
        db_path: args.db_path.as_deref().map(path_string),
    };

    write_text(Path::new(&paths.report_path), &outcome.document.render_report())?;
    write_json_pretty(Path::new(&paths.decisions_path), &outcome.decisions)?;

    let manifest = build_manifest(
        &run_id,
        args.strategy,
        started_at,
        &loaded,
        &outcome,
        paths,
    );
    write_json_pretty(Path::new(&manifest.paths.manifest_path), &manifest)?;

    if let Some(db_path) = &args.db_path {
        let mut connection = open_ledger(db_path)?;
        let recorded = record_run(&mut connection, &manifest, &outcome.decisions)
            .with_context(|| format!("failed to record run in {}", db_path.display()))?;
        info!(path = %db_path.display(), decisions = recorded, "recorded run in ledger");
    }

    info!(
        run_id = %run_id,
        report = %manifest.paths.report_path,
        pages = manifest.counts.pages_assembled,
        unavailable = manifest.counts.pages_unavailable,
        recovered = manifest.counts.pages_recovered,
        chars = manifest.counts.chars_total,
        warnings = manifest.warnings.len(),
        "combine completed"
    );

    Ok(())
}

fn combine_with_judge(
    args: &CombineArgs,
    parser: &BoundaryParser,
    selector: Option<&RangeSelector>,
    sources: &[RawSource],
) -> Result<CombineOutcome> {
    let Some(api_key) = resolve_api_key(args.api_key.as_deref(), std::env::var(API_KEY_ENV).ok())
    else {
        bail!("the scored strategy needs an API key (--api-key or {API_KEY_ENV})");
    };

    let timeout = Duration::from_millis(args.judge_timeout_ms);
    let judge = OpenAiJudge::new(
        api_key,
        args.judge_base_url.clone(),
        args.judge_model.clone(),
        timeout,
    )?;
    let options = ScoredOptions {
        max_concurrency: args.max_concurrency.max(1),
        timeout,
        preview_chars: args.preview_chars,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime
        .block_on(combine_scored(
            &args.name,
            parser,
            selector,
            sources,
            &args.primary,
            Arc::new(judge),
            options,
            interrupted(),
        ))
        .context("failed to reconcile sources")
}

async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("received Ctrl+C; abandoning outstanding judgements"),
        Err(err) => {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

/// The document name becomes part of output file names, so it must stay a
/// single path component.
fn validate_document_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("--name must not be empty");
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        bail!("invalid --name '{name}': path separators and relative components are not allowed");
    }
    Ok(())
}

fn resolve_api_key(explicit: Option<&str>, from_env: Option<String>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or(from_env)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

fn parse_source_arg(value: &str) -> Result<SourceArg> {
    let Some((name, path)) = value.split_once('=') else {
        bail!("invalid --source '{value}': expected <name>=<path>");
    };
    let name = name.trim();
    let path = path.trim();
    if name.is_empty() || path.is_empty() {
        bail!("invalid --source '{value}': name and path must both be non-empty");
    }

    Ok(SourceArg {
        name: name.to_string(),
        path: PathBuf::from(path),
    })
}

fn build_manifest(
    run_id: &str,
    strategy: Strategy,
    started_at: String,
    loaded: &[LoadedSource],
    outcome: &CombineOutcome,
    paths: CombinePaths,
) -> CombineRunManifest {
    let document = &outcome.document;
    let primary = document.primary_source.clone();

    let sources = outcome
        .prepared
        .summaries
        .iter()
        .zip(loaded)
        .map(|(summary, source)| SourceEntry {
            name: summary.name.clone(),
            path: path_string(&source.path),
            sha256: source.sha256.clone(),
            primary: summary.name == primary,
            marker_style: summary.marker_style.as_str().to_string(),
            page_count: summary.page_count,
            char_count: summary.char_count,
        })
        .collect::<Vec<SourceEntry>>();

    let mut warnings = Vec::new();
    let mut selection = Vec::new();
    for summary in &outcome.prepared.summaries {
        let Some(outcome) = &summary.selection else {
            continue;
        };
        if outcome.fallback_used {
            warnings.push(format!(
                "{}: no page matched the selection rules; kept leading pages",
                summary.name
            ));
        }
        selection.push(SelectionSummary {
            source: summary.name.clone(),
            intervals: render_intervals(&outcome.intervals),
            magnitude_pages: outcome.magnitude_pages.clone(),
            keyword_pages: outcome.keyword_pages.clone(),
            fallback_used: outcome.fallback_used,
        });
    }

    for diagnostic in &document.diagnostics {
        warnings.push(match diagnostic {
            PageDiagnostic::Unavailable { page, reason } => {
                format!("page {page} unavailable: {reason}")
            }
            PageDiagnostic::SelectedSourceMissing {
                page,
                expected,
                used,
            } => format!("page {page}: {expected} had no text; used {used}"),
        });
    }

    CombineRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: run_id.to_string(),
        document: document.name.clone(),
        primary_source: primary,
        strategy: strategy.as_str().to_string(),
        started_at,
        completed_at: now_utc_string(),
        sources,
        selection,
        counts: CombineCounts {
            pages_total: outcome.decisions.len(),
            pages_assembled: document.pages.len(),
            pages_unavailable: document.unavailable_pages().len(),
            pages_recovered: document.pages.iter().filter(|record| record.recovered).count(),
            chars_total: document.total_chars(),
            pages_by_source: document.pages_by_source(),
        },
        paths,
        warnings,
    }
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}
