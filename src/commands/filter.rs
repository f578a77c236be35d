use anyhow::Result;
use tracing::{info, warn};

use crate::cli::FilterArgs;
use crate::pages::pipeline::render_intervals;
use crate::pages::{BoundaryParser, RangeSelector, SelectionRules, render_filtered};
use crate::util::{read_text, sibling_path, write_text};

pub fn run(args: FilterArgs) -> Result<()> {
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| sibling_path(&args.input, "_filtered.txt"));

    info!(input = %args.input.display(), "starting page filter");

    let raw_text = read_text(&args.input)?;
    let rules = SelectionRules::load_or_default(args.rules_path.as_deref())?;
    let parser = BoundaryParser::new()?;
    let selector = RangeSelector::new(rules)?;

    let index = parser.parse(&raw_text);
    let outcome = selector.select(&index, &raw_text);
    let filtered = render_filtered(&raw_text, &index, &outcome.intervals);

    if filtered.trim().is_empty() {
        warn!(input = %args.input.display(), "filter produced no pages");
    }
    write_text(&output_path, &filtered)?;

    let original_chars = raw_text.chars().count();
    let filtered_chars = filtered.chars().count();
    let reduction_pct = if original_chars == 0 {
        0.0
    } else {
        100.0 * (1.0 - filtered_chars as f64 / original_chars as f64)
    };

    info!(
        output = %output_path.display(),
        style = index.style().as_str(),
        total_pages = outcome.total_pages,
        magnitude_pages = outcome.magnitude_pages.len(),
        keyword_pages = outcome.keyword_pages.len(),
        intervals = %render_intervals(&outcome.intervals),
        fallback_used = outcome.fallback_used,
        original_chars,
        filtered_chars,
        reduction_pct = %format!("{reduction_pct:.1}"),
        "page filter completed"
    );

    Ok(())
}
