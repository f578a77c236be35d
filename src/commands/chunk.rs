use anyhow::{Result, bail};
use serde::Serialize;
use tracing::info;

use crate::cli::ChunkArgs;
use crate::model::ChunkManifest;
use crate::pages::{Chunk, ReportParser, window};
use crate::util::{now_utc_string, read_text, sibling_path, write_json_pretty};

#[derive(Debug, Serialize)]
struct ChunkOutput<'a> {
    #[serde(flatten)]
    manifest: ChunkManifest,
    chunks: &'a [Chunk],
}

pub fn run(args: ChunkArgs) -> Result<()> {
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| sibling_path(&args.report, "_chunks.json"));

    let report = read_text(&args.report)?;
    let records = ReportParser::new()?.parse(&report);
    if records.is_empty() {
        bail!("no page blocks found in report: {}", args.report.display());
    }

    let chunks = window(&records, args.chunk_size);
    let output = ChunkOutput {
        manifest: ChunkManifest {
            manifest_version: 1,
            generated_at: now_utc_string(),
            report_path: args.report.display().to_string(),
            chunk_size: args.chunk_size.max(1),
            page_count: records.len(),
            chunk_count: chunks.len(),
        },
        chunks: &chunks,
    };
    write_json_pretty(&output_path, &output)?;

    info!(
        report = %args.report.display(),
        output = %output_path.display(),
        pages = records.len(),
        chunks = chunks.len(),
        chunk_size = args.chunk_size.max(1),
        "chunking completed"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;

    use super::*;
    use crate::pages::{BoundaryParser, RawSource, combine_by_rule};
    use crate::util::{scratch_dir, write_text};

    fn report_with_pages(bodies: &[(u32, &str)]) -> String {
        let rule = "=".repeat(80);
        let raw = bodies
            .iter()
            .map(|(page, body)| format!("{rule}\nPAGE {page}\n{rule}\n{body}\n"))
            .collect::<String>();
        let parser = BoundaryParser::new().expect("parser");
        combine_by_rule("policy", &parser, None, &[RawSource::new("ocr", raw)], "ocr")
            .expect("combine")
            .document
            .render_report()
    }

    #[test]
    fn chunk_writes_windows_with_whole_page_text() {
        let dir = scratch_dir("chunk");
        let report_path = dir.join("policy_combined.txt");
        let separator = "=".repeat(80);
        let page_two = format!("before rule\n{separator}\nafter rule");
        write_text(
            &report_path,
            &report_with_pages(&[
                (1, "one"),
                (2, page_two.as_str()),
                (3, "three"),
                (4, "four"),
                (5, "five"),
            ]),
        )
        .expect("write report");

        run(ChunkArgs {
            report: report_path.clone(),
            chunk_size: 4,
            output: None,
        })
        .expect("chunk run");

        let raw = fs::read(dir.join("policy_combined_chunks.json")).expect("chunk json");
        let output: Value = serde_json::from_slice(&raw).expect("valid json");
        assert_eq!(output["page_count"], 5);
        assert_eq!(output["chunk_count"], 2);

        let chunks = output["chunks"].as_array().expect("chunks array");
        assert_eq!(chunks[0]["page_numbers"], serde_json::json!([1, 2, 3, 4]));
        assert_eq!(chunks[1]["page_numbers"], serde_json::json!([5]));
        let first_text = chunks[0]["text"].as_str().expect("chunk text");
        assert!(first_text.contains("after rule"));
        assert!(first_text.contains("=== PAGE 3 (ocr) ==="));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn report_without_page_blocks_is_rejected() {
        let dir = scratch_dir("chunk-empty");
        let report_path = dir.join("empty.txt");
        write_text(&report_path, "COMBINED PAGE EXTRACTION - nothing\n").expect("write report");
        let output = dir.join("chunks.json");

        let result = run(ChunkArgs {
            report: report_path,
            chunk_size: 4,
            output: Some(output.clone()),
        });

        assert!(result.is_err());
        assert!(!output.exists());

        fs::remove_dir_all(&dir).ok();
    }
}
