use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub primary: bool,
    pub marker_style: String,
    pub page_count: usize,
    pub char_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSummary {
    pub source: String,
    pub intervals: String,
    pub magnitude_pages: Vec<u32>,
    pub keyword_pages: Vec<u32>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinePaths {
    pub output_dir: String,
    pub report_path: String,
    pub decisions_path: String,
    pub manifest_path: String,
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineCounts {
    pub pages_total: usize,
    pub pages_assembled: usize,
    pub pages_unavailable: usize,
    pub pages_recovered: usize,
    pub chars_total: usize,
    pub pages_by_source: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub document: String,
    pub primary_source: String,
    pub strategy: String,
    pub started_at: String,
    pub completed_at: String,
    pub sources: Vec<SourceEntry>,
    pub selection: Vec<SelectionSummary>,
    pub counts: CombineCounts,
    pub paths: CombinePaths,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub report_path: String,
    pub chunk_size: usize,
    pub page_count: usize,
    pub chunk_count: usize,
}
