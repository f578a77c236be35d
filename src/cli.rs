use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::pages::judge::{DEFAULT_JUDGE_TIMEOUT_MS, DEFAULT_PREVIEW_CHARS};
use crate::pages::window::DEFAULT_CHUNK_SIZE;

#[derive(Parser, Debug)]
#[command(
    name = "pagecombine",
    version,
    about = "Page reconciliation and selective combination for multi-source document extractions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Filter(FilterArgs),
    Combine(CombineArgs),
    Chunk(ChunkArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    #[arg(long)]
    pub input: PathBuf,

    /// Defaults to `<input stem>_filtered.txt` next to the input.
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub rules_path: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Strategy {
    Rule,
    Scored,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Scored => "scored",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CombineArgs {
    /// Raw extraction as `<name>=<path>`; repeat once per source.
    #[arg(long = "source", required = true)]
    pub sources: Vec<String>,

    #[arg(long)]
    pub primary: String,

    #[arg(long)]
    pub name: String,

    #[arg(long, default_value = ".cache/pagecombine")]
    pub output_dir: PathBuf,

    /// Restrict reconciliation to pages kept by the range selector.
    #[arg(long, default_value_t = false)]
    pub select: bool,

    #[arg(long)]
    pub rules_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Strategy::Rule)]
    pub strategy: Strategy,

    #[arg(long, default_value_t = 1)]
    pub max_concurrency: usize,

    #[arg(long, default_value_t = DEFAULT_JUDGE_TIMEOUT_MS)]
    pub judge_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_PREVIEW_CHARS)]
    pub preview_chars: usize,

    #[arg(long)]
    pub judge_model: Option<String>,

    #[arg(long)]
    pub judge_base_url: Option<String>,

    /// Falls back to `OPENAI_API_KEY`.
    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ChunkArgs {
    #[arg(long)]
    pub report: PathBuf,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Defaults to `<report stem>_chunks.json` next to the report.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/pagecombine/pagecombine_ledger.sqlite")]
    pub db_path: PathBuf,
}
