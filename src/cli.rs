use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "nassverify",
    version,
    about = "LLM-judged verification of Quran and Hadith candidate matches"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Verify(VerifyArgs),
    Status(StatusArgs),
    Export(ExportArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "RESULTS_ROOT", default_value = "results")]
    pub results_root: PathBuf,

    #[arg(long, env = "OLLAMA_MODEL", default_value = "gemma3:1b-it-fp16")]
    pub model: String,

    #[arg(
        long,
        env = "REMOVE_DIACRITICS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub strip_diacritics: bool,

    #[arg(long, env = "OUTPUT_FILE", default_value = "verification_results.json.gz")]
    pub output_name: String,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum AdjacencyTieBreak {
    #[default]
    MostRecent,
    Earliest,
}

impl AdjacencyTieBreak {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MostRecent => "most-recent",
            Self::Earliest => "earliest",
        }
    }
}

/// Everything that decides which verdicts a query's record depends on.
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    #[arg(long, env = "INPUT_FILE", default_value = "dataset/dev_top20_matches.json")]
    pub input: PathBuf,

    #[arg(long, value_enum, default_value_t = AdjacencyTieBreak::MostRecent)]
    pub tie_break: AdjacencyTieBreak,

    #[arg(long)]
    pub prompt_template: Option<PathBuf>,

    /// Only the first N queries of the input.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub input: InputArgs,

    #[arg(long, env = "OLLAMA_BASE_URL", default_value = "http://localhost:11434")]
    pub base_url: String,

    #[arg(long, env = "OLLAMA_TEMPERATURE", default_value_t = 0.0)]
    pub temperature: f32,

    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,

    #[arg(long, default_value_t = 8000)]
    pub max_backoff_ms: u64,

    #[arg(long, env = "CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub input: InputArgs,
}
