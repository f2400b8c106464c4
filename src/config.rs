use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;

use crate::cli::{AdjacencyTieBreak, StoreArgs, VerifyArgs};
use crate::error::ConfigurationError;
use crate::judge::RetryPolicy;

const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub results_dir: PathBuf,
    pub model_name: String,
    pub strip_diacritics: bool,
    pub output_name: String,
}

impl StoreConfig {
    pub fn resolve(
        results_root: &Path,
        model_name: &str,
        strip_diacritics: bool,
        output_name: &str,
    ) -> Result<Self, ConfigurationError> {
        let model_name = model_name.trim();
        if model_name.is_empty() {
            return Err(ConfigurationError::InvalidSetting {
                name: "model",
                reason: "model name must not be empty".to_string(),
            });
        }

        let output_name = output_name.trim();
        if output_name.is_empty() || output_name.contains(['/', '\\']) || output_name == ".." {
            return Err(ConfigurationError::InvalidSetting {
                name: "output_name",
                reason: format!("'{output_name}' must be a plain file name"),
            });
        }

        let folder = format!(
            "{}_{}",
            model_slug(model_name),
            diacritic_setting(strip_diacritics)
        );

        Ok(Self {
            results_dir: results_root.join(folder),
            model_name: model_name.to_string(),
            strip_diacritics,
            output_name: output_name.to_string(),
        })
    }

    pub fn from_args(args: &StoreArgs) -> Result<Self, ConfigurationError> {
        Self::resolve(
            &args.results_root,
            &args.model,
            args.strip_diacritics,
            &args.output_name,
        )
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.results_dir.join("checkpoint.sqlite")
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.results_dir.join(&self.output_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeConfig {
    pub base_url: Url,
    pub model_name: String,
    pub temperature: f32,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub store: StoreConfig,
    pub judge: JudgeConfig,
    pub input_path: PathBuf,
    pub concurrency: usize,
    pub tie_break: AdjacencyTieBreak,
    pub prompt_template: Option<PathBuf>,
    pub limit: Option<usize>,
}

impl RunConfig {
    pub fn from_args(args: &VerifyArgs) -> Result<Self, ConfigurationError> {
        let store = StoreConfig::from_args(&args.store)?;

        let base_url = Url::parse(args.base_url.trim()).map_err(|err| {
            ConfigurationError::InvalidSetting {
                name: "base_url",
                reason: format!("'{}': {err}", args.base_url),
            }
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigurationError::InvalidSetting {
                name: "base_url",
                reason: format!("unsupported scheme '{}'", base_url.scheme()),
            });
        }

        if !args.temperature.is_finite() || !(0.0..=2.0).contains(&args.temperature) {
            return Err(ConfigurationError::InvalidSetting {
                name: "temperature",
                reason: format!("{} is outside 0.0..=2.0", args.temperature),
            });
        }

        if args.max_retries == 0 {
            return Err(ConfigurationError::InvalidSetting {
                name: "max_retries",
                reason: "at least one attempt is required".to_string(),
            });
        }

        if args.concurrency == 0 || args.concurrency > MAX_CONCURRENCY {
            return Err(ConfigurationError::InvalidSetting {
                name: "concurrency",
                reason: format!("{} is outside 1..={MAX_CONCURRENCY}", args.concurrency),
            });
        }

        if args.request_timeout_secs == 0 {
            return Err(ConfigurationError::InvalidSetting {
                name: "request_timeout_secs",
                reason: "timeout must be positive".to_string(),
            });
        }

        let judge = JudgeConfig {
            base_url,
            model_name: store.model_name.clone(),
            temperature: args.temperature,
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            retry: RetryPolicy {
                max_attempts: args.max_retries,
                initial_backoff: Duration::from_millis(args.backoff_ms),
                max_backoff: Duration::from_millis(args.max_backoff_ms.max(args.backoff_ms)),
            },
        };

        Ok(Self {
            store,
            judge,
            input_path: args.input.input.clone(),
            concurrency: args.concurrency,
            tie_break: args.input.tie_break,
            prompt_template: args.input.prompt_template.clone(),
            limit: args.input.limit,
        })
    }
}

pub fn model_slug(model_name: &str) -> String {
    model_name
        .trim()
        .chars()
        .map(|character| match character {
            ':' | '/' | '\\' | '-' | ' ' => '_',
            other => other,
        })
        .collect()
}

pub fn diacritic_setting(strip_diacritics: bool) -> &'static str {
    if strip_diacritics {
        "without_diacritics"
    } else {
        "with_diacritics"
    }
}
