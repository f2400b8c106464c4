use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::JudgeConfig;
use crate::error::TransientJudgeError;
use crate::model::{Verdict, VerdictLabel};

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Sends one prompt to a language model and returns its raw text.
pub trait CompletionClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, TransientJudgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt that follows `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeState {
    Pending,
    AwaitingResponse {
        attempt: u32,
    },
    Retrying {
        attempt: u32,
        error: TransientJudgeError,
    },
    Parsed {
        attempt: u32,
        label: VerdictLabel,
        raw_response: String,
    },
    Exhausted {
        attempts: u32,
        error: TransientJudgeError,
    },
}

impl JudgeState {
    /// Terminal states become a verdict; any other state is handed back.
    pub fn into_verdict(self) -> Result<Verdict, Self> {
        match self {
            Self::Parsed {
                attempt,
                label,
                raw_response,
            } => Ok(Verdict {
                label,
                raw_response,
                attempt_count: attempt,
            }),
            Self::Exhausted { attempts, error } => Ok(Verdict {
                label: VerdictLabel::Uncertain,
                raw_response: format!("judge gave up after {attempts} attempts: {error}"),
                attempt_count: attempts,
            }),
            other => Err(other),
        }
    }
}

pub struct LlmJudge<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: CompletionClient> LlmJudge<C> {
    pub fn new(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    #[cfg(test)]
    pub(crate) fn client(&self) -> &C {
        &self.client
    }

    /// Never fails: transient errors are retried and then reported as `uncertain`.
    pub fn judge(&self, prompt: &str) -> Verdict {
        let mut state = JudgeState::Pending;
        loop {
            state = match self.step(state, prompt).into_verdict() {
                Ok(verdict) => return verdict,
                Err(next) => next,
            };
        }
    }

    pub fn step(&self, state: JudgeState, prompt: &str) -> JudgeState {
        let max_attempts = self.retry.max_attempts.max(1);

        match state {
            JudgeState::Pending => JudgeState::AwaitingResponse { attempt: 1 },
            JudgeState::AwaitingResponse { attempt } => match self.request(prompt) {
                Ok(raw_response) => {
                    let label = parse_verdict(&raw_response);
                    debug!(attempt, label = ?label, "judge response parsed");
                    JudgeState::Parsed {
                        attempt,
                        label,
                        raw_response,
                    }
                }
                Err(error) if attempt < max_attempts => JudgeState::Retrying { attempt, error },
                Err(error) => JudgeState::Exhausted {
                    attempts: attempt,
                    error,
                },
            },
            JudgeState::Retrying { attempt, error } => {
                let delay = self.retry.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient judge failure, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                JudgeState::AwaitingResponse {
                    attempt: attempt + 1,
                }
            }
            terminal @ (JudgeState::Parsed { .. } | JudgeState::Exhausted { .. }) => terminal,
        }
    }

    fn request(&self, prompt: &str) -> Result<String, TransientJudgeError> {
        let text = self.client.complete(prompt)?;
        if text.trim().is_empty() {
            return Err(TransientJudgeError::Empty);
        }
        Ok(text)
    }
}

/// Strict marker check: the answer must be exactly `true` or `false`.
pub fn parse_verdict(raw_response: &str) -> VerdictLabel {
    let mut answer = raw_response.trim();
    if answer.len() >= 7 && answer.is_char_boundary(7) && answer[..7].eq_ignore_ascii_case("answer:")
    {
        answer = answer[7..].trim_start();
    }

    let answer = answer
        .trim_matches(|character: char| {
            character.is_whitespace() || matches!(character, '"' | '\'' | '`' | '*' | '.' | '!')
        })
        .to_ascii_lowercase();

    match answer.as_str() {
        "true" => VerdictLabel::Match,
        "false" => VerdictLabel::NoMatch,
        _ => VerdictLabel::Uncertain,
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaClient {
    http: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(config: &JudgeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build http client for llm service")?;
        let endpoint = config
            .base_url
            .join("api/generate")
            .with_context(|| format!("invalid llm base url: {}", config.base_url))?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            model: config.model_name.clone(),
            temperature: config.temperature,
        })
    }
}

impl CompletionClient for OllamaClient {
    fn complete(&self, prompt: &str) -> Result<String, TransientJudgeError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(TransientJudgeError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let body = response
            .json::<GenerateResponse>()
            .map_err(|err| TransientJudgeError::Malformed(err.to_string()))?;
        Ok(body.response)
    }
}

fn classify_request_error(err: reqwest::Error) -> TransientJudgeError {
    if err.is_timeout() {
        TransientJudgeError::Timeout(err.to_string())
    } else {
        TransientJudgeError::Connection(err.to_string())
    }
}
