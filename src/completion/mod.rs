//! Completion client - governed access to the language model
//!
//! Every attempt reserves a quota slot before going out, retries
//! included; slots are consumed whether the call succeeds or fails,
//! matching how the backend bills attempts.

mod gemini;

pub use gemini::GeminiBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::Error;
use crate::quota::QuotaGovernor;
use crate::Result;

/// Raw completion from the backend.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_used: Option<u32>,
}

/// Result of a governed completion call.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub latency_ms: u64,
}

/// Completion backend seam. Production talks to Gemini; tests script a fake.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Send one prompt and return the generated text.
    ///
    /// Failures must be classified: [`Error::BackendRejected`] for
    /// permanent 4xx-class problems, [`Error::BackendUnavailable`] for
    /// anything transient.
    async fn generate(&self, prompt: &str) -> Result<Completion>;

    /// Model identifier this backend targets.
    fn model(&self) -> &str;
}

/// Retry schedule for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given attempt; attempt 0 starts immediately.
    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self
            .base_delay_ms
            .saturating_mul(u64::from(self.multiplier).saturating_pow(attempt - 1));
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// Sends assembled payloads to the model under quota governance.
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    governor: Arc<QuotaGovernor>,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, governor: Arc<QuotaGovernor>) -> Self {
        Self {
            backend,
            governor,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send a payload to the model.
    ///
    /// Transient failures are retried with exponential backoff up to the
    /// policy's attempt count; every attempt consumes a fresh quota slot.
    /// A backend rejection (4xx) is surfaced immediately without retry,
    /// and a quota denial propagates with its retry hint.
    pub async fn complete(&self, payload: &str, identity: &str) -> Result<CompletionResult> {
        let started = tokio::time::Instant::now();
        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(delay).await;
            }

            self.governor.acquire(identity).await?;

            match self.backend.generate(payload).await {
                Ok(completion) => {
                    debug!(
                        model = self.backend.model(),
                        chars = completion.text.len(),
                        "completion succeeded"
                    );
                    return Ok(CompletionResult {
                        text: completion.text,
                        tokens_used: completion.tokens_used,
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(rejected @ Error::BackendRejected { .. }) => return Err(rejected),
                Err(e) => {
                    warn!(attempt, error = %e, "transient backend failure");
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::BackendUnavailable(format!(
            "giving up after {} attempts: {last_error}",
            self.retry.max_attempts
        )))
    }
}

/// Scripted backend for tests: pops one queued outcome per call and
/// records every prompt it saw.
#[cfg(test)]
pub struct FakeBackend {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Completion>>>,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl FakeBackend {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn ok(self, text: &str) -> Self {
        self.push(Ok(Completion {
            text: text.to_string(),
            tokens_used: Some(42),
        }))
    }

    pub fn transient(self, message: &str) -> Self {
        self.push(Err(Error::BackendUnavailable(message.to_string())))
    }

    pub fn rejected(self, status: u16, message: &str) -> Self {
        self.push(Err(Error::BackendRejected {
            status,
            message: message.to_string(),
        }))
    }

    fn push(self, outcome: Result<Completion>) -> Self {
        self.responses.lock().unwrap().push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl CompletionBackend for FakeBackend {
    async fn generate(&self, prompt: &str) -> Result<Completion> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::BackendUnavailable("no scripted response".to_string())))
    }

    fn model(&self) -> &str {
        "fake-model"
    }
}
