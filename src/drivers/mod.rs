//! OCR drivers.
//!
//! Each driver knows how to send one image and a prompt to a specific kind of
//! API, and how to tell transient failures from fatal ones. Retries, rate
//! limits and concurrency are handled by the caller, so drivers stay simple.

use std::{error, fmt, ops::AddAssign, pin::Pin, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use tokio::time;

use crate::{
    image_payload::ImagePayload, prelude::*, rate_limit::RateLimit,
    retry::IsKnownTransient,
};

pub mod echo;
pub mod gemini;
pub mod openai;

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// Google Gemini, via the Generative Language REST API.
    #[default]
    Gemini,

    /// OpenAI-compatible `/chat/completions` (OpenAI, LiteLLM, Ollama, etc).
    #[clap(name = "openai")]
    OpenAI,

    /// Return the prompt instead of calling a model. Useful for testing.
    Echo,
}

impl DriverType {
    /// Does this driver need `GEMINI_API_KEY` (or `--api-key`)?
    pub fn requires_api_key(self) -> bool {
        matches!(self, DriverType::Gemini)
    }

    /// Does this driver need a model name?
    pub fn requires_model(self) -> bool {
        !matches!(self, DriverType::Echo)
    }

    /// Instantiate an appropriate driver.
    pub fn create_driver(&self, settings: &DriverSettings) -> Result<Arc<dyn Driver>> {
        match self {
            DriverType::Gemini => {
                let api_key = settings.api_key.clone().ok_or_else(|| {
                    anyhow!("The gemini driver needs an API key (GEMINI_API_KEY)")
                })?;
                Ok(Arc::new(gemini::GeminiDriver::new(
                    api_key,
                    settings.api_base.clone(),
                )?))
            }
            DriverType::OpenAI => Ok(Arc::new(openai::OpenAiDriver::new()?)),
            DriverType::Echo => Ok(Arc::new(echo::EchoDriver::new())),
        }
    }
}

/// Connection settings needed to construct a driver.
#[derive(Clone)]
pub struct DriverSettings {
    /// API key, for drivers that take one directly.
    pub api_key: Option<String>,

    /// Base URL of the API.
    pub api_base: String,
}

// Never print API keys, even in debug logs.
impl fmt::Debug for DriverSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Options controlling each model request.
#[derive(Args, Clone, Debug, Default)]
pub struct LlmOpts {
    /// An upper limit on the number of completion tokens to generate. This may
    /// help prevent runaway responses, but it may also truncate long pages.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling. Lower values make transcription
    /// more literal. Defaults to the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// A timeout, in seconds, for the model to return a complete response.
    /// Timed out requests are retried.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A rate limit for API requests, of the form "10/s" or "2000/m". This is
    /// applied separately from `--jobs`, and counts retries.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,
}

impl LlmOpts {
    /// Apply our timeout, if any, to a future.
    ///
    /// `future` may borrow data it doesn't own, so we carry its lifetime
    /// `'fut` through to the boxed result.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        if let Some(timeout) = self.timeout {
            time::timeout(Duration::from_secs(timeout), future)
                // Flatten `Result<Result<T, LlmError<E>>, Elapsed>`.
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout),
                })
                .boxed()
        } else {
            future.boxed()
        }
    }
}

/// A single OCR request.
#[derive(Debug, Clone, Copy)]
pub struct OcrRequest<'a> {
    /// The model to use.
    pub model: &'a str,

    /// The instructions to send along with the image.
    pub prompt: &'a str,

    /// The image itself.
    pub image: &'a ImagePayload,
}

/// What the model sent back.
#[derive(Debug, Clone)]
pub struct OcrResponse {
    /// The extracted text.
    pub text: String,

    /// Token usage, if the API reported it.
    pub token_usage: Option<TokenUsage>,
}

/// A [`RetryResult`] for OCR requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for OCR drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Extract the text from one image. This makes exactly one attempt.
    async fn ocr_image(
        &self,
        request: &OcrRequest<'_>,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<OcrResponse>;
}

/// Token usage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt (including the image)?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Reject a model response that contains no text.
pub(crate) fn require_text(text: String) -> Result<String> {
    if text.trim().is_empty() {
        Err(anyhow!("Model returned no text"))
    } else {
        Ok(text)
    }
}

/// An error which occurred while calling an API.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway responses and overloaded servers often do better on a
            // second try.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "API error: {err}"),
            LlmError::Timeout => write!(f, "API request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}
