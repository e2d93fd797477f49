//! Google Gemini driver, using the Generative Language REST API directly.
//!
//! The request is a single `generateContent` call with the prompt text and the
//! image as `inlineData`. We keep the wire types private and minimal: we only
//! deserialize the fields we actually look at.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use reqwest::Client;

use crate::{
    prelude::*,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, retry_result_transient,
        try_fatal, try_potentially_transient,
    },
};

use super::{
    Driver, LlmOpts, LlmRetryResult, OcrRequest, OcrResponse, TokenUsage, require_text,
};

/// Default API endpoint.
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// Header used to pass our API key. We prefer this to a `?key=` query
/// parameter, so keys don't show up in logged URLs.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Finish reasons which mean the model refused to transcribe the image.
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
];

/// Our Gemini driver.
#[derive(Debug)]
pub struct GeminiDriver {
    /// Shared HTTP client.
    client: Client,

    /// API key.
    api_key: String,

    /// API base URL, without a trailing slash.
    api_base: String,
}

impl GeminiDriver {
    /// Create a new Gemini driver.
    pub fn new(api_key: String, api_base: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_owned(),
        })
    }

    /// The `generateContent` URL for `model`. Accepts both `gemini-2.0-flash`
    /// and `models/gemini-2.0-flash`.
    fn generate_content_url(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/v1beta/models/{}:generateContent", self.api_base, model)
    }
}

#[async_trait]
impl Driver for GeminiDriver {
    #[instrument(level = "debug", skip_all, fields(model = %request.model))]
    async fn ocr_image(
        &self,
        request: &OcrRequest<'_>,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<OcrResponse> {
        let url = self.generate_content_url(request.model);
        let body = GenerateContentRequest::new(request, llm_opts);

        // Send the request and read the whole body under a single timeout.
        let call = async {
            let response = self
                .client
                .post(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };
        let (status, response_body) =
            try_potentially_transient!(llm_opts.apply_timeout(call).await);

        if !status.is_success() {
            let error = anyhow!(
                "Gemini returned {}: {}",
                status,
                api_error_message(&response_body)
            );
            return if status.is_known_transient() {
                retry_result_transient(error)
            } else {
                retry_result_fatal(error)
            };
        }

        let response = try_fatal!(
            serde_json::from_str::<GenerateContentResponse>(&response_body)
                .with_context(|| format!(
                    "Error parsing Gemini response: {:?}",
                    truncate(&response_body)
                ))
        );
        let token_usage = response.token_usage();
        let text = try_fatal!(response.into_text());
        retry_result_ok(OcrResponse { text, token_usage })
    }
}

/// Extract a useful message from a Gemini error body.
fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ApiError {
                message,
                status: Some(status),
            },
        }) => format!("{status}: {message}"),
        Ok(ErrorEnvelope { error }) => error.message,
        Err(_) => truncate(body).to_owned(),
    }
}

/// Limit how much of an unexpected body we put in error messages.
fn truncate(body: &str) -> &str {
    const MAX_LEN: usize = 500;
    match body.char_indices().nth(MAX_LEN) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Body of a `generateContent` request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(request: &OcrRequest<'a>, llm_opts: &LlmOpts) -> Self {
        let generation_config =
            if llm_opts.temperature.is_some() || llm_opts.max_completion_tokens.is_some() {
                Some(GenerationConfig {
                    temperature: llm_opts.temperature,
                    max_output_tokens: llm_opts.max_completion_tokens,
                })
            } else {
                None
            };
        Self {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part {
                        text: Some(request.prompt),
                        inline_data: None,
                    },
                    Part {
                        text: None,
                        inline_data: Some(InlineData {
                            mime_type: &request.image.mime_type,
                            data: BASE64_STANDARD.encode(&request.image.data),
                        }),
                    },
                ],
            }],
            generation_config,
        }
    }
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Part<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

/// Body of a successful `generateContent` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    fn token_usage(&self) -> Option<TokenUsage> {
        self.usage_metadata.as_ref().map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
        })
    }

    /// Concatenate the text of the first candidate, or explain why we can't.
    fn into_text(self) -> Result<String> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(anyhow!("Gemini blocked the request: {reason}"));
        }
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No candidates in Gemini response"))?;
        match candidate.finish_reason.as_deref() {
            Some(reason) if BLOCKED_FINISH_REASONS.contains(&reason) => {
                return Err(anyhow!("Gemini stopped with finish reason {reason}"));
            }
            Some("MAX_TOKENS") => warn!("Gemini response was truncated at max tokens"),
            _ => {}
        }
        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    // Skip "thinking" output from reasoning models.
                    .filter(|part| !part.thought)
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        require_text(text)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    status: Option<String>,
}
