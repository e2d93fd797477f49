//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateChatCompletionResponse, FinishReason},
};

use crate::{
    prelude::*,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient,
    },
};

use super::{
    Driver, LlmOpts, LlmRetryResult, OcrRequest, OcrResponse, TokenUsage, require_text,
};

/// Our OpenAI driver.
#[derive(Debug)]
pub struct OpenAiDriver {
    /// The OpenAI client.
    client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver, configured from `OPENAI_API_KEY` and
    /// `OPENAI_API_BASE`.
    pub fn new() -> Result<Self> {
        let mut client_config = OpenAIConfig::new();
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            client_config = client_config.with_api_key(api_key);
        }
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            client_config = client_config.with_api_base(api_base);
        }
        Ok(Self {
            client: Client::with_config(client_config),
        })
    }
}

/// Build a `/chat/completions` request body for `request`.
fn chat_request(request: &OcrRequest<'_>, llm_opts: &LlmOpts) -> Value {
    let mut req = json!({
        "model": request.model,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": request.prompt },
                { "type": "image_url", "image_url": { "url": request.image.to_data_url() } },
            ],
        }],
        // Ask OpenAI not to keep a copy of our documents.
        "store": false,
    });
    if let Some(max_completion_tokens) = llm_opts.max_completion_tokens {
        req["max_completion_tokens"] = json!(max_completion_tokens);
    }
    if let Some(temperature) = llm_opts.temperature {
        req["temperature"] = json!(temperature);
    }
    req
}

/// Pull the transcription out of a chat completion.
fn response_text(response: &CreateChatCompletionResponse) -> Result<String> {
    let choice = response
        .choices
        .first()
        .ok_or_else(|| anyhow!("No choices in OpenAI response"))?;
    if choice.finish_reason == Some(FinishReason::ContentFilter) {
        return Err(anyhow!(
            "Content filter triggered (may also be a RECITATION error for Gemini models)"
        ));
    }
    require_text(choice.message.content.clone().unwrap_or_default())
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = %request.model))]
    async fn ocr_image(
        &self,
        request: &OcrRequest<'_>,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<OcrResponse> {
        let req = chat_request(request, llm_opts);

        let chat = self.client.chat();
        let chat_result: Value =
            try_potentially_transient!(llm_opts.apply_timeout(chat.create_byot(req)).await);
        trace!(%chat_result, "OpenAI response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
        );

        let token_usage = response.usage.as_ref().map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });
        match response_text(&response) {
            Ok(text) => retry_result_ok(OcrResponse { text, token_usage }),
            Err(err) => retry_result_fatal(err),
        }
    }
}
