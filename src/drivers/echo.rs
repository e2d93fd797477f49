//! Echo driver for testing.
//!
//! This driver never touches the network. It "transcribes" every image as the
//! prompt text, which makes it handy for dry runs and for exercising the rest
//! of the pipeline in tests.

use crate::{prelude::*, retry::retry_result_ok};

use super::{Driver, LlmOpts, LlmRetryResult, OcrRequest, OcrResponse};

/// Echo driver for testing.
#[derive(Debug, Default)]
pub struct EchoDriver;

impl EchoDriver {
    /// Create a new echo driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for EchoDriver {
    async fn ocr_image(
        &self,
        request: &OcrRequest<'_>,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<OcrResponse> {
        debug!(bytes = request.image.data.len(), "Echoing prompt");
        retry_result_ok(OcrResponse {
            text: request.prompt.to_owned(),
            token_usage: None,
        })
    }
}
