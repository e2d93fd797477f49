//! OCR one image at a time: load, ask the model, write the result.
//!
//! Every image produces exactly one [`WorkOutput`], whether it succeeds, is
//! skipped or fails. Nothing in here aborts the run.

use std::{iter, sync::Arc, time::Instant};

use futures::FutureExt as _;
use keen_retry::{ExponentialJitter, ResolvedResult};
use leaky_bucket::RateLimiter;

use crate::{
    async_utils::JoinWorker,
    config::OcrConfig,
    drivers::{Driver, LlmOpts, LlmRetryResult, OcrRequest, OcrResponse},
    image_payload::load_image_payload,
    output::write_ocr_result,
    prelude::*,
    queues::work::{WorkFn, WorkOutput, WorkQueue, WorkStatus},
    walk::{ImageFile, WalkItem},
};

/// Per-image output data.
#[derive(Clone, Debug, Default, Serialize)]
pub struct OcrOutput {
    /// Where we wrote (or would have written) the OCR text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

/// Shared state for processing images.
pub struct OcrState {
    /// The driver to use.
    driver: Arc<dyn Driver>,

    /// The model to use.
    model: String,

    /// The prompt to send with each image.
    prompt: String,

    /// Per-request options.
    llm_opts: LlmOpts,

    /// Our rate limiter, if any.
    rate_limiter: Option<RateLimiter>,

    /// Skip images which already have output.
    skip_existing: bool,
}

impl OcrState {
    /// Build our state from our config and driver.
    pub fn new(config: &OcrConfig, driver: Arc<dyn Driver>) -> Self {
        let rate_limiter = config
            .llm_opts
            .rate_limit
            .as_ref()
            .map(|rate_limit| rate_limit.to_rate_limiter());
        Self {
            driver,
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            llm_opts: config.llm_opts.clone(),
            rate_limiter,
            skip_existing: config.skip_existing,
        }
    }
}

/// Create a work queue that OCRs images, running up to `job_count` at once.
pub fn create_ocr_work_queue(
    state: Arc<OcrState>,
    job_count: usize,
) -> Result<(WorkQueue<WalkItem, WorkOutput<OcrOutput>>, JoinWorker)> {
    let work_fn: WorkFn<WalkItem, WorkOutput<OcrOutput>> = Arc::new(move |input| {
        let state = state.clone();
        async move { Ok(ocr_file(&state, input).await) }.boxed()
    });
    WorkQueue::new(job_count, work_fn)
}

/// Process a single entry from our directory walk.
async fn ocr_file(state: &OcrState, input: WalkItem) -> WorkOutput<OcrOutput> {
    match input {
        Ok(image) => {
            let started = Instant::now();
            let mut output = ocr_image_file(state, &image).await;
            output.elapsed_secs = started.elapsed().as_secs_f64();
            output
        }
        Err(failure) => WorkOutput::new_failed(
            failure.path,
            vec![format!("{:#}", failure.error)],
        ),
    }
}

/// OCR an image file and write out the text.
#[instrument(level = "debug", skip_all, fields(path = %image.path.display()))]
async fn ocr_image_file(state: &OcrState, image: &ImageFile) -> WorkOutput<OcrOutput> {
    let output_path = image.output_path();
    let path = image.path.clone();

    if state.skip_existing {
        match tokio::fs::try_exists(&output_path).await {
            Ok(true) => {
                debug!(output = %output_path.display(), "Output exists, skipping");
                return WorkOutput {
                    path,
                    status: WorkStatus::Skipped,
                    elapsed_secs: 0.0,
                    token_usage: None,
                    errors: vec![],
                    data: OcrOutput {
                        output_path: Some(output_path),
                    },
                };
            }
            Ok(false) => {}
            Err(err) => {
                warn!(output = %output_path.display(), "Could not check for output: {}", err);
            }
        }
    }

    let payload = match load_image_payload(image).await {
        Ok(payload) => payload,
        Err(err) => {
            error!("Could not load image: {:#}", err);
            return WorkOutput::new_failed(path, vec![format!("{:#}", err)]);
        }
    };
    let request = OcrRequest {
        model: &state.model,
        prompt: &state.prompt,
        image: &payload,
    };

    // If we have a transient failure, back off exponentially.
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 1..=30_000,
        re_attempts: 5,
        jitter_ratio: 0.2,
    };

    // Do our real work, retrying as specified.
    let result = ocr_attempt(state, &request)
        .await
        .retry_with_async(|_| async { ocr_attempt(state, &request).await })
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_fatal(|_, fatal_error| error!("FAILED with error {fatal_error:?}"))
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .inspect_given_up(|_, retry_errors_list, fatal_error| {
            error!(
                "FAILED after exhausting all {} retrying attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        });
    let (response, mut errors) = split_resolved_result(result);

    let Some(response) = response else {
        return WorkOutput::new_failed(path, errors);
    };
    if let Err(err) = write_ocr_result(&output_path, &response.text).await {
        error!("Could not write output: {:#}", err);
        errors.push(format!("{:#}", err));
        return WorkOutput {
            token_usage: response.token_usage,
            ..WorkOutput::new_failed(path, errors)
        };
    }
    debug!(output = %output_path.display(), "Wrote OCR text");
    WorkOutput {
        path,
        status: WorkStatus::Ok,
        elapsed_secs: 0.0,
        token_usage: response.token_usage,
        errors,
        data: OcrOutput {
            output_path: Some(output_path),
        },
    }
}

/// Make a single OCR attempt, respecting our rate limit.
async fn ocr_attempt(
    state: &OcrState,
    request: &OcrRequest<'_>,
) -> LlmRetryResult<OcrResponse> {
    if let Some(rate_limiter) = &state.rate_limiter {
        rate_limiter.acquire_one().await;
    }
    state.driver.ocr_image(request, &state.llm_opts).await
}

/// Split a [`ResolvedResult`] into the response, if any, and every error we
/// saw along the way. The fatal error, if any, comes last.
fn split_resolved_result(
    result: ResolvedResult<(), (), OcrResponse, anyhow::Error>,
) -> (Option<OcrResponse>, Vec<String>) {
    let full_err = |err: anyhow::Error| format!("{:#}", err);
    match result {
        ResolvedResult::Ok { output, .. } => (Some(output), vec![]),
        ResolvedResult::Fatal { error, .. } => (None, vec![full_err(error)]),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => (Some(output), retry_errors.into_iter().map(full_err).collect()),
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => (
            None,
            retry_errors
                .into_iter()
                .map(full_err)
                .chain(iter::once(full_err(fatal_error)))
                .collect(),
        ),
    }
}
