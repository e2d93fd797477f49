//! Validated run configuration.
//!
//! Command-line flags and environment variables (possibly loaded from `.env`)
//! are parsed by `clap`. We check them once, here, and hand the rest of the
//! program an immutable [`OcrConfig`].

use crate::{
    cmd::ocr::OcrOpts,
    drivers::{DriverSettings, DriverType, LlmOpts},
    prelude::*,
};

/// The prompt we use if the user doesn't supply one.
pub const DEFAULT_PROMPT: &str = "Extract all text visible in this image. \
     Maintain the original structure and layout as much as possible.";

/// Model name reported by the `echo` driver when none is configured.
const ECHO_MODEL: &str = "echo";

/// Everything we need to know to run.
#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// The directory to search for images.
    pub root_directory: PathBuf,

    /// Which driver to use.
    pub driver_type: DriverType,

    /// Connection settings for our driver.
    pub driver_settings: DriverSettings,

    /// The model to ask for.
    pub model: String,

    /// The prompt to send with each image.
    pub prompt: String,

    /// How many images to process at once.
    pub job_count: usize,

    /// Skip images which already have an output file.
    pub skip_existing: bool,

    /// Only process this many images.
    pub take_first: Option<usize>,

    /// What portion of attempted images may fail before we exit with an error?
    pub allowed_failure_rate: f32,

    /// Where to write a JSONL report, if anywhere.
    pub report_path: Option<PathBuf>,

    /// Per-request model options.
    pub llm_opts: LlmOpts,
}

impl OcrConfig {
    /// Validate our options and build a config.
    #[instrument(level = "debug", skip_all)]
    pub async fn from_opts(opts: &OcrOpts) -> Result<Self> {
        let root_directory = opts.root_directory.clone().ok_or_else(|| {
            anyhow!(
                "ROOT_DIRECTORY not found in environment or .env file \
                 (or pass --root-directory)"
            )
        })?;

        let driver_type = opts.driver;
        let model = match (&opts.model, driver_type.requires_model()) {
            (Some(model), _) if !model.trim().is_empty() => model.trim().to_owned(),
            (_, false) => ECHO_MODEL.to_owned(),
            (_, true) => {
                return Err(anyhow!(
                    "MODEL_NAME not found in environment or .env file (or pass --model)"
                ));
            }
        };

        let api_key = opts
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_owned);
        if driver_type.requires_api_key() && api_key.is_none() {
            return Err(anyhow!(
                "GEMINI_API_KEY not found in environment or .env file (or pass --api-key)"
            ));
        }

        let prompt = match &opts.prompt {
            Some(path) => read_prompt(path).await?,
            None => DEFAULT_PROMPT.to_owned(),
        };

        let stream_opts = &opts.stream_opts;
        if stream_opts.job_count == 0 {
            return Err(anyhow!("MAX_WORKERS (--jobs) must be at least 1"));
        }
        if !(0.0..=1.0).contains(&stream_opts.allowed_failure_rate) {
            return Err(anyhow!(
                "--allowed-failure-rate must be between 0.0 and 1.0, got {}",
                stream_opts.allowed_failure_rate
            ));
        }

        Ok(Self {
            root_directory,
            driver_type,
            driver_settings: DriverSettings {
                api_key,
                api_base: opts.api_base.trim_end_matches('/').to_owned(),
            },
            model,
            prompt,
            job_count: stream_opts.job_count,
            skip_existing: opts.skip_existing,
            take_first: stream_opts.take_first,
            allowed_failure_rate: stream_opts.allowed_failure_rate,
            report_path: opts.report.clone(),
            llm_opts: opts.llm_opts.clone(),
        })
    }
}

/// Read a prompt from a plain text file.
async fn read_prompt(path: &Path) -> Result<String> {
    let prompt = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read prompt file {:?}", path))?;
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(anyhow!("Prompt file {:?} is empty", path));
    }
    Ok(prompt.to_owned())
}
