//! The OCR command: find images, OCR them and write the results.

use std::{sync::Arc, time::Instant};

use clap::{Args, builder::FalseyValueParser};
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::{io::write_output, spawn_blocking_propagating_panics},
    cmd::StreamOpts,
    config::OcrConfig,
    drivers::{DriverType, LlmOpts, gemini::DEFAULT_GEMINI_API_BASE},
    prelude::*,
    queues::{
        ocr::{OcrState, create_ocr_work_queue},
        work::{WorkItemCounterExt as _, WorkOutputCounters},
    },
    ui::{ProgressConfig, Ui},
    walk::{WalkItem, reject_duplicate_outputs, walk_images},
};

/// Options for the OCR command.
#[derive(Debug, Clone, Args)]
pub struct OcrOpts {
    /// The directory to search for TIFF and JPEG images. Subdirectories are
    /// searched too.
    #[clap(long, env = "ROOT_DIRECTORY")]
    pub root_directory: Option<PathBuf>,

    /// Which OCR driver to use.
    #[clap(long, env = "OCR_DRIVER", value_enum, default_value_t)]
    pub driver: DriverType,

    /// The model to use, such as "gemini-2.0-flash".
    #[clap(long, env = "MODEL_NAME")]
    pub model: Option<String>,

    /// API key for the gemini driver.
    #[clap(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL for the gemini driver.
    #[clap(long, env = "GEMINI_API_BASE", default_value = DEFAULT_GEMINI_API_BASE)]
    pub api_base: String,

    /// A plain text file containing the prompt to send with each image.
    #[clap(long)]
    pub prompt: Option<PathBuf>,

    /// Leave images alone if their `_ocr.txt` file already exists.
    #[clap(long, env = "SKIP_EXISTING", value_parser = FalseyValueParser::new())]
    pub skip_existing: bool,

    /// Write a JSONL record describing each image to this path.
    #[clap(long)]
    pub report: Option<PathBuf>,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,
}

/// Run the OCR command.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let started = Instant::now();
    let config = OcrConfig::from_opts(opts).await?;
    debug!(?config, "Loaded configuration");
    let driver = config.driver_type.create_driver(&config.driver_settings)?;

    // Find our images. Scanning is blocking I/O, so we do it on a worker
    // thread, and we collect everything up front so we can size our progress
    // bar.
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🔍",
        msg: "Scanning for images",
        done_msg: "Scanned for images",
    });
    let root = config.root_directory.clone();
    let scan_spinner = spinner.clone();
    let take_first = config.take_first;
    let skip_existing = config.skip_existing;
    let inputs = spawn_blocking_propagating_panics(move || -> Result<Vec<WalkItem>> {
        let inputs = walk_images(&root)?
            .inspect(|_| scan_spinner.inc(1))
            .collect::<Vec<_>>();
        let inputs = reject_duplicate_outputs(inputs);
        Ok(match take_first {
            Some(take_first) => take_first_pending(inputs, take_first, skip_existing),
            None => inputs,
        })
    })
    .await?;
    spinner.finish_using_style();

    if inputs.is_empty() {
        ui.display_message(
            "🤷",
            &format!(
                "No TIFF or JPEG images found in {}",
                config.root_directory.display()
            ),
        );
        return Ok(());
    }
    info!(
        count = inputs.len(),
        driver = ?config.driver_type,
        model = %config.model,
        "Starting OCR"
    );

    // Configure our progress bar.
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing images",
            done_msg: "OCRed images",
        },
        inputs.len() as u64,
    );

    // Build our work queue, and feed it our images.
    let job_count = config.job_count;
    let state = Arc::new(OcrState::new(&config, driver));
    let (queue, worker) = create_ocr_work_queue(state, job_count)?;
    let futures = queue.handle().process_stream(stream::iter(inputs).boxed());
    let outputs = pb.wrap_stream(futures.buffer_unordered(job_count)).boxed();

    // Count our outcomes, and write them to our report, if any.
    let (outputs, counters) = WorkOutputCounters::wrap_stream(outputs);
    let json_outputs = outputs
        .map(|output| output.and_then(|output| output.to_json()))
        .boxed();
    write_output(config.report_path.as_deref(), json_outputs).await?;

    // Shut down our work queue and wait for its background task to exit.
    drop(queue);
    worker.join().await?;

    counters.finish(&ui, started.elapsed(), config.allowed_failure_rate)
}

/// Keep entries up to and including the `take_first`-th one that still needs
/// work.
///
/// With `skip_existing`, images which already have output don't count towards
/// the limit. They're kept, so they still show up as skipped in our summary.
fn take_first_pending(
    inputs: Vec<WalkItem>,
    take_first: usize,
    skip_existing: bool,
) -> Vec<WalkItem> {
    let mut pending = 0;
    let mut kept = Vec::new();
    for item in inputs {
        if pending == take_first {
            break;
        }
        let already_done = skip_existing
            && matches!(&item, Ok(image) if image.output_path().exists());
        if !already_done {
            pending += 1;
        }
        kept.push(item);
    }
    kept
}
