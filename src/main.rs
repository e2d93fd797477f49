use std::str::FromStr;

use clap::Parser;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod data_url;
mod drivers;
mod image_payload;
mod output;
mod prelude;
mod queues;
mod rate_limit;
mod retry;
mod ui;
mod walk;

/// OCR every TIFF and JPEG image under a directory using a generative AI
/// model, writing the text of `scan.tif` to `scan_ocr.txt`.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - ROOT_DIRECTORY: The directory to search for images.
  - MODEL_NAME: The model to use, such as "gemini-2.0-flash".
  - GEMINI_API_KEY: The API key for the gemini driver.
  - GEMINI_API_BASE (optional): Override the Gemini server URL.
  - OCR_DRIVER (optional): "gemini" (the default), "openai" or "echo".
  - OPENAI_API_KEY, OPENAI_API_BASE: Used by the openai driver.
  - MAX_WORKERS (optional): How many images to process at once.
  - SKIP_EXISTING (optional): Set to "true" to skip images with output.
  - RUST_LOG (optional): Logging filter, such as "debug".

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(flatten)]
    ocr_opts: cmd::ocr::OcrOpts,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    cmd::ocr::cmd_ocr(ui, &opts.ocr_opts).await
}
