//! Command-line entry points.

use clap::Args;

pub mod ocr;

/// Options controlling how we process our stream of images.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N images found. Handy for trying out a
    /// new prompt or model. With `--skip-existing`, images which already have
    /// output don't count towards N.
    #[clap(long)]
    pub take_first: Option<usize>,

    /// Max number of images to process at a time.
    #[clap(short = 'j', long = "jobs", env = "MAX_WORKERS", default_value = "5")]
    pub job_count: usize,

    /// What portion of attempted images should we allow to fail? Specified as
    /// a number between 0.0 and 1.0. A run where every attempted image fails
    /// is always an error.
    #[clap(long, default_value = "1.0")]
    pub allowed_failure_rate: f32,
}
