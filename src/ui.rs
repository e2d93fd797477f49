//! Terminal output: a spinner while we scan for images, a progress bar while we
//! OCR them, and one-line summary messages at the end.
//!
//! Log output and progress bars share stderr, so everything that writes there
//! goes through [`Ui`], which pauses the bars while a line is printed.
//!
//! This is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{
    MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle,
};

/// How often our bars redraw themselves, even if nothing has finished.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Shared handle to our progress bars. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    /// Every bar we create, plus the tracing writer, goes through this.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Set up our progress bars. Call this before initializing tracing, so
    /// that log lines can use [`Ui::get_stderr_writer`].
    pub fn init() -> Ui {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    /// A UI which never draws anything.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        Self::with_draw_target(ProgressDrawTarget::hidden())
    }

    fn with_draw_target(target: ProgressDrawTarget) -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::with_draw_target(target)),
        }
    }

    /// A stderr writer for `tracing` which won't scribble over our bars.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Create a progress bar counting `len` images.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        self.add_bar(ProgressBar::new(len).with_style(image_bar_style()), config)
    }

    /// Create a spinner, for when we don't know how many images there are yet.
    pub fn new_spinner(&self, config: &ProgressConfig<'_>) -> ProgressBar {
        self.add_bar(ProgressBar::new_spinner().with_style(scan_spinner_style()), config)
    }

    /// Print a one-line message to stderr, above any active progress bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        self.suspend(|| eprintln!("  {emoji:3}{msg}"));
    }

    /// Hide our bars while running `f`.
    fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi_progress.suspend(f)
    }

    /// Register `bar` and apply `config` to it.
    fn add_bar(&self, bar: ProgressBar, config: &ProgressConfig<'_>) -> ProgressBar {
        let bar = self.multi_progress.add(bar);
        bar.set_prefix(config.emoji.to_owned());
        bar.set_message(config.msg.to_owned());
        bar.enable_steady_tick(TICK_INTERVAL);
        bar.with_finish(ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }
}

/// Labels for a progress bar or spinner.
pub struct ProgressConfig<'a> {
    /// Emoji shown to the left of the bar.
    pub emoji: &'a str,
    /// Message while work is in progress, such as "OCRing images".
    pub msg: &'a str,
    /// Message once the bar is finished, such as "OCRed images".
    pub done_msg: &'a str,
}

fn image_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>5}/{len:5} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

fn scan_spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg} ({pos} images)")
        .expect("bad progress bar template")
}

/// A writer for `stderr` which hides our bars while each log line is written.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

// `tracing` formats whole lines before calling us, so suspending the bars per
// call is enough to keep lines intact.
impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.suspend(|| io::stderr().flush())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.ui.suspend(|| io::stderr().write_vectored(bufs))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.suspend(|| io::stderr().write_all(buf))
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.ui.suspend(|| io::stderr().write_fmt(fmt))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
