//! Async item processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overflow, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, trying to submit more items
//! for processing will block until one of the in-flight items is completed.
//!
//! This is our worker pool: one background task pulls items off a bounded
//! channel and runs up to `concurrency_limit` of them at once. Results travel
//! back to the submitter over a one-shot channel.
//!
//! This module also defines [`WorkOutput`], our per-file outcome record, and
//! the [`WorkOutputCounters`] that summarize a run.

use std::{
    fmt::Write as _,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{
    FutureExt, SinkExt as _, StreamExt,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, BoxedStream, JoinWorker},
    drivers::TokenUsage,
    prelude::*,
    ui::Ui,
};

/// How many failures do we list individually in the summary?
const MAX_LISTED_FAILURES: usize = 50;

/// Output status of a work item.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// The work item was successful.
    Ok,

    /// We didn't need to do anything.
    Skipped,

    /// The work item failed.
    Failed,
}

/// The outcome of processing one file.
#[derive(Clone, Debug, Serialize)]
pub struct WorkOutput<T> {
    /// The file we processed.
    pub path: PathBuf,

    /// What is the status of this work item?
    pub status: WorkStatus,

    /// How long did this item take, including retries?
    pub elapsed_secs: f64,

    /// How many tokens did we use?
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    /// Any errors that occurred during processing. Because of retries, even
    /// successful items may have errors.
    pub errors: Vec<String>,

    /// The output data for the work item.
    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkOutput<T>
where
    T: Serialize + Default + Send + 'static,
{
    /// Create a new failed output record.
    pub fn new_failed(path: PathBuf, errors: Vec<String>) -> Self {
        Self {
            path,
            status: WorkStatus::Failed,
            elapsed_secs: 0.0,
            token_usage: None,
            errors,
            data: T::default(),
        }
    }

    /// Convert from the output type to a JSON value.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialize output")
    }
}

/// Counters summarizing a run.
#[derive(Clone, Debug, Default)]
pub struct WorkOutputCounters {
    /// How many records did we see?
    pub total_record_count: usize,

    /// How many records succeeded?
    pub success_count: usize,

    /// How many records were skipped?
    pub skipped_count: usize,

    /// Records we failed to process, with their first error.
    pub failures: Vec<(PathBuf, String)>,

    /// How many non-fatal errors did we encounter?
    pub non_fatal_error_count: usize,

    /// How many tokens did we use?
    pub token_usage: TokenUsage,
}

impl WorkOutputCounters {
    /// Wrap a stream with counters.
    pub fn wrap_stream<T>(
        stream: BoxedStream<Result<WorkOutput<T>>>,
    ) -> (
        BoxedStream<Result<WorkOutput<T>>>,
        Arc<Mutex<WorkOutputCounters>>,
    )
    where
        T: Send + 'static,
    {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |value| {
                let value = value?;
                counters_clone.update(&value);
                Ok(value)
            })
            .boxed();
        (stream, counters)
    }

    /// How many records did we actually try to process?
    pub fn attempted_count(&self) -> usize {
        self.total_record_count - self.skipped_count
    }

    /// Check the counters against our failure policy.
    ///
    /// A run fails if we attempted at least one record and none succeeded, or
    /// if more than `allowed_failure_rate` of attempted records failed.
    pub fn check_failure_policy(&self, allowed_failure_rate: f32) -> Result<()> {
        let attempted = self.attempted_count();
        let failure_count = self.failures.len();
        if attempted == 0 {
            return Ok(());
        }
        if self.success_count == 0 {
            return Err(anyhow!(
                "None of the {} images could be processed",
                attempted
            ));
        }
        let failure_rate = failure_count as f32 / attempted as f32;
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of images failed, but only {:.2}% were allowed",
                failure_count,
                attempted,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        Ok(())
    }
}

/// We actually want to put methods in `Mutex<WorkOutputCounters>`, because
/// that's the type we actually work with. To do that, we need to define an
/// extension trait with the methods we want.
pub trait WorkItemCounterExt {
    /// Update counters for a work item.
    fn update<T>(&self, item: &WorkOutput<T>);

    /// Display a summary to the user, and apply our failure policy.
    fn finish(
        self: Arc<Self>,
        ui: &Ui,
        elapsed: Duration,
        allowed_failure_rate: f32,
    ) -> Result<()>;
}

impl WorkItemCounterExt for Mutex<WorkOutputCounters> {
    fn update<T>(&self, item: &WorkOutput<T>) {
        // Hold a sync lock, but just for an instant to update counters.
        let mut counters = self.lock().expect("lock poisoned");
        counters.total_record_count += 1;
        match item.status {
            WorkStatus::Ok => {
                counters.success_count += 1;
                counters.non_fatal_error_count += item.errors.len();
            }
            WorkStatus::Skipped => counters.skipped_count += 1,
            WorkStatus::Failed => {
                let first_error = item
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "unknown error".to_owned());
                counters.failures.push((item.path.clone(), first_error));
            }
        }
        if let Some(token_usage) = &item.token_usage {
            counters.token_usage += token_usage.clone();
        }
    }

    fn finish(
        self: Arc<Self>,
        ui: &Ui,
        elapsed: Duration,
        allowed_failure_rate: f32,
    ) -> Result<()> {
        let counters = self.lock().expect("lock poisoned").to_owned();
        ui.display_message("⏱️", &summary_timing(&counters, elapsed));
        ui.display_message(
            "📊",
            &format!(
                "Total: {}, Successful: {}, Skipped: {}, Failed: {}",
                counters.total_record_count,
                counters.success_count,
                counters.skipped_count,
                counters.failures.len(),
            ),
        );
        if !counters.token_usage.is_zero() {
            ui.display_message(
                "📈",
                &format!(
                    "{} input tokens and {} output tokens used",
                    counters.token_usage.prompt_tokens,
                    counters.token_usage.completion_tokens,
                ),
            );
        }
        if counters.non_fatal_error_count > 0 {
            ui.display_message(
                "⚠️",
                &format!(
                    "{} transient errors were retried successfully",
                    counters.non_fatal_error_count
                ),
            );
        }
        if !counters.failures.is_empty() {
            ui.display_message("❌", &failure_list(&counters.failures));
        }
        counters.check_failure_policy(allowed_failure_rate)
    }
}

/// Describe how long the run took.
fn summary_timing(counters: &WorkOutputCounters, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let mut msg = format!("Processing complete in {secs:.2} seconds");
    let attempted = counters.attempted_count();
    if attempted > 0 {
        let _ = write!(msg, ", {:.2} s per image", secs / attempted as f64);
    }
    if counters.success_count > 0 {
        let _ = write!(
            msg,
            ", {:.2} s per successful image",
            secs / counters.success_count as f64
        );
    }
    msg
}

/// List failed files, one per line.
fn failure_list(failures: &[(PathBuf, String)]) -> String {
    let mut msg = format!("{} images could not be processed:", failures.len());
    for (path, error) in failures.iter().take(MAX_LISTED_FAILURES) {
        let _ = write!(msg, "\n     {}: {}", path.display(), error);
    }
    if failures.len() > MAX_LISTED_FAILURES {
        let _ = write!(
            msg,
            "\n     ...and {} more",
            failures.len() - MAX_LISTED_FAILURES
        );
    }
    msg
}

/// Work items are processed by [`WorkItemProcessor`]s. They contain an input,
/// and a one-shot channel on which to return the result.
#[derive(Debug)]
pub struct WorkItem<Input, Output> {
    /// The input to the work item.
    pub input: Input,

    /// The one-shot channel on which to return the result.
    pub tx: oneshot::Sender<Result<Output>>,
}

/// API shared by workers.
///
/// This is fairly bare bones; you'll probably want to use [`WorkQueue`] and
/// [`WorkQueueHandle`] in normal usage.
pub trait WorkItemProcessor {
    type Input: 'static;
    type Output: 'static;

    /// Process a work item. The result will be sent to `item.tx`.
    ///
    /// This should normally only block if our processing capacity has been
    /// maxed out.
    async fn submit_work_item(&self, item: WorkItem<Self::Input, Self::Output>)
    -> Result<()>;

    /// Process an input and return a channel that will receive the output.
    async fn submit_input(
        &self,
        input: Self::Input,
    ) -> Result<oneshot::Receiver<Result<Self::Output>>> {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem { input, tx };
        self.submit_work_item(item).await?;
        Ok(rx)
    }

    /// Process an input and wait for the output.
    async fn process_blocking(&self, input: Self::Input) -> Result<Self::Output> {
        let rx = self.submit_input(input).await?;
        rx.await.context("failed to receive work item result")?
    }
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A handle to a [`WorkQueue`].
///
/// This is basically just a wrapper around a [`mpsc::Sender`] that implements
/// [`WorkItemProcessor`]. It can be cloned cheaply and passed around.
pub struct WorkQueueHandle<Input, Output> {
    /// Our sender.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Process a stream of inputs, returning a stream of futures that will
    /// yield outputs. Typically used with [`futures::StreamExt::buffered`] or
    /// [`futures::StreamExt::buffer_unordered`] to resolve the futures.
    ///
    /// You can use pretty much whatever concurrency you find appropriate when
    /// calling `buffered` or `buffer_unordered`, but the underlying concurrency
    /// limit on the [`WorkQueue`] will still be enforced normally.
    pub fn process_stream(
        &self,
        input: BoxedStream<Input>,
    ) -> BoxedStream<BoxedFuture<Result<Output>>> {
        let handle = self.clone();
        input
            .map(move |input| {
                let handle = handle.clone();
                async move { handle.process_blocking(input).await }.boxed()
            })
            .boxed()
    }
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkItemProcessor for WorkQueueHandle<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    type Input = Input;
    type Output = Output;

    async fn submit_work_item(
        &self,
        item: WorkItem<Self::Input, Self::Output>,
    ) -> Result<()> {
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut tx = self.tx.clone();
        tx.send(item).await.context("failed to send work item")?;
        Ok(())
    }
}

/// A queue of work items, processed in parallel by a background task.
///
/// We maintain backpressure by limiting the number of work items queued, and
/// the number currently being processed. The background task exits once the
/// queue and every handle have been dropped.
pub struct WorkQueue<Input, Output> {
    /// Queue for submitting work items.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Note that up to `concurrency_limit` work may be waiting at any one time,
    /// and another `concurrency_limit` work items may be in progress.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<Input, Output>,
    ) -> Result<(Self, JoinWorker)> {
        if concurrency_limit == 0 {
            return Err(anyhow!("concurrency limit must be at least 1"));
        }
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if item.tx.send(result).is_err() {
                        debug!(
                            "failed to send work item result because receiver was dropped"
                        );
                    }
                }
            })
            .await;
            Ok(())
        });
        Ok((Self { tx }, JoinWorker::from_handle(worker)))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;

    use super::*;

    #[derive(Clone, Debug, Default, Serialize)]
    struct NoData {}

    fn output(path: &str, status: WorkStatus, errors: &[&str]) -> WorkOutput<NoData> {
        WorkOutput {
            path: PathBuf::from(path),
            status,
            elapsed_secs: 0.5,
            token_usage: Some(TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 2,
            }),
            errors: errors.iter().map(|e| e.to_string()).collect(),
            data: NoData {},
        }
    }

    #[tokio::test]
    async fn queue_respects_concurrency_limit() -> Result<()> {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let work_fn: WorkFn<usize, usize> = {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            Arc::new(move |n| {
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
                .boxed()
            })
        };

        let (queue, worker) = WorkQueue::new(3, work_fn)?;
        let inputs = stream::iter(0..20).boxed();
        let mut outputs = queue
            .handle()
            .process_stream(inputs)
            .buffer_unordered(20)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        outputs.sort();
        assert_eq!(outputs, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        assert!(max_seen.load(Ordering::SeqCst) <= 3);

        drop(queue);
        worker.join().await
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let work_fn: WorkFn<(), ()> = Arc::new(|()| async { Ok(()) }.boxed());
        assert!(WorkQueue::new(0, work_fn).is_err());
    }

    #[tokio::test]
    async fn counters_track_outcomes() -> Result<()> {
        let outputs = vec![
            Ok(output("a.tif", WorkStatus::Ok, &[])),
            Ok(output("b.tif", WorkStatus::Ok, &["retried once"])),
            Ok(output("c.tif", WorkStatus::Skipped, &[])),
            Ok(output("d.tif", WorkStatus::Failed, &["bad scan", "second error"])),
        ];
        let (stream, counters) = WorkOutputCounters::wrap_stream(stream::iter(outputs).boxed());
        let seen = stream.collect::<Vec<_>>().await;
        assert_eq!(seen.len(), 4);

        let counters = counters.lock().unwrap().clone();
        assert_eq!(counters.total_record_count, 4);
        assert_eq!(counters.success_count, 2);
        assert_eq!(counters.skipped_count, 1);
        assert_eq!(counters.attempted_count(), 3);
        assert_eq!(counters.non_fatal_error_count, 1);
        assert_eq!(
            counters.failures,
            vec![(PathBuf::from("d.tif"), "bad scan".to_owned())]
        );
        assert_eq!(counters.token_usage.prompt_tokens, 12);
        Ok(())
    }

    #[test]
    fn failure_policy() {
        let mut counters = WorkOutputCounters {
            total_record_count: 4,
            success_count: 3,
            failures: vec![(PathBuf::from("d.tif"), "bad".to_owned())],
            ..WorkOutputCounters::default()
        };
        // Partial failure is fine by default.
        assert!(counters.check_failure_policy(1.0).is_ok());
        // But not when the user asks for a stricter policy.
        assert!(counters.check_failure_policy(0.1).is_err());

        // Total failure is always an error.
        counters.success_count = 0;
        counters.failures = vec![(PathBuf::from("x.tif"), "bad".to_owned()); 4];
        let err = counters.check_failure_policy(1.0).unwrap_err();
        assert!(err.to_string().contains("None of the 4 images"));

        // Nothing attempted is not a failure.
        let counters = WorkOutputCounters {
            total_record_count: 2,
            skipped_count: 2,
            ..WorkOutputCounters::default()
        };
        assert!(counters.check_failure_policy(0.0).is_ok());
    }

    #[test]
    fn finish_reports_and_applies_policy() {
        let ui = Ui::init_for_tests();
        let counters = Arc::new(Mutex::new(WorkOutputCounters {
            total_record_count: 2,
            success_count: 1,
            failures: vec![(PathBuf::from("bad.tif"), "bad".to_owned())],
            ..WorkOutputCounters::default()
        }));
        let elapsed = Duration::from_secs(4);
        assert!(counters.clone().finish(&ui, elapsed, 1.0).is_ok());
        assert!(counters.finish(&ui, elapsed, 0.0).is_err());
    }

    #[test]
    fn timing_is_averaged_over_attempted_images() {
        let counters = WorkOutputCounters {
            total_record_count: 5,
            skipped_count: 1,
            success_count: 2,
            ..WorkOutputCounters::default()
        };
        let msg = summary_timing(&counters, Duration::from_secs(8));
        assert_eq!(
            msg,
            "Processing complete in 8.00 seconds, 2.00 s per image, \
             4.00 s per successful image"
        );
    }

    #[test]
    fn failure_list_is_capped() {
        let failures = (0..60)
            .map(|i| (PathBuf::from(format!("{i}.tif")), "bad".to_owned()))
            .collect::<Vec<_>>();
        let msg = failure_list(&failures);
        assert!(msg.starts_with("60 images could not be processed:"));
        assert!(msg.contains("49.tif: bad"));
        assert!(!msg.contains("50.tif: bad"));
        assert!(msg.ends_with("...and 10 more"));
    }

    #[test]
    fn outputs_serialize_flat() -> Result<()> {
        let json = output("a.tif", WorkStatus::Failed, &["oops"]).to_json()?;
        assert_eq!(json["path"], "a.tif");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["errors"][0], "oops");
        Ok(())
    }
}
