use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BenchmarkConfig;
use crate::engine::{GenerationEngine, SamplingParams};
use crate::report::{FailureRecord, LevelSummary, RequestRecord, RequestStats};

/// Raw output of one concurrency level, before aggregation.
#[derive(Debug, Clone)]
pub struct LevelRun {
    pub concurrency: usize,
    pub records: Vec<RequestRecord>,
    pub batch_duration: Duration,
}

impl LevelRun {
    pub fn summarize(&self) -> LevelSummary {
        LevelSummary::from_records(self.concurrency, &self.records, self.batch_duration)
    }
}

/// Runs every configured concurrency level in order, one batch at a time.
pub async fn run_benchmark(
    engine: Arc<dyn GenerationEngine>,
    config: BenchmarkConfig,
) -> Result<Vec<LevelSummary>> {
    let config = Arc::new(config);
    let mut summaries = Vec::with_capacity(config.concurrency_levels.len());

    for &concurrency in &config.concurrency_levels {
        info!(concurrency, "starting batch");
        let run = run_level(Arc::clone(&engine), Arc::clone(&config), concurrency).await?;
        let summary = run.summarize();
        info!(
            concurrency,
            successes = summary.successful_requests,
            failures = summary.failed_requests,
            duration_secs = summary.batch_duration.as_secs_f64(),
            generation_tps = summary.generation_throughput,
            "batch finished"
        );
        summaries.push(summary);
    }

    Ok(summaries)
}

/// Launches `concurrency` requests at once and waits for all of them.
pub async fn run_level(
    engine: Arc<dyn GenerationEngine>,
    config: Arc<BenchmarkConfig>,
    concurrency: usize,
) -> Result<LevelRun> {
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let start = Instant::now();
    let tracker_handle = tokio::spawn(track_status(
        status_rx,
        start,
        concurrency as u64,
        config.show_progress,
    ));

    let mut join_set = JoinSet::new();
    for request_id in 0..concurrency as u64 {
        let engine = Arc::clone(&engine);
        let config = Arc::clone(&config);
        let status_tx = status_tx.clone();
        join_set.spawn(async move {
            let record = run_request(engine.as_ref(), &config, request_id).await;
            let _ = status_tx.send(StatusEvent::from(&record));
            record
        });
    }
    drop(status_tx);

    let mut records = Vec::with_capacity(concurrency);
    while let Some(join_result) = join_set.join_next().await {
        records.push(join_result?);
    }
    let batch_duration = start.elapsed();

    tracker_handle
        .await
        .map_err(|err| anyhow!("status tracker task failed: {}", err))?;

    records.sort_by_key(RequestRecord::request_id);

    Ok(LevelRun {
        concurrency,
        records,
        batch_duration,
    })
}

/// Issues one generation request and times it. Errors and timeouts become
/// failure records instead of propagating.
pub async fn run_request(
    engine: &dyn GenerationEngine,
    config: &BenchmarkConfig,
    request_id: u64,
) -> RequestRecord {
    let attempt = single_attempt(engine, config, request_id);
    let outcome = match config.request_timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!("timed out after {:.2}s", limit.as_secs_f64())),
        },
        None => attempt.await,
    };

    match outcome {
        Ok(stats) => RequestRecord::Success(stats),
        Err(err) => {
            let message = format!("{:#}", err);
            warn!(request_id, error = %message, "request failed");
            RequestRecord::Failure(FailureRecord {
                request_id,
                error: message,
            })
        }
    }
}

async fn single_attempt(
    engine: &dyn GenerationEngine,
    config: &BenchmarkConfig,
    request_id: u64,
) -> Result<RequestStats> {
    let start = Instant::now();
    let params = SamplingParams {
        max_tokens: config.max_tokens,
    };

    let mut outputs = engine.generate(&config.prompt, params, request_id).await?;

    let mut first_token_at = None;
    let mut generated_tokens = 0;
    let mut reported_prompt_tokens = None;
    while let Some(output) = outputs.next().await {
        let output = output?;
        if first_token_at.is_none() && output.cumulative_tokens > 0 {
            first_token_at = Some(Instant::now());
        }
        generated_tokens = output.cumulative_tokens;
        if output.prompt_tokens.is_some() {
            reported_prompt_tokens = output.prompt_tokens;
        }
    }
    let end = Instant::now();

    Ok(RequestStats {
        request_id,
        prompt_tokens: reported_prompt_tokens.unwrap_or(config.prompt_tokens),
        generated_tokens,
        latency: end.duration_since(start),
        ttft: first_token_at.map(|at| at.duration_since(start)),
    })
}

#[derive(Debug, Clone, Copy)]
enum StatusEvent {
    Success { tokens: u64 },
    Failure,
}

impl From<&RequestRecord> for StatusEvent {
    fn from(record: &RequestRecord) -> Self {
        match record {
            RequestRecord::Success(stats) => StatusEvent::Success {
                tokens: stats.generated_tokens,
            },
            RequestRecord::Failure(_) => StatusEvent::Failure,
        }
    }
}

#[derive(Debug, Default)]
struct StatusSnapshot {
    total_tokens: u64,
    successes: u64,
    failures: u64,
}

async fn track_status(
    mut updates: mpsc::UnboundedReceiver<StatusEvent>,
    start: Instant,
    planned: u64,
    render: bool,
) {
    let mut snapshot = StatusSnapshot::default();
    if render {
        render_status(&snapshot, start, planned, true);
    }

    while let Some(event) = updates.recv().await {
        match event {
            StatusEvent::Success { tokens } => {
                snapshot.successes += 1;
                snapshot.total_tokens = snapshot.total_tokens.saturating_add(tokens);
            }
            StatusEvent::Failure => snapshot.failures += 1,
        }

        if render {
            render_status(&snapshot, start, planned, true);
        }
    }

    if render {
        render_status(&snapshot, start, planned, false);
    }
}

fn render_status(snapshot: &StatusSnapshot, start: Instant, planned: u64, stay: bool) {
    let elapsed = start.elapsed().as_secs_f64();
    let throughput = if elapsed > 0.0 {
        snapshot.total_tokens as f64 / elapsed
    } else {
        0.0
    };
    let completed = snapshot.successes + snapshot.failures;

    let mut stderr = io::stderr().lock();
    let _ = write!(
        stderr,
        "\r\x1b[2KBatch {}: {}/{} done, {} failed, {} tokens, {:.2} tok/s",
        planned, completed, planned, snapshot.failures, snapshot.total_tokens, throughput
    );
    if !stay {
        let _ = writeln!(stderr);
    }
    let _ = stderr.flush();
}
