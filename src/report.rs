use std::fmt;
use std::time::Duration;

use crate::environment::EnvironmentInfo;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestStats {
    pub request_id: u64,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub latency: Duration,
    /// `None` when the stream finished without producing a token.
    pub ttft: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub request_id: u64,
    pub error: String,
}

/// Outcome of a single generation request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestRecord {
    Success(RequestStats),
    Failure(FailureRecord),
}

impl RequestRecord {
    pub fn request_id(&self) -> u64 {
        match self {
            RequestRecord::Success(stats) => stats.request_id,
            RequestRecord::Failure(failure) => failure.request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestRecord::Success(_))
    }
}

/// Aggregates for one concurrency level. Token and TTFT figures only count
/// successful requests.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSummary {
    pub concurrency: usize,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_generated_tokens: u64,
    pub batch_duration: Duration,
    pub generation_throughput: f64,
    pub prompt_throughput: f64,
    pub min_ttft: f64,
    pub max_ttft: f64,
    pub mean_latency: f64,
    pub success_rate: f64,
    pub failures: Vec<FailureRecord>,
}

impl LevelSummary {
    pub fn from_records(
        concurrency: usize,
        records: &[RequestRecord],
        batch_duration: Duration,
    ) -> Self {
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for record in records {
            match record {
                RequestRecord::Success(stats) => successes.push(stats),
                RequestRecord::Failure(failure) => failures.push(failure.clone()),
            }
        }

        let total_prompt_tokens: u64 = successes.iter().map(|s| s.prompt_tokens).sum();
        let total_generated_tokens: u64 = successes.iter().map(|s| s.generated_tokens).sum();

        let duration_secs = batch_duration.as_secs_f64();
        let per_second = |total: u64| {
            if duration_secs > 0.0 {
                total as f64 / duration_secs
            } else {
                0.0
            }
        };

        let ttfts: Vec<f64> = successes
            .iter()
            .filter_map(|s| s.ttft)
            .map(|ttft| ttft.as_secs_f64())
            .collect();
        let (min_ttft, max_ttft) = if ttfts.is_empty() {
            (0.0, 0.0)
        } else {
            (
                ttfts.iter().copied().fold(f64::INFINITY, f64::min),
                ttfts.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            )
        };

        let mean_latency = if successes.is_empty() {
            0.0
        } else {
            successes
                .iter()
                .map(|s| s.latency.as_secs_f64())
                .sum::<f64>()
                / successes.len() as f64
        };

        let succeeded = records.iter().filter(|record| record.is_success()).count();
        let success_rate = if concurrency > 0 {
            (succeeded as f64 / concurrency as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        Self {
            concurrency,
            successful_requests: successes.len() as u64,
            failed_requests: failures.len() as u64,
            total_prompt_tokens,
            total_generated_tokens,
            batch_duration,
            generation_throughput: per_second(total_generated_tokens),
            prompt_throughput: per_second(total_prompt_tokens),
            min_ttft,
            max_ttft,
            mean_latency,
            success_rate,
            failures,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub engine: String,
    pub environment: EnvironmentInfo,
    pub levels: Vec<LevelSummary>,
}

/// Text columns are left-aligned, numeric ones right-aligned.
const LEFT_ALIGNED: [bool; 6] = [false, false, false, false, false, true];

const HEADERS: [&str; 6] = [
    "Batch size",
    "Generation Throughput (tokens/s)",
    "Prompt Throughput (tokens/s)",
    "Min TTFT (s)",
    "Max TTFT (s)",
    "Success Rate",
];

impl BenchmarkReport {
    pub fn rows(&self) -> Vec<[String; 6]> {
        self.levels
            .iter()
            .map(|level| {
                [
                    level.concurrency.to_string(),
                    format!("{:.2}", level.generation_throughput),
                    format!("{:.2}", level.prompt_throughput),
                    format!("{:.2}", level.min_ttft),
                    format!("{:.2}", level.max_ttft),
                    format!("{:.2}%", level.success_rate),
                ]
            })
            .collect()
    }

    /// GitHub-flavoured markdown table in the layout of tabulate's `github` format.
    pub fn render_table(&self) -> String {
        let rows = self.rows();
        let mut widths = HEADERS.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        let mut out = String::new();
        let header: Vec<String> = HEADERS
            .iter()
            .zip(widths.iter())
            .map(|(title, width)| format!(" {:<width$} ", title, width = width))
            .collect();
        out.push_str(&format!("|{}|\n", header.join("|")));

        let separator: Vec<String> = widths
            .iter()
            .zip(LEFT_ALIGNED)
            .map(|(width, left)| {
                if left {
                    format!(":{}-", "-".repeat(*width))
                } else {
                    format!("-{}:", "-".repeat(*width))
                }
            })
            .collect();
        out.push_str(&format!("|{}|\n", separator.join("|")));

        for row in &rows {
            let cells: Vec<String> = row
                .iter()
                .zip(widths.iter().zip(LEFT_ALIGNED))
                .map(|(cell, (width, left))| {
                    if left {
                        format!(" {:<width$} ", cell, width = width)
                    } else {
                        format!(" {:>width$} ", cell, width = width)
                    }
                })
                .collect();
            out.push_str(&format!("|{}|\n", cells.join("|")));
        }
        out
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Engine: {}", self.engine)?;
        write!(f, "{}", self.environment)?;
        writeln!(f)?;
        write!(f, "{}", self.render_table())?;

        for level in self.levels.iter().filter(|level| !level.failures.is_empty()) {
            writeln!(f)?;
            writeln!(
                f,
                "Failures at batch size {}: {}",
                level.concurrency,
                level.failures.len()
            )?;
            for failure in &level.failures {
                writeln!(f, "  request {}: {}", failure.request_id, failure.error)?;
            }
        }
        Ok(())
    }
}
