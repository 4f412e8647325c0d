use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use llmbench::{
    detect_environment, run_benchmark, BenchmarkConfig, BenchmarkReport, EngineConfig,
    GenerationEngine, HttpEngine, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_PROMPT,
    DEFAULT_PROMPT_TOKENS,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "llmbench",
    about = "Measure LLM inference throughput and time-to-first-token across concurrency levels"
)]
struct Args {
    /// Hugging Face access token, forwarded to the engine as a bearer credential
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Base URL of the OpenAI-compatible inference server
    #[arg(long, default_value = "http://localhost:8000")]
    endpoint: String,

    /// Model identifier served by the engine
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Numeric precision the engine was launched with
    #[arg(long, default_value = "float16")]
    dtype: String,

    /// Maximum sequence length the engine was launched with
    #[arg(long, default_value_t = 4096)]
    max_model_len: u32,

    /// Fraction of accelerator memory the engine may use
    #[arg(long, default_value_t = 0.9)]
    gpu_memory_utilization: f64,

    /// Comma-separated concurrency levels, run in order
    #[arg(long, value_delimiter = ',', default_value = "1,2,4,8,16,32")]
    concurrency: Vec<usize>,

    /// Prompt sent with every request
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Maximum number of tokens to generate per request
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    max_tokens: u64,

    /// Prompt length assumed when the engine does not report usage
    #[arg(long, default_value_t = DEFAULT_PROMPT_TOKENS)]
    prompt_tokens: u64,

    /// Per-request timeout in seconds; requests wait indefinitely when omitted
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Disable the live progress line on stderr
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let engine_config = EngineConfig::try_new(&args.endpoint, &args.model, args.hf_token)?
        .with_dtype(&args.dtype)
        .with_max_model_len(args.max_model_len)?
        .with_gpu_memory_utilization(args.gpu_memory_utilization)?;

    let mut config = BenchmarkConfig::try_new(args.concurrency, args.prompt)?
        .with_max_tokens(args.max_tokens)?
        .with_prompt_tokens(args.prompt_tokens)
        .with_progress(!args.no_progress);
    if let Some(secs) = args.request_timeout_secs {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }

    info!(endpoint = %engine_config.endpoint, model = %engine_config.model, "connecting to engine");
    let engine = HttpEngine::connect(engine_config)
        .await
        .with_context(|| format!("failed to construct engine at {}", args.endpoint))?;
    engine.check_request_budget(config.prompt_tokens, config.max_tokens);
    let engine: Arc<dyn GenerationEngine> = Arc::new(engine);

    let levels = run_benchmark(Arc::clone(&engine), config).await?;
    let environment = detect_environment(engine.as_ref()).await;

    let report = BenchmarkReport {
        engine: engine.describe(),
        environment,
        levels,
    };
    println!("{}", report);

    Ok(())
}
